//! OS keyring credential cache.
//!
//! Headless hosts and containers often have no keyring at all. Construction
//! never touches the keyring, so an unavailable service only shows up as
//! per-call errors that the store turns into misses.

use crate::auth::error::CacheError;
use crate::auth::store::CacheBackend;
use crate::auth::types::{Credentials, CredentialsRecord, IssuedVia};

/// Credential cache backed by OS-protected storage.
pub struct SecureBackend {
    /// Service name for keyring entries.
    service: String,
}

impl SecureBackend {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, identity: &str) -> Result<keyring::Entry, CacheError> {
        Ok(keyring::Entry::new(&self.service, identity)?)
    }
}

impl CacheBackend for SecureBackend {
    fn name(&self) -> &'static str {
        "secure"
    }

    fn read(&self, identity: &str) -> Result<Option<Credentials>, CacheError> {
        let secret_data = match self.entry(identity)?.get_password() {
            Ok(data) => data,
            Err(keyring::Error::NoEntry) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record: CredentialsRecord = serde_json::from_str(&secret_data)
            .map_err(|e| CacheError::Corruption(format!("{}: {}", identity, e)))?;
        Ok(Some(
            Credentials::from(record).served_from(IssuedVia::CachedSecure),
        ))
    }

    fn write(&self, identity: &str, credentials: &Credentials) -> Result<(), CacheError> {
        let secret_data = serde_json::to_string(&credentials.to_record())?;
        self.entry(identity)?.set_password(&secret_data)?;
        Ok(())
    }

    fn remove(&self, identity: &str) -> Result<(), CacheError> {
        match self.entry(identity)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
