//! Backend for environments where nothing should be persisted.

use crate::auth::error::CacheError;
use crate::auth::store::CacheBackend;
use crate::auth::types::Credentials;

/// Always misses, accepts and discards writes.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopBackend;

impl CacheBackend for NoopBackend {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn read(&self, _identity: &str) -> Result<Option<Credentials>, CacheError> {
        Ok(None)
    }

    fn write(&self, _identity: &str, _credentials: &Credentials) -> Result<(), CacheError> {
        Ok(())
    }

    fn remove(&self, _identity: &str) -> Result<(), CacheError> {
        Ok(())
    }
}
