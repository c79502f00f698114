//! SSO device-authorization tokens and the root authenticator built on them.
//!
//! Tokens are cached per provider, separately from the chain credential
//! cache. A cached token is only reused while the provider's configuration
//! fingerprint (start URL, region, scopes) is unchanged.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use sha2::{Digest, Sha256};

use crate::auth::authenticator::{IdentityAuthenticator, StepRequest};
use crate::auth::clock::Clock;
use crate::auth::error::{CacheError, StepError};
use crate::auth::store::file::{ensure_private_dir, file_stem, write_atomic};
use crate::auth::types::{Identity, SsoToken, SsoTokenRecord, StepOutput};

const TOKEN_FILE: &str = "token.json";

/// Authentication parameters of an SSO-backed provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SsoParams {
    pub start_url: String,
    pub region: String,
    pub scopes: Vec<String>,
}

impl SsoParams {
    /// Read `start_url`, `region` and optional `scopes` from the identity's
    /// parameters.
    pub fn from_identity(identity: &Identity) -> Result<Self, StepError> {
        let required = |key: &str| {
            identity
                .param_str(key)
                .filter(|v| !v.trim().is_empty())
                .map(str::to_string)
                .ok_or_else(|| {
                    StepError::InvalidConfig(format!("{} is missing {}", identity.name, key))
                })
        };
        let start_url = required("start_url")?;
        let region = required("region")?;

        let scopes = match identity.params.get("scopes") {
            None => Vec::new(),
            Some(serde_json::Value::Array(values)) => values
                .iter()
                .map(|v| {
                    v.as_str().map(str::to_string).ok_or_else(|| {
                        StepError::InvalidConfig(format!(
                            "{} has a non-string scope",
                            identity.name
                        ))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?,
            Some(_) => {
                return Err(StepError::InvalidConfig(format!(
                    "{}: scopes must be a list",
                    identity.name
                )))
            }
        };

        Ok(Self {
            start_url,
            region,
            scopes,
        })
    }

    /// Hex SHA-256 over the start URL, region and the sorted scope set.
    /// Scope order and duplicates do not change the fingerprint.
    pub fn fingerprint(&self) -> String {
        let mut scopes: Vec<&str> = self.scopes.iter().map(String::as_str).collect();
        scopes.sort_unstable();
        scopes.dedup();

        let mut hasher = Sha256::new();
        hasher.update(self.start_url.as_bytes());
        hasher.update(b"\n");
        hasher.update(self.region.as_bytes());
        hasher.update(b"\n");
        hasher.update(scopes.join(",").as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// File cache of SSO tokens, one directory per provider.
///
/// Every failure degrades to a miss; callers then run the device flow again.
pub struct SsoTokenCache {
    root: Option<PathBuf>,
    clock: Arc<dyn Clock>,
}

impl SsoTokenCache {
    pub fn new(root: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            root: Some(root.into()),
            clock,
        }
    }

    /// A cache that never hits and never writes.
    pub fn disabled(clock: Arc<dyn Clock>) -> Self {
        Self { root: None, clock }
    }

    /// Token file for `provider`, if caching is enabled.
    pub fn path_for(&self, provider: &str) -> Option<PathBuf> {
        self.root
            .as_ref()
            .map(|root| root.join(file_stem(provider)).join(TOKEN_FILE))
    }

    /// A usable token for `provider` issued under `fingerprint`.
    pub fn get(&self, provider: &str, fingerprint: &str) -> Option<SsoToken> {
        let path = self.path_for(provider)?;
        let token = match read_token(&path) {
            Ok(Some(token)) => token,
            Ok(None) => {
                debug!("No cached SSO token for {}", provider);
                return None;
            }
            Err(e) => {
                debug!("Treating SSO cache failure for {} as a miss: {}", provider, e);
                return None;
            }
        };

        if token.provider != provider {
            debug!(
                "Ignoring SSO token for {}: {}",
                provider,
                CacheError::OwnerMismatch {
                    expected: provider.to_string(),
                    actual: token.provider.clone(),
                }
            );
            return None;
        }
        if token.config_fingerprint != fingerprint {
            debug!(
                "Ignoring SSO token for {}: {}",
                provider,
                CacheError::ConfigMismatch
            );
            return None;
        }
        if !token.is_usable_at(self.clock.now()) {
            debug!(
                "SSO token for {} expires at {} (within safety buffer)",
                provider, token.expires_at
            );
            return None;
        }
        debug!("SSO token cache hit for {}", provider);
        Some(token)
    }

    /// Store `token` for `provider`. Returns whether it was written.
    pub fn put(&self, provider: &str, token: &SsoToken) -> bool {
        let Some(path) = self.path_for(provider) else {
            return false;
        };
        match write_token(&path, token) {
            Ok(()) => {
                debug!("Cached SSO token for {}", provider);
                true
            }
            Err(e) => {
                debug!("Failed to cache SSO token for {}: {}", provider, e);
                false
            }
        }
    }

    pub fn delete(&self, provider: &str) {
        let Some(path) = self.path_for(provider) else {
            return;
        };
        match fs::remove_file(&path) {
            Ok(()) => debug!("Removed SSO token for {}", provider),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => debug!("Failed to remove SSO token for {}: {}", provider, e),
        }
    }
}

fn read_token(path: &Path) -> Result<Option<SsoToken>, CacheError> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let record: SsoTokenRecord = serde_json::from_slice(&data)
        .map_err(|e| CacheError::Corruption(format!("{}: {}", path.display(), e)))?;
    Ok(Some(record.into()))
}

fn write_token(path: &Path, token: &SsoToken) -> Result<(), CacheError> {
    let dir = path
        .parent()
        .ok_or_else(|| CacheError::Corruption(format!("no parent for {}", path.display())))?;
    let data = serde_json::to_vec_pretty(&SsoTokenRecord::from(token))?;
    ensure_private_dir(dir)?;
    write_atomic(dir, path, &data)?;
    Ok(())
}

/// Out-of-band device-authorization flow for an SSO provider.
#[async_trait]
pub trait DeviceAuthorization: Send + Sync {
    /// Run the flow for `provider` and return the issued token.
    async fn authorize(&self, provider: &Identity, params: &SsoParams)
        -> Result<StepOutput, StepError>;
}

/// Root authenticator for `sso-provider` identities.
///
/// Reuses a cached token when one matches the current configuration and
/// otherwise runs the device flow and caches its result. A reused token is
/// reported through `StepOutput::from_token_cache`; a `force_refresh`
/// request drops it and always runs the flow.
pub struct SsoProviderAuthenticator {
    cache: Arc<SsoTokenCache>,
    flow: Arc<dyn DeviceAuthorization>,
}

impl SsoProviderAuthenticator {
    pub fn new(cache: Arc<SsoTokenCache>, flow: Arc<dyn DeviceAuthorization>) -> Self {
        Self { cache, flow }
    }
}

#[async_trait]
impl IdentityAuthenticator for SsoProviderAuthenticator {
    fn validate(&self, identity: &Identity) -> Result<(), StepError> {
        SsoParams::from_identity(identity).map(|_| ())
    }

    async fn authenticate(&self, request: &StepRequest<'_>) -> Result<StepOutput, StepError> {
        let identity = request.identity;
        let params = SsoParams::from_identity(identity)?;
        let fingerprint = params.fingerprint();

        if request.force_refresh {
            debug!("Discarding cached SSO token for {}", identity.name);
            self.cache.delete(&identity.name);
        } else if let Some(token) = self.cache.get(&identity.name, &fingerprint) {
            return Ok(StepOutput::cached_token(token));
        }

        debug!("Starting device authorization for {}", identity.name);
        let output = self.flow.authorize(identity, &params).await?;
        self.cache.put(
            &identity.name,
            &SsoToken {
                provider: identity.name.clone(),
                token: output.secret.clone(),
                expires_at: output.expires_at,
                config_fingerprint: fingerprint,
            },
        );
        Ok(output)
    }
}
