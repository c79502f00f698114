//! Best-effort credential cache over pluggable backends.
//!
//! The session layer only ever sees a hit or a miss: every backend failure
//! (missing keyring, unreadable file, corrupt JSON) is logged and absorbed
//! here.

pub mod file;
pub mod noop;
pub mod secure;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use log::{debug, warn};

use crate::auth::clock::Clock;
use crate::auth::error::CacheError;
use crate::auth::types::Credentials;

pub use file::FileBackend;
pub use noop::NoopBackend;
pub use secure::SecureBackend;

/// A persistence mechanism for credentials, keyed by identity name.
///
/// Backends report raw results; expiry checks, owner checks and error
/// absorption happen in [`CredentialStore`].
pub trait CacheBackend: Send + Sync {
    /// Short label used in logs.
    fn name(&self) -> &'static str;

    /// Read the entry for `identity`, tagged with how it was served.
    fn read(&self, identity: &str) -> Result<Option<Credentials>, CacheError>;

    /// Replace the entry for `identity`.
    fn write(&self, identity: &str, credentials: &Credentials) -> Result<(), CacheError>;

    /// Remove the entry for `identity`; absent entries are not an error.
    fn remove(&self, identity: &str) -> Result<(), CacheError>;
}

/// Which backend(s) receive writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WritePolicy {
    /// Every configured backend, for redundancy.
    #[default]
    All,
    /// Only the first (preferred) backend.
    Preferred,
}

/// Backend selection read from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreSelection {
    /// Secure storage first, file storage as fallback.
    #[default]
    Auto,
    Secure,
    File,
    Noop,
}

impl FromStr for StoreSelection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(StoreSelection::Auto),
            "secure" | "keyring" => Ok(StoreSelection::Secure),
            "file" => Ok(StoreSelection::File),
            "noop" | "none" => Ok(StoreSelection::Noop),
            other => Err(format!("unknown credential store: {}", other)),
        }
    }
}

impl fmt::Display for StoreSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreSelection::Auto => write!(f, "auto"),
            StoreSelection::Secure => write!(f, "secure"),
            StoreSelection::File => write!(f, "file"),
            StoreSelection::Noop => write!(f, "noop"),
        }
    }
}

/// Locations the configurable backends need.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub keyring_service: String,
    pub cache_dir: PathBuf,
}

/// Credential cache with ordered read fallback across backends.
pub struct CredentialStore {
    backends: Vec<Box<dyn CacheBackend>>,
    clock: Arc<dyn Clock>,
    write_policy: WritePolicy,
}

impl CredentialStore {
    /// Create a store reading from `backends` in order.
    pub fn new(backends: Vec<Box<dyn CacheBackend>>, clock: Arc<dyn Clock>) -> Self {
        Self {
            backends,
            clock,
            write_policy: WritePolicy::default(),
        }
    }

    /// A store that never hits and discards writes.
    pub fn noop(clock: Arc<dyn Clock>) -> Self {
        Self::new(vec![Box::new(NoopBackend)], clock)
    }

    /// Build the backends named by `selection`.
    pub fn from_selection(
        selection: StoreSelection,
        options: &StoreOptions,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let backends: Vec<Box<dyn CacheBackend>> = match selection {
            StoreSelection::Auto => vec![
                Box::new(SecureBackend::new(options.keyring_service.clone())),
                Box::new(FileBackend::new(options.cache_dir.clone())),
            ],
            StoreSelection::Secure => {
                vec![Box::new(SecureBackend::new(options.keyring_service.clone()))]
            }
            StoreSelection::File => vec![Box::new(FileBackend::new(options.cache_dir.clone()))],
            StoreSelection::Noop => vec![Box::new(NoopBackend)],
        };
        debug!("Credential store configured: {}", selection);
        Self::new(backends, clock)
    }

    pub fn with_write_policy(mut self, write_policy: WritePolicy) -> Self {
        self.write_policy = write_policy;
        self
    }

    /// Backend labels in read order.
    pub fn backend_names(&self) -> Vec<&'static str> {
        self.backends.iter().map(|b| b.name()).collect()
    }

    /// Valid cached credentials for `identity`, or `None`.
    ///
    /// An entry counts only if it belongs to `identity` and is usable at the
    /// current time with the safety buffer applied.
    pub fn get(&self, identity: &str) -> Option<Credentials> {
        let now = self.clock.now();
        for backend in &self.backends {
            match backend.read(identity) {
                Ok(Some(credentials)) => {
                    if credentials.owner() != identity {
                        let err = CacheError::OwnerMismatch {
                            expected: identity.to_string(),
                            actual: credentials.owner().to_string(),
                        };
                        debug!("Ignoring {} cache entry: {}", backend.name(), err);
                        continue;
                    }
                    if !credentials.is_usable_at(now) {
                        debug!(
                            "Cached credentials for {} in {} expire at {} (within safety buffer)",
                            identity,
                            backend.name(),
                            credentials.expires_at()
                        );
                        continue;
                    }
                    debug!("Cache hit for {} in {}", identity, backend.name());
                    return Some(credentials);
                }
                Ok(None) => {
                    debug!("Cache miss for {} in {}", identity, backend.name());
                }
                Err(e) => {
                    debug!(
                        "Treating {} cache failure for {} as a miss: {}",
                        backend.name(),
                        identity,
                        e
                    );
                }
            }
        }
        None
    }

    /// Overwrite the cached entry for `identity`. Returns how many backends
    /// accepted the write.
    pub fn put(&self, identity: &str, credentials: &Credentials) -> usize {
        if credentials.owner() != identity {
            warn!(
                "Refusing to cache credentials owned by {} under {}",
                credentials.owner(),
                identity
            );
            return 0;
        }

        let targets = match self.write_policy {
            WritePolicy::All => &self.backends[..],
            WritePolicy::Preferred => &self.backends[..self.backends.len().min(1)],
        };

        let mut written = 0;
        for backend in targets {
            match backend.write(identity, credentials) {
                Ok(()) => {
                    debug!("Cached credentials for {} in {}", identity, backend.name());
                    written += 1;
                }
                Err(e) => {
                    debug!(
                        "Failed to cache credentials for {} in {}: {}",
                        identity,
                        backend.name(),
                        e
                    );
                }
            }
        }
        written
    }

    /// [`get`](Self::get) on the blocking thread pool.
    pub async fn get_async(self: &Arc<Self>, identity: &str) -> Option<Credentials> {
        let store = Arc::clone(self);
        let identity = identity.to_string();
        tokio::task::spawn_blocking(move || store.get(&identity))
            .await
            .unwrap_or_else(|e| {
                debug!("Cache read task failed: {}", e);
                None
            })
    }

    /// [`put`](Self::put) on the blocking thread pool.
    pub async fn put_async(self: &Arc<Self>, identity: &str, credentials: &Credentials) -> usize {
        let store = Arc::clone(self);
        let identity = identity.to_string();
        let credentials = credentials.clone();
        tokio::task::spawn_blocking(move || store.put(&identity, &credentials))
            .await
            .unwrap_or_else(|e| {
                debug!("Cache write task failed: {}", e);
                0
            })
    }

    /// [`delete`](Self::delete) on the blocking thread pool.
    pub async fn delete_async(self: &Arc<Self>, identity: &str) {
        let store = Arc::clone(self);
        let identity = identity.to_string();
        if let Err(e) = tokio::task::spawn_blocking(move || store.delete(&identity)).await {
            debug!("Cache delete task failed: {}", e);
        }
    }

    /// Remove `identity` from every backend.
    pub fn delete(&self, identity: &str) {
        for backend in &self.backends {
            if let Err(e) = backend.remove(identity) {
                debug!(
                    "Failed to remove {} from {}: {}",
                    identity,
                    backend.name(),
                    e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::testing::{ManualClock, MemoryBackend};
    use crate::auth::types::{IssuedVia, StepOutput};
    use chrono::Duration;

    fn creds(owner: &str, clock: &ManualClock, ttl_minutes: i64) -> Credentials {
        Credentials::fresh(
            owner,
            StepOutput::new("secret", clock.now() + Duration::minutes(ttl_minutes)),
        )
    }

    /// Backend whose every operation fails.
    struct BrokenBackend;

    impl CacheBackend for BrokenBackend {
        fn name(&self) -> &'static str {
            "broken"
        }

        fn read(&self, _identity: &str) -> Result<Option<Credentials>, CacheError> {
            Err(CacheError::Keyring("no secret service".to_string()))
        }

        fn write(&self, _identity: &str, _credentials: &Credentials) -> Result<(), CacheError> {
            Err(CacheError::Keyring("no secret service".to_string()))
        }

        fn remove(&self, _identity: &str) -> Result<(), CacheError> {
            Err(CacheError::LockPoisoned)
        }
    }

    #[test]
    fn test_get_misses_inside_safety_buffer() {
        let clock = Arc::new(ManualClock::default());
        let backend = MemoryBackend::new(IssuedVia::CachedFile);
        let store = CredentialStore::new(vec![Box::new(backend.clone())], clock.clone());

        store.put("admin", &creds("admin", &clock, 10));
        assert!(store.get("admin").is_some());

        clock.advance(Duration::minutes(5));
        assert!(store.get("admin").is_none(), "exactly at expiry - buffer");

        clock.advance(Duration::minutes(10));
        assert!(store.get("admin").is_none());
        assert!(backend.contains("admin"), "entry is evicted lazily, not removed");
    }

    #[test]
    fn test_read_fallback_order() {
        let clock = Arc::new(ManualClock::default());
        let secure = MemoryBackend::new(IssuedVia::CachedSecure);
        let file = MemoryBackend::new(IssuedVia::CachedFile);
        let store = CredentialStore::new(
            vec![Box::new(secure.clone()), Box::new(file.clone())],
            clock.clone(),
        );

        file.insert("ps", creds("ps", &clock, 60));
        let hit = store.get("ps").unwrap();
        assert_eq!(hit.issued_via(), IssuedVia::CachedFile);

        secure.insert("ps", creds("ps", &clock, 60));
        let hit = store.get("ps").unwrap();
        assert_eq!(hit.issued_via(), IssuedVia::CachedSecure);
    }

    #[test]
    fn test_expired_secure_entry_falls_through_to_file() {
        let clock = Arc::new(ManualClock::default());
        let secure = MemoryBackend::new(IssuedVia::CachedSecure);
        let file = MemoryBackend::new(IssuedVia::CachedFile);
        let store = CredentialStore::new(
            vec![Box::new(secure.clone()), Box::new(file.clone())],
            clock.clone(),
        );

        secure.insert("ps", creds("ps", &clock, 2));
        file.insert("ps", creds("ps", &clock, 60));
        assert_eq!(store.get("ps").unwrap().issued_via(), IssuedVia::CachedFile);
    }

    #[test]
    fn test_backend_errors_are_misses() {
        let clock = Arc::new(ManualClock::default());
        let file = MemoryBackend::new(IssuedVia::CachedFile);
        let store = CredentialStore::new(
            vec![Box::new(BrokenBackend), Box::new(file.clone())],
            clock.clone(),
        );

        assert_eq!(store.put("ps", &creds("ps", &clock, 60)), 1);
        assert!(store.get("ps").is_some());
        store.delete("ps");
        assert!(store.get("ps").is_none());
    }

    #[test]
    fn test_owner_mismatch_is_a_miss() {
        let clock = Arc::new(ManualClock::default());
        let file = MemoryBackend::new(IssuedVia::CachedFile);
        let store = CredentialStore::new(vec![Box::new(file.clone())], clock.clone());

        file.insert("admin", creds("ps", &clock, 60));
        assert!(store.get("admin").is_none());
    }

    #[test]
    fn test_put_refuses_foreign_owner() {
        let clock = Arc::new(ManualClock::default());
        let file = MemoryBackend::new(IssuedVia::CachedFile);
        let store = CredentialStore::new(vec![Box::new(file.clone())], clock.clone());

        assert_eq!(store.put("admin", &creds("ps", &clock, 60)), 0);
        assert!(!file.contains("admin"));
    }

    #[test]
    fn test_put_overwrites_and_respects_write_policy() {
        let clock = Arc::new(ManualClock::default());
        let secure = MemoryBackend::new(IssuedVia::CachedSecure);
        let file = MemoryBackend::new(IssuedVia::CachedFile);
        let store = CredentialStore::new(
            vec![Box::new(secure.clone()), Box::new(file.clone())],
            clock.clone(),
        )
        .with_write_policy(WritePolicy::Preferred);

        assert_eq!(store.put("admin", &creds("admin", &clock, 30)), 1);
        assert!(secure.contains("admin"));
        assert!(!file.contains("admin"));

        store.put("admin", &creds("admin", &clock, 90));
        let hit = store.get("admin").unwrap();
        assert_eq!(hit.expires_at(), clock.now() + Duration::minutes(90));
    }

    #[tokio::test]
    async fn test_async_wrappers_share_the_store() {
        let clock = Arc::new(ManualClock::default());
        let file = MemoryBackend::new(IssuedVia::CachedFile);
        let store = Arc::new(CredentialStore::new(vec![Box::new(file.clone())], clock.clone()));

        assert!(store.get_async("admin").await.is_none());
        assert_eq!(store.put_async("admin", &creds("admin", &clock, 60)).await, 1);
        assert_eq!(store.put_async("admin", &creds("ps", &clock, 60)).await, 0);
        let hit = store.get_async("admin").await.unwrap();
        assert_eq!(hit.owner(), "admin");

        store.delete_async("admin").await;
        assert!(!file.contains("admin"));
    }

    #[test]
    fn test_noop_store_never_hits() {
        let clock = Arc::new(ManualClock::default());
        let store = CredentialStore::noop(clock.clone());
        assert_eq!(store.put("admin", &creds("admin", &clock, 60)), 1);
        assert!(store.get("admin").is_none());
        assert_eq!(store.backend_names(), vec!["noop"]);
    }

    #[test]
    fn test_selection_parsing() {
        assert_eq!("auto".parse::<StoreSelection>().unwrap(), StoreSelection::Auto);
        assert_eq!("Keyring".parse::<StoreSelection>().unwrap(), StoreSelection::Secure);
        assert_eq!(" file ".parse::<StoreSelection>().unwrap(), StoreSelection::File);
        assert_eq!("none".parse::<StoreSelection>().unwrap(), StoreSelection::Noop);
        assert!("vault".parse::<StoreSelection>().is_err());
    }
}
