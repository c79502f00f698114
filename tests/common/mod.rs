//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use credchain::auth::store::{CacheBackend, FileBackend};
use credchain::auth::testing::{
    ManualClock, MemoryBackend, ScriptedAuthenticator, ScriptedDeviceFlow,
};
use credchain::auth::{
    AuthManager, AuthenticatorRegistry, CredentialStore, Identity, IdentityGraph, IdentityKind,
    IssuedVia, RetryPolicy, SsoProviderAuthenticator, SsoTokenCache,
};
use tempfile::TempDir;

/// `base -> ps -> admin`, the canonical three-step chain.
pub fn three_step() -> Vec<Identity> {
    vec![
        Identity::new("base", IdentityKind::Provider, None),
        Identity::new("ps", IdentityKind::PermissionSet, Some("base")),
        Identity::new("admin", IdentityKind::AssumeRole, Some("ps")),
    ]
}

/// `base -> ps -> admin` with an SSO-backed root.
pub fn sso_three_step() -> Vec<Identity> {
    let mut identities = three_step();
    identities[0] = Identity::new("base", IdentityKind::SsoProvider, None)
        .with_param("start_url", "https://example.awsapps.com/start")
        .with_param("region", "us-east-1");
    identities
}

/// Two roles sharing the `ps` intermediate.
pub fn forked() -> Vec<Identity> {
    let mut identities = three_step();
    identities.push(Identity::new("reader", IdentityKind::AssumeRole, Some("ps")));
    identities
}

/// A manager over an in-memory "secure" backend and a real file backend,
/// with every kind handled by one scripted authenticator.
pub struct Harness {
    pub dir: TempDir,
    pub clock: Arc<ManualClock>,
    pub secure: MemoryBackend,
    pub scripted: Arc<ScriptedAuthenticator>,
    pub sso_cache: Arc<SsoTokenCache>,
    pub device_flow: Arc<ScriptedDeviceFlow>,
    pub manager: AuthManager,
}

impl Harness {
    pub fn new(identities: Vec<Identity>) -> Self {
        Self::build(identities, false)
    }

    /// Like [`new`](Self::new), but `sso-provider` roots go through a real
    /// `SsoProviderAuthenticator` and token cache backed by a scripted
    /// device flow.
    pub fn with_sso_root(identities: Vec<Identity>) -> Self {
        Self::build(identities, true)
    }

    fn build(identities: Vec<Identity>, sso_root: bool) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::default());
        let secure = MemoryBackend::new(IssuedVia::CachedSecure);
        let scripted = Arc::new(ScriptedAuthenticator::new(clock.clone()));

        let store = CredentialStore::new(
            vec![
                Box::new(secure.clone()),
                Box::new(FileBackend::new(dir.path().join("credentials"))),
            ],
            clock.clone(),
        );
        let registry = [
            IdentityKind::Provider,
            IdentityKind::SsoProvider,
            IdentityKind::User,
            IdentityKind::PermissionSet,
            IdentityKind::AssumeRole,
        ]
        .into_iter()
        .fold(AuthenticatorRegistry::new(), |registry, kind| {
            registry.register(kind, scripted.clone())
        });

        let sso_cache = Arc::new(SsoTokenCache::new(dir.path().join("sso"), clock.clone()));
        let device_flow = Arc::new(ScriptedDeviceFlow::new(clock.clone()));
        let registry = if sso_root {
            registry.register(
                IdentityKind::SsoProvider,
                Arc::new(SsoProviderAuthenticator::new(
                    sso_cache.clone(),
                    device_flow.clone(),
                )),
            )
        } else {
            registry
        };

        let manager = AuthManager::new(
            IdentityGraph::new(identities).unwrap(),
            store,
            sso_cache.clone(),
            clock.clone(),
            registry,
        )
        .with_retry_policy(RetryPolicy {
            max_attempts: 3,
            initial_backoff: std::time::Duration::from_millis(1),
            max_backoff: std::time::Duration::from_millis(5),
        });

        Self {
            dir,
            clock,
            secure,
            scripted,
            sso_cache,
            device_flow,
            manager,
        }
    }

    pub fn file_backend(&self) -> FileBackend {
        FileBackend::new(self.credentials_dir())
    }

    pub fn credentials_dir(&self) -> PathBuf {
        self.dir.path().join("credentials")
    }

    /// Drop `name` from both credential backends, leaving the SSO token
    /// cache alone.
    pub fn evict(&self, name: &str) {
        self.secure.remove(name).unwrap();
        self.file_backend().remove(name).unwrap();
    }
}
