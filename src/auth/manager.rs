//! Entry point for authentication requests.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use log::{debug, info};

use crate::auth::authenticator::AuthenticatorRegistry;
use crate::auth::clock::Clock;
use crate::auth::error::{AuthError, ConfigError};
use crate::auth::graph::IdentityGraph;
use crate::auth::hooks::PostAuthenticate;
use crate::auth::resolver::{Chain, ChainResolver};
use crate::auth::retry::RetryPolicy;
use crate::auth::session::AuthenticationSession;
use crate::auth::sso::SsoTokenCache;
use crate::auth::store::CredentialStore;
use crate::auth::types::{Credentials, Identity, IdentityKind};

/// Name of the identity a child environment was prepared for.
pub const ENV_IDENTITY: &str = "CREDCHAIN_IDENTITY";
/// Root of that identity's chain.
pub const ENV_ROOT: &str = "CREDCHAIN_ROOT";

/// Owns the shared dependencies and starts one session per request.
///
/// Concurrent `authenticate` calls share only the credential store and the
/// SSO token cache; every call resolves and owns its own chain.
pub struct AuthManager {
    graph: RwLock<Arc<IdentityGraph>>,
    store: Arc<CredentialStore>,
    sso_cache: Arc<SsoTokenCache>,
    clock: Arc<dyn Clock>,
    registry: AuthenticatorRegistry,
    retry: RetryPolicy,
    hooks: Vec<Arc<dyn PostAuthenticate>>,
    timing_logs: bool,
}

impl AuthManager {
    pub fn new(
        graph: IdentityGraph,
        store: CredentialStore,
        sso_cache: Arc<SsoTokenCache>,
        clock: Arc<dyn Clock>,
        registry: AuthenticatorRegistry,
    ) -> Self {
        Self {
            graph: RwLock::new(Arc::new(graph)),
            store: Arc::new(store),
            sso_cache,
            clock,
            registry,
            retry: RetryPolicy::default(),
            hooks: Vec::new(),
            timing_logs: false,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_hook(mut self, hook: Arc<dyn PostAuthenticate>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn with_timing_logs(mut self, enabled: bool) -> Self {
        self.timing_logs = enabled;
        self
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Snapshot of the current identity graph.
    pub fn graph(&self) -> Arc<IdentityGraph> {
        let graph = self
            .graph
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&graph)
    }

    /// Swap in a new identity graph. Sessions already running keep the
    /// graph they started with.
    pub fn replace_graph(&self, graph: IdentityGraph) {
        let mut current = self
            .graph
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *current = Arc::new(graph);
        info!("Identity configuration replaced ({} identities)", current.len());
    }

    /// Authenticate as `target`, walking its chain from the deepest valid
    /// cached step.
    pub async fn authenticate(&self, target: &str) -> Result<Credentials, AuthError> {
        let chain = self.chain_for(target)?;
        let target = chain.target().name.clone();
        debug!("Authenticating {} via {}", target, chain);

        let mut session =
            AuthenticationSession::new(chain, self.store.clone(), &self.registry, self.retry)
                .with_timing_logs(self.timing_logs);
        let credentials = session.run().await?;

        if credentials.owner() != target {
            return Err(AuthError::OwnerMismatch {
                expected: target,
                actual: credentials.owner().to_string(),
            });
        }

        for hook in &self.hooks {
            hook.after_authenticate(&target, session.chain(), &credentials)
                .map_err(|reason| AuthError::PostAuthenticate {
                    target: target.clone(),
                    reason,
                })?;
        }
        Ok(credentials)
    }

    /// Like [`authenticate`](Self::authenticate), abandoned after `timeout`.
    ///
    /// Steps that completed before the deadline stay cached; the step in
    /// flight writes nothing.
    pub async fn authenticate_within(
        &self,
        target: &str,
        timeout: Duration,
    ) -> Result<Credentials, AuthError> {
        tokio::time::timeout(timeout, self.authenticate(target))
            .await
            .map_err(|_| AuthError::TimedOut {
                target: target.to_string(),
                elapsed: timeout,
            })?
    }

    /// Valid cached credentials for `target`, without authenticating.
    pub fn cached_credentials(&self, target: &str) -> Result<Option<Credentials>, ConfigError> {
        let graph = self.graph();
        let identity = graph.lookup(target)?;
        Ok(self.store.get(&identity.name))
    }

    /// Forget cached credentials for `name`, and its SSO token if it is an
    /// SSO-backed root.
    pub fn logout(&self, name: &str) -> Result<(), ConfigError> {
        let graph = self.graph();
        let identity = graph.lookup(name)?;
        self.forget(identity);
        Ok(())
    }

    /// Forget cached credentials for every declared identity.
    pub fn logout_all(&self) {
        let graph = self.graph();
        for name in graph.names() {
            if let Ok(identity) = graph.lookup(name) {
                self.forget(identity);
            }
        }
    }

    fn forget(&self, identity: &Identity) {
        self.store.delete(&identity.name);
        if identity.kind == IdentityKind::SsoProvider {
            self.sso_cache.delete(&identity.name);
        }
        info!("Logged out of {}", identity.name);
    }

    /// Name of the identity flagged `default`, used when a request names
    /// none. Zero or several defaults are configuration errors.
    pub fn default_identity(&self) -> Result<String, ConfigError> {
        Ok(self.graph().default_identity()?.name.clone())
    }

    /// Variables describing `target` to a child process. Nothing is
    /// authenticated and no secret is included.
    ///
    /// Identity and root names come first, then whatever the hooks
    /// persist, then the identity's own `env` entries, later ones winning.
    pub fn environment(&self, target: &str) -> Result<BTreeMap<String, String>, ConfigError> {
        let chain = self.chain_for(target)?;
        let identity = chain.target();

        let mut env = BTreeMap::new();
        env.insert(ENV_IDENTITY.to_string(), identity.name.clone());
        env.insert(ENV_ROOT.to_string(), chain.root().name.clone());
        for hook in &self.hooks {
            env.extend(hook.environment(&identity.name));
        }
        env.extend(identity.env.clone());
        Ok(env)
    }

    /// `current` with the variables of [`environment`](Self::environment)
    /// applied on top, ready for spawning a subprocess.
    pub fn prepare_environment<I>(
        &self,
        target: &str,
        current: I,
    ) -> Result<BTreeMap<String, String>, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut env: BTreeMap<String, String> = current.into_iter().collect();
        env.extend(self.environment(target)?);
        Ok(env)
    }

    /// Declared identities in configuration order.
    pub fn list_identities(&self) -> Vec<Arc<Identity>> {
        let graph = self.graph();
        graph
            .names()
            .filter_map(|name| graph.lookup(name).ok().cloned())
            .collect()
    }

    /// Root-to-target chain for `target` under the current graph.
    pub fn chain_for(&self, target: &str) -> Result<Chain, ConfigError> {
        ChainResolver::new(self.graph()).resolve(target)
    }
}
