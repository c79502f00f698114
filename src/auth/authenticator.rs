//! Identity-kind-specific authentication steps.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::auth::error::StepError;
use crate::auth::resolver::Chain;
use crate::auth::types::{Credentials, Identity, IdentityKind, StepOutput};

/// Everything an authenticator may use for one step.
///
/// The chain is the session's own chain, borrowed read-only. Authenticators
/// that need context about other links (the root provider, for instance)
/// read it from here instead of resolving a chain of their own.
pub struct StepRequest<'a> {
    pub identity: &'a Identity,
    /// Credentials of the parent step; `None` only for the root.
    pub parent: Option<&'a Credentials>,
    pub chain: &'a Chain,
    pub index: usize,
    /// Ignore provider-side token caches and obtain new material.
    pub force_refresh: bool,
}

impl StepRequest<'_> {
    /// Root identity of the chain this step belongs to.
    pub fn root(&self) -> &Identity {
        self.chain.root()
    }

    /// Parent credentials, or an `InvalidConfig` error for a chained step
    /// that was handed none.
    pub fn require_parent(&self) -> Result<&Credentials, StepError> {
        self.parent.ok_or_else(|| {
            StepError::InvalidConfig(format!(
                "{} requires credentials from its parent",
                self.identity.name
            ))
        })
    }
}

/// Performs authentication for one kind of identity.
///
/// Implementations hold provider clients; they never persist credentials
/// themselves.
#[async_trait]
pub trait IdentityAuthenticator: Send + Sync {
    /// Validate the identity's parameters. Runs for every pending step
    /// before the first network call.
    fn validate(&self, _identity: &Identity) -> Result<(), StepError> {
        Ok(())
    }

    /// Authenticate `request.identity`, using `request.parent` as the
    /// calling credentials.
    async fn authenticate(&self, request: &StepRequest<'_>) -> Result<StepOutput, StepError>;
}

/// Authenticators keyed by identity kind, with per-identity overrides.
#[derive(Default, Clone)]
pub struct AuthenticatorRegistry {
    by_kind: HashMap<IdentityKind, Arc<dyn IdentityAuthenticator>>,
    by_name: HashMap<String, Arc<dyn IdentityAuthenticator>>,
}

impl AuthenticatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `authenticator` for every identity of `kind`.
    pub fn register(
        mut self,
        kind: IdentityKind,
        authenticator: Arc<dyn IdentityAuthenticator>,
    ) -> Self {
        self.by_kind.insert(kind, authenticator);
        self
    }

    /// Use `authenticator` for the identity called `name`, ahead of its kind.
    pub fn register_identity(
        mut self,
        name: impl Into<String>,
        authenticator: Arc<dyn IdentityAuthenticator>,
    ) -> Self {
        self.by_name.insert(name.into(), authenticator);
        self
    }

    pub fn get(&self, identity: &Identity) -> Option<&Arc<dyn IdentityAuthenticator>> {
        self.by_name
            .get(&identity.name)
            .or_else(|| self.by_kind.get(&identity.kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::graph::IdentityGraph;
    use crate::auth::resolver::ChainResolver;
    use chrono::Utc;
    use secrecy::ExposeSecret;

    struct Fixed(&'static str);

    #[async_trait]
    impl IdentityAuthenticator for Fixed {
        async fn authenticate(&self, _request: &StepRequest<'_>) -> Result<StepOutput, StepError> {
            Ok(StepOutput::new(self.0, Utc::now()))
        }
    }

    #[tokio::test]
    async fn test_identity_override_beats_kind() {
        let registry = AuthenticatorRegistry::new()
            .register(IdentityKind::AssumeRole, Arc::new(Fixed("kind")))
            .register_identity("special", Arc::new(Fixed("named")));

        let graph = Arc::new(
            IdentityGraph::new(vec![
                Identity::new("base", IdentityKind::SsoProvider, None),
                Identity::new("plain", IdentityKind::AssumeRole, Some("base")),
                Identity::new("special", IdentityKind::AssumeRole, Some("base")),
            ])
            .unwrap(),
        );
        let resolver = ChainResolver::new(graph);

        let mut served = Vec::new();
        for target in ["plain", "special"] {
            let chain = resolver.resolve(target).unwrap();
            let request = StepRequest {
                identity: chain.target(),
                parent: None,
                chain: &chain,
                index: 1,
                force_refresh: false,
            };
            let authenticator = registry.get(request.identity).unwrap();
            let output = authenticator.authenticate(&request).await.unwrap();
            served.push(output.secret.expose_secret().clone());
        }
        assert_eq!(served, vec!["kind", "named"]);

        let sso = Identity::new("base", IdentityKind::SsoProvider, None);
        assert!(registry.get(&sso).is_none());
    }

    #[test]
    fn test_require_parent() {
        let graph = Arc::new(
            IdentityGraph::new(vec![
                Identity::new("base", IdentityKind::Provider, None),
                Identity::new("role", IdentityKind::AssumeRole, Some("base")),
            ])
            .unwrap(),
        );
        let chain = ChainResolver::new(graph).resolve("role").unwrap();
        let request = StepRequest {
            identity: chain.target(),
            parent: None,
            chain: &chain,
            index: 1,
            force_refresh: false,
        };
        assert_eq!(request.root().name, "base");
        assert!(matches!(
            request.require_parent(),
            Err(StepError::InvalidConfig(_))
        ));
    }
}
