//! One authentication request, walking one chain.
//!
//! A session owns its chain from construction. Nothing inside the session
//! resolves a chain again: every step, cache lookup and authenticator call
//! reads the same immutable value, so the work can never stop short of the
//! requested target.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::auth::authenticator::{AuthenticatorRegistry, IdentityAuthenticator, StepRequest};
use crate::auth::error::{AuthError, StepError};
use crate::auth::resolver::Chain;
use crate::auth::retry::RetryPolicy;
use crate::auth::store::CredentialStore;
use crate::auth::types::{Credentials, Identity};

/// Log `duration` at info level when timing logs are enabled.
pub(crate) fn log_timing(enabled: bool, message: &str, duration: Duration) {
    if enabled {
        info!("{}: {:?}", message, duration);
    }
}

/// Where and why a walk stopped.
struct StepFailure {
    index: usize,
    cause: StepError,
    /// The failing step's input credentials came from the cache.
    input_cached: bool,
}

/// How a walk treats the credential cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CacheMode {
    /// Resume from the deepest step with valid cached credentials.
    Read,
    /// Authenticate every step and ask providers to skip their own token
    /// caches; results are still written back.
    Bypass,
}

pub struct AuthenticationSession<'m> {
    chain: Chain,
    store: Arc<CredentialStore>,
    registry: &'m AuthenticatorRegistry,
    retry: RetryPolicy,
    timing_logs: bool,
    /// Credentials per chain position, filled as steps complete.
    results: Vec<Option<Credentials>>,
    network_steps: usize,
}

impl<'m> AuthenticationSession<'m> {
    pub fn new(
        chain: Chain,
        store: Arc<CredentialStore>,
        registry: &'m AuthenticatorRegistry,
        retry: RetryPolicy,
    ) -> Self {
        let results = vec![None; chain.len()];
        Self {
            chain,
            store,
            registry,
            retry,
            timing_logs: false,
            results,
            network_steps: 0,
        }
    }

    pub fn with_timing_logs(mut self, enabled: bool) -> Self {
        self.timing_logs = enabled;
        self
    }

    /// The chain this session was built for.
    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    pub fn target(&self) -> &str {
        &self.chain.target().name
    }

    /// Credentials obtained so far for `name`, if it is part of this chain.
    pub fn step_result(&self, name: &str) -> Option<&Credentials> {
        self.chain
            .position(name)
            .and_then(|index| self.results[index].as_ref())
    }

    /// Number of steps that called an authenticator.
    pub fn network_steps(&self) -> usize {
        self.network_steps
    }

    /// Authenticate the whole chain and return the target's credentials.
    pub async fn run(&mut self) -> Result<Credentials, AuthError> {
        let started = Instant::now();
        let outcome = match self.walk(CacheMode::Read).await {
            Err(StepFailure {
                index,
                cause: StepError::Expired { reason },
                input_cached: true,
            }) => {
                let stale = index
                    .checked_sub(1)
                    .and_then(|parent| self.chain.get(parent))
                    .map(|id| id.name.clone());
                info!(
                    "Cached input for {} was rejected as expired ({}); re-authenticating {} without cache",
                    self.chain.get(index).map(|id| id.name.as_str()).unwrap_or_default(),
                    reason,
                    self.chain
                );
                if let Some(stale) = stale {
                    self.store.delete_async(&stale).await;
                }
                self.results = vec![None; self.chain.len()];
                self.walk(CacheMode::Bypass).await
            }
            other => other,
        };
        log_timing(
            self.timing_logs,
            &format!("Total time to authenticate {}", self.target()),
            started.elapsed(),
        );

        match outcome {
            Ok(credentials) => {
                info!(
                    "Authenticated as {} ({} step(s), {} fresh)",
                    self.target(),
                    self.chain.len(),
                    self.network_steps
                );
                Ok(credentials)
            }
            Err(failure) => {
                let failed_identity = self
                    .chain
                    .get(failure.index)
                    .map(|id| id.name.clone())
                    .unwrap_or_default();
                Err(AuthError::ChainAuthentication {
                    failed_identity,
                    step: failure.index,
                    cause: failure.cause,
                })
            }
        }
    }

    /// Deepest chain position with valid cached credentials, recorded into
    /// the per-step results. Positions above it still need authenticating.
    async fn resume_point(&mut self) -> Option<usize> {
        let chain = self.chain.clone();
        for (index, identity) in chain.iter().enumerate().rev() {
            if let Some(cached) = self.store.get_async(&identity.name).await {
                debug!(
                    "Resuming {} from cached {} (step {})",
                    self.target(),
                    identity.name,
                    index
                );
                self.results[index] = Some(cached);
                return Some(index);
            }
        }
        None
    }

    /// Authenticator for every position from `start`, validated up front so
    /// configuration errors surface before any network call.
    fn preflight(&self, start: usize) -> Result<Vec<&'m dyn IdentityAuthenticator>, StepFailure> {
        let registry = self.registry;
        let mut authenticators = Vec::with_capacity(self.chain.len() - start);
        for (index, identity) in self.chain.iter().enumerate().skip(start) {
            let fail = |cause: StepError| StepFailure {
                index,
                cause,
                input_cached: false,
            };
            let authenticator = registry.get(identity).ok_or_else(|| {
                fail(StepError::InvalidConfig(format!(
                    "no authenticator registered for {} identities",
                    identity.kind
                )))
            })?;
            authenticator.validate(identity).map_err(fail)?;
            authenticators.push(&**authenticator);
        }
        Ok(authenticators)
    }

    async fn walk(&mut self, mode: CacheMode) -> Result<Credentials, StepFailure> {
        let target_index = self.chain.len() - 1;
        let start = match mode {
            CacheMode::Read => match self.resume_point().await {
                Some(index) if index == target_index => {
                    debug!("Using cached credentials for {}", self.target());
                    return self.finish();
                }
                Some(index) => index + 1,
                None => 0,
            },
            CacheMode::Bypass => 0,
        };

        let authenticators = self.preflight(start)?;
        let chain = self.chain.clone();

        for (offset, authenticator) in authenticators.into_iter().enumerate() {
            let index = start + offset;
            let Some(identity) = chain.get(index) else {
                break;
            };
            let parent = match index {
                0 => None,
                _ => self.results[index - 1].as_ref(),
            };
            let input_cached = parent.map(|p| p.issued_via().is_cached()).unwrap_or(false);

            let output = {
                let request = &StepRequest {
                    identity,
                    parent,
                    chain: &chain,
                    index,
                    force_refresh: mode == CacheMode::Bypass,
                };
                let step_started = Instant::now();
                let label = format!(
                    "Authenticating {} (step {}/{})",
                    identity.name,
                    index + 1,
                    chain.len()
                );
                debug!("{}", label);
                let result = self
                    .retry
                    .run(&label, move || authenticator.authenticate(request))
                    .await;
                log_timing(
                    self.timing_logs,
                    &format!("Time to authenticate {}", identity.name),
                    step_started.elapsed(),
                );
                result
            };
            self.network_steps += 1;

            let output = output.map_err(|cause| StepFailure {
                index,
                cause,
                input_cached,
            })?;
            self.record(identity, Credentials::issued(identity.name.clone(), output))
                .await;
        }

        self.finish()
    }

    async fn record(&mut self, identity: &Identity, credentials: Credentials) {
        if self.store.put_async(&identity.name, &credentials).await == 0 {
            debug!("Credentials for {} were not cached", identity.name);
        }
        if let Some(index) = self.chain.position(&identity.name) {
            self.results[index] = Some(credentials);
        }
    }

    fn finish(&self) -> Result<Credentials, StepFailure> {
        let target_index = self.chain.len() - 1;
        self.results[target_index].clone().ok_or_else(|| StepFailure {
            index: target_index,
            cause: StepError::InvalidConfig(format!(
                "no credentials produced for {}",
                self.target()
            )),
            input_cached: false,
        })
    }
}
