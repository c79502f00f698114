//! Chained identity authentication.
//!
//! A target identity is reached by authenticating a chain of identities,
//! root first, each step using its parent's credentials. Credentials for
//! every step are cached, and a request resumes from the deepest step whose
//! cached credentials are still valid.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────┐     ┌───────────────┐     ┌───────────────────────┐
//! │ IdentityGraph │────▶│ ChainResolver │────▶│ AuthenticationSession │
//! │  (validated)  │     │ (root→target) │     │   (owns its Chain)    │
//! └───────────────┘     └───────────────┘     └───────────────────────┘
//!                                                  │              │
//!                                                  ▼              ▼
//!                                   ┌──────────────────┐  ┌───────────────────────┐
//!                                   │ CredentialStore  │  │ IdentityAuthenticator │
//!                                   │ secure/file/noop │  │   (per kind, trait)   │
//!                                   └──────────────────┘  └───────────────────────┘
//!                                                                    │
//!                                                                    ▼
//!                                                           ┌─────────────────┐
//!                                                           │  SsoTokenCache  │
//!                                                           │   (sso roots)   │
//!                                                           └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use credchain::auth::{AuthManager, AuthenticatorRegistry, CommandAuthenticator};
//!
//! let clock: Arc<dyn Clock> = Arc::new(SystemClock);
//! let registry = AuthenticatorRegistry::new()
//!     .register(IdentityKind::AssumeRole, Arc::new(CommandAuthenticator::new()));
//! let manager = AuthManager::new(graph, store, sso_cache, clock, registry);
//!
//! match manager.authenticate("prod-admin").await {
//!     Ok(credentials) => { /* use credentials.secret() */ }
//!     Err(e) => std::process::exit(e.exit_code()),
//! }
//! ```

pub mod authenticator;
pub mod clock;
pub mod command;
pub mod error;
pub mod graph;
pub mod hooks;
pub mod manager;
pub mod resolver;
pub mod retry;
pub mod session;
pub mod sso;
pub mod store;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod types;

pub use authenticator::{AuthenticatorRegistry, IdentityAuthenticator, StepRequest};
pub use clock::{Clock, SystemClock};
pub use command::CommandAuthenticator;
pub use error::{AuthError, CacheError, ConfigError, StepError};
pub use graph::IdentityGraph;
pub use hooks::{ExportFileHook, PostAuthenticate};
pub use manager::AuthManager;
pub use resolver::{Chain, ChainResolver};
pub use retry::RetryPolicy;
pub use session::AuthenticationSession;
pub use sso::{DeviceAuthorization, SsoParams, SsoProviderAuthenticator, SsoTokenCache};
pub use store::{CacheBackend, CredentialStore, StoreOptions, StoreSelection, WritePolicy};
pub use types::{Credentials, Identity, IdentityKind, IssuedVia, SsoToken, StepOutput};
