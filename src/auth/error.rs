//! Error types for chained identity authentication.

use std::time::Duration;

use thiserror::Error;

/// Exit code for a successful authentication.
pub const EXIT_OK: i32 = 0;
/// Exit code for configuration problems (unknown identity, cycles, bad params).
pub const EXIT_CONFIG: i32 = 2;
/// Exit code for provider or chain authentication failures.
pub const EXIT_AUTH: i32 = 3;
/// Exit code when the caller's timeout elapsed mid-chain.
pub const EXIT_TIMEOUT: i32 = 4;

/// Errors raised while building or querying the identity graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Identity not found: {name}")]
    UnknownIdentity { name: String },

    #[error("Circular dependency detected in identity chain involving {name}")]
    CyclicChain { name: String },

    #[error("Identity declared more than once: {name}")]
    DuplicateIdentity { name: String },

    #[error("Invalid configuration for identity {identity}: {reason}")]
    InvalidConfig { identity: String, reason: String },

    #[error("No identity given and none is marked as default")]
    NoDefaultIdentity,

    #[error("No identity given and several are marked as default: {}", names.join(", "))]
    MultipleDefaultIdentities { names: Vec<String> },
}

/// Failure of a single authentication step.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepError {
    /// The credentials used as input were rejected as expired.
    #[error("Credentials expired: {reason}")]
    Expired { reason: String },

    #[error("Provider rejected the request: {reason} (hint: {hint})")]
    ProviderRejected { reason: String, hint: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request throttled by provider")]
    Throttled { retry_after: Option<Duration> },

    #[error("Invalid identity configuration: {0}")]
    InvalidConfig(String),
}

impl StepError {
    /// Whether the step may be attempted again under the retry policy.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StepError::Network(_) | StepError::Throttled { .. })
    }

    pub fn rejected(reason: impl Into<String>, hint: impl Into<String>) -> Self {
        StepError::ProviderRejected {
            reason: reason.into(),
            hint: hint.into(),
        }
    }
}

/// Errors returned by a top-level authentication request.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Authentication failed at identity {failed_identity} (step {step}): {cause}")]
    ChainAuthentication {
        failed_identity: String,
        step: usize,
        #[source]
        cause: StepError,
    },

    #[error("Authentication of {target} timed out after {elapsed:?}")]
    TimedOut { target: String, elapsed: Duration },

    #[error("Post-authentication hook failed for {target}: {reason}")]
    PostAuthenticate { target: String, reason: String },

    #[error("Credentials for {actual} cannot be returned as {expected}")]
    OwnerMismatch { expected: String, actual: String },
}

impl AuthError {
    /// Process exit code a calling CLI should use for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            AuthError::Config(_) => EXIT_CONFIG,
            AuthError::ChainAuthentication {
                cause: StepError::InvalidConfig(_),
                ..
            } => EXIT_CONFIG,
            AuthError::ChainAuthentication { .. }
            | AuthError::PostAuthenticate { .. }
            | AuthError::OwnerMismatch { .. } => EXIT_AUTH,
            AuthError::TimedOut { .. } => EXIT_TIMEOUT,
        }
    }

    /// Name of the identity whose step failed, if the failure happened mid-chain.
    pub fn failed_identity(&self) -> Option<&str> {
        match self {
            AuthError::ChainAuthentication {
                failed_identity, ..
            } => Some(failed_identity),
            _ => None,
        }
    }
}

/// Errors inside cache backends. These never leave the cache layer: the
/// store logs them and reports a miss.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache entry is corrupt: {0}")]
    Corruption(String),

    #[error("Cached entry was issued for a different configuration")]
    ConfigMismatch,

    #[error("Cached entry belongs to {actual}, requested {expected}")]
    OwnerMismatch { expected: String, actual: String },

    #[error("Cache I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Keyring error: {0}")]
    Keyring(String),

    #[error("Internal lock poisoned")]
    LockPoisoned,
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::Serialization(e.to_string())
    }
}

impl From<keyring::Error> for CacheError {
    fn from(e: keyring::Error) -> Self {
        CacheError::Keyring(e.to_string())
    }
}
