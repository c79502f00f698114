//! Core data types: identities, credentials and SSO tokens.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

/// Margin subtracted from an expiry before a cached entry is trusted.
pub const SAFETY_BUFFER_MINUTES: i64 = 5;

/// The safety buffer as a `chrono::Duration`.
pub fn safety_buffer() -> Duration {
    Duration::minutes(SAFETY_BUFFER_MINUTES)
}

/// Opaque provider configuration attached to an identity.
pub type ProviderParams = BTreeMap<String, serde_json::Value>;

/// Kind of a declared identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IdentityKind {
    /// Root identity authenticating with its own provider mechanism.
    Provider,
    /// Root identity backed by an SSO device-authorization flow.
    SsoProvider,
    /// Standalone long-lived user credentials.
    User,
    /// Permission set obtained through a parent identity.
    PermissionSet,
    /// Role assumed with a parent identity's credentials.
    AssumeRole,
}

impl IdentityKind {
    /// Root kinds start a chain and must not declare a parent.
    pub fn is_root(&self) -> bool {
        matches!(
            self,
            IdentityKind::Provider | IdentityKind::SsoProvider | IdentityKind::User
        )
    }
}

impl fmt::Display for IdentityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityKind::Provider => write!(f, "provider"),
            IdentityKind::SsoProvider => write!(f, "sso-provider"),
            IdentityKind::User => write!(f, "user"),
            IdentityKind::PermissionSet => write!(f, "permission-set"),
            IdentityKind::AssumeRole => write!(f, "assume-role"),
        }
    }
}

/// One declared identity, as read from configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    pub kind: IdentityKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: ProviderParams,
    /// Used when a request names no identity.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub default: bool,
    /// Extra variables exported for this identity.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl Identity {
    pub fn new(name: impl Into<String>, kind: IdentityKind, parent: Option<&str>) -> Self {
        Self {
            name: name.into(),
            kind,
            parent: parent.map(str::to_string),
            params: ProviderParams::new(),
            default: false,
            env: BTreeMap::new(),
        }
    }

    pub fn as_default(mut self) -> Self {
        self.default = true;
        self
    }

    /// Attach an exported environment variable.
    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    /// Attach a provider parameter.
    pub fn with_param(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    /// Name of the parent identity, empty for roots.
    pub fn parent_name(&self) -> &str {
        self.parent.as_deref().unwrap_or("")
    }

    /// String parameter lookup.
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_str())
    }
}

/// How a credential was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IssuedVia {
    Fresh,
    CachedSecure,
    CachedFile,
    /// Derived from a cached SSO token rather than a device flow.
    CachedSsoToken,
}

impl IssuedVia {
    pub fn is_cached(&self) -> bool {
        !matches!(self, IssuedVia::Fresh)
    }
}

/// Secret material returned by an authenticator for one step.
///
/// The session, not the authenticator, tags the output with the identity
/// it authenticates as.
#[derive(Debug)]
pub struct StepOutput {
    pub secret: SecretString,
    pub expires_at: DateTime<Utc>,
    /// Served from a provider token cache instead of a new exchange.
    pub from_token_cache: bool,
}

impl StepOutput {
    pub fn new(secret: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            secret: SecretString::new(secret.into()),
            expires_at,
            from_token_cache: false,
        }
    }

    pub fn cached_token(token: SsoToken) -> Self {
        Self {
            secret: token.token,
            expires_at: token.expires_at,
            from_token_cache: true,
        }
    }
}

/// Time-bounded secret material proving authentication as one identity.
#[derive(Clone)]
pub struct Credentials {
    owner: String,
    secret: SecretString,
    expires_at: DateTime<Utc>,
    issued_via: IssuedVia,
}

impl Credentials {
    /// Freshly issued credentials for `owner`.
    pub fn fresh(owner: impl Into<String>, output: StepOutput) -> Self {
        Self::issued(owner, output).served_from(IssuedVia::Fresh)
    }

    /// Credentials for `owner` from one step's output, tagged
    /// `CachedSsoToken` when the step reused a cached token.
    pub fn issued(owner: impl Into<String>, output: StepOutput) -> Self {
        let issued_via = if output.from_token_cache {
            IssuedVia::CachedSsoToken
        } else {
            IssuedVia::Fresh
        };
        Self {
            owner: owner.into(),
            secret: output.secret,
            expires_at: output.expires_at,
            issued_via,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn secret(&self) -> &SecretString {
        &self.secret
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn issued_via(&self) -> IssuedVia {
        self.issued_via
    }

    /// Same credentials, re-tagged with the cache they were read from.
    pub fn served_from(mut self, via: IssuedVia) -> Self {
        self.issued_via = via;
        self
    }

    /// Usable at `now`: strictly before the expiry minus the safety buffer.
    pub fn is_usable_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at - safety_buffer()
    }

    pub(crate) fn to_record(&self) -> CredentialsRecord {
        CredentialsRecord {
            owner: self.owner.clone(),
            secret: self.secret.expose_secret().clone(),
            expires_at: self.expires_at,
            issued_via: self.issued_via,
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("owner", &self.owner)
            .field("secret", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .field("issued_via", &self.issued_via)
            .finish()
    }
}

/// Serialized form of `Credentials` in cache backends.
#[derive(Serialize, Deserialize)]
pub(crate) struct CredentialsRecord {
    pub owner: String,
    pub secret: String,
    pub expires_at: DateTime<Utc>,
    pub issued_via: IssuedVia,
}

impl From<CredentialsRecord> for Credentials {
    fn from(record: CredentialsRecord) -> Self {
        Self {
            owner: record.owner,
            secret: SecretString::new(record.secret),
            expires_at: record.expires_at,
            issued_via: record.issued_via,
        }
    }
}

/// Token obtained through an SSO device-authorization flow.
#[derive(Clone)]
pub struct SsoToken {
    pub provider: String,
    pub token: SecretString,
    pub expires_at: DateTime<Utc>,
    pub config_fingerprint: String,
}

impl SsoToken {
    pub fn is_usable_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at - safety_buffer()
    }
}

impl fmt::Debug for SsoToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SsoToken")
            .field("provider", &self.provider)
            .field("token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .field("config_fingerprint", &self.config_fingerprint)
            .finish()
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SsoTokenRecord {
    pub provider: String,
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub config_fingerprint: String,
}

impl From<&SsoToken> for SsoTokenRecord {
    fn from(token: &SsoToken) -> Self {
        Self {
            provider: token.provider.clone(),
            token: token.token.expose_secret().clone(),
            expires_at: token.expires_at,
            config_fingerprint: token.config_fingerprint.clone(),
        }
    }
}

impl From<SsoTokenRecord> for SsoToken {
    fn from(record: SsoTokenRecord) -> Self {
        Self {
            provider: record.provider,
            token: SecretString::new(record.token),
            expires_at: record.expires_at,
            config_fingerprint: record.config_fingerprint,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, hour, minute, 0).unwrap()
    }

    #[test]
    fn test_usable_respects_safety_buffer() {
        let creds = Credentials::fresh("admin", StepOutput::new("s3cret", at(12, 0)));

        assert!(creds.is_usable_at(at(11, 54)));
        assert!(!creds.is_usable_at(at(11, 55)));
        assert!(!creds.is_usable_at(at(12, 30)));
    }

    #[test]
    fn test_debug_redacts_secret() {
        let creds = Credentials::fresh("admin", StepOutput::new("hunter2", at(12, 0)));
        let debug_str = format!("{:?}", creds);
        assert!(debug_str.contains("REDACTED"));
        assert!(!debug_str.contains("hunter2"));
    }

    #[test]
    fn test_identity_kind_serde_names() {
        let identity: Identity = serde_json::from_str(
            r#"{"name": "ps", "kind": "permission-set", "parent": "base"}"#,
        )
        .unwrap();
        assert_eq!(identity.kind, IdentityKind::PermissionSet);
        assert_eq!(identity.parent_name(), "base");
        assert!(identity.params.is_empty());
        assert!(!identity.kind.is_root());
        assert!(!identity.default);
        assert!(identity.env.is_empty());

        let identity: Identity = serde_json::from_str(
            r#"{"name": "dev", "kind": "user", "default": true, "env": {"AWS_REGION": "us-east-2"}}"#,
        )
        .unwrap();
        assert!(identity.default);
        assert_eq!(identity.env.get("AWS_REGION").map(String::as_str), Some("us-east-2"));
    }

    #[test]
    fn test_reused_token_output_is_tagged_cached() {
        let fresh = Credentials::issued("base", StepOutput::new("t", at(12, 0)));
        assert_eq!(fresh.issued_via(), IssuedVia::Fresh);

        let reused = Credentials::issued(
            "base",
            StepOutput::cached_token(SsoToken {
                provider: "base".to_string(),
                token: SecretString::new("t".to_string()),
                expires_at: at(12, 0),
                config_fingerprint: "fp".to_string(),
            }),
        );
        assert_eq!(reused.issued_via(), IssuedVia::CachedSsoToken);
        assert!(reused.issued_via().is_cached());
    }
}
