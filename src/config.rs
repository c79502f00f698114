//! Environment settings and identity configuration loading.

use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::auth::clock::Clock;
use crate::auth::error::{ConfigError, EXIT_CONFIG};
use crate::auth::graph::IdentityGraph;
use crate::auth::retry::RetryPolicy;
use crate::auth::sso::SsoTokenCache;
use crate::auth::store::{CredentialStore, StoreOptions, StoreSelection};
use crate::auth::types::Identity;

const DEFAULT_CONFIG_PATH: &str = "identities.json";
const DEFAULT_KEYRING_SERVICE: &str = "credchain";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Invalid value for {var}: {value:?} ({reason})")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("Failed to read identity configuration {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Malformed identity configuration {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Graph(#[from] ConfigError),
}

impl SettingsError {
    pub fn exit_code(&self) -> i32 {
        EXIT_CONFIG
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub config_path: PathBuf,
    pub store: StoreSelection,
    pub cache_dir: PathBuf,
    pub sso_cache_dir: PathBuf,
    pub keyring_service: String,
    pub export_dir: Option<PathBuf>,
    pub retry_attempts: u32,
    pub retry_backoff: Duration,
    pub timeout: Option<Duration>,
    pub enable_timing_logs: bool,
}

impl Settings {
    /// Read settings from the process environment.
    pub fn from_env() -> Result<Self, SettingsError> {
        Self::from_vars(|name| env::var(name).ok())
    }

    /// Read settings through `var`, which returns a variable's value if set.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self, SettingsError> {
        let base = dirs::cache_dir()
            .unwrap_or_else(env::temp_dir)
            .join("credchain");
        let non_empty = |name: &str| var(name).filter(|v| !v.trim().is_empty());

        let store = match non_empty("CREDCHAIN_STORE") {
            Some(value) => value.parse().map_err(|reason| SettingsError::InvalidValue {
                var: "CREDCHAIN_STORE",
                value,
                reason,
            })?,
            None => StoreSelection::default(),
        };

        let retry_attempts = parse_number(
            "CREDCHAIN_RETRY_ATTEMPTS",
            non_empty("CREDCHAIN_RETRY_ATTEMPTS"),
        )?
        .unwrap_or(u64::from(crate::auth::retry::DEFAULT_MAX_ATTEMPTS));
        let retry_attempts = u32::try_from(retry_attempts)
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| SettingsError::InvalidValue {
                var: "CREDCHAIN_RETRY_ATTEMPTS",
                value: retry_attempts.to_string(),
                reason: "must be between 1 and 4294967295".to_string(),
            })?;

        let retry_backoff = parse_number(
            "CREDCHAIN_RETRY_BACKOFF_MS",
            non_empty("CREDCHAIN_RETRY_BACKOFF_MS"),
        )?
        .map(Duration::from_millis)
        .unwrap_or(crate::auth::retry::DEFAULT_INITIAL_BACKOFF);

        let timeout = parse_number("CREDCHAIN_TIMEOUT_SECS", non_empty("CREDCHAIN_TIMEOUT_SECS"))?
            .map(Duration::from_secs);

        Ok(Settings {
            config_path: non_empty("CREDCHAIN_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH)),
            store,
            cache_dir: non_empty("CREDCHAIN_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| base.join("credentials")),
            sso_cache_dir: non_empty("CREDCHAIN_SSO_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| base.join("sso")),
            keyring_service: non_empty("CREDCHAIN_KEYRING_SERVICE")
                .unwrap_or_else(|| DEFAULT_KEYRING_SERVICE.to_string()),
            export_dir: non_empty("CREDCHAIN_EXPORT_DIR").map(PathBuf::from),
            retry_attempts,
            retry_backoff,
            timeout,
            enable_timing_logs: var("ENABLE_TIMING_LOGS")
                .unwrap_or_else(|| "false".to_string())
                .parse()
                .unwrap_or(false),
        })
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            keyring_service: self.keyring_service.clone(),
            cache_dir: self.cache_dir.clone(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_attempts,
            initial_backoff: self.retry_backoff,
            ..RetryPolicy::default()
        }
    }

    /// Credential store for the configured backend selection.
    pub fn credential_store(&self, clock: Arc<dyn Clock>) -> CredentialStore {
        CredentialStore::from_selection(self.store, &self.store_options(), clock)
    }

    /// SSO token cache; disabled together with the credential cache.
    pub fn sso_cache(&self, clock: Arc<dyn Clock>) -> SsoTokenCache {
        match self.store {
            StoreSelection::Noop => SsoTokenCache::disabled(clock),
            _ => SsoTokenCache::new(self.sso_cache_dir.clone(), clock),
        }
    }
}

fn parse_number(var: &'static str, value: Option<String>) -> Result<Option<u64>, SettingsError> {
    value
        .map(|value| {
            value
                .trim()
                .parse::<u64>()
                .map_err(|e| SettingsError::InvalidValue {
                    var,
                    value: value.clone(),
                    reason: e.to_string(),
                })
        })
        .transpose()
}

#[derive(Deserialize)]
struct IdentityFile {
    identities: Vec<Identity>,
}

/// Read the declared identities from a JSON configuration file.
pub fn load_identities(path: &Path) -> Result<Vec<Identity>, SettingsError> {
    let data = fs::read(path).map_err(|source| SettingsError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let file: IdentityFile = serde_json::from_slice(&data).map_err(|source| SettingsError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(file.identities)
}

/// Read and validate the identity graph at `path`.
pub fn load_graph(path: &Path) -> Result<IdentityGraph, SettingsError> {
    Ok(IdentityGraph::new(load_identities(path)?)?)
}
