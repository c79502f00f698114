//! Hooks run after a chain completes successfully.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::info;
use secrecy::ExposeSecret;
use serde::Serialize;

use crate::auth::resolver::Chain;
use crate::auth::store::file::{ensure_private_dir, file_stem, write_atomic};
use crate::auth::types::Credentials;

/// Variable naming the exported credentials file of the current identity.
pub const ENV_CREDENTIALS_FILE: &str = "CREDCHAIN_CREDENTIALS_FILE";

/// Called with the target's credentials once a session succeeds.
///
/// `target` is always the name the caller asked for; hooks must key
/// anything they persist by it, never by an intermediate identity.
pub trait PostAuthenticate: Send + Sync {
    fn after_authenticate(
        &self,
        target: &str,
        chain: &Chain,
        credentials: &Credentials,
    ) -> Result<(), String>;

    /// Variables pointing a child process at what this hook persists
    /// for `target`.
    fn environment(&self, _target: &str) -> BTreeMap<String, String> {
        BTreeMap::new()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExportRecord<'a> {
    identity: &'a str,
    chain: Vec<&'a str>,
    secret: &'a str,
    expires_at: DateTime<Utc>,
}

/// Writes the target's credentials to `<dir>/<target>.json`.
pub struct ExportFileHook {
    dir: PathBuf,
}

impl ExportFileHook {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, target: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(target)))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl PostAuthenticate for ExportFileHook {
    fn after_authenticate(
        &self,
        target: &str,
        chain: &Chain,
        credentials: &Credentials,
    ) -> Result<(), String> {
        if credentials.owner() != target {
            return Err(format!(
                "refusing to export credentials of {} as {}",
                credentials.owner(),
                target
            ));
        }
        let record = ExportRecord {
            identity: target,
            chain: chain.names(),
            secret: credentials.secret().expose_secret(),
            expires_at: credentials.expires_at(),
        };
        let data = serde_json::to_vec_pretty(&record).map_err(|e| e.to_string())?;
        let path = self.path_for(target);
        ensure_private_dir(&self.dir).map_err(|e| e.to_string())?;
        write_atomic(&self.dir, &path, &data).map_err(|e| e.to_string())?;
        info!("Exported credentials for {} to {}", target, path.display());
        Ok(())
    }

    fn environment(&self, target: &str) -> BTreeMap<String, String> {
        BTreeMap::from([(
            ENV_CREDENTIALS_FILE.to_string(),
            self.path_for(target).display().to_string(),
        )])
    }
}
