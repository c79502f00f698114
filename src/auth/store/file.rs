//! On-disk JSON credential cache, one file per identity.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use crate::auth::error::CacheError;
use crate::auth::store::CacheBackend;
use crate::auth::types::{Credentials, CredentialsRecord, IssuedVia};

/// Credential files live under `root`, named after the identity.
pub struct FileBackend {
    root: PathBuf,
    /// Per-identity write locks; unrelated identities never wait on each other.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FileBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Deterministic cache file path for `identity`.
    pub fn path_for(&self, identity: &str) -> PathBuf {
        self.root.join(format!("{}.json", file_stem(identity)))
    }

    fn lock_for(&self, identity: &str) -> Result<Arc<Mutex<()>>, CacheError> {
        let mut locks = self.locks.lock().map_err(|_| CacheError::LockPoisoned)?;
        Ok(Arc::clone(
            locks
                .entry(identity.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        ))
    }
}

impl CacheBackend for FileBackend {
    fn name(&self) -> &'static str {
        "file"
    }

    fn read(&self, identity: &str) -> Result<Option<Credentials>, CacheError> {
        let data = match fs::read(self.path_for(identity)) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record: CredentialsRecord = serde_json::from_slice(&data)
            .map_err(|e| CacheError::Corruption(format!("{}: {}", identity, e)))?;
        Ok(Some(
            Credentials::from(record).served_from(IssuedVia::CachedFile),
        ))
    }

    fn write(&self, identity: &str, credentials: &Credentials) -> Result<(), CacheError> {
        let data = serde_json::to_vec_pretty(&credentials.to_record())?;
        let lock = self.lock_for(identity)?;
        let _guard = lock.lock().map_err(|_| CacheError::LockPoisoned)?;
        ensure_private_dir(&self.root)?;
        write_atomic(&self.root, &self.path_for(identity), &data)?;
        Ok(())
    }

    fn remove(&self, identity: &str) -> Result<(), CacheError> {
        let lock = self.lock_for(identity)?;
        let _guard = lock.lock().map_err(|_| CacheError::LockPoisoned)?;
        match fs::remove_file(self.path_for(identity)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// File-name-safe stem for a cache key.
///
/// Names made only of `[a-z0-9._-]` (not starting with `.`) are used as is.
/// Anything else, uppercase included, becomes `@` plus 32 hex digits of its
/// SHA-256. `@` never appears in a verbatim stem and the digest is
/// lowercase, so two names never share a file, even on case-insensitive
/// filesystems.
pub(crate) fn file_stem(name: &str) -> String {
    let verbatim = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '_' | '-'));
    if verbatim {
        name.to_string()
    } else {
        let digest = Sha256::digest(name.as_bytes());
        format!("{}{}", HASHED_STEM_PREFIX, &hex::encode(digest)[..32])
    }
}

const HASHED_STEM_PREFIX: char = '@';

/// Create `dir` (and parents) readable only by the current user.
pub(crate) fn ensure_private_dir(dir: &Path) -> io::Result<()> {
    if dir.is_dir() {
        return Ok(());
    }
    fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

/// Write `data` to `path` via a temporary file in `dir` and an atomic
/// rename. Readers see either the old file or the new one, never a partial
/// write.
pub(crate) fn write_atomic(dir: &Path, path: &Path, data: &[u8]) -> io::Result<()> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::types::StepOutput;
    use chrono::{Duration, Utc};

    fn creds(owner: &str) -> Credentials {
        Credentials::fresh(
            owner,
            StepOutput::new(format!("secret-{}", owner), Utc::now() + Duration::hours(1)),
        )
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path().join("creds"));

        backend.write("admin", &creds("admin")).unwrap();
        let read = backend.read("admin").unwrap().unwrap();
        assert_eq!(read.owner(), "admin");
        assert_eq!(read.issued_via(), IssuedVia::CachedFile);
        assert!(backend.path_for("admin").exists());
    }

    #[test]
    fn test_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path());
        assert!(backend.read("ghost").unwrap().is_none());
        backend.remove("ghost").unwrap();
    }

    #[test]
    fn test_corrupt_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path());
        fs::write(backend.path_for("admin"), b"{\"owner\": \"adm").unwrap();
        assert!(matches!(
            backend.read("admin"),
            Err(CacheError::Corruption(_))
        ));
    }

    #[test]
    fn test_file_stem_hashes_unsafe_names() {
        assert_eq!(file_stem("prod-admin_1.x"), "prod-admin_1.x");
        let hashed = file_stem("../etc/passwd");
        assert!(hashed.starts_with('@'));
        assert_eq!(hashed.len(), 33);
        assert!(!hashed.contains('/'));
        assert_ne!(file_stem("a/b"), file_stem("a_b"));
        assert!(file_stem(".hidden").starts_with('@'));
    }

    #[test]
    fn test_file_stems_never_collide_across_naming_schemes() {
        let hashed = file_stem("team/admin");
        let lookalike = format!("id-{}", &hashed[1..]);
        assert_ne!(file_stem(&lookalike), hashed);
        assert_eq!(file_stem(&lookalike), lookalike);

        let lower = file_stem("dev");
        let upper = file_stem("DEV");
        assert_eq!(lower, "dev");
        assert_ne!(lower.to_lowercase(), upper.to_lowercase());
    }

    #[test]
    fn test_case_variants_keep_separate_files() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path());
        backend.write("dev", &creds("dev")).unwrap();
        backend.write("DEV", &creds("DEV")).unwrap();

        assert_ne!(
            backend.path_for("dev").to_string_lossy().to_lowercase(),
            backend.path_for("DEV").to_string_lossy().to_lowercase()
        );
        assert_eq!(backend.read("dev").unwrap().unwrap().owner(), "dev");
        assert_eq!(backend.read("DEV").unwrap().unwrap().owner(), "DEV");
    }

    #[cfg(unix)]
    #[test]
    fn test_cache_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path().join("creds"));
        backend.write("admin", &creds("admin")).unwrap();

        let mode = fs::metadata(backend.path_for("admin"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o077, 0);
    }
}
