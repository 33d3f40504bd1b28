use crate::auth::{Credential, CredentialStore};
use anyhow::{Context, Result};
use directories::BaseDirs;
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Credential store persisted as a JSON file, typically under the user's
/// config directory.
///
/// The file is the source of truth; a copy is cached in memory so reads on
/// the request path never touch the disk.
pub struct FileCredentialStore {
    path: PathBuf,
    cached: Mutex<Option<Credential>>,
}

impl FileCredentialStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let cached = read_credential(&path);
        Self {
            path,
            cached: Mutex::new(cached),
        }
    }

    /// Opens the store at `<config dir>/subtrack/credentials.json`.
    pub fn user_default() -> Self {
        Self::open(default_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, credential: &Credential) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let serialized = serde_json::to_vec_pretty(credential)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        Ok(())
    }

    fn forget(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(err).with_context(|| format!("failed to remove {}", self.path.display()))
            }
        }
    }
}

impl CredentialStore for FileCredentialStore {
    fn get(&self) -> Option<Credential> {
        self.cached.lock().clone()
    }

    fn set(&self, credential: Credential) {
        if let Err(err) = self.persist(&credential) {
            warn!(error = ?err, "failed to persist credential");
        }
        *self.cached.lock() = Some(credential);
    }

    fn clear(&self) {
        self.cached.lock().take();
        if let Err(err) = self.forget() {
            warn!(error = ?err, "failed to remove persisted credential");
        }
    }
}

fn read_credential(path: &Path) -> Option<Credential> {
    let contents = fs::read_to_string(path).ok()?;
    match serde_json::from_str(&contents) {
        Ok(credential) => Some(credential),
        Err(err) => {
            warn!(error = ?err, path = %path.display(), "ignoring unreadable credential file");
            None
        }
    }
}

fn default_path() -> PathBuf {
    if let Some(base) = BaseDirs::new() {
        base.config_dir().join("subtrack").join("credentials.json")
    } else {
        PathBuf::from(".subtrack").join("credentials.json")
    }
}
