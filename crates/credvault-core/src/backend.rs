//! Key-value storage consumed by the record store.
//!
//! The store itself owns no durability guarantees across keys; each `write`
//! replaces exactly one entry.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use parking_lot::RwLock;
use tracing::warn;

use crate::error::{Result, VaultError};

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn read(&self, name: &str) -> Result<Option<Vec<u8>>>;
    async fn write(&self, name: &str, value: &[u8]) -> Result<()>;
    /// Removing a missing entry is not an error.
    async fn delete(&self, name: &str) -> Result<()>;
    /// All entry names, in ascending order.
    async fn list(&self) -> Result<Vec<String>>;
}

/// Process-local store. Also used as the session-scoped verifier store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn read(&self, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().get(name).cloned())
    }

    async fn write(&self, name: &str, value: &[u8]) -> Result<()> {
        self.entries.write().insert(name.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.entries.write().remove(name);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        Ok(self.entries.read().keys().cloned().collect())
    }
}

/// Single JSON document on disk (`name -> base64 value`), rewritten through a
/// staging file and an atomic rename on every mutation.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: RwLock<BTreeMap<String, String>>,
}

impl FileStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = if path.exists() {
            let raw = fs::read(&path)?;
            if raw.is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_slice(&raw)?
            }
        } else {
            BTreeMap::new()
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
            restrict_dir_permissions(parent);
        }
        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut staging = tempfile::NamedTempFile::new_in(dir)?;
        staging.write_all(&serde_json::to_vec_pretty(entries)?)?;
        staging.as_file().sync_all()?;
        staging
            .persist(&self.path)
            .map_err(|e| VaultError::Backend(format!("persist {}: {}", self.path.display(), e.error)))?;
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn read(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let guard = self.entries.read();
        match guard.get(name) {
            Some(encoded) => {
                let decoded = general_purpose::STANDARD
                    .decode(encoded)
                    .map_err(|e| VaultError::Backend(format!("decode entry {name}: {e}")))?;
                Ok(Some(decoded))
            }
            None => Ok(None),
        }
    }

    async fn write(&self, name: &str, value: &[u8]) -> Result<()> {
        let mut guard = self.entries.write();
        let previous = guard.insert(name.to_string(), general_purpose::STANDARD.encode(value));
        if let Err(e) = self.persist(&guard) {
            match previous {
                Some(old) => guard.insert(name.to_string(), old),
                None => guard.remove(name),
            };
            return Err(e);
        }
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let mut guard = self.entries.write();
        if let Some(old) = guard.remove(name) {
            if let Err(e) = self.persist(&guard) {
                guard.insert(name.to_string(), old);
                return Err(e);
            }
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        Ok(self.entries.read().keys().cloned().collect())
    }
}

fn restrict_dir_permissions(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o700)) {
            warn!("cannot restrict permissions on {}: {}", path.display(), e);
        }
    }
    #[cfg(not(unix))]
    let _ = path;
}
