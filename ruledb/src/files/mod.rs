use crate::error::{Result, RuleDbError};
use std::path::{Component, Path, PathBuf};

/// Blob storage for the values of `file` fields.
///
/// Keys have the form `<collectionId>/<recordId>/<filename>`. The store calls
/// `delete`/`delete_prefix` after commits and only logs their failures.
pub trait FileStorage: Send + Sync {
    fn upload(&self, key: &str, bytes: &[u8]) -> Result<()>;

    /// Remove a single file. Missing files are not an error.
    fn delete(&self, key: &str) -> Result<()>;

    /// Remove every file under `prefix`. Missing prefixes are not an error.
    fn delete_prefix(&self, prefix: &str) -> Result<()>;
}

/// Storage key of a record file.
pub fn file_key(collection_id: &str, record_id: &str, filename: &str) -> String {
    format!("{collection_id}/{record_id}/{filename}")
}

/// Storage prefix holding all files of a record.
pub fn record_prefix(collection_id: &str, record_id: &str) -> String {
    format!("{collection_id}/{record_id}")
}

/// Files on the local disk below a root directory.
#[derive(Debug, Clone)]
pub struct LocalFileStorage {
    root: PathBuf,
}

impl LocalFileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalFileStorage { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a key to a path, rejecting keys that would escape the root.
    fn resolve(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let safe = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(RuleDbError::Other(format!("invalid file key '{key}'")));
        }
        Ok(self.root.join(relative))
    }
}

impl FileStorage for LocalFileStorage {
    fn upload(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, bytes)?;
        log::debug!("stored file {key} ({} bytes)", bytes.len());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let path = self.resolve(key)?;
        match std::fs::remove_file(&path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn delete_prefix(&self, prefix: &str) -> Result<()> {
        let path = self.resolve(prefix.trim_end_matches('/'))?;
        if path.is_dir() {
            std::fs::remove_dir_all(&path)?;
        } else if path.is_file() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }
}
