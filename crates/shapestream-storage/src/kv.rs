//! Persistent key-value store for service metadata.
//!
//! A single JSON file replaced atomically on every write. Holds a
//! handful of small values (installation ID, bookkeeping), so the
//! whole-file rewrite is the simplest durable option.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Errors from the key-value store.
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    /// Underlying I/O failure.
    #[error("metadata store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The store file is not valid JSON.
    #[error("metadata store corrupted: {0}")]
    Corrupted(String),
}

/// File-backed string map with atomic whole-file persistence.
pub struct PersistentKvStore {
    path: PathBuf,
    values: BTreeMap<String, String>,
}

impl PersistentKvStore {
    /// Opens (or creates) the store at `path`.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors or invalid stored JSON.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, KvError> {
        let path = path.as_ref().to_path_buf();
        let values = match std::fs::read_to_string(&path) {
            Ok(text) => {
                serde_json::from_str(&text).map_err(|e| KvError::Corrupted(e.to_string()))?
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self { path, values })
    }

    /// Returns the value under `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Stores `value` under `key` and persists immediately.
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be written.
    pub fn put(&mut self, key: impl Into<String>, value: impl Into<String>) -> Result<(), KvError> {
        self.values.insert(key.into(), value.into());
        self.persist()
    }

    /// Returns the number of stored keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns `true` if the store holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn persist(&self) -> Result<(), KvError> {
        let tmp = self.path.with_extension("tmp");
        let mut file = File::create(&tmp)?;
        file.write_all(
            serde_json::to_string_pretty(&self.values)
                .map_err(|e| KvError::Corrupted(e.to_string()))?
                .as_bytes(),
        )?;
        file.sync_all()?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
