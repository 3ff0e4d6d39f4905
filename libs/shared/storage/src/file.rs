use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tokio::fs;
use tracing::debug;

use crate::store::{KeyValueStore, StorageError};

/// File-backed store: one JSON document per key under a data directory.
/// Writes go through a temp file and an atomic rename so a failed write
/// never leaves a half-written value behind.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }

    async fn ensure_dir(&self) -> Result<(), StorageError> {
        fs::create_dir_all(&self.dir).await.map_err(|e| {
            StorageError::unavailable(format!(
                "Failed to create data directory {}: {}",
                self.dir.display(),
                e
            ))
        })
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get_raw(&self, key: &str) -> Result<Option<Value>, StorageError> {
        let path = self.path_for(key);
        let contents = match fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StorageError::unavailable(format!(
                    "Failed to read key '{}': {}",
                    key, e
                )))
            }
        };

        serde_json::from_str(&contents).map(Some).map_err(|e| {
            StorageError::unavailable(format!("Corrupt value for key '{}': {}", key, e))
        })
    }

    async fn set_raw(&self, key: &str, value: Value) -> Result<(), StorageError> {
        self.ensure_dir().await?;

        let path = self.path_for(key);
        let tmp = self.dir.join(format!("{}.json.tmp", key));
        let contents = serde_json::to_string(&value).map_err(|e| {
            StorageError::unavailable(format!("Failed to encode key '{}': {}", key, e))
        })?;

        fs::write(&tmp, contents).await.map_err(|e| {
            StorageError::unavailable(format!("Failed to write key '{}': {}", key, e))
        })?;
        fs::rename(&tmp, &path).await.map_err(|e| {
            StorageError::unavailable(format!("Failed to commit key '{}': {}", key, e))
        })?;

        debug!("Persisted key '{}' to {}", key, path.display());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(key);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::unavailable(format!(
                "Failed to remove key '{}': {}",
                key, e
            ))),
        }
    }

    async fn clear(&self) -> Result<(), StorageError> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(StorageError::unavailable(format!(
                    "Failed to list data directory: {}",
                    e
                )))
            }
        };

        while let Some(entry) = entries.next_entry().await.map_err(|e| {
            StorageError::unavailable(format!("Failed to list data directory: {}", e))
        })? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) == Some("json") {
                fs::remove_file(&path).await.map_err(|e| {
                    StorageError::unavailable(format!(
                        "Failed to remove {}: {}",
                        path.display(),
                        e
                    ))
                })?;
            }
        }
        Ok(())
    }
}

impl FileStore {
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
