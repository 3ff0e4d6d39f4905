use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum StorageError {
    #[error("Storage unavailable: {message}")]
    Unavailable { message: String },
}

impl StorageError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        StorageError::Unavailable {
            message: message.into(),
        }
    }
}

/// Asynchronous key-value store with the semantics of a browser-local
/// storage area: values are JSON, a missing key reads back as `None`,
/// and every read or write may fail as a whole.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get_raw(&self, key: &str) -> Result<Option<Value>, StorageError>;

    async fn set_raw(&self, key: &str, value: Value) -> Result<(), StorageError>;

    async fn remove(&self, key: &str) -> Result<(), StorageError>;

    async fn clear(&self) -> Result<(), StorageError>;
}

impl dyn KeyValueStore {
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        match self.get_raw(key).await? {
            Some(value) => serde_json::from_value(value).map(Some).map_err(|e| {
                StorageError::unavailable(format!("Failed to decode key '{}': {}", key, e))
            }),
            None => Ok(None),
        }
    }

    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
    ) -> Result<(), StorageError> {
        let value = serde_json::to_value(value).map_err(|e| {
            StorageError::unavailable(format!("Failed to encode key '{}': {}", key, e))
        })?;
        self.set_raw(key, value).await
    }
}
