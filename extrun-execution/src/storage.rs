//! Key-value persistence behind step storage scopes
//!
//! Keys are full slash-separated paths built by [`crate::context`]; the
//! backends here know nothing about scopes.

use async_trait::async_trait;
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

/// Storage errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    /// The scope cannot be used for this invocation
    #[error("{0}")]
    Unavailable(String),

    #[error("Storage IO error: {0}")]
    Io(String),

    #[error("Storage serialization error: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Persistence backend shared by every scope of a worker
#[async_trait]
pub trait Storage: Send + Sync {
    async fn get(&self, path: &str) -> Result<Option<JsonValue>, StorageError>;

    async fn set(&self, path: &str, value: JsonValue) -> Result<(), StorageError>;

    /// Deleting a missing key is not an error
    async fn del(&self, path: &str) -> Result<(), StorageError>;
}

/// In-memory storage
#[derive(Debug, Default)]
pub struct MemoryStorage {
    data: RwLock<HashMap<String, JsonValue>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every stored path
    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.data.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, path: &str) -> Result<Option<JsonValue>, StorageError> {
        Ok(self.data.read().await.get(path).cloned())
    }

    async fn set(&self, path: &str, value: JsonValue) -> Result<(), StorageError> {
        self.data.write().await.insert(path.to_string(), value);
        Ok(())
    }

    async fn del(&self, path: &str) -> Result<(), StorageError> {
        self.data.write().await.remove(path);
        Ok(())
    }
}

/// Storage persisted as one flat JSON object in a file.
///
/// Every write rewrites the whole file. A missing file reads as empty.
#[derive(Debug)]
pub struct FileStorage {
    file: PathBuf,
    lock: Mutex<()>,
}

impl FileStorage {
    pub fn new(file: impl Into<PathBuf>) -> Self {
        Self {
            file: file.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    async fn read_all(&self) -> Result<Map<String, JsonValue>, StorageError> {
        match tokio::fs::read(&self.file).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(Map::new()),
            Ok(bytes) => match serde_json::from_slice(&bytes)? {
                JsonValue::Object(map) => Ok(map),
                _ => Err(StorageError::Serialization(format!(
                    "{} does not contain a JSON object",
                    self.file.display()
                ))),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Map::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_all(&self, map: &Map<String, JsonValue>) -> Result<(), StorageError> {
        if let Some(parent) = self.file.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let body = serde_json::to_vec_pretty(map)?;
        tokio::fs::write(&self.file, body).await?;
        debug!("Persisted {} storage entries to {:?}", map.len(), self.file);
        Ok(())
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn get(&self, path: &str) -> Result<Option<JsonValue>, StorageError> {
        let _guard = self.lock.lock().await;
        Ok(self.read_all().await?.remove(path))
    }

    async fn set(&self, path: &str, value: JsonValue) -> Result<(), StorageError> {
        let _guard = self.lock.lock().await;
        let mut map = self.read_all().await?;
        map.insert(path.to_string(), value);
        self.write_all(&map).await
    }

    async fn del(&self, path: &str) -> Result<(), StorageError> {
        let _guard = self.lock.lock().await;
        let mut map = self.read_all().await?;
        if map.remove(path).is_some() {
            self.write_all(&map).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_storage_set_get_del() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.get("a/storage/k").await.unwrap(), None);

        storage.set("a/storage/k", json!({"n": 1})).await.unwrap();
        assert_eq!(storage.get("a/storage/k").await.unwrap(), Some(json!({"n": 1})));

        storage.del("a/storage/k").await.unwrap();
        storage.del("a/storage/k").await.unwrap();
        assert!(storage.keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_file_storage_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join(".extrun").join("storage.json");

        let storage = FileStorage::new(&file);
        assert_eq!(storage.get("x").await.unwrap(), None);
        storage.set("x", json!("one")).await.unwrap();
        storage.set("y", json!(2)).await.unwrap();

        let reopened = FileStorage::new(&file);
        assert_eq!(reopened.get("x").await.unwrap(), Some(json!("one")));
        reopened.del("x").await.unwrap();
        assert_eq!(storage.get("x").await.unwrap(), None);
        assert_eq!(storage.get("y").await.unwrap(), Some(json!(2)));
    }

    #[tokio::test]
    async fn test_file_storage_rejects_non_object() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("storage.json");
        std::fs::write(&file, "[1, 2]").unwrap();

        let storage = FileStorage::new(&file);
        assert!(matches!(
            storage.get("x").await,
            Err(StorageError::Serialization(_))
        ));
    }
}
