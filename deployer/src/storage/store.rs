//! Key-value state store
//!
//! Values are JSON documents. `compare_and_swap` is the only way the deployment
//! state mutates an (artifact, server) entry.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use crate::errors::DeployerError;
use crate::filesys::file::File;

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, DeployerError>;

    async fn put(&self, key: &str, value: Value) -> Result<(), DeployerError>;

    async fn delete(&self, key: &str) -> Result<(), DeployerError>;

    /// Entries whose key starts with `prefix`, in key order
    async fn list(&self, prefix: &str) -> Result<Vec<(String, Value)>, DeployerError>;

    /// Set `key` to `new` only if its current value equals `expected`. `None` means
    /// absent on both sides. Fails with `CasConflict` otherwise.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<Value>,
        new: Option<Value>,
    ) -> Result<(), DeployerError>;
}

fn swap(
    entries: &mut BTreeMap<String, Value>,
    key: &str,
    expected: Option<Value>,
    new: Option<Value>,
) -> Result<(), DeployerError> {
    if entries.get(key) != expected.as_ref() {
        return Err(DeployerError::CasConflict(key.to_string()));
    }
    match new {
        Some(value) => entries.insert(key.to_string(), value),
        None => entries.remove(key),
    };
    Ok(())
}

fn list_prefix(entries: &BTreeMap<String, Value>, prefix: &str) -> Vec<(String, Value)> {
    entries
        .range(prefix.to_string()..)
        .take_while(|(k, _)| k.starts_with(prefix))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Store kept entirely in memory
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: Mutex<BTreeMap<String, Value>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, DeployerError> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Value) -> Result<(), DeployerError> {
        self.entries.lock().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), DeployerError> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Value)>, DeployerError> {
        Ok(list_prefix(&*self.entries.lock().await, prefix))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<Value>,
        new: Option<Value>,
    ) -> Result<(), DeployerError> {
        swap(&mut *self.entries.lock().await, key, expected, new)
    }
}

/// Store persisted as a single JSON document. Every mutation rewrites the file
/// atomically, so a crash leaves either the previous or the new document.
#[derive(Debug)]
pub struct FileKvStore {
    file: File,
    entries: Mutex<BTreeMap<String, Value>>,
}

impl FileKvStore {
    /// Open the store, starting empty when the file does not exist yet
    pub async fn open(file: File) -> Result<Self, DeployerError> {
        let entries = if file.exists().await {
            file.read_json().await.map_err(|e| {
                DeployerError::StorageError(format!(
                    "Failed to read state store {}: {}",
                    file.path().display(),
                    e
                ))
            })?
        } else {
            BTreeMap::new()
        };
        debug!(
            "Opened state store {} ({} entries)",
            file.path().display(),
            entries.len()
        );
        Ok(Self {
            file,
            entries: Mutex::new(entries),
        })
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    async fn persist(&self, entries: &BTreeMap<String, Value>) -> Result<(), DeployerError> {
        self.file.write_json(entries).await
    }

    /// Apply `mutate` to a copy, persist it, then publish it in memory
    async fn mutate<F>(&self, mutate: F) -> Result<(), DeployerError>
    where
        F: FnOnce(&mut BTreeMap<String, Value>) -> Result<(), DeployerError> + Send,
    {
        let mut entries = self.entries.lock().await;
        let mut next = entries.clone();
        mutate(&mut next)?;
        self.persist(&next).await?;
        *entries = next;
        Ok(())
    }
}

#[async_trait]
impl KvStore for FileKvStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, DeployerError> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Value) -> Result<(), DeployerError> {
        self.mutate(|entries| {
            entries.insert(key.to_string(), value);
            Ok(())
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), DeployerError> {
        self.mutate(|entries| {
            entries.remove(key);
            Ok(())
        })
        .await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Value)>, DeployerError> {
        Ok(list_prefix(&*self.entries.lock().await, prefix))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<Value>,
        new: Option<Value>,
    ) -> Result<(), DeployerError> {
        self.mutate(|entries| swap(entries, key, expected, new)).await
    }
}
