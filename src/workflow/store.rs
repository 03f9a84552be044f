//! Key/value state store seam.
//!
//! The workflow persists everything as JSON documents under string keys:
//!
//! | Key | Value |
//! |-----|-------|
//! | `upload:{id}` | [`crate::workflow::records::UploadRecord`] |
//! | `workflow:{id}` | [`crate::workflow::records::WorkflowExecution`] |
//! | `workflow:{id}:stage:{stage}:result` | stage output (overwritten on re-run) |
//!
//! Keys are scoped by upload or workflow id, so concurrently processed
//! documents never touch each other's records.

use crate::error::StoreError;
use crate::workflow::stage::WorkflowStage;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;

pub fn upload_key(upload_id: &str) -> String {
    format!("upload:{upload_id}")
}

pub fn workflow_key(workflow_id: &str) -> String {
    format!("workflow:{workflow_id}")
}

pub fn stage_result_key(workflow_id: &str, stage: WorkflowStage) -> String {
    format!("workflow:{workflow_id}:stage:{stage}:result")
}

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    /// Write `value`, replacing whatever was stored.
    async fn put(&self, key: &str, value: Value) -> Result<(), StoreError>;

    /// Shallow-merge the top-level fields of `patch` into the stored object
    /// (creating it when absent) and return the merged value.
    async fn patch(&self, key: &str, patch: Value) -> Result<Value, StoreError>;
}

/// Read and deserialize a record.
pub async fn get_typed<T: DeserializeOwned>(
    store: &dyn StateStore,
    key: &str,
) -> Result<Option<T>, StoreError> {
    match store.get(key).await? {
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(|source| StoreError::Decode {
                key: key.to_string(),
                source,
            }),
        None => Ok(None),
    }
}

/// Serialize and write a record.
pub async fn put_typed<T: Serialize + Sync>(
    store: &dyn StateStore,
    key: &str,
    value: &T,
) -> Result<(), StoreError> {
    let value = serde_json::to_value(value).map_err(|source| StoreError::Encode {
        key: key.to_string(),
        source,
    })?;
    store.put(key, value).await
}

/// Shallow merge of two JSON objects.
fn merge(target: &mut Value, patch: Value, key: &str) -> Result<(), StoreError> {
    let Value::Object(fields) = patch else {
        return Err(StoreError::InvalidPatch { key: key.to_string() });
    };
    if !target.is_object() {
        *target = Value::Object(Default::default());
    }
    if let Value::Object(existing) = target {
        existing.extend(fields);
    }
    Ok(())
}

/// In-process [`StateStore`].
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    entries: RwLock<HashMap<String, Value>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys starting with `prefix`, sorted.
    pub async fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let entries = self.entries.read().await;
        let mut keys: Vec<String> = entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Value) -> Result<(), StoreError> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn patch(&self, key: &str, patch: Value) -> Result<Value, StoreError> {
        let mut entries = self.entries.write().await;
        let entry = entries.entry(key.to_string()).or_insert(Value::Null);
        merge(entry, patch, key)?;
        Ok(entry.clone())
    }
}
