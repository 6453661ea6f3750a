//! Remote real-time store contract.
//!
//! The store is an observation/cross-client mirror, not the source of
//! truth. Only the [`mirror`](crate::mirror) adapter talks to it.
//!
//! - [`MemoryStore`]: in-process store for development and tests
//! - [`FirebaseStore`]: Firebase Realtime Database over its REST API

pub mod firebase;
pub mod memory;

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::Result;

pub use firebase::FirebaseStore;
pub use memory::MemoryStore;

pub type Fields = serde_json::Map<String, serde_json::Value>;

/// Turn a `json!({...})` object into [`Fields`]. Non-objects yield no fields.
pub fn fields(value: serde_json::Value) -> Fields {
    match value {
        serde_json::Value::Object(map) => map,
        _ => Fields::new(),
    }
}

/// Stable handle to one record: `<collection>/<key>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct RecordRef {
    pub collection: String,
    pub key: String,
}

impl RecordRef {
    pub fn new(collection: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            key: key.into(),
        }
    }

    pub fn path(&self) -> String {
        format!("{}/{}", self.collection, self.key)
    }
}

impl fmt::Display for RecordRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.key)
    }
}

/// A child record of a watched collection changed. `value` is the whole
/// record after the change.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildChange {
    pub record: RecordRef,
    pub value: serde_json::Value,
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Push a new record under `collection` and return its handle.
    async fn create_record(&self, collection: &str, fields: Fields) -> Result<RecordRef>;

    /// Merge `fields` into an existing record. `null` values delete fields.
    async fn update(&self, record: &RecordRef, fields: Fields) -> Result<()>;

    async fn remove(&self, record: &RecordRef) -> Result<()>;

    /// Drop every record under `collection`.
    async fn remove_collection(&self, collection: &str) -> Result<()>;

    /// Stream child-changed notifications for `collection`. Creation and
    /// removal of records are not reported.
    async fn subscribe(&self, collection: &str) -> Result<mpsc::UnboundedReceiver<ChildChange>>;
}

pub type SharedStore = Arc<dyn RemoteStore>;

/// Merge `fields` into `target` the way the realtime store does: keys are
/// replaced, `null` removes the key.
pub(crate) fn merge_fields(target: &mut serde_json::Value, fields: &Fields) {
    if !target.is_object() {
        *target = serde_json::Value::Object(Fields::new());
    }
    if let serde_json::Value::Object(map) = target {
        for (k, v) in fields {
            if v.is_null() {
                map.remove(k);
            } else {
                map.insert(k.clone(), v.clone());
            }
        }
    }
}
