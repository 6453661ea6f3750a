//! In-memory remote store.
//!
//! Behaves like the realtime database for one process: records are JSON
//! objects, updates merge, and subscribers receive child-changed
//! notifications carrying the merged record. Every write is journaled and
//! the store can be switched offline to exercise failure paths.
//!
//! ## Limitations
//!
//! - Single-process only, nothing is persisted
//! - Notifications are delivered for every update, including the
//!   process's own writes (like the real store)

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{merge_fields, ChildChange, Fields, RecordRef, RemoteStore};
use crate::error::{Result, SprinklerError};

/// One journaled write.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreWrite {
    Create { record: RecordRef, fields: Fields },
    Update { record: RecordRef, fields: Fields },
    Remove { path: String },
}

#[derive(Default)]
struct Inner {
    collections: HashMap<String, BTreeMap<String, serde_json::Value>>,
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<ChildChange>>>,
    journal: Vec<StoreWrite>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    next_key: AtomicU64,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline every operation fails with a remote-store error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn get(&self, record: &RecordRef) -> Option<serde_json::Value> {
        self.lock()
            .collections
            .get(&record.collection)
            .and_then(|c| c.get(&record.key))
            .cloned()
    }

    /// Records of `collection` in creation order.
    pub fn records(&self, collection: &str) -> Vec<(RecordRef, serde_json::Value)> {
        self.lock()
            .collections
            .get(collection)
            .map(|c| {
                c.iter()
                    .map(|(k, v)| (RecordRef::new(collection, k.clone()), v.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn journal(&self) -> Vec<StoreWrite> {
        self.lock().journal.clone()
    }

    pub fn take_journal(&self) -> Vec<StoreWrite> {
        std::mem::take(&mut self.lock().journal)
    }

    /// Updates journaled for one record, oldest first.
    pub fn updates_to(&self, record: &RecordRef) -> Vec<Fields> {
        self.lock()
            .journal
            .iter()
            .filter_map(|w| match w {
                StoreWrite::Update { record: r, fields } if r == record => Some(fields.clone()),
                _ => None,
            })
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(SprinklerError::RemoteStore("memory store is offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn create_record(&self, collection: &str, fields: Fields) -> Result<RecordRef> {
        self.check_online()?;
        // Zero-padded so BTreeMap order equals push order, like push keys.
        let key = format!("-r{:010}", self.next_key.fetch_add(1, Ordering::SeqCst));
        let record = RecordRef::new(collection, key.clone());
        let mut inner = self.lock();
        inner
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(key, serde_json::Value::Object(fields.clone()));
        inner.journal.push(StoreWrite::Create {
            record: record.clone(),
            fields,
        });
        Ok(record)
    }

    async fn update(&self, record: &RecordRef, fields: Fields) -> Result<()> {
        self.check_online()?;
        let mut inner = self.lock();
        let value = {
            let entry = inner
                .collections
                .entry(record.collection.clone())
                .or_default()
                .entry(record.key.clone())
                .or_insert(serde_json::Value::Null);
            merge_fields(entry, &fields);
            entry.clone()
        };
        inner.journal.push(StoreWrite::Update {
            record: record.clone(),
            fields,
        });
        if let Some(subs) = inner.subscribers.get_mut(&record.collection) {
            let change = ChildChange {
                record: record.clone(),
                value,
            };
            subs.retain(|tx| tx.send(change.clone()).is_ok());
        }
        Ok(())
    }

    async fn remove(&self, record: &RecordRef) -> Result<()> {
        self.check_online()?;
        let mut inner = self.lock();
        if let Some(c) = inner.collections.get_mut(&record.collection) {
            c.remove(&record.key);
        }
        inner.journal.push(StoreWrite::Remove {
            path: record.path(),
        });
        Ok(())
    }

    async fn remove_collection(&self, collection: &str) -> Result<()> {
        self.check_online()?;
        let mut inner = self.lock();
        inner.collections.remove(collection);
        inner.journal.push(StoreWrite::Remove {
            path: collection.to_string(),
        });
        Ok(())
    }

    async fn subscribe(&self, collection: &str) -> Result<mpsc::UnboundedReceiver<ChildChange>> {
        self.check_online()?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock()
            .subscribers
            .entry(collection.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}
