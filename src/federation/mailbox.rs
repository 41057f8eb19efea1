//! Serialized appends to stored collections
//!
//! Inboxes and outboxes are read-modify-written as whole documents. Every
//! append for a given collection runs under that collection's lock, with a
//! single `put` per append.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::data::ResourceStore;
use crate::error::AppError;

/// Outcome of `Mailbox::prepend`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prepend {
    Inserted,
    AlreadyPresent,
    MissingCollection,
}

/// Newest-first collection writer
#[derive(Clone)]
pub struct Mailbox {
    store: Arc<dyn ResourceStore>,
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl Mailbox {
    pub fn new(store: Arc<dyn ResourceStore>) -> Self {
        Self {
            store,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn lock_for(&self, collection_uri: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(collection_uri.to_string())
            .or_default()
            .clone()
    }

    /// Drop the lock entry once nobody else holds or waits on it
    fn release(&self, collection_uri: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        // One reference in the map, one in `lock`
        if Arc::strong_count(&lock) == 2 {
            locks.remove(collection_uri);
        }
    }

    /// Insert `item_uri` at the head of the collection's `orderedItems`
    ///
    /// An id already present is left where it is.
    pub async fn prepend(&self, collection_uri: &str, item_uri: &str) -> Result<Prepend, AppError> {
        let lock = self.lock_for(collection_uri);
        let outcome = {
            let _guard = lock.lock().await;
            self.prepend_locked(collection_uri, item_uri).await
        };
        self.release(collection_uri, lock);
        outcome
    }

    async fn prepend_locked(&self, collection_uri: &str, item_uri: &str) -> Result<Prepend, AppError> {
        let Some(mut collection) = self.store.get(collection_uri).await? else {
            return Ok(Prepend::MissingCollection);
        };
        let Value::Object(fields) = &mut collection else {
            return Ok(Prepend::MissingCollection);
        };

        let items = fields
            .entry("orderedItems")
            .or_insert_with(|| Value::Array(Vec::new()));
        if !items.is_array() {
            *items = Value::Array(Vec::new());
        }
        let Value::Array(items) = items else {
            return Ok(Prepend::MissingCollection);
        };

        if items.iter().any(|item| crate::data::model::id_of(item) == Some(item_uri)) {
            return Ok(Prepend::AlreadyPresent);
        }
        items.insert(0, Value::String(item_uri.to_string()));
        let total = items.len();
        fields.insert("totalItems".to_string(), Value::from(total));

        self.store.put(collection).await?;
        Ok(Prepend::Inserted)
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.locks.lock().map(|locks| locks.len()).unwrap_or(0)
    }
}
