//! In-memory resource store
//!
//! Volatile; used for development, tests, and as the default driver.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::store::{Predicate, ResourceStore, resource_id};
use crate::error::AppError;

/// Resource store backed by a `BTreeMap`
#[derive(Clone, Default)]
pub struct MemoryResourceStore {
    resources: Arc<RwLock<BTreeMap<String, Value>>>,
}

impl MemoryResourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored resources
    pub async fn len(&self) -> usize {
        self.resources.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.resources.read().await.is_empty()
    }
}

#[async_trait]
impl ResourceStore for MemoryResourceStore {
    async fn get(&self, uri: &str) -> Result<Option<Value>, AppError> {
        Ok(self.resources.read().await.get(uri).cloned())
    }

    async fn put(&self, resource: Value) -> Result<(), AppError> {
        let id = resource_id(&resource)?;
        self.resources.write().await.insert(id, resource);
        Ok(())
    }

    async fn remove(&self, uri: &str) -> Result<(), AppError> {
        self.resources.write().await.remove(uri);
        Ok(())
    }

    async fn is_stored(&self, uri: &str) -> Result<bool, AppError> {
        Ok(self.resources.read().await.contains_key(uri))
    }

    async fn query(&self, predicate: &Predicate) -> Result<Vec<Value>, AppError> {
        let resources = self.resources.read().await;
        Ok(resources
            .values()
            .filter(|resource| predicate.matches(resource))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn put_get_remove() {
        let store = MemoryResourceStore::new();
        store
            .put(json!({"id": "https://social.example/note/1", "type": "Note"}))
            .await
            .unwrap();

        assert!(store.is_stored("https://social.example/note/1").await.unwrap());
        let note = store.get("https://social.example/note/1").await.unwrap();
        assert_eq!(note.unwrap()["type"], "Note");

        store.remove("https://social.example/note/1").await.unwrap();
        assert!(store.get("https://social.example/note/1").await.unwrap().is_none());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn put_rejects_resource_without_id() {
        let store = MemoryResourceStore::new();
        let result = store.put(json!({"type": "Note"})).await;
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn query_one_filters_by_predicate() {
        let store = MemoryResourceStore::new();
        store
            .put(json!({"id": "urn:a", "type": "courier:Credentials", "attributedTo": "x"}))
            .await
            .unwrap();
        store
            .put(json!({"id": "https://social.example/a", "type": "courier:Credentials"}))
            .await
            .unwrap();

        let found = store
            .query_one(&Predicate::private().with_type("courier:Credentials"))
            .await
            .unwrap()
            .expect("private credentials present");
        assert_eq!(found["id"], "urn:a");
        assert_eq!(store.query(&Predicate::new()).await.unwrap().len(), 2);
    }
}
