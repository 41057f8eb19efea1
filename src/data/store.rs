//! Resource store boundary
//!
//! The delivery and routing code only ever talks to a `ResourceStore`,
//! a document store keyed by URI. Adapters live next to this module.

use async_trait::async_trait;
use serde_json::Value;

use super::model::{self, PRIVATE_PREFIX};
use crate::error::AppError;

/// Partial-object query
///
/// Every populated field must match. `type_` accepts documents whose
/// `type` is the tag or an array containing it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Predicate {
    pub prefix: Option<String>,
    pub type_: Option<String>,
    pub attributed_to: Option<String>,
    pub properties: Vec<(String, Value)>,
}

impl Predicate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resources in the reserved private namespace
    pub fn private() -> Self {
        Self::new().with_prefix(PRIVATE_PREFIX)
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn with_type(mut self, type_: impl Into<String>) -> Self {
        self.type_ = Some(type_.into());
        self
    }

    pub fn attributed_to(mut self, uri: impl Into<String>) -> Self {
        self.attributed_to = Some(uri.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.push((key.into(), value.into()));
        self
    }

    pub fn matches(&self, resource: &Value) -> bool {
        let id = resource.get("id").and_then(Value::as_str).unwrap_or("");

        if let Some(prefix) = &self.prefix {
            if !id.starts_with(prefix.as_str()) {
                return false;
            }
        }

        if let Some(type_) = &self.type_ {
            if !model::has_type(resource, type_) {
                return false;
            }
        }

        if let Some(owner) = &self.attributed_to {
            let attributed = resource.get("attributedTo").and_then(model::id_of);
            if attributed != Some(owner.as_str()) {
                return false;
            }
        }

        self.properties
            .iter()
            .all(|(key, expected)| resource.get(key) == Some(expected))
    }
}

/// Async document store keyed by URI
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Fetch a resource by URI
    async fn get(&self, uri: &str) -> Result<Option<Value>, AppError>;

    /// Insert or replace a resource; the write is atomic per resource
    ///
    /// # Errors
    /// `Validation` when the resource has no string `id`
    async fn put(&self, resource: Value) -> Result<(), AppError>;

    /// Delete a resource; removing an absent URI is not an error
    async fn remove(&self, uri: &str) -> Result<(), AppError>;

    async fn is_stored(&self, uri: &str) -> Result<bool, AppError> {
        Ok(self.get(uri).await?.is_some())
    }

    /// All resources matching the predicate, ordered by URI
    ///
    /// The in-memory adapter scans every resource. The SQLite adapter
    /// narrows by prefix and string-valued properties in SQL first.
    async fn query(&self, predicate: &Predicate) -> Result<Vec<Value>, AppError>;

    async fn query_one(&self, predicate: &Predicate) -> Result<Option<Value>, AppError> {
        Ok(self.query(predicate).await?.into_iter().next())
    }
}

/// Extract the `id` a resource is stored under
pub(crate) fn resource_id(resource: &Value) -> Result<String, AppError> {
    resource
        .get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .ok_or_else(|| AppError::Validation("Resource is missing an 'id'".to_string()))
}
