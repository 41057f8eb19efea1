//! Activity service
//!
//! The federation endpoint hands every dereference and every inbox/outbox
//! POST to an `ActivityService`. `StoreActivityService` is the default:
//! it stores what it is given, keeps the collections current and passes
//! outbox activities on to the `DeliveryDispatcher`. Verb semantics
//! (Follow, Undo, ...) are not interpreted.

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::auth::{AuthContext, Identity};
use crate::config::AppConfig;
use crate::data::model::{self, Actor};
use crate::data::{Predicate, ResourceStore};
use crate::error::AppError;
use crate::federation::{DeliveryDispatcher, Mailbox, Prepend, redact, sanitize};
use super::visibility::{self, Access};

/// Result of a POST to a collection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostOutcome {
    /// Outbox POST; carries the activity id
    Created(String),
    /// Inbox POST
    Accepted,
}

#[async_trait]
pub trait ActivityService: Send + Sync {
    /// Dereference a stored resource
    async fn get(&self, uri: &str, auth: &AuthContext) -> Result<Value, AppError>;

    /// Submit an activity to the collection at `collection_uri`
    async fn post(
        &self,
        collection_uri: &str,
        activity: Value,
        auth: &AuthContext,
    ) -> Result<PostOutcome, AppError>;
}

/// Store-backed activity service
pub struct StoreActivityService {
    store: Arc<dyn ResourceStore>,
    mailbox: Mailbox,
    dispatcher: DeliveryDispatcher,
    config: Arc<AppConfig>,
}

impl StoreActivityService {
    /// Create new activity service
    pub fn new(
        store: Arc<dyn ResourceStore>,
        mailbox: Mailbox,
        dispatcher: DeliveryDispatcher,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            store,
            mailbox,
            dispatcher,
            config,
        }
    }

    /// Local actor owning the collection through `property` (`inbox` or `outbox`)
    async fn owner_of(&self, collection_uri: &str, property: &str) -> Result<Option<Actor>, AppError> {
        let Some(tenant) = self.config.tenant_for_uri(collection_uri) else {
            return Ok(None);
        };
        let predicate = Predicate::new()
            .with_prefix(tenant)
            .with_property(property, collection_uri);
        Ok(self
            .store
            .query_one(&predicate)
            .await?
            .as_ref()
            .and_then(Actor::from_value))
    }

    async fn post_to_outbox(
        &self,
        outbox_uri: &str,
        owner: &Actor,
        activity: Map<String, Value>,
        identity: &Identity,
    ) -> Result<PostOutcome, AppError> {
        if identity.uri != owner.id {
            tracing::warn!(identity = %identity.uri, outbox = %outbox_uri, "Outbox POST by non-owner");
            return Err(AppError::Forbidden);
        }
        let mut activity = activity;

        match activity.get("actor").map(model::id_of) {
            None => {
                activity.insert("actor".to_string(), Value::String(owner.id.clone()));
            }
            Some(Some(actor)) if actor == owner.id => {}
            Some(_) => {
                return Err(AppError::Validation(
                    "actor does not match the outbox owner".to_string(),
                ));
            }
        }
        if !activity
            .get("type")
            .is_some_and(|type_| type_.is_string() || type_.is_array())
        {
            return Err(AppError::Validation("Missing type field".to_string()));
        }

        let activity_id = match activity.get("id").and_then(Value::as_str) {
            Some(id) => {
                let id = id.to_string();
                if self.store.is_stored(&id).await? {
                    return Err(AppError::Validation(format!("{} already exists", id)));
                }
                id
            }
            None => {
                let id = format!("{}/activities/{}", owner.id, ulid::Ulid::new().to_string().to_lowercase());
                activity.insert("id".to_string(), Value::String(id.clone()));
                id
            }
        };
        let published = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        activity
            .entry("published")
            .or_insert_with(|| Value::String(published.clone()));

        if let Some(Value::Object(object)) = activity.get_mut("object") {
            if !object.contains_key("id") {
                let object_id = format!("{}/objects/{}", owner.id, ulid::Ulid::new().to_string().to_lowercase());
                object.insert("id".to_string(), Value::String(object_id));
                object
                    .entry("attributedTo")
                    .or_insert_with(|| Value::String(owner.id.clone()));
                object
                    .entry("published")
                    .or_insert_with(|| Value::String(published.clone()));
                self.store.put(Value::Object(object.clone())).await?;
            }
        }

        let activity = Value::Object(activity);
        self.store.put(activity.clone()).await?;
        if self.mailbox.prepend(outbox_uri, &activity_id).await? == Prepend::MissingCollection {
            tracing::warn!(outbox = %outbox_uri, "Outbox collection missing; activity stored only");
        }

        tracing::info!(activity = %activity_id, actor = %owner.id, "Activity posted to outbox");
        self.dispatcher.spawn(activity);
        Ok(PostOutcome::Created(activity_id))
    }

    /// Outbox as seen by someone other than its owner: only the entries
    /// they may read
    async fn readable_outbox(&self, outbox: &Value, auth: &AuthContext) -> Result<Value, AppError> {
        let mut readable = Vec::new();
        for entry in model::collection_items(outbox) {
            let Some(item_uri) = model::id_of(entry) else {
                continue;
            };
            let Some(item) = self.store.get(item_uri).await? else {
                continue;
            };
            if visibility::access(&item, auth.identity()) != Access::Denied {
                readable.push(entry.clone());
            }
        }

        let mut outbox = sanitize(outbox);
        if let Some(fields) = outbox.as_object_mut() {
            let key = if fields.contains_key("orderedItems") {
                "orderedItems"
            } else {
                "items"
            };
            fields.insert("totalItems".to_string(), Value::from(readable.len()));
            fields.insert(key.to_string(), Value::Array(readable));
        }
        Ok(outbox)
    }

    async fn post_to_inbox(
        &self,
        inbox_uri: &str,
        activity: Map<String, Value>,
        identity: &Identity,
    ) -> Result<PostOutcome, AppError> {
        let actor = activity.get("actor").and_then(model::id_of);
        if actor != Some(identity.uri.as_str()) {
            tracing::warn!(identity = %identity.uri, actor = ?actor, "Inbox POST actor mismatch");
            return Err(AppError::Forbidden);
        }
        let activity_id = activity
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| AppError::Validation("Missing id field".to_string()))?;

        if !self.store.is_stored(&activity_id).await? {
            self.store.put(Value::Object(activity)).await?;
        }

        match self.mailbox.prepend(inbox_uri, &activity_id).await? {
            Prepend::MissingCollection => Err(AppError::NotFound),
            outcome => {
                tracing::info!(activity = %activity_id, inbox = %inbox_uri, ?outcome, "Activity received");
                Ok(PostOutcome::Accepted)
            }
        }
    }
}

#[async_trait]
impl ActivityService for StoreActivityService {
    async fn get(&self, uri: &str, auth: &AuthContext) -> Result<Value, AppError> {
        if model::is_private(uri) {
            return Err(AppError::NotFound);
        }
        let resource = self.store.get(uri).await?.ok_or(AppError::NotFound)?;
        let requester = auth.identity().map(|identity| identity.uri.as_str());

        if model::is_collection(&resource) {
            if let Some(owner) = self.owner_of(uri, "inbox").await? {
                if requester != Some(owner.id.as_str()) {
                    return Err(visibility::denied(auth));
                }
                return Ok(redact(&resource));
            }
            if let Some(owner) = self.owner_of(uri, "outbox").await? {
                if requester != Some(owner.id.as_str()) {
                    return self.readable_outbox(&resource, auth).await;
                }
            }
        }

        let access = visibility::access(&resource, auth.identity());
        visibility::view(&resource, access).ok_or_else(|| visibility::denied(auth))
    }

    async fn post(
        &self,
        collection_uri: &str,
        activity: Value,
        auth: &AuthContext,
    ) -> Result<PostOutcome, AppError> {
        let identity = auth.identity().ok_or(AppError::Unauthorized)?;
        // Internal properties are never accepted from the outside
        let Value::Object(activity) = redact(&activity) else {
            return Err(AppError::Validation("Activity must be a JSON object".to_string()));
        };
        if let Some(id) = activity.get("id").and_then(Value::as_str) {
            if model::is_private(id) {
                return Err(AppError::Validation(format!("{} is reserved", id)));
            }
        }

        if let Some(owner) = self.owner_of(collection_uri, "outbox").await? {
            return self.post_to_outbox(collection_uri, &owner, activity, identity).await;
        }
        if self.owner_of(collection_uri, "inbox").await?.is_some() {
            return self.post_to_inbox(collection_uri, activity, identity).await;
        }

        if self.store.is_stored(collection_uri).await? {
            Err(AppError::MethodNotAllowed)
        } else {
            Err(AppError::NotFound)
        }
    }
}
