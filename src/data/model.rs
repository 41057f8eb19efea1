//! ActivityStreams vocabulary helpers
//!
//! Resources are kept as `serde_json::Value` documents; these helpers read
//! the handful of properties the delivery and routing code relies on.

use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeSet;

/// URIs meaning "the general public"; never delivery targets.
pub const PUBLIC_URIS: [&str; 3] = [
    "https://www.w3.org/ns/activitystreams#Public",
    "as:Public",
    "Public",
];

/// ActivityStreams 2.0 media types
pub const AS2_CONTENT_TYPES: [&str; 3] = [
    "application/activity+json",
    "application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"",
    "application/ld+json",
];

/// Media type used for outbound activities
pub const ACTIVITY_CONTENT_TYPE: &str = "application/activity+json";

/// Prefix of private, non-federated resource ids
pub const PRIVATE_PREFIX: &str = "urn:";

/// Prefix of internal property keys that must never leave the server
pub const INTERNAL_KEY_PREFIX: &str = "courier:";

/// Type tag of the per-actor private credentials resource
pub const CREDENTIALS_TYPE: &str = "courier:Credentials";
/// PEM private key property on credentials
pub const PRIVATE_KEY_PROPERTY: &str = "courier:privateKey";
/// Role list property on credentials
pub const ROLE_PROPERTY: &str = "courier:role";
/// Bearer token hash property on credentials
pub const TOKEN_HASH_PROPERTY: &str = "courier:tokenHash";

/// Addressing properties, in delivery order
pub const RECIPIENT_PROPERTIES: [&str; 4] = ["to", "cc", "bto", "bcc"];

pub fn is_public(uri: &str) -> bool {
    PUBLIC_URIS.contains(&uri)
}

pub fn is_private(uri: &str) -> bool {
    uri.starts_with(PRIVATE_PREFIX)
}

/// Whether the object's `type` (string or array) contains `tag`
pub fn has_type(object: &Value, tag: &str) -> bool {
    match object.get("type") {
        Some(Value::String(t)) => t == tag,
        Some(Value::Array(types)) => types.iter().any(|t| t.as_str() == Some(tag)),
        _ => false,
    }
}

/// First type tag of the object
pub fn type_tag(object: &Value) -> Option<&str> {
    match object.get("type") {
        Some(Value::String(t)) => Some(t.as_str()),
        Some(Value::Array(types)) => types.iter().find_map(Value::as_str),
        _ => None,
    }
}

pub fn is_collection(object: &Value) -> bool {
    has_type(object, "Collection") || has_type(object, "OrderedCollection")
}

/// `id` of an object, or the value itself when it is a bare URI
pub fn id_of(value: &Value) -> Option<&str> {
    match value {
        Value::String(uri) => Some(uri.as_str()),
        Value::Object(map) => map.get("id").and_then(Value::as_str),
        _ => None,
    }
}

/// Inline entries of a collection: `items`, falling back to `orderedItems`
pub fn collection_items(collection: &Value) -> &[Value] {
    ["items", "orderedItems"]
        .into_iter()
        .filter_map(|key| collection.get(key).and_then(Value::as_array))
        .find(|items| !items.is_empty())
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

/// Whether the collection is paged instead of carrying its items inline
pub fn is_paginated(collection: &Value) -> bool {
    collection_items(collection).is_empty() && collection.get("first").is_some()
}

/// Delivery endpoint of an actor-like object, preferring `sharedInbox`
pub fn preferred_inbox(object: &Value) -> Option<&str> {
    object
        .get("sharedInbox")
        .and_then(Value::as_str)
        .or_else(|| {
            object
                .get("endpoints")
                .and_then(|endpoints| endpoints.get("sharedInbox"))
                .and_then(Value::as_str)
        })
        .or_else(|| object.get("inbox").and_then(Value::as_str))
}

/// Union of every addressing field; each may be a URI or a list of URIs
pub fn recipients(activity: &Value) -> BTreeSet<String> {
    let mut uris = BTreeSet::new();
    for property in RECIPIENT_PROPERTIES {
        match activity.get(property) {
            Some(Value::String(uri)) => {
                uris.insert(uri.clone());
            }
            Some(Value::Array(entries)) => {
                uris.extend(entries.iter().filter_map(id_of).map(str::to_string));
            }
            Some(object @ Value::Object(_)) => {
                if let Some(uri) = id_of(object) {
                    uris.insert(uri.to_string());
                }
            }
            _ => {}
        }
    }
    uris
}

/// Public key block of an actor
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKey {
    pub id: Option<String>,
    pub owner: Option<String>,
    pub public_key_pem: Option<String>,
}

/// The subset of an actor document the server reads
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    pub id: String,
    pub public_key: Option<PublicKey>,
    pub inbox: Option<String>,
    pub outbox: Option<String>,
    pub preferred_username: Option<String>,
}

impl Actor {
    pub fn from_value(value: &Value) -> Option<Self> {
        Actor::deserialize(value).ok()
    }

    pub fn key_id(&self) -> Option<&str> {
        self.public_key.as_ref().and_then(|key| key.id.as_deref())
    }

    pub fn public_key_pem(&self) -> Option<&str> {
        self.public_key
            .as_ref()
            .and_then(|key| key.public_key_pem.as_deref())
    }
}
