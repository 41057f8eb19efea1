//! Read access to stored resources
//!
//! Resources without addressing (actors, collections, plain documents)
//! are readable by anyone. Addressed resources are readable by their
//! owner, by anyone when they are public, and otherwise only by the
//! actors they name. Only owners see blind recipients.

use serde_json::Value;

use crate::auth::{AuthContext, Identity};
use crate::data::model;
use crate::error::AppError;
use crate::federation::{redact, sanitize};

/// Properties that restrict who may read a resource
const ADDRESSING_PROPERTIES: [&str; 5] = ["to", "cc", "bto", "bcc", "audience"];

/// Blind-addressing properties hidden from everyone but the owner
const BLIND_PROPERTIES: [&str; 2] = ["bto", "bcc"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Full view, blind recipients included
    Owner,
    /// Sanitized view
    Reader,
    Denied,
}

/// The actor a resource belongs to: its `actor`, else its `attributedTo`
pub fn owner_of(resource: &Value) -> Option<&str> {
    resource
        .get("actor")
        .and_then(model::id_of)
        .or_else(|| resource.get("attributedTo").and_then(model::id_of))
}

fn addressees(resource: &Value) -> Vec<&str> {
    let mut uris = Vec::new();
    for property in ADDRESSING_PROPERTIES {
        match resource.get(property) {
            Some(Value::Array(entries)) => uris.extend(entries.iter().filter_map(model::id_of)),
            Some(value) => uris.extend(model::id_of(value)),
            None => {}
        }
    }
    uris
}

fn is_addressed(resource: &Value) -> bool {
    ADDRESSING_PROPERTIES
        .iter()
        .any(|property| resource.get(property).is_some())
}

/// What `identity` may see of `resource`
pub fn access(resource: &Value, identity: Option<&Identity>) -> Access {
    let requester = identity.map(|identity| identity.uri.as_str());
    if requester.is_some()
        && (requester == owner_of(resource) || requester == model::id_of(resource))
    {
        return Access::Owner;
    }
    if !is_addressed(resource) {
        return Access::Reader;
    }

    let addressees = addressees(resource);
    let readable = addressees.iter().any(|uri| model::is_public(uri))
        || requester.is_some_and(|requester| addressees.contains(&requester));
    if readable {
        Access::Reader
    } else {
        Access::Denied
    }
}

/// The representation served for `access`
///
/// Readers get the sanitized copy, with the blind recipients of an
/// embedded `object` removed as well.
pub fn view(resource: &Value, access: Access) -> Option<Value> {
    match access {
        Access::Owner => Some(redact(resource)),
        Access::Reader => {
            let mut view = sanitize(resource);
            if let Some(Value::Object(object)) = view.get_mut("object") {
                for property in BLIND_PROPERTIES {
                    object.remove(property);
                }
            }
            Some(view)
        }
        Access::Denied => None,
    }
}

/// Error for a refused read: 401 when anonymous, 403 otherwise
pub fn denied(auth: &AuthContext) -> AppError {
    if auth.is_authenticated() {
        AppError::Forbidden
    } else {
        AppError::Unauthorized
    }
}
