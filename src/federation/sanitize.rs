//! Redaction of activities before they leave the server

use serde_json::{Map, Value};

use crate::data::model::INTERNAL_KEY_PREFIX;

/// Blind-addressing properties stripped from the top level
const BLIND_PROPERTIES: [&str; 2] = ["bto", "bcc"];

/// Shareable copy of an activity
///
/// Removes `bto`/`bcc` from the top level and every `courier:`-prefixed
/// key at any depth. The input is left untouched.
pub fn sanitize(activity: &Value) -> Value {
    match activity {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(key, _)| !BLIND_PROPERTIES.contains(&key.as_str()))
                .filter(|(key, _)| !is_internal(key))
                .map(|(key, value)| (key.clone(), redact(value)))
                .collect(),
        ),
        other => redact(other),
    }
}

/// Drop internal keys from a resource of any depth
pub fn redact(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(key, _)| !is_internal(key))
                .map(|(key, value)| (key.clone(), redact(value)))
                .collect::<Map<String, Value>>(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact).collect()),
        scalar => scalar.clone(),
    }
}

fn is_internal(key: &str) -> bool {
    key.starts_with(INTERNAL_KEY_PREFIX)
}
