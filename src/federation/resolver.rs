//! Recipient resolution
//!
//! Expands addressing URIs into the set of inbox endpoints to deliver to,
//! recursing through collections.

use http::header::{ACCEPT, HeaderValue};
use serde_json::Value;
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::Arc;

use super::transport::{HttpTransport, RequestOptions, Signer};
use crate::config::AppConfig;
use crate::data::ResourceStore;
use crate::data::model::{self, AS2_CONTENT_TYPES};

/// Entry in the resolution worklist
enum Pending {
    Uri(String),
    Inline(Value),
}

/// Resolves recipient URIs to inbox endpoints
///
/// Resolution is best-effort: a URI that cannot be loaded is skipped.
/// Each URI is expanded at most once per call, so cyclic collections
/// terminate.
#[derive(Clone)]
pub struct RecipientResolver {
    store: Arc<dyn ResourceStore>,
    transport: Arc<dyn HttpTransport>,
    config: Arc<AppConfig>,
}

impl RecipientResolver {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        transport: Arc<dyn HttpTransport>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            store,
            transport,
            config,
        }
    }

    /// Inbox endpoints for `recipients`
    ///
    /// `signer` authenticates the GET used to dereference remote
    /// recipients missing from the store.
    pub async fn resolve(
        &self,
        recipients: &BTreeSet<String>,
        signer: Option<Arc<dyn Signer>>,
    ) -> BTreeSet<String> {
        let mut pending: VecDeque<Pending> = recipients.iter().cloned().map(Pending::Uri).collect();
        let mut visited = HashSet::new();
        let mut inboxes = BTreeSet::new();

        while let Some(next) = pending.pop_front() {
            let resource = match next {
                Pending::Uri(uri) => {
                    if model::is_public(&uri) || !visited.insert(uri.clone()) {
                        continue;
                    }
                    match self.load(&uri, signer.as_ref()).await {
                        Some(resource) => resource,
                        None => {
                            tracing::debug!(recipient = %uri, "Recipient did not resolve, skipping");
                            continue;
                        }
                    }
                }
                Pending::Inline(resource) => resource,
            };

            if model::is_collection(&resource) {
                if model::is_paginated(&resource) {
                    tracing::warn!(
                        collection = model::id_of(&resource).unwrap_or("<inline>"),
                        "Paged collection is not expanded"
                    );
                }
                for item in model::collection_items(&resource) {
                    match item {
                        Value::String(uri) => pending.push_back(Pending::Uri(uri.clone())),
                        Value::Object(_) => {
                            if let Some(entry) = inline_entry(item, &mut visited) {
                                pending.push_back(entry);
                            }
                        }
                        _ => {}
                    }
                }
            } else if let Some(inbox) = model::preferred_inbox(&resource) {
                inboxes.insert(inbox.to_string());
            }
        }

        inboxes
    }

    async fn load(&self, uri: &str, signer: Option<&Arc<dyn Signer>>) -> Option<Value> {
        match self.store.get(uri).await {
            Ok(Some(resource)) => return Some(resource),
            Ok(None) => {}
            Err(error) => {
                tracing::warn!(recipient = %uri, %error, "Store lookup failed");
                return None;
            }
        }

        if !self.config.delivery.fetch_remote_recipients
            || self.config.is_local(uri)
            || model::is_private(uri)
        {
            return None;
        }

        let mut options = RequestOptions::new()
            .with_header(ACCEPT, HeaderValue::from_static(AS2_CONTENT_TYPES[0]));
        if let Some(signer) = signer {
            options = options.with_signer(signer.clone());
        }

        match self.transport.get(uri, options).await {
            Ok(response) if response.is_success() => match response.json() {
                Ok(document) => Some(document),
                Err(error) => {
                    tracing::warn!(recipient = %uri, %error, "Remote recipient is not JSON");
                    None
                }
            },
            Ok(response) => {
                tracing::debug!(recipient = %uri, status = response.status_code, "Remote recipient fetch refused");
                None
            }
            Err(error) => {
                tracing::warn!(recipient = %uri, %error, "Remote recipient fetch failed");
                None
            }
        }
    }
}

/// Embedded collection items are used as-is when they carry enough to
/// deliver; otherwise their `id` is dereferenced.
fn inline_entry(item: &Value, visited: &mut HashSet<String>) -> Option<Pending> {
    let usable = (model::is_collection(item) && !model::collection_items(item).is_empty())
        || model::preferred_inbox(item).is_some();

    match model::id_of(item) {
        Some(id) if !usable => Some(Pending::Uri(id.to_string())),
        Some(id) => visited
            .insert(id.to_string())
            .then(|| Pending::Inline(item.clone())),
        None => Some(Pending::Inline(item.clone())),
    }
}
