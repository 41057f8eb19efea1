//! Activity delivery
//!
//! Delivers a finished activity to every inbox its addressing resolves to:
//! local inboxes are appended in the store, remote ones receive a signed
//! POST of the sanitized activity.

use http::header::{CONTENT_TYPE, HeaderValue};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OnceCell, Semaphore};
use tokio::task::JoinSet;

use super::mailbox::{Mailbox, Prepend};
use super::resolver::RecipientResolver;
use super::sanitize::sanitize;
use super::signature::HttpSignatureSigner;
use super::transport::{HttpTransport, RequestBody, RequestOptions, Signer};
use crate::config::AppConfig;
use crate::data::model::{self, ACTIVITY_CONTENT_TYPE, CREDENTIALS_TYPE, PRIVATE_KEY_PROPERTY};
use crate::data::{Predicate, ResourceStore};
use crate::metrics;

/// Why a delivery was abandoned before reaching any inbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryAbort {
    /// Activity has no `id` or `actor`
    MalformedActivity,
    ActorNotFound,
    /// Actor has no `publicKey.id`
    MissingActorKey,
    /// No credentials resource or no private key in it
    MissingCredentials,
    /// Private key material could not be parsed
    InvalidCredentials,
    StoreUnavailable,
}

/// Result of a delivery attempt to one inbox
#[derive(Debug, Clone)]
pub struct DeliveryResult {
    /// Target inbox URI
    pub inbox_uri: String,
    /// Whether the inbox belongs to a local tenant
    pub local: bool,
    /// Whether delivery succeeded
    pub success: bool,
    /// HTTP status code if available
    pub status_code: Option<u16>,
    /// Error message if failed
    pub error: Option<String>,
}

impl DeliveryResult {
    fn ok(inbox_uri: &str, local: bool, status_code: Option<u16>) -> Self {
        Self {
            inbox_uri: inbox_uri.to_string(),
            local,
            success: true,
            status_code,
            error: None,
        }
    }

    fn failed(inbox_uri: &str, local: bool, status_code: Option<u16>, error: impl Into<String>) -> Self {
        Self {
            inbox_uri: inbox_uri.to_string(),
            local,
            success: false,
            status_code,
            error: Some(error.into()),
        }
    }
}

/// Summary of one `deliver` call
#[derive(Debug, Clone, Default)]
pub struct DeliveryReport {
    pub activity_id: Option<String>,
    pub aborted: Option<DeliveryAbort>,
    pub results: Vec<DeliveryResult>,
}

impl DeliveryReport {
    fn aborted(activity_id: Option<&str>, reason: DeliveryAbort) -> Self {
        Self {
            activity_id: activity_id.map(str::to_string),
            aborted: Some(reason),
            results: Vec::new(),
        }
    }

    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }

    pub fn result_for(&self, inbox_uri: &str) -> Option<&DeliveryResult> {
        self.results.iter().find(|r| r.inbox_uri == inbox_uri)
    }
}

/// Activity delivery service
///
/// Never fails towards its caller: every failure is logged and recorded in
/// the returned `DeliveryReport`.
#[derive(Clone)]
pub struct DeliveryDispatcher {
    store: Arc<dyn ResourceStore>,
    transport: Arc<dyn HttpTransport>,
    resolver: RecipientResolver,
    mailbox: Mailbox,
    config: Arc<AppConfig>,
    in_flight: Arc<Mutex<JoinSet<()>>>,
    encode: fn(&Value) -> serde_json::Result<Vec<u8>>,
}

/// Wire body of a remote delivery: the sanitized activity as JSON
fn encode_message(activity: &Value) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(&sanitize(activity))
}

impl DeliveryDispatcher {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        transport: Arc<dyn HttpTransport>,
        mailbox: Mailbox,
        config: Arc<AppConfig>,
    ) -> Self {
        let resolver = RecipientResolver::new(store.clone(), transport.clone(), config.clone());
        Self {
            store,
            transport,
            resolver,
            mailbox,
            config,
            in_flight: Arc::new(Mutex::new(JoinSet::new())),
            encode: encode_message,
        }
    }

    #[cfg(test)]
    fn with_encoder(mut self, encode: fn(&Value) -> serde_json::Result<Vec<u8>>) -> Self {
        self.encode = encode;
        self
    }

    /// Deliver in the background
    ///
    /// The task is tracked so that `drain` can wait for it on shutdown.
    pub fn spawn(&self, activity: Value) {
        let dispatcher = self.clone();
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        // Reap finished deliveries so the set does not grow unbounded
        while in_flight.try_join_next().is_some() {}
        in_flight.spawn(async move {
            dispatcher.deliver(&activity).await;
        });
    }

    /// Wait up to `grace` for background deliveries, then abort the rest
    ///
    /// Returns the number of deliveries that were aborted.
    pub async fn drain(&self, grace: Duration) -> usize {
        let mut in_flight = {
            let mut guard = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };
        if in_flight.is_empty() {
            return 0;
        }

        tracing::info!(pending = in_flight.len(), "Waiting for in-flight deliveries");
        let finished = tokio::time::timeout(grace, async {
            while in_flight.join_next().await.is_some() {}
        })
        .await;

        if finished.is_ok() {
            return 0;
        }

        let remaining = in_flight.len();
        tracing::warn!(remaining, "Aborting deliveries still running after grace period");
        in_flight.shutdown().await;
        remaining
    }

    /// Deliver `activity` to every resolved inbox
    pub async fn deliver(&self, activity: &Value) -> DeliveryReport {
        let activity_id = activity.get("id").and_then(Value::as_str);
        let actor_uri = activity.get("actor").and_then(model::id_of);
        let (Some(activity_id), Some(actor_uri)) = (activity_id, actor_uri) else {
            tracing::error!("Activity without id or actor cannot be delivered");
            return DeliveryReport::aborted(activity_id, DeliveryAbort::MalformedActivity);
        };

        // 1. Sender actor and its advertised key
        let actor = match self.store.get(actor_uri).await {
            Ok(Some(actor)) => actor,
            Ok(None) => {
                tracing::error!(actor = %actor_uri, activity = %activity_id, "Actor not found, delivery aborted");
                return DeliveryReport::aborted(Some(activity_id), DeliveryAbort::ActorNotFound);
            }
            Err(error) => {
                tracing::error!(actor = %actor_uri, %error, "Store unavailable, delivery aborted");
                return DeliveryReport::aborted(Some(activity_id), DeliveryAbort::StoreUnavailable);
            }
        };
        let Some(key_id) = actor.pointer("/publicKey/id").and_then(Value::as_str) else {
            tracing::error!(actor = %actor_uri, "No key for actor, delivery aborted");
            return DeliveryReport::aborted(Some(activity_id), DeliveryAbort::MissingActorKey);
        };

        // 2-3. Private key and signer
        let signer: Option<Arc<dyn Signer>> = match self.load_signer(actor_uri, key_id).await {
            Ok(signer) => Some(signer),
            Err(reason) if self.config.delivery.local_without_credentials => {
                tracing::warn!(actor = %actor_uri, ?reason, "Actor cannot sign, remote inboxes will be skipped");
                None
            }
            Err(reason) => {
                tracing::error!(actor = %actor_uri, ?reason, "No usable private key for actor, delivery aborted");
                return DeliveryReport::aborted(Some(activity_id), reason);
            }
        };

        // 4. Addressing to inboxes
        let recipients = model::recipients(activity);
        let inboxes = self.resolver.resolve(&recipients, signer.clone()).await;
        tracing::info!(
            activity = %activity_id,
            recipients = recipients.len(),
            inboxes = inboxes.len(),
            "Delivering activity"
        );

        // 5. Bounded fan-out; the sanitized body is built once and shared
        let semaphore = Arc::new(Semaphore::new(self.config.delivery.max_concurrency));
        let message = Arc::new(OnceCell::new());
        let shared = Arc::new(activity.clone());
        let mut tasks = JoinSet::new();

        for inbox_uri in inboxes {
            let local = self.config.is_local(&inbox_uri);
            let dispatcher = self.clone();
            let semaphore = semaphore.clone();
            let message = message.clone();
            let activity = shared.clone();
            let signer = signer.clone();

            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let result = if local {
                    dispatcher.deliver_local(&inbox_uri, &activity).await
                } else {
                    dispatcher
                        .deliver_remote(&inbox_uri, &activity, &message, signer)
                        .await
                };
                metrics::record_delivery(local, if result.success { "success" } else { "failure" });
                result
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(error) => tracing::error!(%error, "Delivery task failed"),
            }
        }
        results.sort_by(|a, b| a.inbox_uri.cmp(&b.inbox_uri));

        let report = DeliveryReport {
            activity_id: Some(activity_id.to_string()),
            aborted: None,
            results,
        };
        tracing::info!(
            activity = %activity_id,
            succeeded = report.succeeded(),
            failed = report.failed(),
            "Delivery complete"
        );
        report
    }

    async fn load_signer(
        &self,
        actor_uri: &str,
        key_id: &str,
    ) -> Result<Arc<dyn Signer>, DeliveryAbort> {
        let predicate = Predicate::private()
            .with_type(CREDENTIALS_TYPE)
            .attributed_to(actor_uri);
        let credentials = self
            .store
            .query_one(&predicate)
            .await
            .map_err(|_| DeliveryAbort::StoreUnavailable)?
            .ok_or(DeliveryAbort::MissingCredentials)?;
        let private_key_pem = credentials
            .get(PRIVATE_KEY_PROPERTY)
            .and_then(Value::as_str)
            .filter(|pem| !pem.is_empty())
            .ok_or(DeliveryAbort::MissingCredentials)?;

        let signer = HttpSignatureSigner::new(key_id, private_key_pem)
            .map_err(|_| DeliveryAbort::InvalidCredentials)?;
        Ok(Arc::new(signer))
    }

    async fn deliver_local(&self, inbox_uri: &str, activity: &Value) -> DeliveryResult {
        let Some(activity_id) = activity.get("id").and_then(Value::as_str) else {
            return DeliveryResult::failed(inbox_uri, true, None, "activity has no id");
        };

        match self.mailbox.prepend(inbox_uri, activity_id).await {
            Ok(Prepend::Inserted) => {
                tracing::info!(inbox = %inbox_uri, activity = %activity_id, "Delivered to local inbox");
                DeliveryResult::ok(inbox_uri, true, None)
            }
            Ok(Prepend::AlreadyPresent) => {
                tracing::debug!(inbox = %inbox_uri, activity = %activity_id, "Activity already in local inbox");
                DeliveryResult::ok(inbox_uri, true, None)
            }
            Ok(Prepend::MissingCollection) => {
                tracing::warn!(inbox = %inbox_uri, "Local inbox does not exist");
                DeliveryResult::failed(inbox_uri, true, None, "local inbox not found")
            }
            Err(error) => {
                tracing::error!(inbox = %inbox_uri, %error, "Local delivery failed");
                DeliveryResult::failed(inbox_uri, true, None, error.to_string())
            }
        }
    }

    async fn deliver_remote(
        &self,
        inbox_uri: &str,
        activity: &Value,
        message: &OnceCell<Vec<u8>>,
        signer: Option<Arc<dyn Signer>>,
    ) -> DeliveryResult {
        let Some(signer) = signer else {
            tracing::warn!(inbox = %inbox_uri, "Skipping remote inbox, actor cannot sign");
            return DeliveryResult::failed(inbox_uri, false, None, "actor cannot sign requests");
        };

        let body = match message
            .get_or_try_init(|| async { (self.encode)(activity) })
            .await
        {
            Ok(body) => body.clone(),
            Err(error) => {
                tracing::error!(%error, "Failed to serialize activity");
                return DeliveryResult::failed(inbox_uri, false, None, error.to_string());
            }
        };

        let options = RequestOptions::new()
            .with_header(CONTENT_TYPE, HeaderValue::from_static(ACTIVITY_CONTENT_TYPE))
            .with_signer(signer);

        match self
            .transport
            .post(inbox_uri, RequestBody::Bytes(body), options)
            .await
        {
            Ok(response) if response.is_success() => {
                tracing::info!(inbox = %inbox_uri, status = response.status_code, "Delivered to remote inbox");
                DeliveryResult::ok(inbox_uri, false, Some(response.status_code))
            }
            Ok(response) => {
                tracing::warn!(
                    inbox = %inbox_uri,
                    status = response.status_code,
                    reason = %response.reason_phrase,
                    body = %response.text(),
                    "Remote inbox rejected activity"
                );
                DeliveryResult::failed(
                    inbox_uri,
                    false,
                    Some(response.status_code),
                    format!("HTTP {}", response.status_code),
                )
            }
            Err(error) => {
                tracing::warn!(inbox = %inbox_uri, %error, "Remote delivery failed");
                DeliveryResult::failed(inbox_uri, false, None, error.to_string())
            }
        }
    }
}
