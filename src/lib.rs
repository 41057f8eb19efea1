//! Courier - federated activity delivery for ActivityPub object graphs
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - Authentication middleware (bearer, HTTP signature)       │
//! │  - Content-negotiated router                                │
//! │  - Well-known, static, HTML and federation endpoints        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                Service / Federation Layer                    │
//! │  - Activity service (inbox/outbox POST, dereference)        │
//! │  - Recipient resolution, sanitization, delivery             │
//! │  - Signed outbound HTTP                                     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Data Layer                              │
//! │  - ResourceStore (in-memory or SQLite via sqlx)             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: Content-negotiated router and HTTP handlers
//! - `auth`: Inbound authentication
//! - `service`: Activity service and actor provisioning
//! - `federation`: Delivery, resolution, signing and transport
//! - `data`: Resource store
//! - `config`: Configuration management
//! - `error`: Error types

pub mod api;
pub mod auth;
pub mod config;
pub mod data;
pub mod error;
pub mod federation;
pub mod metrics;
pub mod service;

use std::sync::Arc;

/// Application state shared across all handlers
///
/// This struct is cloned for each request and contains
/// shared resources like the store, transport and dispatcher.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Resource store
    pub store: Arc<dyn data::ResourceStore>,

    /// Outbound HTTP transport
    pub transport: Arc<dyn federation::HttpTransport>,

    /// Serialized collection appends
    pub mailbox: federation::Mailbox,

    /// Background activity delivery
    pub dispatcher: federation::DeliveryDispatcher,

    /// Inbound authentication strategies, in order
    pub authenticators: Arc<auth::AuthenticatorChain>,

    /// Activity processing behind the federation endpoint
    pub activity_service: Arc<dyn service::ActivityService>,

    /// Content-negotiated routes
    pub routes: Arc<api::RouteTable>,
}

impl AppState {
    /// Initialize application state
    ///
    /// # Steps
    /// 1. Open the resource store
    /// 2. Build the outbound HTTP transport
    /// 3. Wire delivery, authentication and routes
    ///
    /// # Errors
    /// Returns error if the store cannot be opened or the transport cannot
    /// be built
    pub async fn new(config: config::AppConfig) -> Result<Self, error::AppError> {
        tracing::info!("Initializing application state...");

        let store = data::open_store(&config.store).await?;
        tracing::info!("Resource store opened");

        let transport: Arc<dyn federation::HttpTransport> =
            Arc::new(federation::ReqwestTransport::new(&config.http)?);

        let state = Self::with_parts(config, store, transport)?;
        tracing::info!("Application state initialized successfully");
        Ok(state)
    }

    /// Assemble state around an already opened store and transport
    pub fn with_parts(
        config: config::AppConfig,
        store: Arc<dyn data::ResourceStore>,
        transport: Arc<dyn federation::HttpTransport>,
    ) -> Result<Self, error::AppError> {
        let config = Arc::new(config);
        let mailbox = federation::Mailbox::new(store.clone());
        let dispatcher = federation::DeliveryDispatcher::new(
            store.clone(),
            transport.clone(),
            mailbox.clone(),
            config.clone(),
        );

        let authenticators = auth::AuthenticatorChain::new()
            .with(Arc::new(auth::BearerTokenAuthenticator::new(store.clone())))
            .with(Arc::new(auth::HttpSignatureAuthenticator::new(
                store.clone(),
                transport.clone(),
                config.http.allow_private_addresses,
            )));

        let activity_service = Arc::new(service::StoreActivityService::new(
            store.clone(),
            mailbox.clone(),
            dispatcher.clone(),
            config.clone(),
        ));

        Ok(Self {
            config,
            store,
            transport,
            mailbox,
            dispatcher,
            authenticators: Arc::new(authenticators),
            activity_service,
            routes: Arc::new(api::route_table()?),
        })
    }

    /// Provision the actors listed under `bootstrap.actors`
    pub async fn bootstrap(&self) -> Result<(), error::AppError> {
        for actor in &self.config.bootstrap.actors {
            service::ensure_actor(self.store.as_ref(), actor, self.config.bootstrap.key_bits).await?;
        }
        Ok(())
    }
}

/// Build the Axum router.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments. Everything except the
/// health check goes through the content-negotiated `dispatch`.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::{Router, middleware};
    use tower_http::trace::TraceLayer;

    let cors_layer = build_cors_layer(&state.config);

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .fallback(api::dispatch)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::authenticate,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer)
        .with_state(state)
}

fn build_cors_layer(config: &config::AppConfig) -> tower_http::cors::CorsLayer {
    use axum::http::HeaderValue;
    use tower_http::cors::{Any, CorsLayer};

    if config.tenants.iter().any(|tenant| tenant.starts_with("http://")) {
        return CorsLayer::permissive();
    }

    let origins: Vec<HeaderValue> = config
        .tenants
        .iter()
        .filter_map(|tenant| match HeaderValue::from_str(tenant) {
            Ok(origin) => Some(origin),
            Err(error) => {
                tracing::error!(%error, origin = %tenant, "Failed to parse CORS origin from tenant");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(Any)
        .allow_headers(Any)
}

async fn health_check() -> &'static str {
    "OK"
}

#[cfg(test)]
pub(crate) async fn test_state_with(config: config::AppConfig) -> AppState {
    let store: Arc<dyn data::ResourceStore> = Arc::new(data::MemoryResourceStore::new());
    AppState::with_parts(
        config,
        store,
        federation::transport::tests::RecordingTransport::new(),
    )
    .expect("test state")
}

#[cfg(test)]
pub(crate) async fn test_state() -> AppState {
    test_state_with(config::tests::valid_config()).await
}
