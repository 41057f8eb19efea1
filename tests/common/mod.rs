//! Common test utilities for E2E tests

#![allow(dead_code)]

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
};
use courier::{AppState, config};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;

pub const ALICE_TOKEN: &str = "alice-token";
pub const AS2: &str = "application/activity+json";

/// Test server instance
pub struct TestServer {
    pub addr: String,
    /// Tenant prefix served by this instance (same as `addr`)
    pub tenant: String,
    pub state: AppState,
    pub _temp_dir: TempDir,
    pub client: reqwest::Client,
}

impl TestServer {
    /// Create a new test server instance with alice and carol provisioned
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Create a test server, adjusting the configuration before start-up
    pub async fn with_config(customize: impl FnOnce(&mut config::AppConfig)) -> Self {
        // Bind first so the tenant prefix can carry the port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let tenant = format!("http://{}", addr);

        let temp_dir = TempDir::new().unwrap();
        let static_dir = temp_dir.path().join("static");
        std::fs::create_dir_all(&static_dir).unwrap();
        std::fs::write(static_dir.join("site.css"), "body { margin: 0; }").unwrap();

        let mut config = config::AppConfig {
            server: config::ServerConfig {
                host: "127.0.0.1".to_string(),
                port: addr.port(),
                max_body_bytes: 256 * 1024,
            },
            tenants: vec![tenant.clone()],
            store: config::StoreConfig {
                driver: config::StoreDriver::Sqlite,
                path: Some(temp_dir.path().join("courier.db")),
            },
            http: config::HttpConfig {
                timeout_seconds: 5,
                verify: true,
                follow_redirects: false,
                user_agent: "Courier/test".to_string(),
                allow_private_addresses: true,
            },
            delivery: config::DeliveryConfig {
                max_concurrency: 4,
                local_without_credentials: false,
                fetch_remote_recipients: true,
                shutdown_grace_seconds: 1,
            },
            html: config::HtmlConfig {
                static_dir,
                tenants_dir: temp_dir.path().join("tenants"),
            },
            bootstrap: config::BootstrapConfig {
                actors: vec![
                    config::ActorBootstrap {
                        uri: format!("{}/actor/alice", tenant),
                        name: "Alice".to_string(),
                        handle: "alice".to_string(),
                        summary: Some("Test account".to_string()),
                        roles: vec!["admin".to_string()],
                        token: Some(ALICE_TOKEN.to_string()),
                    },
                    config::ActorBootstrap {
                        uri: format!("{}/actor/carol", tenant),
                        name: "Carol".to_string(),
                        handle: "carol".to_string(),
                        summary: None,
                        roles: Vec::new(),
                        token: None,
                    },
                ],
                key_bits: 1024,
            },
            logging: config::LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        };
        customize(&mut config);

        courier::metrics::init_metrics();

        // Initialize app state
        let state = AppState::new(config).await.unwrap();
        state.bootstrap().await.unwrap();

        // Create HTTP client
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap();

        // Build router and serve in the background
        let app = courier::build_router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr: tenant.clone(),
            tenant,
            state,
            _temp_dir: temp_dir,
            client,
        }
    }

    /// Get base URL for requests
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    pub fn actor_uri(&self, handle: &str) -> String {
        format!("{}/actor/{}", self.tenant, handle)
    }

    /// POST an AS2 document as alice
    pub async fn post_as_alice(&self, path: &str, body: &Value) -> reqwest::Response {
        self.client
            .post(self.url(path))
            .bearer_auth(ALICE_TOKEN)
            .header("content-type", AS2)
            .body(body.to_string())
            .send()
            .await
            .unwrap()
    }

    /// Stored document, if any
    pub async fn stored(&self, uri: &str) -> Option<Value> {
        self.state.store.get(uri).await.unwrap()
    }
}

/// A request received by a `RemotePeer`
#[derive(Debug, Clone)]
pub struct Received {
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Clone)]
struct PeerState {
    base: String,
    public_key_pem: String,
    received: Arc<Mutex<Vec<Received>>>,
}

/// In-process remote server hosting actor `bob`
///
/// Serves bob's actor document and records every POST to his inbox.
pub struct RemotePeer {
    pub base: String,
    pub private_key_pem: String,
    received: Arc<Mutex<Vec<Received>>>,
}

impl RemotePeer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let (private_key_pem, public_key_pem) = generate_keypair();
        let received = Arc::new(Mutex::new(Vec::new()));

        let state = PeerState {
            base: base.clone(),
            public_key_pem,
            received: received.clone(),
        };
        let app = Router::new()
            .route("/actor/bob", get(bob_actor))
            .route("/actor/bob/inbox", post(bob_inbox))
            .route("/moved", get(moved))
            .with_state(state);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base,
            private_key_pem,
            received,
        }
    }

    pub fn bob(&self) -> String {
        format!("{}/actor/bob", self.base)
    }

    pub fn received(&self) -> Vec<Received> {
        self.received.lock().unwrap().clone()
    }

    /// Wait until at least `count` inbox POSTs arrived
    pub async fn wait_for(&self, count: usize) -> Vec<Received> {
        for _ in 0..100 {
            let received = self.received();
            if received.len() >= count {
                return received;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("expected {} deliveries, got {}", count, self.received().len());
    }
}

async fn bob_actor(State(peer): State<PeerState>) -> impl IntoResponse {
    let bob = format!("{}/actor/bob", peer.base);
    (
        [("content-type", AS2)],
        Json(json!({
            "id": bob,
            "type": "Person",
            "preferredUsername": "bob",
            "inbox": format!("{}/inbox", bob),
            "publicKey": {
                "id": format!("{}#main-key", bob),
                "owner": bob,
                "publicKeyPem": peer.public_key_pem
            }
        })),
    )
}

async fn bob_inbox(State(peer): State<PeerState>, headers: HeaderMap, body: Bytes) -> StatusCode {
    peer.received.lock().unwrap().push(Received {
        path: "/actor/bob/inbox".to_string(),
        headers,
        body,
    });
    StatusCode::ACCEPTED
}

async fn moved(State(peer): State<PeerState>) -> impl IntoResponse {
    (
        StatusCode::FOUND,
        [("location", format!("{}/actor/bob", peer.base))],
    )
}

/// 1024-bit RSA keypair as (PKCS#8 private PEM, SPKI public PEM)
pub fn generate_keypair() -> (String, String) {
    use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
    use rsa::{RsaPrivateKey, RsaPublicKey};

    let mut rng = rand::thread_rng();
    let private_key = RsaPrivateKey::new(&mut rng, 1024).unwrap();
    let public_key = RsaPublicKey::from(&private_key);
    (
        private_key.to_pkcs8_pem(LineEnding::LF).unwrap().to_string(),
        public_key.to_public_key_pem(LineEnding::LF).unwrap(),
    )
}

/// Poll until `check` holds or give up after five seconds
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not met in time");
}
