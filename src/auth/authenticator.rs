//! Authentication strategies
//!
//! Each `Authenticator` either recognizes the caller or has no opinion.
//! The chain tries them in order; the first identity wins.

use async_trait::async_trait;
use axum::http::{HeaderMap, Method};
use axum_extra::extract::CookieJar;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::data::model::{Actor, CREDENTIALS_TYPE, ROLE_PROPERTY, TOKEN_HASH_PROPERTY};
use crate::data::{Predicate, ResourceStore};
use crate::federation::{self, HttpTransport};

/// How an identity was established
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    Bearer,
    HttpSignature,
}

/// Authenticated caller
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    /// Actor URI
    pub uri: String,
    pub roles: Vec<String>,
    pub scheme: AuthScheme,
}

impl Identity {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// Authentication outcome attached to every request
#[derive(Debug, Clone, PartialEq, Default)]
pub enum AuthContext {
    Authenticated(Identity),
    #[default]
    Unauthenticated,
}

impl AuthContext {
    pub fn identity(&self) -> Option<&Identity> {
        match self {
            AuthContext::Authenticated(identity) => Some(identity),
            AuthContext::Unauthenticated => None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self, AuthContext::Authenticated(_))
    }
}

/// The parts of an inbound request authenticators may inspect
pub struct InboundRequest<'a> {
    pub method: &'a Method,
    /// Path plus query, as signed by HTTP signatures
    pub path_and_query: &'a str,
    pub headers: &'a HeaderMap,
    pub body: &'a [u8],
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    /// `None` means "no opinion"
    async fn authenticate(&self, request: &InboundRequest<'_>) -> Option<Identity>;
}

/// Ordered list of strategies
#[derive(Clone, Default)]
pub struct AuthenticatorChain {
    authenticators: Vec<Arc<dyn Authenticator>>,
}

impl AuthenticatorChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticators.push(authenticator);
        self
    }

    pub fn len(&self) -> usize {
        self.authenticators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.authenticators.is_empty()
    }

    pub async fn authenticate(&self, request: &InboundRequest<'_>) -> AuthContext {
        for authenticator in &self.authenticators {
            if let Some(identity) = authenticator.authenticate(request).await {
                tracing::debug!(identity = %identity.uri, scheme = ?identity.scheme, "Request authenticated");
                return AuthContext::Authenticated(identity);
            }
        }
        AuthContext::Unauthenticated
    }
}

/// Hash under which bearer tokens are stored: `base64url(sha256(token))`
pub fn hash_token(token: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(token.as_bytes()))
}

fn extract_token_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(ToOwned::to_owned)
        .or_else(|| {
            let jar = CookieJar::from_headers(headers);
            jar.get("session").map(|cookie| cookie.value().to_owned())
        })
}

fn roles_of(credentials: &Value) -> Vec<String> {
    match credentials.get(ROLE_PROPERTY) {
        Some(Value::String(role)) => vec![role.clone()],
        Some(Value::Array(roles)) => roles
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

/// Bearer token or `session` cookie matched against stored credentials
pub struct BearerTokenAuthenticator {
    store: Arc<dyn ResourceStore>,
}

impl BearerTokenAuthenticator {
    pub fn new(store: Arc<dyn ResourceStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Authenticator for BearerTokenAuthenticator {
    async fn authenticate(&self, request: &InboundRequest<'_>) -> Option<Identity> {
        let token = extract_token_from_headers(request.headers)?;
        let predicate = Predicate::private()
            .with_type(CREDENTIALS_TYPE)
            .with_property(TOKEN_HASH_PROPERTY, hash_token(&token));

        let credentials = match self.store.query_one(&predicate).await {
            Ok(Some(credentials)) => credentials,
            Ok(None) => {
                tracing::debug!("Unknown bearer token");
                return None;
            }
            Err(error) => {
                tracing::warn!(%error, "Credential lookup failed");
                return None;
            }
        };

        let uri = credentials
            .get("attributedTo")
            .and_then(crate::data::model::id_of)?
            .to_string();
        Some(Identity {
            uri,
            roles: roles_of(&credentials),
            scheme: AuthScheme::Bearer,
        })
    }
}

/// HTTP Signature checked against the signing actor's public key
///
/// The key comes from the store when the actor is known, otherwise it is
/// fetched through the transport. Keys are looked up only for signatures
/// that pass `precheck_signature`.
pub struct HttpSignatureAuthenticator {
    store: Arc<dyn ResourceStore>,
    transport: Arc<dyn HttpTransport>,
    allow_private_addresses: bool,
}

impl HttpSignatureAuthenticator {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        transport: Arc<dyn HttpTransport>,
        allow_private_addresses: bool,
    ) -> Self {
        Self {
            store,
            transport,
            allow_private_addresses,
        }
    }

    async fn public_key(&self, key_id: &str) -> Option<(String, String)> {
        let actor_uri = key_id.split('#').next().unwrap_or(key_id);

        if let Ok(Some(document)) = self.store.get(actor_uri).await {
            if let Some(actor) = Actor::from_value(&document) {
                let key_matches = !key_id.contains('#') || actor.key_id() == Some(key_id);
                if let (true, Some(pem)) = (key_matches, actor.public_key_pem()) {
                    return Some((actor.id.clone(), pem.to_string()));
                }
            }
        }

        match federation::fetch_public_key(self.transport.as_ref(), key_id, self.allow_private_addresses).await {
            Ok(pem) => Some((actor_uri.to_string(), pem)),
            Err(error) => {
                tracing::debug!(key_id = %key_id, %error, "Could not obtain signing key");
                None
            }
        }
    }
}

#[async_trait]
impl Authenticator for HttpSignatureAuthenticator {
    async fn authenticate(&self, request: &InboundRequest<'_>) -> Option<Identity> {
        if !request.headers.contains_key("signature") {
            return None;
        }
        let body = (!request.body.is_empty()).then_some(request.body);
        let parsed = match federation::precheck_signature(request.headers, body.is_some()) {
            Ok(parsed) => parsed,
            Err(error) => {
                tracing::debug!(%error, "Signature rejected before key lookup");
                return None;
            }
        };
        let (actor_uri, pem) = self.public_key(&parsed.key_id).await?;

        match federation::verify_signature(
            request.method.as_str(),
            request.path_and_query,
            request.headers,
            body,
            &pem,
        ) {
            Ok(()) => Some(Identity {
                uri: actor_uri,
                roles: Vec::new(),
                scheme: AuthScheme::HttpSignature,
            }),
            Err(error) => {
                tracing::debug!(key_id = %parsed.key_id, %error, "Signature rejected");
                None
            }
        }
    }
}
