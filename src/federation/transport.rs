//! Outbound HTTP transport
//!
//! Normalizes GET/POST over `reqwest` into a uniform `HttpResponse`.
//! Requests may carry a `Signer`, which sees the final request exactly
//! once before it is sent.

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use http::header::{AUTHORIZATION, CONTENT_TYPE, COOKIE, HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::config::HttpConfig;
use crate::error::AppError;

/// Timeout applied when neither the request nor the config sets one
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// View of an outbound request handed to a `Signer`
///
/// Headers are mutable; the body is already buffered and may be read any
/// number of times.
pub struct SigningRequest<'a> {
    method: &'a Method,
    url: &'a Url,
    headers: &'a mut HeaderMap,
    body: Option<&'a [u8]>,
}

impl<'a> SigningRequest<'a> {
    pub fn new(
        method: &'a Method,
        url: &'a Url,
        headers: &'a mut HeaderMap,
        body: Option<&'a [u8]>,
    ) -> Self {
        Self {
            method,
            url,
            headers,
            body,
        }
    }

    pub fn method(&self) -> &Method {
        self.method
    }

    pub fn url(&self) -> &Url {
        self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        self.headers
    }

    pub fn body(&self) -> Option<&[u8]> {
        self.body
    }
}

/// Capability that authenticates an outbound request by adding headers
pub trait Signer: Send + Sync {
    fn sign(&self, request: &mut SigningRequest<'_>) -> Result<(), AppError>;
}

/// HTTP basic credentials
#[derive(Debug, Clone)]
pub struct BasicAuth {
    pub username: String,
    pub password: Option<String>,
}

/// Per-request options; unset fields fall back to transport defaults
#[derive(Clone, Default)]
pub struct RequestOptions {
    pub params: Vec<(String, String)>,
    pub headers: HeaderMap,
    pub cookies: Vec<(String, String)>,
    pub auth: Option<BasicAuth>,
    pub timeout: Option<Duration>,
    pub verify: Option<bool>,
    pub follow_redirects: Option<bool>,
    pub signer: Option<Arc<dyn Signer>>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.push((name.into(), value.into()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = Some(signer);
        self
    }
}

/// Outbound request payload
#[derive(Debug, Clone, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Bytes(Vec<u8>),
    Text(String),
    Json(Value),
}

impl RequestBody {
    /// Encoded bytes plus the content type implied by the variant
    fn into_parts(self) -> Result<(Option<Vec<u8>>, Option<&'static str>), AppError> {
        Ok(match self {
            RequestBody::Empty => (None, None),
            RequestBody::Bytes(bytes) => (Some(bytes), None),
            RequestBody::Text(text) => (Some(text.into_bytes()), Some("text/plain; charset=utf-8")),
            RequestBody::Json(value) => (Some(serde_json::to_vec(&value)?), Some("application/json")),
        })
    }
}

/// Normalized response
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status_code: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    pub reason_phrase: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    pub fn json(&self) -> Result<Value, AppError> {
        serde_json::from_slice(&self.body)
            .map_err(|e| AppError::Federation(format!("Response is not JSON: {}", e)))
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn get(&self, url: &str, options: RequestOptions) -> Result<HttpResponse, AppError>;

    async fn post(
        &self,
        url: &str,
        body: RequestBody,
        options: RequestOptions,
    ) -> Result<HttpResponse, AppError>;
}

/// `HttpTransport` over pre-built `reqwest` clients
///
/// TLS verification and redirect policy are client-level settings in
/// reqwest, so one client is kept per combination.
#[derive(Clone)]
pub struct ReqwestTransport {
    clients: Arc<[reqwest::Client; 4]>,
    timeout: Duration,
    verify: bool,
    follow_redirects: bool,
}

impl ReqwestTransport {
    pub fn new(config: &HttpConfig) -> Result<Self, AppError> {
        let build = |verify: bool, follow: bool| {
            let redirect = if follow {
                reqwest::redirect::Policy::limited(10)
            } else {
                reqwest::redirect::Policy::none()
            };
            reqwest::Client::builder()
                .user_agent(config.user_agent.clone())
                .danger_accept_invalid_certs(!verify)
                .redirect(redirect)
                .build()
        };

        let clients = [
            build(false, false)?,
            build(false, true)?,
            build(true, false)?,
            build(true, true)?,
        ];

        let timeout = if config.timeout_seconds == 0 {
            DEFAULT_TIMEOUT
        } else {
            config.timeout()
        };

        Ok(Self {
            clients: Arc::new(clients),
            timeout,
            verify: config.verify,
            follow_redirects: config.follow_redirects,
        })
    }

    fn client(&self, verify: bool, follow_redirects: bool) -> &reqwest::Client {
        &self.clients[(verify as usize) * 2 + follow_redirects as usize]
    }

    async fn execute(
        &self,
        method: Method,
        url: &str,
        body: RequestBody,
        options: RequestOptions,
    ) -> Result<HttpResponse, AppError> {
        let RequestOptions {
            params,
            mut headers,
            cookies,
            auth,
            timeout,
            verify,
            follow_redirects,
            signer,
        } = options;

        let mut url =
            Url::parse(url).map_err(|e| AppError::Validation(format!("Invalid URL: {}", e)))?;
        if !params.is_empty() {
            url.query_pairs_mut().extend_pairs(params.iter());
        }

        if !cookies.is_empty() {
            let cookie = cookies
                .iter()
                .map(|(name, value)| format!("{}={}", name, value))
                .collect::<Vec<_>>()
                .join("; ");
            headers.insert(COOKIE, header_value(&cookie)?);
        }

        if let Some(auth) = auth {
            let credentials = format!(
                "{}:{}",
                auth.username,
                auth.password.as_deref().unwrap_or("")
            );
            let value = format!("Basic {}", BASE64.encode(credentials));
            headers.insert(AUTHORIZATION, header_value(&value)?);
        }

        let (bytes, implied_type) = body.into_parts()?;
        if let Some(content_type) = implied_type {
            headers
                .entry(CONTENT_TYPE)
                .or_insert(HeaderValue::from_static(content_type));
        }

        if let Some(signer) = signer {
            let mut request = SigningRequest::new(&method, &url, &mut headers, bytes.as_deref());
            signer.sign(&mut request)?;
        }

        let client = self.client(
            verify.unwrap_or(self.verify),
            follow_redirects.unwrap_or(self.follow_redirects),
        );
        let mut builder = client
            .request(method.clone(), url.clone())
            .headers(headers)
            .timeout(timeout.unwrap_or(self.timeout));
        if let Some(bytes) = bytes {
            builder = builder.body(bytes);
        }

        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?.to_vec();

        tracing::debug!(%method, %url, status = status.as_u16(), "Outbound request completed");

        Ok(HttpResponse {
            status_code: status.as_u16(),
            headers,
            body,
            reason_phrase: status.canonical_reason().unwrap_or("").to_string(),
        })
    }
}

fn header_value(value: &str) -> Result<HeaderValue, AppError> {
    HeaderValue::from_str(value)
        .map_err(|_| AppError::Validation(format!("Invalid header value: {}", value)))
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get(&self, url: &str, options: RequestOptions) -> Result<HttpResponse, AppError> {
        self.execute(Method::GET, url, RequestBody::Empty, options)
            .await
    }

    async fn post(
        &self,
        url: &str,
        body: RequestBody,
        options: RequestOptions,
    ) -> Result<HttpResponse, AppError> {
        self.execute(Method::POST, url, body, options).await
    }
}
