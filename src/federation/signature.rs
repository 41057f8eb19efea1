//! HTTP Signatures for ActivityPub
//!
//! Implements signing and verification per:
//! https://docs.joinmastodon.org/spec/security/

use crate::error::AppError;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use http::header::{ACCEPT, HeaderValue};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey, pkcs1v15::Signature as Pkcs1v15Signature};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::net::IpAddr;
use url::{Host, Url};

use super::transport::{HttpTransport, RequestOptions, Signer, SigningRequest};
use crate::data::model::{AS2_CONTENT_TYPES, Actor};

/// Largest accepted clock skew for the `Date` header, in seconds
const MAX_DATE_SKEW_SECONDS: i64 = 300;

fn is_disallowed_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_broadcast()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_disallowed_ip(IpAddr::V4(v4)),
            None => {
                v6.is_loopback()
                    || v6.is_unique_local()
                    || v6.is_unicast_link_local()
                    || v6.is_multicast()
                    || v6.is_unspecified()
            }
        },
    }
}

fn is_disallowed_host(host: &Host<&str>) -> bool {
    match host {
        Host::Domain(domain) => {
            let normalized = domain.trim_end_matches('.').to_ascii_lowercase();
            normalized == "localhost" || normalized.ends_with(".localhost")
        }
        Host::Ipv4(v4) => is_disallowed_ip(IpAddr::V4(*v4)),
        Host::Ipv6(v6) => is_disallowed_ip(IpAddr::V6(*v6)),
    }
}

async fn validate_resolved_host_ips(host: &str, port: u16) -> Result<(), AppError> {
    let normalized = host.trim_end_matches('.').to_ascii_lowercase();

    let mut resolved_any = false;
    let lookup = tokio::net::lookup_host((normalized.as_str(), port))
        .await
        .map_err(|e| AppError::Federation(format!("Failed to resolve key host: {}", e)))?;

    for addr in lookup {
        resolved_any = true;
        if is_disallowed_ip(addr.ip()) {
            tracing::warn!(host = %normalized, ip = %addr.ip(), "Key host resolves to a local address");
            return Err(AppError::Forbidden);
        }
    }

    if !resolved_any {
        return Err(AppError::Federation("No DNS records for key host".to_string()));
    }
    Ok(())
}

/// Actor URL behind `key_id`, checked to be safe to fetch
///
/// Only `http`/`https` URLs pass. Unless `allow_private_addresses` is set,
/// hosts that are or resolve to loopback, private or link-local addresses
/// are refused with `Forbidden`.
pub async fn key_owner_url(key_id: &str, allow_private_addresses: bool) -> Result<Url, AppError> {
    let actor_url = key_id.split('#').next().unwrap_or(key_id);
    let parsed = Url::parse(actor_url)
        .map_err(|e| AppError::Validation(format!("Invalid keyId URL: {}", e)))?;

    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(AppError::Validation(format!(
            "Unsupported keyId URL scheme: {}",
            parsed.scheme()
        )));
    }
    let host = parsed
        .host()
        .ok_or_else(|| AppError::Validation("Missing host in keyId URL".to_string()))?;
    if allow_private_addresses {
        return Ok(parsed);
    }

    if is_disallowed_host(&host) {
        return Err(AppError::Forbidden);
    }
    if let Host::Domain(domain) = host {
        let port = parsed.port_or_known_default().unwrap_or(443);
        validate_resolved_host_ips(domain, port).await?;
    }
    Ok(parsed)
}

/// `Signer` producing draft-cavage `rsa-sha256` signatures
///
/// Signs `(request-target) host date` plus `digest` when the request has a
/// body, and adds the `Host`, `Date`, `Digest` and `Signature` headers.
pub struct HttpSignatureSigner {
    key_id: String,
    private_key: RsaPrivateKey,
}

impl std::fmt::Debug for HttpSignatureSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSignatureSigner")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

impl HttpSignatureSigner {
    /// Bind a key identity to PEM private key material (PKCS#8 or PKCS#1)
    pub fn new(key_id: impl Into<String>, private_key_pem: &str) -> Result<Self, AppError> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(private_key_pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(private_key_pem))
            .map_err(|e| AppError::Validation(format!("Invalid private key: {}", e)))?;

        Ok(Self {
            key_id: key_id.into(),
            private_key,
        })
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }
}

impl Signer for HttpSignatureSigner {
    fn sign(&self, request: &mut SigningRequest<'_>) -> Result<(), AppError> {
        let url = request.url();
        let host = authority(url)?;
        let target = match url.query() {
            Some(query) => format!("{} {}?{}", request.method().as_str().to_lowercase(), url.path(), query),
            None => format!("{} {}", request.method().as_str().to_lowercase(), url.path()),
        };
        // IMF-fixdate, always GMT
        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        let digest = request.body().map(generate_digest);

        let mut lines = vec![
            ("(request-target)", target),
            ("host", host.clone()),
            ("date", date.clone()),
        ];
        if let Some(digest) = &digest {
            lines.push(("digest", digest.clone()));
        }
        let covered = lines
            .iter()
            .map(|(name, _)| *name)
            .collect::<Vec<_>>()
            .join(" ");

        let signing_key = rsa::pkcs1v15::SigningKey::<Sha256>::new(self.private_key.clone());
        let signature =
            signing_key.sign_with_rng(&mut rand::thread_rng(), signing_string(lines).as_bytes());
        let signature_header = format!(
            "keyId=\"{}\",algorithm=\"rsa-sha256\",headers=\"{}\",signature=\"{}\"",
            self.key_id,
            covered,
            BASE64.encode(signature.to_bytes())
        );

        let headers = request.headers_mut();
        headers.insert(http::header::HOST, header_value(&host)?);
        headers.insert(http::header::DATE, header_value(&date)?);
        if let Some(digest) = digest {
            headers.insert("digest", header_value(&digest)?);
        }
        headers.insert("signature", header_value(&signature_header)?);
        Ok(())
    }
}

/// `host[:port]` as sent in the `Host` header
fn authority(url: &url::Url) -> Result<String, AppError> {
    let host = url
        .host_str()
        .ok_or_else(|| AppError::Validation(format!("{} has no host", url)))?;
    Ok(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

fn header_value(value: &str) -> Result<HeaderValue, AppError> {
    HeaderValue::from_str(value)
        .map_err(|_| AppError::Validation("Invalid signature header value".to_string()))
}

fn header_str<'a>(headers: &'a http::HeaderMap, name: &str) -> Result<&'a str, AppError> {
    headers
        .get(name)
        .ok_or_else(|| AppError::Validation(format!("Missing {} header", name)))?
        .to_str()
        .map_err(|_| AppError::Validation(format!("Invalid {} header", name)))
}

/// `name: value` lines joined into the string that gets signed
fn signing_string<'a>(lines: impl IntoIterator<Item = (&'a str, String)>) -> String {
    lines
        .into_iter()
        .map(|(name, value)| format!("{}: {}", name, value))
        .collect::<Vec<_>>()
        .join("\n")
}

/// The signature must cover these, plus `digest` when there is a body
const REQUIRED_HEADERS: [&str; 3] = ["(request-target)", "host", "date"];

/// Signed headers whose values can be reproduced from the request
const VERIFIABLE_HEADERS: [&str; 4] = ["host", "date", "digest", "content-type"];

fn check_coverage(parsed: &ParsedSignature, has_body: bool) -> Result<(), AppError> {
    if !matches!(parsed.algorithm.as_str(), "rsa-sha256" | "hs2019") {
        return Err(AppError::Validation(format!(
            "Unsupported signature algorithm: {}",
            parsed.algorithm
        )));
    }

    let uncovered = REQUIRED_HEADERS
        .into_iter()
        .chain(has_body.then_some("digest"))
        .find(|name| !parsed.covers(name));
    match uncovered {
        Some(name) => Err(AppError::Validation(format!("Signature does not cover {}", name))),
        None => Ok(()),
    }
}

fn check_date(value: &str) -> Result<(), AppError> {
    let date = DateTime::parse_from_rfc2822(value)
        .map_err(|_| AppError::Validation(format!("Invalid Date header: {}", value)))?;
    let skew = (Utc::now().timestamp() - date.timestamp()).abs();
    if skew > MAX_DATE_SKEW_SECONDS {
        return Err(AppError::Validation(format!(
            "Date header is {}s away from server time",
            skew
        )));
    }
    Ok(())
}

/// Checks that need no key: header syntax, coverage and `Date` freshness
///
/// Run before looking up the signing key.
pub fn precheck_signature(headers: &http::HeaderMap, has_body: bool) -> Result<ParsedSignature, AppError> {
    let parsed = parse_signature_header(header_str(headers, "signature")?)?;
    check_coverage(&parsed, has_body)?;
    check_date(header_str(headers, "date")?)?;
    Ok(parsed)
}

/// Verify an inbound request signature
///
/// `path` is the request path including any query string. A non-empty
/// `body` must match the signed `Digest`.
///
/// # Errors
/// `Validation` for malformed, stale or incomplete signatures,
/// `InvalidSignature` when the signature does not verify
pub fn verify_signature(
    method: &str,
    path: &str,
    headers: &http::HeaderMap,
    body: Option<&[u8]>,
    public_key_pem: &str,
) -> Result<(), AppError> {
    let body = body.filter(|bytes| !bytes.is_empty());
    let parsed = precheck_signature(headers, body.is_some())?;

    if let Some(body) = body {
        if header_str(headers, "digest")? != generate_digest(body) {
            return Err(AppError::Validation("Digest does not match body".to_string()));
        }
    }

    let mut lines = Vec::with_capacity(parsed.headers.len());
    for name in &parsed.headers {
        let value = match name.as_str() {
            "(request-target)" => format!("{} {}", method.to_lowercase(), path),
            known if VERIFIABLE_HEADERS.contains(&known) => header_str(headers, known)?.to_string(),
            other => {
                return Err(AppError::Validation(format!(
                    "Cannot verify signed header {}",
                    other
                )));
            }
        };
        lines.push((name.as_str(), value));
    }

    let public_key = RsaPublicKey::from_public_key_pem(public_key_pem)
        .map_err(|e| AppError::Validation(format!("Invalid public key: {}", e)))?;
    let signature = BASE64
        .decode(&parsed.signature)
        .ok()
        .and_then(|bytes| Pkcs1v15Signature::try_from(bytes.as_slice()).ok())
        .ok_or(AppError::InvalidSignature)?;

    rsa::pkcs1v15::VerifyingKey::<Sha256>::new(public_key)
        .verify(signing_string(lines).as_bytes(), &signature)
        .map_err(|_| AppError::InvalidSignature)
}

/// Whether `key_id` belongs to `actor_id` (fragments ignored)
pub fn key_id_matches_actor(key_id: &str, actor_id: &str) -> bool {
    let without_fragment = |uri: &str| uri.split('#').next().unwrap_or_default().to_string();
    without_fragment(key_id) == without_fragment(actor_id)
}

/// Fields of a `Signature` header
#[derive(Debug, Clone)]
pub struct ParsedSignature {
    pub key_id: String,
    pub algorithm: String,
    /// Covered header names, lower-cased, in signing order
    pub headers: Vec<String>,
    /// Base64 signature value
    pub signature: String,
}

impl ParsedSignature {
    pub fn covers(&self, name: &str) -> bool {
        self.headers.iter().any(|header| header == name)
    }
}

/// Parse `keyId="...",algorithm="...",headers="...",signature="..."`
///
/// A missing `algorithm` reads as `hs2019` and missing `headers` as
/// `date`, as draft-cavage allows.
pub fn parse_signature_header(header: &str) -> Result<ParsedSignature, AppError> {
    let fields: HashMap<&str, &str> = header
        .split(',')
        .filter_map(|part| part.split_once('='))
        .map(|(key, value)| (key.trim(), value.trim().trim_matches('"')))
        .collect();
    let required = |name: &str| {
        fields
            .get(name)
            .map(|value| value.to_string())
            .ok_or_else(|| AppError::Validation(format!("Signature header lacks {}", name)))
    };

    Ok(ParsedSignature {
        key_id: required("keyId")?,
        algorithm: fields.get("algorithm").unwrap_or(&"hs2019").to_string(),
        headers: fields
            .get("headers")
            .map(|names| names.split_whitespace().map(str::to_ascii_lowercase).collect())
            .unwrap_or_else(|| vec!["date".to_string()]),
        signature: required("signature")?,
    })
}

/// `SHA-256=<base64>` digest of a body
pub fn generate_digest(body: &[u8]) -> String {
    format!("SHA-256={}", BASE64.encode(Sha256::digest(body)))
}

/// Fetch the PEM public key advertised for `key_id` through the transport
///
/// The key host goes through `key_owner_url` first. The actor document
/// must advertise exactly `key_id` when it carries a fragment.
pub async fn fetch_public_key(
    transport: &dyn HttpTransport,
    key_id: &str,
    allow_private_addresses: bool,
) -> Result<String, AppError> {
    let actor_url = key_owner_url(key_id, allow_private_addresses).await?;
    let options = RequestOptions::new().with_header(ACCEPT, HeaderValue::from_static(AS2_CONTENT_TYPES[0]));

    let response = transport.get(actor_url.as_str(), options).await?;
    if !response.is_success() {
        return Err(AppError::Federation(format!(
            "Failed to fetch actor: HTTP {}",
            response.status_code
        )));
    }

    let document = response.json()?;
    let actor = Actor::from_value(&document)
        .ok_or_else(|| AppError::Federation("Response is not an actor".to_string()))?;

    if key_id.contains('#') && actor.key_id() != Some(key_id) {
        return Err(AppError::Validation(
            "Signature keyId does not match actor public key id".to_string(),
        ));
    }

    actor
        .public_key_pem()
        .map(str::to_string)
        .ok_or_else(|| AppError::Federation("Missing publicKeyPem in actor".to_string()))
}
