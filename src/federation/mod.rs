//! ActivityPub federation module
//!
//! Handles:
//! - Outbound HTTP transport and request signing
//! - HTTP Signatures (sign and verify)
//! - Recipient resolution
//! - Activity sanitization
//! - Local mailbox appends
//! - Activity delivery

mod delivery;
mod mailbox;
mod resolver;
mod sanitize;
pub(crate) mod signature;
pub(crate) mod transport;

pub use delivery::{DeliveryAbort, DeliveryDispatcher, DeliveryReport, DeliveryResult};
pub use mailbox::{Mailbox, Prepend};
pub use resolver::RecipientResolver;
pub use sanitize::{redact, sanitize};
pub use signature::{
    HttpSignatureSigner, ParsedSignature, fetch_public_key, generate_digest, key_id_matches_actor,
    key_owner_url, parse_signature_header, precheck_signature, verify_signature,
};
pub use transport::{
    BasicAuth, DEFAULT_TIMEOUT, HttpResponse, HttpTransport, RequestBody, RequestOptions,
    ReqwestTransport, Signer, SigningRequest,
};
