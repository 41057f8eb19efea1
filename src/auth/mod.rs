//! Inbound authentication
//!
//! Handles:
//! - Authenticator strategies (bearer token, HTTP signature)
//! - The ordered authenticator chain
//! - Middleware attaching an `AuthContext` to each request

mod authenticator;
mod middleware;

pub use authenticator::{
    AuthContext, AuthScheme, Authenticator, AuthenticatorChain, BearerTokenAuthenticator,
    HttpSignatureAuthenticator, Identity, InboundRequest, hash_token,
};
pub use middleware::authenticate;
