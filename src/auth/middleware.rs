//! Authentication middleware
//!
//! Runs the authenticator chain on every request and attaches the
//! resulting `AuthContext`. Rejection is left to the routes that require
//! an identity.

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::Response,
};

use super::authenticator::InboundRequest;
use crate::AppState;
use crate::error::AppError;

/// Middleware attaching an `AuthContext` to each request
///
/// The body is buffered (bounded by `server.max_body_bytes`) so signature
/// digests can be checked, then handed on unchanged.
///
/// # Usage
/// ```ignore
/// let app = Router::new()
///     .fallback(dispatch)
///     .layer(middleware::from_fn_with_state(state.clone(), authenticate));
/// ```
pub async fn authenticate(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, AppError> {
    let (parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, state.config.server.max_body_bytes)
        .await
        .map_err(|error| {
            tracing::debug!(%error, "Request body rejected");
            AppError::PayloadTooLarge
        })?;

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let inbound = InboundRequest {
        method: &parts.method,
        path_and_query,
        headers: &parts.headers,
        body: &bytes,
    };
    let context = state.authenticators.authenticate(&inbound).await;

    let mut request = Request::from_parts(parts, Body::from(bytes));
    request.extensions_mut().insert(context);

    Ok(next.run(request).await)
}
