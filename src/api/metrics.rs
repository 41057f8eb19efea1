//! Prometheus metrics endpoint
//!
//! Exposes application metrics in Prometheus format for monitoring and observability.

use axum::{
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use prometheus::{Encoder, TextEncoder};

use super::router::RouteRequest;
use crate::AppState;
use crate::error::AppError;
use crate::metrics::REGISTRY;

/// GET /metrics
///
/// Returns all metrics in Prometheus text format. The route requires an
/// authenticated caller.
pub async fn metrics_handler(_state: AppState, _request: RouteRequest) -> Result<Response, AppError> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    match encoder.encode_to_string(&metric_families) {
        Ok(metrics_text) => Ok((
            StatusCode::OK,
            [(header::CONTENT_TYPE, encoder.format_type().to_string())],
            metrics_text,
        )
            .into_response()),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            Err(AppError::Internal(e.into()))
        }
    }
}
