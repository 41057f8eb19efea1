//! Prometheus metrics registry and instruments.
//!
//! This module is framework-agnostic and can be used from any layer.

use lazy_static::lazy_static;
use prometheus::{IntCounterVec, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // HTTP Metrics
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("courier_http_requests_total", "Total number of routed HTTP requests"),
        &["route", "status"]
    ).expect("metric can be created");

    // Delivery Metrics
    pub static ref DELIVERIES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("courier_deliveries_total", "Total number of per-inbox delivery attempts"),
        &["target", "outcome"]
    ).expect("metric can be created");

    // Error Metrics
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("courier_errors_total", "Total number of errors returned to clients"),
        &["error_type"]
    ).expect("metric can be created");
}

/// Initialize metrics registry.
///
/// Safe to call more than once; repeated registrations are ignored.
pub fn init_metrics() {
    let collectors: [Box<dyn prometheus::core::Collector>; 3] = [
        Box::new(HTTP_REQUESTS_TOTAL.clone()),
        Box::new(DELIVERIES_TOTAL.clone()),
        Box::new(ERRORS_TOTAL.clone()),
    ];

    for collector in collectors {
        if let Err(error) = REGISTRY.register(collector) {
            tracing::debug!(%error, "Metric already registered");
        }
    }

    tracing::info!("Metrics registry initialized");
}

/// Record the outcome of a single delivery attempt
pub fn record_delivery(local: bool, outcome: &str) {
    let target = if local { "local" } else { "remote" };
    DELIVERIES_TOTAL.with_label_values(&[target, outcome]).inc();
}
