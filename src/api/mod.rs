//! API layer
//!
//! The content-negotiated router and the endpoints it reaches:
//! - Well-known (WebFinger, NodeInfo)
//! - Static assets
//! - HTML views
//! - Federation (ActivityPub)
//! - Metrics (Prometheus)

mod activitypub;
mod html;
pub mod metrics;
pub mod negotiation;
pub mod router;
mod static_files;
mod wellknown;

pub use negotiation::{MediaPolicy, MediaRange, best_match, content_type_allowed};
pub use router::{
    PathTemplate, Route, RouteHandler, RouteMatch, RoutePriority, RouteRequest, RouteTable,
    dispatch,
};

use axum::{
    Json,
    http::{HeaderValue, Method, header},
    response::{IntoResponse, Response},
};
use serde_json::Value;

use crate::data::model::AS2_CONTENT_TYPES;
use crate::error::AppError;

/// JSON body with an explicit content type
pub(crate) fn typed_json(content_type: &'static str, body: &Value) -> Response {
    (
        [(header::CONTENT_TYPE, HeaderValue::from_static(content_type))],
        Json(body),
    )
        .into_response()
}

/// The route table served by `dispatch`
///
/// | Priority  | Path                       | Methods         | Media     | Auth |
/// |-----------|----------------------------|-----------------|-----------|------|
/// | WellKnown | /.well-known/webfinger     | GET             | any       | no   |
/// | WellKnown | /.well-known/nodeinfo      | GET             | any       | no   |
/// | WellKnown | /nodeinfo/{version}        | GET             | any       | no   |
/// | WellKnown | /metrics                   | GET             | any       | yes  |
/// | Static    | /static/{file_path:path}   | GET, HEAD       | any       | no   |
/// | Html      | /{path:path}               | GET, HEAD       | text/html | no   |
/// | Federation| /{path:path}               | GET, HEAD, POST | AS2       | per operation |
pub fn route_table() -> Result<RouteTable, AppError> {
    Ok(RouteTable::new()
        .with(Route::new(
            "webfinger",
            "/.well-known/webfinger",
            RoutePriority::WellKnown,
            wellknown::webfinger,
        )?)
        .with(Route::new(
            "nodeinfo_links",
            "/.well-known/nodeinfo",
            RoutePriority::WellKnown,
            wellknown::nodeinfo_links,
        )?)
        .with(Route::new(
            "nodeinfo",
            "/nodeinfo/{version}",
            RoutePriority::WellKnown,
            wellknown::nodeinfo,
        )?)
        .with(
            Route::new(
                "metrics",
                "/metrics",
                RoutePriority::WellKnown,
                metrics::metrics_handler,
            )?
            .requires_auth(),
        )
        .with(
            Route::new(
                "static",
                "/static/{file_path:path}",
                RoutePriority::Static,
                static_files::static_file,
            )?
            .methods(&[Method::GET, Method::HEAD]),
        )
        .with(
            Route::new("html", "/{path:path}", RoutePriority::Html, html::html_view)?
                .methods(&[Method::GET, Method::HEAD])
                .media(MediaPolicy::only(["text/html"])),
        )
        .with(
            Route::new(
                "federation",
                "/{path:path}",
                RoutePriority::Federation,
                activitypub::federation,
            )?
            .methods(&[Method::GET, Method::HEAD, Method::POST])
            .media(MediaPolicy::only(AS2_CONTENT_TYPES)),
        ))
}
