//! Well-known endpoints
//!
//! - /.well-known/webfinger
//! - /.well-known/nodeinfo
//! - /nodeinfo/{version}

use axum::response::Response;
use serde_json::{Value, json};

use super::router::RouteRequest;
use super::typed_json;
use crate::AppState;
use crate::data::Predicate;
use crate::data::model::{self, ACTIVITY_CONTENT_TYPE, CREDENTIALS_TYPE};
use crate::error::AppError;

const JRD_CONTENT_TYPE: &str = "application/jrd+json";
const PROFILE_PAGE_REL: &str = "http://webfinger.net/rel/profile-page";
const NODEINFO_VERSIONS: [&str; 2] = ["2.0", "2.1"];

/// GET /.well-known/webfinger
///
/// Query: ?resource=acct:handle@host or ?resource=<actor uri>
pub async fn webfinger(state: AppState, request: RouteRequest) -> Result<Response, AppError> {
    let query = request.query();
    let resource = query
        .get("resource")
        .map(|resource| resource.trim())
        .filter(|resource| !resource.is_empty())
        .ok_or_else(|| AppError::Validation("Missing resource parameter".to_string()))?;

    let actor = match resource.strip_prefix("acct:") {
        Some(acct) => {
            let (handle, host) = acct
                .split_once('@')
                .filter(|(handle, host)| !handle.is_empty() && !host.is_empty())
                .ok_or_else(|| AppError::Validation("Invalid acct format".to_string()))?;
            let tenant = state.config.tenant_for_host(host).ok_or(AppError::NotFound)?;

            let predicate = Predicate::new()
                .with_prefix(format!("{}/", tenant))
                .with_property("preferredUsername", handle);
            state
                .store
                .query(&predicate)
                .await?
                .into_iter()
                .find(|candidate| candidate.get("inbox").is_some())
        }
        None if state.config.is_local(resource) && !model::is_private(resource) => {
            state.store.get(resource).await?
        }
        None => None,
    }
    .ok_or(AppError::NotFound)?;

    let actor_id = model::id_of(&actor).ok_or(AppError::NotFound)?;
    tracing::debug!(resource = %resource, actor = %actor_id, "WebFinger lookup");

    Ok(typed_json(
        JRD_CONTENT_TYPE,
        &json!({
            "subject": resource,
            "aliases": [actor_id],
            "links": [
                {
                    "rel": "self",
                    "type": ACTIVITY_CONTENT_TYPE,
                    "href": actor_id
                },
                {
                    "rel": PROFILE_PAGE_REL,
                    "type": "text/html",
                    "href": actor_id
                }
            ]
        }),
    ))
}

/// GET /.well-known/nodeinfo
///
/// Returns links to nodeinfo documents.
pub async fn nodeinfo_links(_state: AppState, request: RouteRequest) -> Result<Response, AppError> {
    let tenant = request.tenant()?;
    let links: Vec<Value> = NODEINFO_VERSIONS
        .iter()
        .map(|version| {
            json!({
                "rel": format!("http://nodeinfo.diaspora.software/ns/schema/{}", version),
                "href": format!("{}/nodeinfo/{}", tenant, version)
            })
        })
        .collect();

    Ok(typed_json("application/json", &json!({ "links": links })))
}

/// GET /nodeinfo/{version}
///
/// NodeInfo 2.0 and 2.1 documents; user count is the number of local
/// actors holding credentials under the requested tenant.
pub async fn nodeinfo(state: AppState, request: RouteRequest) -> Result<Response, AppError> {
    let version = request
        .param("version")
        .filter(|version| NODEINFO_VERSIONS.contains(version))
        .ok_or(AppError::NotFound)?;
    let tenant = request.tenant()?;

    let users = state
        .store
        .query(&Predicate::private().with_type(CREDENTIALS_TYPE))
        .await?
        .iter()
        .filter_map(|credentials| credentials.get("attributedTo").and_then(model::id_of))
        .filter(|owner| state.config.tenant_for_uri(owner) == Some(tenant))
        .count();

    let mut software = json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION")
    });
    if version == "2.1" {
        software["repository"] = json!(env!("CARGO_PKG_REPOSITORY"));
    }

    let content_type = match version {
        "2.0" => "application/json; profile=\"http://nodeinfo.diaspora.software/ns/schema/2.0#\"",
        _ => "application/json; profile=\"http://nodeinfo.diaspora.software/ns/schema/2.1#\"",
    };

    Ok(typed_json(
        content_type,
        &json!({
            "version": version,
            "software": software,
            "protocols": ["activitypub"],
            "services": {
                "inbound": [],
                "outbound": []
            },
            "openRegistrations": false,
            "usage": {
                "users": {
                    "total": users
                }
            },
            "metadata": {}
        }),
    ))
}
