//! HTML views
//!
//! The tenant root renders the home page and `/login` the login page.
//! Any other path renders the stored resource with a view picked from its
//! type tag; types without a view are returned as JSON. Reads go through
//! the activity service, so requesters only see what they may read.

use axum::{
    Json,
    http::StatusCode,
    response::{Html, IntoResponse, Response},
};
use html_escape::{encode_double_quoted_attribute as attr, encode_text as text};
use serde_json::Value;
use std::collections::HashSet;

use super::router::RouteRequest;
use crate::AppState;
use crate::data::model::{self, CREDENTIALS_TYPE, ROLE_PROPERTY};
use crate::auth::AuthContext;
use crate::data::Predicate;
use crate::error::AppError;

const TIMELINE_LIMIT: usize = 10;
const DOCUMENT_TYPES: [&str; 3] = ["Note", "Article", "Document"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResourceView {
    Actor,
    Document,
}

const RESOURCE_VIEWS: [(&str, ResourceView); 8] = [
    ("Person", ResourceView::Actor),
    ("Organization", ResourceView::Actor),
    ("Group", ResourceView::Actor),
    ("Application", ResourceView::Actor),
    ("Service", ResourceView::Actor),
    ("Note", ResourceView::Document),
    ("Article", ResourceView::Document),
    ("Document", ResourceView::Document),
];

fn view_for(resource: &Value) -> Option<ResourceView> {
    let tag = model::type_tag(resource)?;
    RESOURCE_VIEWS
        .iter()
        .find(|(name, _)| *name == tag)
        .map(|(_, view)| *view)
}

fn page(title: &str, body: &str) -> Response {
    Html(format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>{}</title>\n\
         <link rel=\"stylesheet\" href=\"/static/site.css\">\n</head>\n<body>\n{}\n\
         <footer>{} {}</footer>\n</body>\n</html>\n",
        text(title),
        body,
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
    ))
    .into_response()
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "Resource not found").into_response()
}

/// GET/HEAD for `text/html` requests
pub async fn html_view(state: AppState, request: RouteRequest) -> Result<Response, AppError> {
    let tenant = request.tenant()?;
    let path = request.uri.path();

    if path.trim_end_matches('/').is_empty() {
        return Ok(home_page(tenant));
    }
    if path == "/login" {
        return Ok(login_page(tenant));
    }

    let uri = format!("{}{}", tenant, path.trim_end_matches('/'));
    let Some(resource) = readable(&state, &uri, &request.auth).await? else {
        tracing::debug!(uri = %uri, "No readable resource for HTML view");
        return Ok(not_found());
    };

    match view_for(&resource) {
        Some(ResourceView::Actor) => actor_page(&state, &request.auth, &uri, &resource).await,
        Some(ResourceView::Document) => Ok(document_page(&resource)),
        None => Ok(Json(resource).into_response()),
    }
}

/// The view of `uri` the requester may see, `None` when it is missing or
/// refused
async fn readable(state: &AppState, uri: &str, auth: &AuthContext) -> Result<Option<Value>, AppError> {
    match state.activity_service.get(uri, auth).await {
        Ok(resource) => Ok(Some(resource)),
        Err(AppError::NotFound | AppError::Unauthorized | AppError::Forbidden) => Ok(None),
        Err(error) => Err(error),
    }
}

fn home_page(tenant: &str) -> Response {
    page(
        tenant,
        &format!(
            "<main>\n<h1>{}</h1>\n<p>An ActivityPub server.</p>\n<p><a href=\"/login\">Log in</a></p>\n</main>",
            text(tenant)
        ),
    )
}

fn login_page(tenant: &str) -> Response {
    page(
        &format!("Log in to {}", tenant),
        "<main>\n<h1>Log in</h1>\n\
         <form id=\"login\" onsubmit=\"document.cookie='session='+encodeURIComponent(this.token.value)+';path=/;SameSite=Strict';location.href='/';return false;\">\n\
         <label for=\"token\">Access token</label>\n\
         <input id=\"token\" name=\"token\" type=\"password\" autocomplete=\"current-password\">\n\
         <button type=\"submit\">Log in</button>\n</form>\n</main>",
    )
}

async fn actor_page(
    state: &AppState,
    auth: &AuthContext,
    uri: &str,
    actor: &Value,
) -> Result<Response, AppError> {
    let credentials = state
        .store
        .query_one(
            &Predicate::private()
                .with_type(CREDENTIALS_TYPE)
                .attributed_to(uri),
        )
        .await?;
    let roles: Vec<String> = match credentials.as_ref().and_then(|c| c.get(ROLE_PROPERTY)) {
        Some(Value::String(role)) => vec![role.clone()],
        Some(Value::Array(roles)) => roles.iter().filter_map(Value::as_str).map(str::to_string).collect(),
        _ => Vec::new(),
    };
    let timeline = timeline(state, auth, actor).await?;

    let name = actor
        .get("name")
        .and_then(Value::as_str)
        .or_else(|| actor.get("preferredUsername").and_then(Value::as_str))
        .unwrap_or(uri);

    let mut body = format!("<main class=\"actor\">\n<h1>{}</h1>\n", text(name));
    if let Some(handle) = actor.get("preferredUsername").and_then(Value::as_str) {
        body.push_str(&format!("<p class=\"handle\">@{}</p>\n", text(handle)));
    }
    if let Some(summary) = actor.get("summary").and_then(Value::as_str) {
        body.push_str(&format!("<p class=\"summary\">{}</p>\n", text(summary)));
    }
    if !roles.is_empty() {
        body.push_str("<ul class=\"roles\">\n");
        for role in &roles {
            body.push_str(&format!("<li>{}</li>\n", text(role)));
        }
        body.push_str("</ul>\n");
    }

    body.push_str("<section class=\"timeline\">\n");
    for document in &timeline {
        body.push_str(&document_card(document));
    }
    body.push_str("</section>\n</main>");

    Ok(page(name, &body))
}

/// Up to ten distinct documents created or updated through the outbox,
/// limited to what the requester may read
async fn timeline(state: &AppState, auth: &AuthContext, actor: &Value) -> Result<Vec<Value>, AppError> {
    let Some(outbox_uri) = actor.get("outbox").and_then(Value::as_str) else {
        return Ok(Vec::new());
    };
    let Some(outbox) = readable(state, outbox_uri, auth).await? else {
        return Ok(Vec::new());
    };

    let mut seen = HashSet::new();
    let mut documents = Vec::new();
    for entry in model::collection_items(&outbox) {
        let Some(activity_uri) = model::id_of(entry) else {
            continue;
        };
        let Some(activity) = readable(state, activity_uri, auth).await? else {
            continue;
        };
        if !(model::has_type(&activity, "Create") || model::has_type(&activity, "Update")) {
            continue;
        }

        let object = match activity.get("object") {
            Some(Value::String(object_uri)) => readable(state, object_uri, auth).await?,
            Some(object @ Value::Object(_)) => Some(object.clone()),
            _ => None,
        };
        let Some(object) = object else {
            continue;
        };
        let is_document = DOCUMENT_TYPES.iter().any(|tag| model::has_type(&object, tag));
        let Some(object_id) = model::id_of(&object).map(str::to_string) else {
            continue;
        };
        if is_document && seen.insert(object_id) {
            documents.push(object);
            if documents.len() >= TIMELINE_LIMIT {
                break;
            }
        }
    }
    Ok(documents)
}

fn document_card(document: &Value) -> String {
    let id = model::id_of(document).unwrap_or_default();
    let mut card = format!("<article>\n<a href=\"{}\">", attr(id));
    card.push_str(&text(
        document
            .get("name")
            .and_then(Value::as_str)
            .or_else(|| document.get("published").and_then(Value::as_str))
            .unwrap_or(id),
    ));
    card.push_str("</a>\n");
    if let Some(content) = document.get("content").and_then(Value::as_str) {
        card.push_str(&format!("<div class=\"content\">{}</div>\n", text(content)));
    }
    card.push_str("</article>\n");
    card
}

fn document_page(document: &Value) -> Response {
    let title = document
        .get("name")
        .and_then(Value::as_str)
        .or_else(|| model::type_tag(document))
        .unwrap_or("Document");

    let mut body = format!("<main class=\"document\">\n<h1>{}</h1>\n", text(title));
    if let Some(author) = document.get("attributedTo").and_then(model::id_of) {
        body.push_str(&format!(
            "<p class=\"author\"><a href=\"{}\">{}</a></p>\n",
            attr(author),
            text(author)
        ));
    }
    if let Some(published) = document.get("published").and_then(Value::as_str) {
        body.push_str(&format!("<time>{}</time>\n", text(published)));
    }
    if let Some(content) = document.get("content").and_then(Value::as_str) {
        body.push_str(&format!("<div class=\"content\">{}</div>\n", text(content)));
    }
    body.push_str("</main>");

    page(title, &body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::router::tests::{body_text, routed};
    use crate::data::ResourceStore;
    use crate::test_state;
    use axum::http::{Method, header};
    use serde_json::json;

    const ALICE: &str = "https://social.example/actor/alice";

    async fn seeded() -> AppState {
        let state = test_state().await;
        let store = &state.store;
        store
            .put(json!({
                "id": ALICE,
                "type": "Person",
                "name": "Alice <Admin>",
                "preferredUsername": "alice",
                "inbox": format!("{}/inbox", ALICE),
                "outbox": format!("{}/outbox", ALICE)
            }))
            .await
            .unwrap();
        store
            .put(json!({
                "id": "urn:uuid:alice-credentials",
                "type": CREDENTIALS_TYPE,
                "attributedTo": ALICE,
                ROLE_PROPERTY: ["admin"]
            }))
            .await
            .unwrap();
        store
            .put(json!({
                "id": format!("{}/outbox", ALICE),
                "type": "OrderedCollection",
                "orderedItems": [
                    "https://social.example/activities/2",
                    "https://social.example/activities/1",
                    "https://social.example/activities/follow"
                ]
            }))
            .await
            .unwrap();
        store
            .put(json!({
                "id": "https://social.example/notes/1",
                "type": "Note",
                "attributedTo": ALICE,
                "content": "hello <b>world</b>",
                "courier:draft": true
            }))
            .await
            .unwrap();
        for (id, kind) in [("1", "Create"), ("2", "Update")] {
            store
                .put(json!({
                    "id": format!("https://social.example/activities/{}", id),
                    "type": kind,
                    "actor": ALICE,
                    "object": "https://social.example/notes/1"
                }))
                .await
                .unwrap();
        }
        store
            .put(json!({
                "id": "https://social.example/activities/follow",
                "type": "Follow",
                "actor": ALICE,
                "object": "https://remote.example/bob"
            }))
            .await
            .unwrap();
        state
    }

    #[test]
    fn type_table_selects_views() {
        assert_eq!(view_for(&json!({"type": "Service"})), Some(ResourceView::Actor));
        assert_eq!(view_for(&json!({"type": ["Article"]})), Some(ResourceView::Document));
        assert_eq!(view_for(&json!({"type": "Like"})), None);
    }

    #[tokio::test]
    async fn actor_view_lists_roles_and_deduplicated_timeline() {
        let state = seeded().await;
        let response = html_view(state, routed(Method::GET, "/actor/alice")).await.unwrap();
        let html = body_text(response).await;

        assert!(html.contains("Alice &lt;Admin&gt;"));
        assert!(html.contains("<li>admin</li>"));
        assert_eq!(html.matches("<article>").count(), 1);
        assert!(html.contains("hello &lt;b&gt;world&lt;/b&gt;"));
    }

    #[tokio::test]
    async fn document_view_escapes_content() {
        let state = seeded().await;
        let response = html_view(state, routed(Method::GET, "/notes/1/")).await.unwrap();
        let html = body_text(response).await;
        assert!(html.contains("<main class=\"document\">"));
        assert!(!html.contains("<b>world</b>"));
    }

    #[tokio::test]
    async fn untyped_resources_fall_back_to_json() {
        let state = seeded().await;
        let response = html_view(state, routed(Method::GET, "/activities/follow"))
            .await
            .unwrap();
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");
        let document: Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(document["type"], "Follow");
    }

    #[tokio::test]
    async fn special_pages_and_missing_resources() {
        let state = seeded().await;
        let home = body_text(html_view(state.clone(), routed(Method::GET, "/")).await.unwrap()).await;
        assert!(home.contains("https://social.example"));

        let login = body_text(html_view(state.clone(), routed(Method::GET, "/login")).await.unwrap()).await;
        assert!(login.contains("<form id=\"login\""));

        let missing = html_view(state, routed(Method::GET, "/nothing/here")).await.unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn anonymous_views_respect_addressing() {
        let state = seeded().await;
        state
            .store
            .put(json!({
                "id": "https://social.example/activities/shared",
                "type": "Create",
                "actor": ALICE,
                "to": ["https://www.w3.org/ns/activitystreams#Public"],
                "bcc": ["https://remote.example/secret-friend"],
                "object": "https://social.example/notes/1"
            }))
            .await
            .unwrap();
        state
            .store
            .put(json!({
                "id": "https://social.example/activities/direct",
                "type": "Create",
                "actor": ALICE,
                "bto": ["https://remote.example/secret-friend"],
                "object": "https://social.example/notes/1"
            }))
            .await
            .unwrap();
        state
            .store
            .put(json!({
                "id": format!("{}/inbox", ALICE),
                "type": "OrderedCollection",
                "orderedItems": ["https://social.example/activities/direct"]
            }))
            .await
            .unwrap();

        let response = html_view(state.clone(), routed(Method::GET, "/activities/shared"))
            .await
            .unwrap();
        let document: Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(document["type"], "Create");
        assert!(document.get("bcc").is_none());

        let direct = html_view(state.clone(), routed(Method::GET, "/activities/direct"))
            .await
            .unwrap();
        assert_eq!(direct.status(), StatusCode::NOT_FOUND);

        let inbox = html_view(state, routed(Method::GET, "/actor/alice/inbox")).await.unwrap();
        assert_eq!(inbox.status(), StatusCode::NOT_FOUND);
    }
}
