//! Static assets
//!
//! `/static/{file_path:path}` is served from the tenant's override
//! directory (`<tenants_dir>/<hostname>/static`) first, then from the
//! shared `static_dir`.

use axum::{
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use lazy_static::lazy_static;
use std::collections::HashMap;
use std::io;
use std::path::{Component, Path, PathBuf};

use super::router::RouteRequest;
use crate::AppState;
use crate::error::AppError;

lazy_static! {
    static ref CONTENT_TYPES: HashMap<&'static str, HeaderValue> = HashMap::from([
        ("html", HeaderValue::from_static("text/html; charset=utf-8")),
        ("css", HeaderValue::from_static("text/css")),
        ("js", HeaderValue::from_static("text/javascript")),
        ("json", HeaderValue::from_static("application/json")),
        ("svg", HeaderValue::from_static("image/svg+xml")),
        ("png", HeaderValue::from_static("image/png")),
        ("jpg", HeaderValue::from_static("image/jpeg")),
        ("jpeg", HeaderValue::from_static("image/jpeg")),
        ("gif", HeaderValue::from_static("image/gif")),
        ("webp", HeaderValue::from_static("image/webp")),
        ("ico", HeaderValue::from_static("image/x-icon")),
        ("txt", HeaderValue::from_static("text/plain; charset=utf-8")),
        ("woff2", HeaderValue::from_static("font/woff2")),
        ("wasm", HeaderValue::from_static("application/wasm")),
    ]);
}

fn content_type_for(path: &Path) -> HeaderValue {
    path.extension()
        .and_then(|extension| extension.to_str())
        .map(str::to_ascii_lowercase)
        .and_then(|extension| CONTENT_TYPES.get(extension.as_str()).cloned())
        .unwrap_or_else(|| HeaderValue::from_static("application/octet-stream"))
}

/// Relative file path with only normal components
fn safe_relative(file_path: &str) -> Option<PathBuf> {
    let path = Path::new(file_path);
    let safe = !file_path.is_empty()
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
    safe.then(|| path.to_path_buf())
}

/// Directories searched for the request's tenant, in order
fn search_dirs(state: &AppState, tenant: Option<&str>) -> Vec<PathBuf> {
    let mut dirs = Vec::with_capacity(2);
    if let Some(hostname) = tenant
        .and_then(|tenant| url::Url::parse(tenant).ok())
        .and_then(|url| url.host_str().map(str::to_string))
    {
        let tenant_dir = state.config.html.tenants_dir.join(hostname).join("static");
        if tenant_dir.is_dir() {
            dirs.push(tenant_dir);
        }
    }
    dirs.push(state.config.html.static_dir.clone());
    dirs
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "File not found").into_response()
}

/// GET/HEAD /static/{file_path:path}
pub async fn static_file(state: AppState, request: RouteRequest) -> Result<Response, AppError> {
    let Some(relative) = request.param("file_path").and_then(safe_relative) else {
        tracing::debug!(path = %request.uri.path(), "Rejected static path");
        return Ok(not_found());
    };

    for dir in search_dirs(&state, request.tenant.as_deref()) {
        let candidate = dir.join(&relative);
        match tokio::fs::read(&candidate).await {
            Ok(contents) => {
                return Ok((
                    [(header::CONTENT_TYPE, content_type_for(&candidate))],
                    contents,
                )
                    .into_response());
            }
            Err(error) if matches!(error.kind(), io::ErrorKind::NotFound | io::ErrorKind::IsADirectory) => {
                continue;
            }
            Err(error) => {
                tracing::warn!(file = %candidate.display(), %error, "Failed to read static asset");
                return Err(AppError::Internal(error.into()));
            }
        }
    }

    Ok(not_found())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::router::tests::{body_text, routed};
    use crate::config::tests::valid_config;
    use crate::test_state_with;
    use axum::http::Method;

    fn request_for(file_path: &str) -> RouteRequest {
        let mut request = routed(Method::GET, &format!("/static/{}", file_path));
        request
            .params
            .insert("file_path".to_string(), file_path.to_string());
        request
    }

    #[test]
    fn traversal_is_rejected() {
        assert!(safe_relative("../secret").is_none());
        assert!(safe_relative("css/../../secret").is_none());
        assert!(safe_relative("/etc/passwd").is_none());
        assert!(safe_relative("").is_none());
        assert_eq!(safe_relative("css/site.css"), Some(PathBuf::from("css/site.css")));
    }

    #[test]
    fn content_type_follows_extension() {
        assert_eq!(content_type_for(Path::new("a/site.CSS")), "text/css");
        assert_eq!(content_type_for(Path::new("logo.svg")), "image/svg+xml");
        assert_eq!(content_type_for(Path::new("blob")), "application/octet-stream");
    }

    #[tokio::test]
    async fn tenant_override_wins_over_shared_assets() {
        let root = tempfile::tempdir().unwrap();
        let shared = root.path().join("static");
        let tenant = root.path().join("tenants/social.example/static");
        std::fs::create_dir_all(&shared).unwrap();
        std::fs::create_dir_all(&tenant).unwrap();
        std::fs::write(shared.join("site.css"), "shared").unwrap();
        std::fs::write(shared.join("only-shared.txt"), "fallback").unwrap();
        std::fs::write(tenant.join("site.css"), "tenant").unwrap();

        let mut config = valid_config();
        config.html.static_dir = shared;
        config.html.tenants_dir = root.path().join("tenants");
        let state = test_state_with(config).await;

        let response = static_file(state.clone(), request_for("site.css")).await.unwrap();
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/css");
        assert_eq!(body_text(response).await, "tenant");

        let response = static_file(state.clone(), request_for("only-shared.txt")).await.unwrap();
        assert_eq!(body_text(response).await, "fallback");

        let response = static_file(state, request_for("missing.js")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_text(response).await, "File not found");
    }
}
