//! Content-negotiated request router
//!
//! Every request is dispatched through one axum fallback. Routes are tried
//! in priority order; a route is selected when its media policy admits the
//! request's negotiation header, its path template matches and it allows
//! the method.

use async_trait::async_trait;
use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, Method, Request, Uri, header},
    response::{IntoResponse, Response},
};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use super::negotiation::MediaPolicy;
use crate::AppState;
use crate::auth::{AuthContext, Identity};
use crate::error::AppError;
use crate::metrics::HTTP_REQUESTS_TOTAL;

/// Evaluation tier of a route; lower tiers are tried first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RoutePriority {
    WellKnown,
    Static,
    Html,
    Federation,
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    /// `{name}`: exactly one non-empty segment
    Param(String),
    /// `{name:path}`: the remainder of the path, possibly empty
    Rest(String),
}

/// Path template such as `/nodeinfo/{version}` or `/static/{file_path:path}`
#[derive(Debug, Clone, PartialEq)]
pub struct PathTemplate {
    raw: String,
    segments: Vec<Segment>,
}

impl PathTemplate {
    pub fn parse(template: &str) -> Result<Self, AppError> {
        let invalid = |reason: &str| AppError::Config(format!("invalid path template {}: {}", template, reason));

        let trimmed = template
            .strip_prefix('/')
            .ok_or_else(|| invalid("must start with '/'"))?;
        let pieces: Vec<&str> = if trimmed.is_empty() {
            Vec::new()
        } else {
            trimmed.split('/').collect()
        };

        let mut segments = Vec::with_capacity(pieces.len());
        for (index, piece) in pieces.iter().enumerate() {
            let segment = match piece.strip_prefix('{').and_then(|p| p.strip_suffix('}')) {
                Some(inner) => match inner.split_once(':') {
                    Some((name, "path")) if index == pieces.len() - 1 => Segment::Rest(name.to_string()),
                    Some((_, "path")) => return Err(invalid("{name:path} must be the last segment")),
                    Some((_, kind)) => return Err(invalid(&format!("unknown parameter kind {}", kind))),
                    None => Segment::Param(inner.to_string()),
                },
                None => Segment::Literal(piece.to_string()),
            };
            if let Segment::Param(name) | Segment::Rest(name) = &segment {
                if name.is_empty() {
                    return Err(invalid("parameter name is empty"));
                }
            }
            segments.push(segment);
        }

        Ok(Self {
            raw: template.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Captured parameters when `path` matches
    pub fn matches(&self, path: &str) -> Option<HashMap<String, String>> {
        let trimmed = path.strip_prefix('/').unwrap_or(path);
        let parts: Vec<&str> = if trimmed.is_empty() {
            Vec::new()
        } else {
            trimmed.split('/').collect()
        };

        let mut params = HashMap::new();
        for (index, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Rest(name) => {
                    let rest = parts.get(index..).unwrap_or_default().join("/");
                    params.insert(name.clone(), rest);
                    return Some(params);
                }
                Segment::Literal(literal) => {
                    if parts.get(index) != Some(&literal.as_str()) {
                        return None;
                    }
                }
                Segment::Param(name) => {
                    let value = parts.get(index).filter(|value| !value.is_empty())?;
                    params.insert(name.clone(), value.to_string());
                }
            }
        }

        (parts.len() == self.segments.len()).then_some(params)
    }
}

/// Everything a handler needs to know about a routed request
#[derive(Debug, Clone)]
pub struct RouteRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Parameters captured by the path template
    pub params: HashMap<String, String>,
    pub auth: AuthContext,
    /// Tenant prefix selected by the `Host` header
    pub tenant: Option<String>,
    /// Name of the matched route
    pub route: &'static str,
}

impl RouteRequest {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// Decoded query string parameters; the last occurrence of a key wins
    pub fn query(&self) -> HashMap<String, String> {
        self.uri
            .query()
            .map(|query| url::form_urlencoded::parse(query.as_bytes()).into_owned().collect())
            .unwrap_or_default()
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.auth.identity()
    }

    pub fn tenant(&self) -> Result<&str, AppError> {
        self.tenant.as_deref().ok_or(AppError::NotFound)
    }

    /// URI of the resource addressed by this request's path
    pub fn resource_uri(&self) -> Result<String, AppError> {
        Ok(format!("{}{}", self.tenant()?, self.uri.path()))
    }

    pub fn json(&self) -> Result<Value, AppError> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

#[async_trait]
pub trait RouteHandler: Send + Sync {
    async fn call(&self, state: AppState, request: RouteRequest) -> Result<Response, AppError>;
}

#[async_trait]
impl<F, Fut> RouteHandler for F
where
    F: Fn(AppState, RouteRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Response, AppError>> + Send + 'static,
{
    async fn call(&self, state: AppState, request: RouteRequest) -> Result<Response, AppError> {
        (self)(state, request).await
    }
}

/// A path template plus the method, media and auth constraints around it
pub struct Route {
    pub name: &'static str,
    template: PathTemplate,
    methods: Vec<Method>,
    media: MediaPolicy,
    priority: RoutePriority,
    requires_auth: bool,
    handler: Arc<dyn RouteHandler>,
}

impl Route {
    /// GET-only, unrestricted media, no authentication
    pub fn new<H>(
        name: &'static str,
        template: &str,
        priority: RoutePriority,
        handler: H,
    ) -> Result<Self, AppError>
    where
        H: RouteHandler + 'static,
    {
        Ok(Self {
            name,
            template: PathTemplate::parse(template)?,
            methods: vec![Method::GET],
            media: MediaPolicy::Any,
            priority,
            requires_auth: false,
            handler: Arc::new(handler),
        })
    }

    pub fn methods(mut self, methods: &[Method]) -> Self {
        self.methods = methods.to_vec();
        self
    }

    pub fn media(mut self, media: MediaPolicy) -> Self {
        self.media = media;
        self
    }

    pub fn requires_auth(mut self) -> Self {
        self.requires_auth = true;
        self
    }

    pub fn priority(&self) -> RoutePriority {
        self.priority
    }

    pub fn template(&self) -> &PathTemplate {
        &self.template
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("name", &self.name)
            .field("template", &self.template.as_str())
            .field("methods", &self.methods)
            .field("media", &self.media)
            .field("priority", &self.priority)
            .field("requires_auth", &self.requires_auth)
            .finish()
    }
}

/// Route selected for a request
pub struct RouteMatch {
    pub route: Arc<Route>,
    pub params: HashMap<String, String>,
}

/// Routes ordered by priority, registration order within a priority
#[derive(Default, Clone)]
pub struct RouteTable {
    routes: Vec<Arc<Route>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, route: Route) {
        let position = self
            .routes
            .iter()
            .position(|existing| existing.priority > route.priority)
            .unwrap_or(self.routes.len());
        self.routes.insert(position, Arc::new(route));
    }

    pub fn with(mut self, route: Route) -> Self {
        self.add(route);
        self
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.routes.iter().map(|route| route.name).collect()
    }

    /// Select the route for a request
    ///
    /// # Errors
    /// - `Validation` when a negotiation header consulted along the way is malformed
    /// - `MethodNotAllowed` when media and path matched but no such route allows the method
    /// - `NotFound` otherwise
    pub fn resolve(&self, method: &Method, path: &str, headers: &HeaderMap) -> Result<RouteMatch, AppError> {
        let mut method_mismatch = false;

        for route in &self.routes {
            if !route.media.admits(method, headers)? {
                continue;
            }
            let Some(params) = route.template.matches(path) else {
                continue;
            };
            if !route.methods.contains(method) {
                method_mismatch = true;
                continue;
            }
            return Ok(RouteMatch {
                route: route.clone(),
                params,
            });
        }

        Err(if method_mismatch {
            AppError::MethodNotAllowed
        } else {
            AppError::NotFound
        })
    }
}

/// Fallback handler running every request through the route table
pub async fn dispatch(State(state): State<AppState>, request: Request<Body>) -> Response {
    let (route, result) = route_request(&state, request).await;
    let response = result.into_response();
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[route, response.status().as_str()])
        .inc();
    response
}

async fn route_request(state: &AppState, request: Request<Body>) -> (&'static str, Result<Response, AppError>) {
    let (parts, body) = request.into_parts();

    let matched = match state.routes.resolve(&parts.method, parts.uri.path(), &parts.headers) {
        Ok(matched) => matched,
        Err(error) => {
            tracing::debug!(method = %parts.method, path = %parts.uri.path(), %error, "No route");
            return ("unmatched", Err(error));
        }
    };
    let name = matched.route.name;

    let auth = parts
        .extensions
        .get::<AuthContext>()
        .cloned()
        .unwrap_or_default();
    if matched.route.requires_auth && !auth.is_authenticated() {
        return (name, Err(AppError::Unauthorized));
    }

    let body = match axum::body::to_bytes(body, state.config.server.max_body_bytes).await {
        Ok(body) => body,
        Err(_) => return (name, Err(AppError::PayloadTooLarge)),
    };

    let host = parts
        .headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .or_else(|| parts.uri.authority().map(|authority| authority.as_str()));
    let tenant = host
        .and_then(|host| state.config.tenant_for_host(host))
        .map(str::to_string);

    let request = RouteRequest {
        method: parts.method,
        uri: parts.uri,
        headers: parts.headers,
        body,
        params: matched.params,
        auth,
        tenant,
        route: name,
    };

    tracing::debug!(route = name, method = %request.method, path = %request.uri.path(), "Routing request");
    (name, matched.route.handler.call(state.clone(), request).await)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use axum::http::HeaderValue;

    /// Request as the router would hand it to a handler for the test tenant
    pub(crate) fn routed(method: Method, path_and_query: &str) -> RouteRequest {
        RouteRequest {
            method,
            uri: path_and_query.parse().unwrap(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            params: HashMap::new(),
            auth: AuthContext::Unauthenticated,
            tenant: Some("https://social.example".to_string()),
            route: "test",
        }
    }

    pub(crate) async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    async fn noop(_state: AppState, _request: RouteRequest) -> Result<Response, AppError> {
        Ok(().into_response())
    }

    fn accept(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT, HeaderValue::from_static(value));
        headers
    }

    fn table() -> RouteTable {
        RouteTable::new()
            .with(
                Route::new("federation", "/{path:path}", RoutePriority::Federation, noop)
                    .unwrap()
                    .methods(&[Method::GET, Method::HEAD, Method::POST])
                    .media(MediaPolicy::only(crate::data::model::AS2_CONTENT_TYPES)),
            )
            .with(
                Route::new("html", "/{path:path}", RoutePriority::Html, noop)
                    .unwrap()
                    .methods(&[Method::GET, Method::HEAD])
                    .media(MediaPolicy::only(["text/html"])),
            )
            .with(Route::new("nodeinfo", "/nodeinfo/{version}", RoutePriority::WellKnown, noop).unwrap())
            .with(
                Route::new("static", "/static/{file_path:path}", RoutePriority::Static, noop)
                    .unwrap()
                    .methods(&[Method::GET, Method::HEAD]),
            )
    }

    #[test]
    fn templates_capture_parameters() {
        let template = PathTemplate::parse("/nodeinfo/{version}").unwrap();
        assert_eq!(template.matches("/nodeinfo/2.1").unwrap()["version"], "2.1");
        assert!(template.matches("/nodeinfo/").is_none());
        assert!(template.matches("/nodeinfo/2.1/extra").is_none());

        let rest = PathTemplate::parse("/static/{file_path:path}").unwrap();
        assert_eq!(rest.matches("/static/css/site.css").unwrap()["file_path"], "css/site.css");
        assert_eq!(rest.matches("/static").unwrap()["file_path"], "");
        assert!(rest.matches("/other/site.css").is_none());

        let root = PathTemplate::parse("/{path:path}").unwrap();
        assert_eq!(root.matches("/").unwrap()["path"], "");
    }

    #[test]
    fn malformed_templates_are_rejected() {
        assert!(PathTemplate::parse("no-slash").is_err());
        assert!(PathTemplate::parse("/{rest:path}/tail").is_err());
        assert!(PathTemplate::parse("/{id:int}").is_err());
        assert!(PathTemplate::parse("/{}").is_err());
    }

    #[test]
    fn table_keeps_priority_then_registration_order() {
        assert_eq!(table().names(), vec!["nodeinfo", "static", "html", "federation"]);
    }

    #[test]
    fn accept_header_selects_pipeline() {
        let routes = table();
        let matched = routes
            .resolve(&Method::GET, "/actor/alice", &accept("application/activity+json"))
            .unwrap();
        assert_eq!(matched.route.name, "federation");

        let matched = routes.resolve(&Method::GET, "/actor/alice", &accept("text/html")).unwrap();
        assert_eq!(matched.route.name, "html");

        // Both acceptable: list order decides
        let matched = routes
            .resolve(&Method::GET, "/actor/alice", &accept("application/activity+json, text/html"))
            .unwrap();
        assert_eq!(matched.route.name, "html");
    }

    #[test]
    fn unrestricted_routes_ignore_negotiation_headers() {
        let matched = table().resolve(&Method::GET, "/nodeinfo/2.0", &HeaderMap::new()).unwrap();
        assert_eq!(matched.route.name, "nodeinfo");
        assert_eq!(matched.params["version"], "2.0");
    }

    #[test]
    fn failures_distinguish_missing_route_from_wrong_method() {
        let routes = table();
        assert!(matches!(
            routes.resolve(&Method::GET, "/actor/alice", &HeaderMap::new()),
            Err(AppError::NotFound)
        ));
        assert!(matches!(
            routes.resolve(&Method::DELETE, "/actor/alice", &accept("text/html")),
            Err(AppError::NotFound)
        ));

        let mut content_type = HeaderMap::new();
        content_type.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/html"));
        assert!(matches!(
            routes.resolve(&Method::POST, "/actor/alice", &content_type),
            Err(AppError::MethodNotAllowed)
        ));
        assert!(matches!(
            routes.resolve(&Method::POST, "/nodeinfo/2.0", &HeaderMap::new()),
            Err(AppError::MethodNotAllowed)
        ));
    }

    #[test]
    fn malformed_accept_is_a_client_error() {
        assert!(matches!(
            table().resolve(&Method::GET, "/actor/alice", &accept("garbage")),
            Err(AppError::Validation(_))
        ));
    }
}
