//! HTTP router: path normalization, CORS, HEAD probes, and the route table.

use axum::Router;
use axum::body::Body;
use axum::extract::Request;
use axum::http::{HeaderValue, Method, StatusCode, Uri, header};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};

use crate::handlers;
use crate::state::AppState;

/// Strip the longest of `/v1/api`, `/api`, `/v1` off the front of a path.
/// Idempotent: canonical paths never start with a strippable prefix again.
pub fn canonical_path(path: &str) -> &str {
    for prefix in ["/v1/api", "/api", "/v1"] {
        if let Some(rest) = path.strip_prefix(prefix) {
            if rest.is_empty() {
                return "/";
            }
            if rest.starts_with('/') {
                return rest;
            }
            // e.g. "/apichat": not a prefix match, try the next candidate.
        }
    }
    path
}

async fn normalize_path(mut request: Request, next: Next) -> Response {
    let path = request.uri().path();
    let canonical = canonical_path(path);
    if canonical != path {
        let rewritten = match request.uri().query() {
            Some(query) => format!("{canonical}?{query}"),
            None => canonical.to_string(),
        };
        if let Ok(uri) = rewritten.parse::<Uri>() {
            *request.uri_mut() = uri;
        }
    }
    next.run(request).await
}

/// `HEAD` on any path answers 204 with an empty body.
async fn head_probe(request: Request, next: Next) -> Response {
    if request.method() == Method::HEAD {
        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::NO_CONTENT;
        return response;
    }
    next.run(request).await
}

const DEFAULT_ALLOW_METHODS: &str = "GET, POST, OPTIONS, HEAD";
const DEFAULT_ALLOW_HEADERS: &str = "Content-Type, Authorization";

/// The configured CORS allow-list. An empty list disables CORS entirely:
/// no headers are emitted and preflights fall through to routing.
#[derive(Clone, Default)]
pub struct CorsPolicy {
    allowed: std::sync::Arc<Vec<String>>,
}

impl CorsPolicy {
    pub fn new(allowed: Vec<String>) -> Self {
        Self {
            allowed: std::sync::Arc::new(allowed),
        }
    }

    /// The `Access-Control-Allow-Origin` value for a request origin, if the
    /// policy admits one.
    fn allow_origin(&self, origin: Option<&HeaderValue>) -> Option<HeaderValue> {
        if self.allowed.is_empty() {
            return None;
        }
        if self.allowed.iter().any(|o| o == "*") {
            return Some(HeaderValue::from_static("*"));
        }
        let origin = origin?;
        let origin_str = origin.to_str().ok()?;
        self.allowed
            .iter()
            .any(|o| o == origin_str)
            .then(|| origin.clone())
    }
}

async fn cors(
    axum::extract::State(policy): axum::extract::State<CorsPolicy>,
    request: Request,
    next: Next,
) -> Response {
    if policy.allowed.is_empty() {
        return next.run(request).await;
    }

    let origin = request.headers().get(header::ORIGIN).cloned();
    let allow_origin = policy.allow_origin(origin.as_ref());

    if request.method() == Method::OPTIONS {
        // Preflight: echo the requested method/headers, defaults otherwise.
        let allow_methods = request
            .headers()
            .get(header::ACCESS_CONTROL_REQUEST_METHOD)
            .cloned()
            .unwrap_or_else(|| HeaderValue::from_static(DEFAULT_ALLOW_METHODS));
        let allow_headers = request
            .headers()
            .get(header::ACCESS_CONTROL_REQUEST_HEADERS)
            .cloned()
            .unwrap_or_else(|| HeaderValue::from_static(DEFAULT_ALLOW_HEADERS));

        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::NO_CONTENT;
        if let Some(allow_origin) = allow_origin {
            let headers = response.headers_mut();
            headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, allow_origin);
            headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, allow_methods);
            headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, allow_headers);
        }
        return response;
    }

    let mut response = next.run(request).await;
    if let Some(allow_origin) = allow_origin {
        response
            .headers_mut()
            .insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, allow_origin);
    }
    response
}

/// The full route table over canonical paths.
pub fn build_router(state: AppState) -> Router {
    let cors_policy = CorsPolicy::new(state.config.server.cors_allowed_origins.clone());

    Router::new()
        .route("/", get(handlers::banner))
        .route("/health", get(handlers::health))
        .route("/models", get(handlers::models))
        .route("/tags", get(handlers::tags))
        .route("/chat/completions", post(handlers::chat_openai))
        .route("/messages", post(handlers::chat_anthropic))
        .route("/chat", post(handlers::chat_ollama))
        .route("/show", post(handlers::show))
        .route("/mcp/health", get(handlers::mcp_health))
        .route("/mcp/tools", get(handlers::mcp_tools))
        .route("/mcp/call", post(handlers::mcp_call))
        .with_state(state)
        // Layer order, outermost first at request time: CORS, HEAD,
        // normalization, then routing.
        .layer(middleware::from_fn(normalize_path))
        .layer(middleware::from_fn(head_probe))
        .layer(middleware::from_fn_with_state(cors_policy, cors))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixes_strip_to_one_canonical_path() {
        assert_eq!(canonical_path("/v1/chat/completions"), "/chat/completions");
        assert_eq!(canonical_path("/api/chat/completions"), "/chat/completions");
        assert_eq!(canonical_path("/v1/api/chat/completions"), "/chat/completions");
        assert_eq!(canonical_path("/chat/completions"), "/chat/completions");
    }

    #[test]
    fn normalization_is_idempotent() {
        for path in [
            "/v1/chat",
            "/api/chat",
            "/v1/api/chat",
            "/chat",
            "/v1",
            "/",
            "/v1x/chat",
        ] {
            let once = canonical_path(path);
            assert_eq!(canonical_path(once), once, "not idempotent for {path}");
        }
    }

    #[test]
    fn bare_prefix_becomes_root() {
        assert_eq!(canonical_path("/v1"), "/");
        assert_eq!(canonical_path("/api"), "/");
        assert_eq!(canonical_path("/v1/api"), "/");
    }

    #[test]
    fn lookalike_prefixes_are_untouched() {
        assert_eq!(canonical_path("/v1x/chat"), "/v1x/chat");
        assert_eq!(canonical_path("/apichat"), "/apichat");
    }

    #[test]
    fn cors_policy_empty_emits_nothing() {
        let policy = CorsPolicy::new(vec![]);
        assert!(policy.allow_origin(None).is_none());
        assert!(
            policy
                .allow_origin(Some(&HeaderValue::from_static("http://a")))
                .is_none()
        );
    }

    #[test]
    fn cors_policy_wildcard_and_exact() {
        let policy = CorsPolicy::new(vec!["*".into()]);
        assert_eq!(
            policy.allow_origin(None),
            Some(HeaderValue::from_static("*"))
        );

        let policy = CorsPolicy::new(vec!["http://localhost:3000".into()]);
        assert_eq!(
            policy.allow_origin(Some(&HeaderValue::from_static("http://localhost:3000"))),
            Some(HeaderValue::from_static("http://localhost:3000"))
        );
        assert!(
            policy
                .allow_origin(Some(&HeaderValue::from_static("http://evil.example")))
                .is_none()
        );
    }
}
