use axum::{
    Json,
    body::Body,
    extract::State,
    http::{Request, StatusCode, Uri},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::Span;

use super::AppState;
use crate::notify::AUTH_HEADER;

/// Paths reachable without the shared key. `/ws` clients authenticate
/// through their group id instead.
const OPEN_PATHS: &[&str] = &["/", "/health", "/ws"];

pub async fn enrich_current_span_middleware(req: Request<Body>, next: Next) -> Response {
    let uri: &Uri = req.uri();
    let host = req
        .headers()
        .get("host")
        .and_then(|h| h.to_str().ok())
        .unwrap_or("UNKNOWN");

    let current_span = Span::current();
    current_span.record("http.method", req.method().as_str());
    current_span.record("http.uri", uri.path());
    current_span.record("http.host", host);
    if let Some(query) = uri.query() {
        current_span.record("http.query", query);
    }

    next.run(req).await
}

/// Rejects requests whose `X_KEY` header does not match the configured
/// secret. An empty secret turns the check off.
pub async fn require_auth_key(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let secret = state.config.auth_header_secret.as_str();
    if secret.is_empty() || OPEN_PATHS.contains(&req.uri().path()) {
        return next.run(req).await;
    }

    let presented = req
        .headers()
        .get(AUTH_HEADER)
        .and_then(|v| v.to_str().ok());
    if presented == Some(secret) {
        return next.run(req).await;
    }

    tracing::warn!(path = %req.uri().path(), "rejected request with bad auth key");
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "status": "error", "error": "invalid auth key" })),
    )
        .into_response()
}
