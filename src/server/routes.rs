use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::response::IntoResponse;
use axum::http::{HeaderName, header};
use axum::routing::{get, post};
use axum::{Json, Router};
use hyper::StatusCode;
use serde::{Deserialize, Deserializer};
use serde_json::{Value, json};
use tower_http::cors::{Any, CorsLayer};

use super::ws::{self, PushMessage};
use super::{AppState, middleware};
use crate::chat;
use crate::error::GatewayError;

pub fn build_router(state: AppState) -> Router {
    let health_routes = Router::new().route(
        "/",
        get(|| async {
            Json(json!({
                "status": "ok",
            }))
        }),
    );

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(vec![header::CONTENT_TYPE, HeaderName::from_static("x_key")]);

    Router::new()
        .route("/", get(index))
        .nest("/health", health_routes)
        .route("/ws", get(ws::upgrade))
        .route("/ws/push", post(push))
        .route("/ws/runtime", get(runtime).post(runtime))
        .route("/v1/chat_now", post(chat_now))
        .route("/v1/embedding", post(embedding))
        .fallback(not_found)
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::require_auth_key,
        ))
        .with_state(state)
        .layer(cors)
        .layer(axum::middleware::from_fn(
            middleware::enrich_current_span_middleware,
        ))
}

async fn not_found(req: axum::extract::Request) -> impl IntoResponse {
    tracing::warn!("unhandled path: {}", req.uri());
    (StatusCode::NOT_FOUND, "Not Found")
}

async fn index() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "data": format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
    }))
}

fn error_status(err: &GatewayError) -> StatusCode {
    match err {
        GatewayError::Parse(_) | GatewayError::UnknownModel(_) | GatewayError::Json(_) => {
            StatusCode::BAD_REQUEST
        }
        _ => StatusCode::BAD_GATEWAY,
    }
}

/// Malformed bodies get the same envelope as every other failure.
fn rejected(rejection: JsonRejection) -> (StatusCode, Json<Value>) {
    let error = rejection.body_text();
    tracing::warn!(%error, "rejected request body");
    (
        rejection.status(),
        Json(json!({ "status": "error", "error": error })),
    )
}

async fn push(
    State(state): State<AppState>,
    body: Result<Json<PushMessage>, JsonRejection>,
) -> (StatusCode, Json<Value>) {
    let body = match body {
        Ok(Json(body)) => body,
        Err(rejection) => return rejected(rejection),
    };
    let payload = match serde_json::to_vec(&body) {
        Ok(payload) => payload,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "status": "error", "error": e.to_string() })),
            );
        }
    };
    state.pool.broadcast(&payload).await;
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}

async fn runtime(State(state): State<AppState>) -> Json<Value> {
    let stats = state.pool.stats().await;
    Json(json!({
        "status": "ok",
        "data": {
            "max_connection": state.config.ws.max_connections,
            "current_groups": stats.group_count,
            "current_connections": stats.connection_count,
        },
    }))
}

#[derive(Deserialize)]
pub struct ChatNowRequest {
    pub prompt: String,
    #[serde(default)]
    pub user_uuid: String,
    #[serde(default, deserialize_with = "lenient_flag")]
    pub has_context: bool,
}

/// A flag sent as a JSON bool, a number or a string such as `"true"`.
fn lenient_flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(false),
        Value::Bool(flag) => Ok(flag),
        Value::Number(n) => Ok(n.as_f64().is_some_and(|n| n != 0.0)),
        Value::String(s) => Ok(matches!(s.trim(), "1" | "t" | "T" | "true" | "TRUE" | "True")),
        other => Err(serde::de::Error::custom(format!("expected a boolean, got {other}"))),
    }
}

#[tracing::instrument(skip_all, fields(job_uuid))]
async fn chat_now(
    State(state): State<AppState>,
    body: Result<Json<ChatNowRequest>, JsonRejection>,
) -> (StatusCode, Json<Value>) {
    let body = match body {
        Ok(Json(body)) => body,
        Err(rejection) => return rejected(rejection),
    };
    let job_uuid = uuid::Uuid::new_v4().to_string();
    tracing::Span::current().record("job_uuid", job_uuid.as_str());
    tracing::info!(user_uuid = %body.user_uuid, has_context = body.has_context, "chat_now");

    let result = match chat::conversation(&body.prompt, body.has_context) {
        Ok(messages) => state.completions.complete(&messages).await,
        Err(e) => Err(e),
    };
    match result {
        Ok(rsp) => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "data": { "job_uuid": job_uuid, "prompt": body.prompt, "rsp": rsp },
            })),
        ),
        Err(e) => {
            tracing::warn!(error = %e, "chat_now failed");
            (
                error_status(&e),
                Json(json!({ "status": "error", "job_uuid": job_uuid, "error": e.to_string() })),
            )
        }
    }
}

#[derive(Deserialize)]
pub struct EmbeddingRequest {
    pub prompt: String,
}

async fn embedding(
    State(state): State<AppState>,
    body: Result<Json<EmbeddingRequest>, JsonRejection>,
) -> (StatusCode, Json<Value>) {
    let body = match body {
        Ok(Json(body)) => body,
        Err(rejection) => return rejected(rejection),
    };
    match state.embedder.embed(&body.prompt).await {
        Ok(rsp) => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "data": { "prompt": body.prompt, "rsp": rsp },
            })),
        ),
        Err(e) => {
            tracing::warn!(error = %e, "embedding failed");
            (
                error_status(&e),
                Json(json!({ "status": "error", "error": e.to_string() })),
            )
        }
    }
}
