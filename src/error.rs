use reqwest::StatusCode;

/// Errors surfaced by the gateway.
///
/// `Parse` and `UnknownModel` are caller mistakes and are reported before any
/// upstream traffic happens. `Canceled` is a user-initiated stop and is never
/// reported as a failure.
#[derive(thiserror::Error, Debug)]
pub enum GatewayError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("chat_model {0} is invalid")]
    UnknownModel(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("upstream returned {status}: {body}")]
    Upstream { status: StatusCode, body: String },

    #[error("client canceled")]
    Canceled,

    #[error("resource limit: {0}")]
    ResourceLimit(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    pub fn is_cancel(&self) -> bool {
        matches!(self, GatewayError::Canceled)
    }
}

pub type Result<T, E = GatewayError> = std::result::Result<T, E>;
