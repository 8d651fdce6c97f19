use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

#[derive(thiserror::Error, Debug)]
pub enum GatewayError {
    #[error("malformed deploy request: {0}")]
    MalformedRequest(String),

    #[error("invalid service config for '{name}': {reason}")]
    InvalidConfig { name: String, reason: String },

    #[error("service '{0}' not found")]
    ServiceNotFound(String),

    #[error("session '{0}' not found")]
    SessionNotFound(String),

    #[error("service '{name}' failed to start: {source}")]
    StartFailed {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("service '{0}' is already running")]
    AlreadyRunning(String),

    #[error("service '{0}' has no usable URL (not running)")]
    NotRunning(String),

    #[error("missing query parameter 'sessionId'")]
    MissingSessionId,

    #[error("invalid proxy path: {0}")]
    InvalidPath(String),

    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),

    #[error("failed to persist configuration: {0}")]
    Persistence(#[source] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = match &self {
            GatewayError::MalformedRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::InvalidConfig { .. } => StatusCode::BAD_REQUEST,
            GatewayError::MissingSessionId => StatusCode::BAD_REQUEST,
            GatewayError::InvalidPath(_) => StatusCode::NOT_FOUND,
            GatewayError::ServiceNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::NotRunning(_) => StatusCode::NOT_FOUND,
            GatewayError::AlreadyRunning(_) => StatusCode::CONFLICT,
            GatewayError::StartFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
