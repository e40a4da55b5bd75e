use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Application error types
#[derive(Debug, Error)]
pub enum AppError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
    /// Could not reach the upstream provider
    #[error("Upstream unreachable: {0}")]
    UpstreamUnreachable(String),
    /// Upstream did not respond within the configured timeout
    #[error("Upstream timeout after {0}s")]
    UpstreamTimeout(u64),
    /// Query-by-id with no matching record
    #[error("Request not found: {0}")]
    UnknownRequestId(String),
    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            Self::Config(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
            Self::UpstreamUnreachable(msg) => (StatusCode::BAD_GATEWAY, msg.clone()),
            Self::UpstreamTimeout(secs) => (
                StatusCode::GATEWAY_TIMEOUT,
                format!("upstream did not respond within {secs}s"),
            ),
            Self::UnknownRequestId(id) => {
                (StatusCode::NOT_FOUND, format!("no such request: {id}"))
            }
            Self::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let body = Json(json!({
            "error": {
                "message": error_message,
                "type": error_type_name(&self),
            }
        }));

        (status, body).into_response()
    }
}

fn error_type_name(error: &AppError) -> &'static str {
    match error {
        AppError::Config(_) => "config_error",
        AppError::UpstreamUnreachable(_) => "upstream_unreachable",
        AppError::UpstreamTimeout(_) => "upstream_timeout",
        AppError::UnknownRequestId(_) => "unknown_request_id",
        AppError::Internal(_) => "internal_error",
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err.to_string())
    }
}
