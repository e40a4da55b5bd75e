//! Anthropic-style Messages endpoint.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Response;

use crate::error::AppError;
use crate::proxy;
use crate::server::AppState;
use crate::store::ApiFamily;

/// POST /v1/messages (also mounted at /messages for clients whose base URL
/// already includes /v1).
pub async fn handle_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    proxy::forward(&state, ApiFamily::Anthropic, "/v1/messages", headers, body).await
}
