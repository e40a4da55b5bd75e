//! OpenAI-style Chat Completions endpoint.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Response;

use crate::error::AppError;
use crate::proxy;
use crate::server::AppState;
use crate::store::ApiFamily;

/// POST /v1/chat/completions
pub async fn handle_chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    proxy::forward(
        &state,
        ApiFamily::OpenAi,
        "/v1/chat/completions",
        headers,
        body,
    )
    .await
}
