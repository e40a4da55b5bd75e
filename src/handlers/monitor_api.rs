//! Monitoring query surface: per-request detail, aggregate stats, history
//! management and the health probe.

use axum::extract::{Path, State};
use axum::Json;
use serde_json::{json, Value};
use tracing::info;

use crate::error::AppError;
use crate::server::AppState;
use crate::store::{RequestDetail, StoreStats};

/// GET /api/request/:id
pub async fn get_request_detail(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RequestDetail>, AppError> {
    state
        .store
        .get_detail(&id)
        .map(Json)
        .ok_or(AppError::UnknownRequestId(id))
}

/// GET /api/stats
pub async fn get_stats(State(state): State<AppState>) -> Json<StoreStats> {
    Json(state.store.stats())
}

/// POST /api/clear-history. Empties completed history; in-flight records
/// are untouched.
pub async fn clear_history(State(state): State<AppState>) -> Json<Value> {
    let cleared = state.store.clear_history();
    info!(cleared, "History cleared");
    Json(json!({ "cleared": cleared }))
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "active_requests": state.store.active_count(),
        "observers": state.hub.observer_count(),
    }))
}
