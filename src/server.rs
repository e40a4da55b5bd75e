//! HTTP server assembly: shared state, routing and graceful shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::events::EventHub;
use crate::handlers;
use crate::store::MetricsStore;

/// Shared application state, cheap to clone per request.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<MetricsStore>,
    pub hub: EventHub,
    pub http_client: reqwest::Client,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let hub = EventHub::default();
        let store = Arc::new(MetricsStore::new(config.monitor.max_history, hub.clone()));
        Self {
            config: Arc::new(config),
            store,
            hub,
            http_client: reqwest::Client::new(),
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Proxied provider surfaces
        .route("/v1/messages", post(handlers::messages::handle_messages))
        .route("/messages", post(handlers::messages::handle_messages))
        .route(
            "/v1/chat/completions",
            post(handlers::chat_completions::handle_chat_completions),
        )
        // Monitoring surfaces
        .route(
            "/api/request/:id",
            get(handlers::monitor_api::get_request_detail),
        )
        .route("/api/stats", get(handlers::monitor_api::get_stats))
        .route(
            "/api/clear-history",
            post(handlers::monitor_api::clear_history),
        )
        .route("/health", get(handlers::monitor_api::health))
        .route("/ws", get(handlers::ws::ws_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub async fn start_server(config: Config) -> Result<()> {
    let host: std::net::IpAddr = config
        .server
        .host
        .parse()
        .with_context(|| format!("invalid listen host '{}'", config.server.host))?;
    let addr = SocketAddr::from((host, config.server.port));

    let state = AppState::new(config);
    info!(
        anthropic_upstream = %state.config.upstream.anthropic_base_url,
        openai_upstream = %state.config.upstream.openai_base_url,
        max_history = state.config.monitor.max_history,
        "Configuration loaded"
    );

    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("LiveToken monitor listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown signal received, draining connections");
}
