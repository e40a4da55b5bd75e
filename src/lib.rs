//! LiveToken: a transparent proxy for LLM APIs that measures streaming
//! responses in real time (TTFT, token throughput, usage) and broadcasts
//! lifecycle events to WebSocket observers.

pub mod config;
pub mod error;
pub mod estimator;
pub mod events;
pub mod extractor;
pub mod handlers;
pub mod models;
pub mod proxy;
pub mod server;
pub mod store;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize tracing with a RUST_LOG-style filter, defaulting to info.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .init();
}
