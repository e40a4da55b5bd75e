//! Observer WebSocket channel.
//!
//! On connect the observer receives a snapshot of the store (history
//! newest-first, then in-flight records), then live lifecycle events as they
//! are published. Subscription happens before the snapshot is taken so no
//! transition can fall in the gap; an observer may at worst see a record
//! twice, never miss it.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crate::server::AppState;

/// GET /ws
pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    if !state.config.monitor.enable_ws {
        return StatusCode::NOT_FOUND.into_response();
    }
    ws.on_upgrade(move |socket| observer_loop(socket, state))
        .into_response()
}

async fn observer_loop(socket: WebSocket, state: AppState) {
    let mut events = state.hub.subscribe();
    let (mut sender, mut receiver) = socket.split();
    debug!(observers = state.hub.observer_count(), "Observer connected");

    for event in state.store.snapshot_events() {
        let Ok(text) = serde_json::to_string(&event) else {
            continue;
        };
        if sender.send(Message::Text(text)).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let Ok(text) = serde_json::to_string(&event) else {
                        continue;
                    };
                    if sender.send(Message::Text(text)).await.is_err() {
                        debug!("Observer write failed, dropping connection");
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Observer too slow, dropping connection");
                    break;
                }
                Err(RecvError::Closed) => break,
            },
            msg = receiver.next() => match msg {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                // Inbound frames other than close are ignored.
                _ => {}
            },
        }
    }
    debug!("Observer disconnected");
}
