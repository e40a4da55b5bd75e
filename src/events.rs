//! Event fan-out from lifecycle transitions to live observers.
//!
//! Built on a bounded `tokio::sync::broadcast` channel: publishing never
//! blocks the proxy path, and an observer that falls behind its queue
//! capacity is dropped on its next receive (`RecvError::Lagged`) without
//! affecting anyone else.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::store::{ApiFamily, RequestRecord};

/// Default per-hub event queue capacity.
pub const DEFAULT_CAPACITY: usize = 256;

/// Lifecycle event type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Started,
    FirstToken,
    Progress,
    Complete,
    Error,
}

/// A lifecycle event as delivered to observers.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub request_id: String,
    pub api_type: ApiFamily,
    pub model: String,
    pub ttft: Option<f64>,
    pub tokens: u64,
    pub chars: usize,
    pub input_tokens: u64,
    pub speed: f64,
    pub duration: f64,
    pub error: Option<String>,
    pub tokens_estimated: bool,
    pub start_time: f64,
    pub end_time: Option<f64>,
}

impl MonitorEvent {
    pub fn from_record(kind: EventKind, record: &RequestRecord) -> Self {
        Self {
            kind,
            request_id: record.id.clone(),
            api_type: record.api_family,
            model: record.model.clone(),
            ttft: record.ttft().map(round3),
            tokens: record.output_tokens,
            chars: record.char_count(),
            input_tokens: record.input_tokens,
            speed: round2(record.speed()),
            duration: round3(record.duration()),
            error: record.error.clone(),
            tokens_estimated: record.tokens_estimated,
            start_time: record.start_time_epoch(),
            end_time: record.end_time_epoch(),
        }
    }
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Broadcast hub between the lifecycle store and observer connections.
#[derive(Clone)]
pub struct EventHub {
    tx: broadcast::Sender<MonitorEvent>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe a new observer. Events published after this call are
    /// delivered in publish order until the observer lags past capacity.
    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.tx.subscribe()
    }

    /// Publish an event to all current observers. Never blocks; a hub with
    /// no observers discards the event.
    pub fn publish(&self, event: MonitorEvent) {
        let _ = self.tx.send(event);
    }

    pub fn observer_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
