//! Lifecycle store: the authoritative record of in-flight and completed
//! requests.
//!
//! All mutation goes through short mutex-guarded critical sections; the
//! resulting lifecycle event is broadcast to observers strictly after the
//! lock is released, so a slow observer can never stall a request task.
//! The proxy engine is the sole writer per record id, which gives each id a
//! single total order of transitions.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::Value;

use crate::events::{EventHub, EventKind, MonitorEvent};

/// Which upstream wire-format dialect a request was proxied under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiFamily {
    Anthropic,
    #[serde(rename = "openai")]
    OpenAi,
}

impl ApiFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiFamily::Anthropic => "anthropic",
            ApiFamily::OpenAi => "openai",
        }
    }
}

impl std::fmt::Display for ApiFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request lifecycle state. Terminal states are entered exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Started,
    Streaming,
    Complete,
    Error,
}

/// One proxied call, from registration to completion or failure.
#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub id: String,
    pub api_family: ApiFamily,
    pub model: String,
    pub status: RequestStatus,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// True until an upstream-reported count replaces the heuristic estimate.
    pub tokens_estimated: bool,
    pub request_headers: Vec<(String, String)>,
    pub response_headers: Option<Vec<(String, String)>>,
    pub request_body: Value,
    pub response_text: String,
    pub error: Option<String>,
    started_epoch: f64,
    start: Instant,
    first_token: Option<Instant>,
    end: Option<Instant>,
}

impl RequestRecord {
    fn new(
        id: String,
        api_family: ApiFamily,
        model: String,
        request_headers: Vec<(String, String)>,
        request_body: Value,
        input_estimate: u64,
    ) -> Self {
        let started_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        Self {
            id,
            api_family,
            model,
            status: RequestStatus::Started,
            input_tokens: input_estimate,
            output_tokens: 0,
            tokens_estimated: true,
            request_headers,
            response_headers: None,
            request_body,
            response_text: String::new(),
            error: None,
            started_epoch,
            start: Instant::now(),
            first_token: None,
            end: None,
        }
    }

    /// Time to first token in seconds, absent if no content ever arrived.
    pub fn ttft(&self) -> Option<f64> {
        self.first_token.map(|t| (t - self.start).as_secs_f64())
    }

    /// Elapsed time in seconds; still ticking for in-flight records.
    pub fn duration(&self) -> f64 {
        let end = self.end.unwrap_or_else(Instant::now);
        (end - self.start).as_secs_f64()
    }

    /// Output tokens per second; 0 while the duration is 0.
    pub fn speed(&self) -> f64 {
        let duration = self.duration();
        if duration > 0.0 {
            self.output_tokens as f64 / duration
        } else {
            0.0
        }
    }

    pub fn char_count(&self) -> usize {
        self.response_text.chars().count()
    }

    pub fn start_time_epoch(&self) -> f64 {
        self.started_epoch
    }

    pub fn end_time_epoch(&self) -> Option<f64> {
        self.end
            .map(|end| self.started_epoch + (end - self.start).as_secs_f64())
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, RequestStatus::Complete | RequestStatus::Error)
    }

    fn detail(&self) -> RequestDetail {
        RequestDetail {
            request_id: self.id.clone(),
            api_type: self.api_family,
            model: self.model.clone(),
            status: self.status,
            start_time: self.started_epoch,
            end_time: self.end_time_epoch(),
            ttft: self.ttft(),
            duration: self.duration(),
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            tokens_estimated: self.tokens_estimated,
            speed: self.speed(),
            request_headers: self.request_headers.clone(),
            response_headers: self.response_headers.clone(),
            request_body: self.request_body.clone(),
            response_text: self.response_text.clone(),
            error: self.error.clone(),
        }
    }

    #[cfg(test)]
    pub(crate) fn new_for_test(id: &str, api_family: ApiFamily) -> Self {
        Self::new(
            id.to_string(),
            api_family,
            "test-model".to_string(),
            Vec::new(),
            Value::Null,
            0,
        )
    }
}

/// Full record detail for the query-by-id surface.
#[derive(Debug, Clone, Serialize)]
pub struct RequestDetail {
    pub request_id: String,
    pub api_type: ApiFamily,
    pub model: String,
    pub status: RequestStatus,
    pub start_time: f64,
    pub end_time: Option<f64>,
    pub ttft: Option<f64>,
    pub duration: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub tokens_estimated: bool,
    pub speed: f64,
    pub request_headers: Vec<(String, String)>,
    pub response_headers: Option<Vec<(String, String)>>,
    pub request_body: Value,
    pub response_text: String,
    pub error: Option<String>,
}

/// Aggregate statistics over completed history.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub total_requests: usize,
    pub avg_ttft: f64,
    pub avg_speed: f64,
}

struct StoreInner {
    active: HashMap<String, RequestRecord>,
    /// Newest-first, capacity-bounded.
    history: VecDeque<RequestRecord>,
}

/// Concurrency-safe store of request lifecycle state.
pub struct MetricsStore {
    inner: Mutex<StoreInner>,
    hub: EventHub,
    max_history: usize,
}

impl MetricsStore {
    pub fn new(max_history: usize, hub: EventHub) -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                active: HashMap::new(),
                history: VecDeque::new(),
            }),
            hub,
            max_history,
        }
    }

    /// Create a record in STARTED state and return its id.
    pub fn register(
        &self,
        api_family: ApiFamily,
        model: String,
        request_headers: Vec<(String, String)>,
        request_body: Value,
        input_estimate: u64,
    ) -> String {
        let (id, event) = {
            let mut inner = self.inner.lock().unwrap();
            let id = loop {
                let candidate = short_id();
                if !inner.active.contains_key(&candidate)
                    && !inner.history.iter().any(|r| r.id == candidate)
                {
                    break candidate;
                }
            };
            let record = RequestRecord::new(
                id.clone(),
                api_family,
                model,
                request_headers,
                request_body,
                input_estimate,
            );
            let event = MonitorEvent::from_record(EventKind::Started, &record);
            inner.active.insert(id.clone(), record);
            (id, event)
        };
        self.hub.publish(event);
        id
    }

    /// STARTED → STREAMING on the first response content. Idempotent.
    pub fn on_first_byte(&self, id: &str) {
        let event = {
            let mut inner = self.inner.lock().unwrap();
            match inner.active.get_mut(id) {
                Some(record) if record.status == RequestStatus::Started => {
                    record.status = RequestStatus::Streaming;
                    record.first_token.get_or_insert_with(Instant::now);
                    Some(MonitorEvent::from_record(EventKind::FirstToken, record))
                }
                _ => None,
            }
        };
        if let Some(event) = event {
            self.hub.publish(event);
        }
    }

    /// Append output text; refreshes the estimated output count while no
    /// authoritative count has been reported. Silently ignores terminal or
    /// unknown ids (a final fact can race a cancellation).
    pub fn on_text(&self, id: &str, delta: &str) {
        let event = {
            let mut inner = self.inner.lock().unwrap();
            match inner.active.get_mut(id) {
                Some(record) => {
                    record.response_text.push_str(delta);
                    if record.tokens_estimated {
                        record.output_tokens = crate::estimator::estimate_tokens(&record.response_text);
                    }
                    Some(MonitorEvent::from_record(EventKind::Progress, record))
                }
                None => None,
            }
        };
        if let Some(event) = event {
            self.hub.publish(event);
        }
    }

    /// Record an upstream-reported token count. The estimated flag tracks
    /// output authority: an input-only report (message_start, usage headers)
    /// leaves output estimation running, while a reported output count is a
    /// one-way transition that estimation never overwrites again.
    pub fn on_usage(&self, id: &str, input_tokens: Option<u64>, output_tokens: Option<u64>) {
        if input_tokens.is_none() && output_tokens.is_none() {
            return;
        }
        let event = {
            let mut inner = self.inner.lock().unwrap();
            match inner.active.get_mut(id) {
                Some(record) => {
                    if let Some(input) = input_tokens {
                        record.input_tokens = input;
                    }
                    if let Some(output) = output_tokens {
                        record.output_tokens = output;
                        record.tokens_estimated = false;
                    }
                    Some(MonitorEvent::from_record(EventKind::Progress, record))
                }
                None => None,
            }
        };
        if let Some(event) = event {
            self.hub.publish(event);
        }
    }

    /// Finalize a record as COMPLETE and move it into history.
    pub fn complete(
        &self,
        id: &str,
        response_headers: Option<Vec<(String, String)>>,
    ) -> Option<RequestRecord> {
        self.finalize(id, RequestStatus::Complete, None, response_headers)
    }

    /// Finalize a record as ERROR with a machine-readable cause.
    pub fn fail(
        &self,
        id: &str,
        cause: &str,
        response_headers: Option<Vec<(String, String)>>,
    ) -> Option<RequestRecord> {
        self.finalize(
            id,
            RequestStatus::Error,
            Some(cause.to_string()),
            response_headers,
        )
    }

    fn finalize(
        &self,
        id: &str,
        status: RequestStatus,
        error: Option<String>,
        response_headers: Option<Vec<(String, String)>>,
    ) -> Option<RequestRecord> {
        let (snapshot, event) = {
            let mut inner = self.inner.lock().unwrap();
            let mut record = inner.active.remove(id)?;
            record.status = status;
            record.error = error;
            record.end = Some(Instant::now());
            if response_headers.is_some() {
                record.response_headers = response_headers;
            }

            let kind = match status {
                RequestStatus::Error => EventKind::Error,
                _ => EventKind::Complete,
            };
            let event = MonitorEvent::from_record(kind, &record);
            let snapshot = record.clone();

            inner.history.push_front(record);
            while inner.history.len() > self.max_history {
                inner.history.pop_back();
            }
            (snapshot, event)
        };
        self.hub.publish(event);
        Some(snapshot)
    }

    /// Look up a record in the active set, then history.
    pub fn get(&self, id: &str) -> Option<RequestRecord> {
        let inner = self.inner.lock().unwrap();
        inner
            .active
            .get(id)
            .cloned()
            .or_else(|| inner.history.iter().find(|r| r.id == id).cloned())
    }

    /// Full detail of a record for the query surface.
    pub fn get_detail(&self, id: &str) -> Option<RequestDetail> {
        self.get(id).map(|record| record.detail())
    }

    /// Empty the history list, leaving active records untouched.
    pub fn clear_history(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let count = inner.history.len();
        inner.history.clear();
        count
    }

    /// Aggregate over history only. TTFT averages the records that measured
    /// one; speed averages all completed records.
    pub fn stats(&self) -> StoreStats {
        let inner = self.inner.lock().unwrap();
        let total = inner.history.len();
        if total == 0 {
            return StoreStats {
                total_requests: 0,
                avg_ttft: 0.0,
                avg_speed: 0.0,
            };
        }

        let ttfts: Vec<f64> = inner.history.iter().filter_map(|r| r.ttft()).collect();
        let avg_ttft = if ttfts.is_empty() {
            0.0
        } else {
            ttfts.iter().sum::<f64>() / ttfts.len() as f64
        };
        let avg_speed = inner.history.iter().map(|r| r.speed()).sum::<f64>() / total as f64;

        StoreStats {
            total_requests: total,
            avg_ttft: (avg_ttft * 1000.0).round() / 1000.0,
            avg_speed: (avg_speed * 100.0).round() / 100.0,
        }
    }

    /// Snapshot for a freshly connected observer: history newest-first as
    /// terminal events, then in-flight records as progress events.
    pub fn snapshot_events(&self) -> Vec<MonitorEvent> {
        let inner = self.inner.lock().unwrap();
        let mut events: Vec<MonitorEvent> = inner
            .history
            .iter()
            .map(|record| {
                let kind = match record.status {
                    RequestStatus::Error => EventKind::Error,
                    _ => EventKind::Complete,
                };
                MonitorEvent::from_record(kind, record)
            })
            .collect();
        events.extend(
            inner
                .active
                .values()
                .map(|record| MonitorEvent::from_record(EventKind::Progress, record)),
        );
        events
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().unwrap().active.len()
    }

    pub fn history_count(&self) -> usize {
        self.inner.lock().unwrap().history.len()
    }
}

/// Short uppercase hex id, unique across active + history (enforced by the
/// caller under the store lock).
fn short_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..8].to_uppercase()
}
