//! Intercepting proxy engine: the only component that talks to the network.
//!
//! Each inbound call is registered with the lifecycle store, forwarded to the
//! configured upstream unchanged, and the response bytes are streamed back to
//! the caller while a side-channel extractor derives metrics from the same
//! bytes. Extraction never gates passthrough.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use futures::Stream;
use futures_util::StreamExt;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::AppError;
use crate::estimator;
use crate::extractor::{self, StreamExtractor, StreamFact};
use crate::server::AppState;
use crate::store::{ApiFamily, MetricsStore};

/// Machine-readable failure causes recorded on ERROR records.
pub const CAUSE_TIMEOUT: &str = "upstream_timeout";
pub const CAUSE_UNREACHABLE: &str = "upstream_unreachable";
pub const CAUSE_CLIENT_CANCELLED: &str = "client_cancelled";

/// Forward one inbound request to the family's upstream and measure it.
pub async fn forward(
    state: &AppState,
    family: ApiFamily,
    upstream_path: &str,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let body_json: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    let model = body_json
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let is_stream = body_json
        .get("stream")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let input_estimate = estimator::estimate_input_tokens(&body_json);

    let id = state.store.register(
        family,
        model.clone(),
        header_pairs(&headers),
        body_json,
        input_estimate,
    );

    info!(
        request_id = %id,
        api = %family,
        model = %model,
        stream = is_stream,
        "Proxying request"
    );

    let base_url = match family {
        ApiFamily::Anthropic => &state.config.upstream.anthropic_base_url,
        ApiFamily::OpenAi => &state.config.upstream.openai_base_url,
    };
    let url = format!("{base_url}{upstream_path}");

    let mut request = state
        .http_client
        .post(&url)
        .header(header::CONTENT_TYPE, "application/json")
        .body(body);
    request = apply_auth(
        request,
        family,
        &headers,
        state.config.upstream.api_key.as_deref(),
    );
    if family == ApiFamily::Anthropic {
        let version = headers
            .get("anthropic-version")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("2023-06-01");
        request = request.header("anthropic-version", version);
    }

    let timeout_secs = state.config.upstream.timeout_seconds;
    let response = match tokio::time::timeout(Duration::from_secs(timeout_secs), request.send())
        .await
    {
        Err(_) => {
            state.store.fail(&id, CAUSE_TIMEOUT, None);
            return Err(AppError::UpstreamTimeout(timeout_secs));
        }
        Ok(Err(e)) => {
            if e.is_timeout() {
                state.store.fail(&id, CAUSE_TIMEOUT, None);
                return Err(AppError::UpstreamTimeout(timeout_secs));
            }
            state.store.fail(&id, CAUSE_UNREACHABLE, None);
            return Err(AppError::UpstreamUnreachable(e.to_string()));
        }
        Ok(Ok(response)) => response,
    };

    let status = response.status();
    let upstream_headers = response.headers().clone();
    let response_headers = header_pairs(&upstream_headers);

    if !status.is_success() {
        // Reflect the upstream's own error shape to the caller, record the
        // terminal failure.
        let bytes = response.bytes().await.unwrap_or_default();
        warn!(
            request_id = %id,
            status = status.as_u16(),
            "Upstream returned error status"
        );
        state.store.fail(
            &id,
            &format!("upstream_status_{}", status.as_u16()),
            Some(response_headers.clone()),
        );
        return Ok(passthrough_response(
            status,
            &response_headers,
            Body::from(bytes),
        ));
    }

    // Some upstreams report token counts in headers before any body arrives.
    let (header_input, header_output) = extractor::usage_from_headers(family, &upstream_headers);
    state.store.on_usage(&id, header_input, header_output);

    if is_stream {
        let tap = TapStream::new(
            response.bytes_stream().boxed(),
            StreamExtractor::new(family),
            state.store.clone(),
            id,
            response_headers.clone(),
        );
        Ok(passthrough_response(
            status,
            &response_headers,
            Body::from_stream(tap),
        ))
    } else {
        let bytes = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                let cause = if e.is_timeout() {
                    CAUSE_TIMEOUT
                } else {
                    CAUSE_UNREACHABLE
                };
                state.store.fail(&id, cause, Some(response_headers));
                return Err(AppError::UpstreamUnreachable(e.to_string()));
            }
        };

        let facts = extractor::extract_buffered(family, &bytes, &upstream_headers);
        apply_facts(&state.store, &id, facts);
        state.store.complete(&id, Some(response_headers.clone()));

        Ok(passthrough_response(
            status,
            &response_headers,
            Body::from(bytes),
        ))
    }
}

/// Forward the client's own credential when present, else inject the
/// configured default in the family's native shape.
fn apply_auth(
    request: reqwest::RequestBuilder,
    family: ApiFamily,
    headers: &HeaderMap,
    default_key: Option<&str>,
) -> reqwest::RequestBuilder {
    if let Some(auth) = headers.get(header::AUTHORIZATION) {
        return request.header(header::AUTHORIZATION, auth);
    }
    if let Some(key) = headers.get("x-api-key") {
        return request.header("x-api-key", key);
    }
    let Some(key) = default_key else {
        return request;
    };
    match family {
        ApiFamily::Anthropic => request.header("x-api-key", key),
        ApiFamily::OpenAi => {
            if key.starts_with("Bearer ") {
                request.header(header::AUTHORIZATION, key)
            } else {
                request.header(header::AUTHORIZATION, format!("Bearer {key}"))
            }
        }
    }
}

/// Drive store transitions from extracted facts. Returns true once the
/// stream logically ended.
fn apply_facts(store: &MetricsStore, id: &str, facts: Vec<StreamFact>) -> bool {
    let mut ended = false;
    for fact in facts {
        match fact {
            StreamFact::FirstByte => store.on_first_byte(id),
            StreamFact::TextDelta(text) => store.on_text(id, &text),
            StreamFact::UsageReported {
                input_tokens,
                output_tokens,
            } => store.on_usage(id, input_tokens, output_tokens),
            StreamFact::StreamEnded { finish_reason } => {
                debug!(request_id = %id, ?finish_reason, "Stream ended");
                ended = true;
            }
            StreamFact::ParseSkipped => {
                debug!(request_id = %id, "Unparsed frame, passthrough continues");
            }
        }
    }
    ended
}

fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).to_string(),
            )
        })
        .collect()
}

fn passthrough_response(status: StatusCode, headers: &[(String, String)], body: Body) -> Response {
    let mut builder = Response::builder().status(status);
    for (name, value) in headers {
        if is_hop_by_hop(name) {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder.body(body).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to rebuild upstream response");
        Response::new(Body::empty())
    })
}

fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection" | "keep-alive" | "transfer-encoding" | "content-length"
    )
}

type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>;

/// Streams upstream bytes to the caller unchanged while feeding the same
/// bytes to the extractor and lifecycle store. Dropped before the upstream
/// finished means the caller went away: the record fails as cancelled and
/// the upstream read is released with it.
struct TapStream {
    inner: ByteStream,
    extractor: StreamExtractor,
    store: Arc<MetricsStore>,
    id: String,
    response_headers: Vec<(String, String)>,
    finished: bool,
}

impl TapStream {
    fn new(
        inner: ByteStream,
        extractor: StreamExtractor,
        store: Arc<MetricsStore>,
        id: String,
        response_headers: Vec<(String, String)>,
    ) -> Self {
        Self {
            inner,
            extractor,
            store,
            id,
            response_headers,
            finished: false,
        }
    }
}

impl Stream for TapStream {
    type Item = Result<Bytes, reqwest::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.as_mut().get_mut();
        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                let facts = this.extractor.feed(&chunk);
                if apply_facts(&this.store, &this.id, facts) && !this.finished {
                    this.finished = true;
                    this.store
                        .complete(&this.id, Some(this.response_headers.clone()));
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                if !this.finished {
                    this.finished = true;
                    let cause = if e.is_timeout() {
                        CAUSE_TIMEOUT
                    } else {
                        CAUSE_UNREACHABLE
                    };
                    this.store
                        .fail(&this.id, cause, Some(this.response_headers.clone()));
                }
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                if !this.finished {
                    this.finished = true;
                    let facts = this.extractor.finish();
                    apply_facts(&this.store, &this.id, facts);
                    this.store
                        .complete(&this.id, Some(this.response_headers.clone()));
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for TapStream {
    fn drop(&mut self) {
        if !self.finished {
            debug!(request_id = %self.id, "Client disconnected before upstream finished");
            self.store.fail(&self.id, CAUSE_CLIENT_CANCELLED, None);
        }
    }
}
