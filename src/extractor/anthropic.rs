//! Fact extraction for Anthropic-style responses.
//!
//! Streaming responses are a sequence of named SSE events: `message_start`
//! may carry initial usage, `content_block_delta` carries text deltas, and a
//! final `message_delta`/`message_stop` pair carries the authoritative usage
//! and stop reason.

use axum::http::HeaderMap;

use super::{header_u64, StreamFact};
use crate::models::anthropic::{MessagesResponse, StreamEvent};

#[derive(Default)]
pub(super) struct Parser {
    finish_reason: Option<String>,
}

impl Parser {
    pub(super) fn parse_line(&mut self, line: &str, facts: &mut Vec<StreamFact>) {
        // SSE framing: blank separators, `event:` names and comments are
        // known lines that carry no facts of their own.
        if line.is_empty() || line.starts_with("event:") || line.starts_with(':') {
            return;
        }
        let Some(data) = line.strip_prefix("data:") else {
            facts.push(StreamFact::ParseSkipped);
            return;
        };
        let data = data.trim();

        let event: StreamEvent = match serde_json::from_str(data) {
            Ok(event) => event,
            Err(_) => {
                facts.push(StreamFact::ParseSkipped);
                return;
            }
        };

        match event.event_type.as_str() {
            "message_start" => {
                // The output count here is a placeholder (usually 1); only
                // the input count is trustworthy this early in the stream.
                if let Some(input) = event.message.and_then(|m| m.usage).and_then(|u| u.input_tokens)
                {
                    facts.push(StreamFact::UsageReported {
                        input_tokens: Some(input),
                        output_tokens: None,
                    });
                }
            }
            "content_block_delta" => {
                if let Some(delta) = event.delta {
                    if delta.delta_type == "text_delta" {
                        if let Some(text) = delta.text {
                            if !text.is_empty() {
                                facts.push(StreamFact::TextDelta(text));
                            }
                        }
                    }
                }
            }
            "message_delta" => {
                if let Some(reason) = event.delta.and_then(|d| d.stop_reason) {
                    self.finish_reason = Some(reason);
                }
                if let Some(usage) = event.usage {
                    facts.push(StreamFact::UsageReported {
                        input_tokens: usage.input_tokens,
                        output_tokens: usage.output_tokens,
                    });
                }
            }
            "message_stop" => {
                if let Some(usage) = event.usage {
                    facts.push(StreamFact::UsageReported {
                        input_tokens: usage.input_tokens,
                        output_tokens: usage.output_tokens,
                    });
                }
                facts.push(StreamFact::StreamEnded {
                    finish_reason: self.finish_reason.take(),
                });
            }
            // ping, content_block_start, content_block_stop
            _ => {}
        }
    }
}

pub(super) fn extract_buffered(body: &[u8], headers: &HeaderMap) -> Vec<StreamFact> {
    let mut facts = vec![StreamFact::FirstByte];

    match serde_json::from_slice::<MessagesResponse>(body) {
        Ok(response) => {
            let text: String = response
                .content
                .iter()
                .filter_map(|block| block.text.as_deref())
                .collect();
            if !text.is_empty() {
                facts.push(StreamFact::TextDelta(text));
            }

            let (header_input, header_output) = header_usage(headers);
            let input = response
                .usage
                .as_ref()
                .and_then(|u| u.input_tokens)
                .or(header_input);
            let output = response
                .usage
                .as_ref()
                .and_then(|u| u.output_tokens)
                .or(header_output);
            if input.is_some() || output.is_some() {
                facts.push(StreamFact::UsageReported {
                    input_tokens: input,
                    output_tokens: output,
                });
            }

            facts.push(StreamFact::StreamEnded {
                finish_reason: response.stop_reason,
            });
        }
        Err(_) => {
            facts.push(StreamFact::ParseSkipped);
            facts.push(StreamFact::StreamEnded {
                finish_reason: None,
            });
        }
    }
    facts
}

pub(super) fn header_usage(headers: &HeaderMap) -> (Option<u64>, Option<u64>) {
    (
        header_u64(headers, "anthropic-input-tokens"),
        header_u64(headers, "anthropic-output-tokens"),
    )
}

#[cfg(test)]
mod tests {
    use super::super::{StreamExtractor, StreamFact};
    use super::*;
    use crate::store::ApiFamily;

    fn feed_lines(lines: &[&str]) -> Vec<StreamFact> {
        let mut ex = StreamExtractor::new(ApiFamily::Anthropic);
        let mut facts = Vec::new();
        for line in lines {
            facts.extend(ex.feed(format!("{line}\n").as_bytes()));
        }
        facts.extend(ex.finish());
        facts
    }

    #[test]
    fn test_content_deltas_in_order() {
        let facts = feed_lines(&[
            "event: content_block_delta",
            r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hel"}}"#,
            "",
            "event: content_block_delta",
            r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"lo"}}"#,
        ]);

        let text: String = facts
            .iter()
            .filter_map(|f| match f {
                StreamFact::TextDelta(t) => Some(t.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "Hello");
    }

    #[test]
    fn test_message_start_carries_input_usage() {
        let facts = feed_lines(&[
            r#"data: {"type":"message_start","message":{"id":"msg_1","model":"claude-3-5-sonnet","usage":{"input_tokens":17}}}"#,
        ]);
        assert!(facts.contains(&StreamFact::UsageReported {
            input_tokens: Some(17),
            output_tokens: None,
        }));
    }

    #[test]
    fn test_message_start_output_placeholder_is_dropped() {
        let facts = feed_lines(&[
            r#"data: {"type":"message_start","message":{"id":"msg_1","model":"claude-3-5-sonnet","usage":{"input_tokens":25,"output_tokens":1}}}"#,
        ]);
        assert!(facts.contains(&StreamFact::UsageReported {
            input_tokens: Some(25),
            output_tokens: None,
        }));
        assert!(!facts.iter().any(|f| matches!(
            f,
            StreamFact::UsageReported {
                output_tokens: Some(_),
                ..
            }
        )));
    }

    #[test]
    fn test_message_delta_then_stop() {
        let facts = feed_lines(&[
            r#"data: {"type":"message_delta","delta":{"type":"message_delta","stop_reason":"end_turn"},"usage":{"output_tokens":50}}"#,
            r#"data: {"type":"message_stop"}"#,
        ]);

        assert!(facts.contains(&StreamFact::UsageReported {
            input_tokens: None,
            output_tokens: Some(50),
        }));
        assert!(facts.contains(&StreamFact::StreamEnded {
            finish_reason: Some("end_turn".to_string()),
        }));
    }

    #[test]
    fn test_malformed_frame_is_skipped_not_fatal() {
        let facts = feed_lines(&[
            "data: {not json",
            r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"ok"}}"#,
        ]);
        assert!(facts.contains(&StreamFact::ParseSkipped));
        assert!(facts.contains(&StreamFact::TextDelta("ok".to_string())));
    }

    #[test]
    fn test_ping_event_produces_no_fact() {
        let facts = feed_lines(&["event: ping", r#"data: {"type":"ping"}"#]);
        // FirstByte only.
        assert_eq!(facts, vec![StreamFact::FirstByte]);
    }

    #[test]
    fn test_buffered_response() {
        let body = r#"{
            "id": "msg_1",
            "model": "claude-3-5-sonnet",
            "content": [{"type":"text","text":"Hello there"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 9, "output_tokens": 4}
        }"#;
        let facts = extract_buffered(body.as_bytes(), &HeaderMap::new());

        assert_eq!(facts[0], StreamFact::FirstByte);
        assert!(facts.contains(&StreamFact::TextDelta("Hello there".to_string())));
        assert!(facts.contains(&StreamFact::UsageReported {
            input_tokens: Some(9),
            output_tokens: Some(4),
        }));
        assert!(facts.contains(&StreamFact::StreamEnded {
            finish_reason: Some("end_turn".to_string()),
        }));
    }

    #[test]
    fn test_buffered_usage_falls_back_to_headers() {
        let body = r#"{"id":"msg_1","model":"m","content":[{"type":"text","text":"x"}]}"#;
        let mut headers = HeaderMap::new();
        headers.insert("anthropic-input-tokens", "11".parse().unwrap());
        headers.insert("anthropic-output-tokens", "3".parse().unwrap());

        let facts = extract_buffered(body.as_bytes(), &headers);
        assert!(facts.contains(&StreamFact::UsageReported {
            input_tokens: Some(11),
            output_tokens: Some(3),
        }));
    }

    #[test]
    fn test_buffered_unparseable_body() {
        let facts = extract_buffered(b"<html>bad gateway</html>", &HeaderMap::new());
        assert_eq!(facts[0], StreamFact::FirstByte);
        assert!(facts.contains(&StreamFact::ParseSkipped));
        assert!(facts.contains(&StreamFact::StreamEnded {
            finish_reason: None,
        }));
    }
}
