//! Fact extraction for OpenAI-style responses.
//!
//! Streaming responses are newline-delimited `data: <json>` frames; each
//! frame's first choice delta carries output text, a literal `data: [DONE]`
//! terminates the stream, and a trailing usage object (when the provider
//! includes one) carries the authoritative counts.

use axum::http::HeaderMap;

use super::{header_u64, StreamFact};
use crate::models::openai::{ChatCompletionChunk, ChatCompletionResponse};

#[derive(Default)]
pub(super) struct Parser {
    finish_reason: Option<String>,
}

impl Parser {
    pub(super) fn parse_line(&mut self, line: &str, facts: &mut Vec<StreamFact>) {
        if line.is_empty() || line.starts_with(':') {
            return;
        }
        let Some(data) = line.strip_prefix("data:") else {
            facts.push(StreamFact::ParseSkipped);
            return;
        };
        let data = data.trim();

        if data == "[DONE]" {
            facts.push(StreamFact::StreamEnded {
                finish_reason: self.finish_reason.take(),
            });
            return;
        }

        let chunk: ChatCompletionChunk = match serde_json::from_str(data) {
            Ok(chunk) => chunk,
            Err(_) => {
                facts.push(StreamFact::ParseSkipped);
                return;
            }
        };

        if let Some(choice) = chunk.choices.first() {
            if let Some(content) = &choice.delta.content {
                if !content.is_empty() {
                    facts.push(StreamFact::TextDelta(content.clone()));
                }
            }
            if let Some(reason) = &choice.finish_reason {
                self.finish_reason = Some(reason.clone());
            }
        }

        if let Some(usage) = chunk.usage {
            facts.push(StreamFact::UsageReported {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
            });
        }
    }
}

pub(super) fn extract_buffered(body: &[u8], headers: &HeaderMap) -> Vec<StreamFact> {
    let mut facts = vec![StreamFact::FirstByte];

    match serde_json::from_slice::<ChatCompletionResponse>(body) {
        Ok(response) => {
            let text = response
                .choices
                .first()
                .and_then(|c| c.message.content.clone())
                .unwrap_or_default();
            if !text.is_empty() {
                facts.push(StreamFact::TextDelta(text));
            }

            let (header_input, header_output) = header_usage(headers);
            let input = response
                .usage
                .as_ref()
                .and_then(|u| u.prompt_tokens)
                .or(header_input);
            let output = response
                .usage
                .as_ref()
                .and_then(|u| u.completion_tokens)
                .or(header_output);
            if input.is_some() || output.is_some() {
                facts.push(StreamFact::UsageReported {
                    input_tokens: input,
                    output_tokens: output,
                });
            }

            facts.push(StreamFact::StreamEnded {
                finish_reason: response
                    .choices
                    .first()
                    .and_then(|c| c.finish_reason.clone()),
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
    // OpenAI itself does not report usage in headers; some proxies do.
    (
        header_u64(headers, "x-prompt-tokens"),
        header_u64(headers, "x-completion-tokens"),
    )
}

#[cfg(test)]
mod tests {
    use super::super::{StreamExtractor, StreamFact};
    use super::*;
    use crate::store::ApiFamily;

    fn feed_lines(lines: &[&str]) -> Vec<StreamFact> {
        let mut ex = StreamExtractor::new(ApiFamily::OpenAi);
        let mut facts = Vec::new();
        for line in lines {
            facts.extend(ex.feed(format!("{line}\n").as_bytes()));
        }
        facts.extend(ex.finish());
        facts
    }

    #[test]
    fn test_delta_content_concatenates() {
        let facts = feed_lines(&[
            r#"data: {"choices":[{"index":0,"delta":{"role":"assistant","content":"Hel"}}]}"#,
            "",
            r#"data: {"choices":[{"index":0,"delta":{"content":"lo"}}]}"#,
            "data: [DONE]",
        ]);

        let text: String = facts
            .iter()
            .filter_map(|f| match f {
                StreamFact::TextDelta(t) => Some(t.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "Hello");
        assert!(facts.contains(&StreamFact::StreamEnded {
            finish_reason: None,
        }));
    }

    #[test]
    fn test_done_carries_finish_reason_from_last_chunk() {
        let facts = feed_lines(&[
            r#"data: {"choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}"#,
            "data: [DONE]",
        ]);
        assert!(facts.contains(&StreamFact::StreamEnded {
            finish_reason: Some("stop".to_string()),
        }));
    }

    #[test]
    fn test_trailing_usage_chunk() {
        let facts = feed_lines(&[
            r#"data: {"choices":[{"index":0,"delta":{"content":"hi"}}]}"#,
            r#"data: {"choices":[],"usage":{"prompt_tokens":12,"completion_tokens":34,"total_tokens":46}}"#,
            "data: [DONE]",
        ]);
        assert!(facts.contains(&StreamFact::UsageReported {
            input_tokens: Some(12),
            output_tokens: Some(34),
        }));
    }

    #[test]
    fn test_malformed_frame_is_skipped() {
        let facts = feed_lines(&["data: oops", "data: [DONE]"]);
        assert!(facts.contains(&StreamFact::ParseSkipped));
        assert!(matches!(
            facts.last(),
            Some(StreamFact::StreamEnded { .. })
        ));
    }

    #[test]
    fn test_buffered_response_with_usage() {
        let body = r#"{
            "id": "chatcmpl-1",
            "model": "gpt-4o",
            "choices": [{"index":0,"message":{"role":"assistant","content":"Hi"},"finish_reason":"stop"}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 34, "total_tokens": 46}
        }"#;
        let facts = extract_buffered(body.as_bytes(), &HeaderMap::new());

        assert_eq!(facts[0], StreamFact::FirstByte);
        assert!(facts.contains(&StreamFact::TextDelta("Hi".to_string())));
        assert!(facts.contains(&StreamFact::UsageReported {
            input_tokens: Some(12),
            output_tokens: Some(34),
        }));
        assert!(facts.contains(&StreamFact::StreamEnded {
            finish_reason: Some("stop".to_string()),
        }));
    }

    #[test]
    fn test_buffered_usage_from_proxy_headers() {
        let body = r#"{"id":"c1","model":"m","choices":[{"index":0,"message":{"role":"assistant","content":"x"}}]}"#;
        let mut headers = HeaderMap::new();
        headers.insert("x-prompt-tokens", "7".parse().unwrap());
        headers.insert("x-completion-tokens", "2".parse().unwrap());

        let facts = extract_buffered(body.as_bytes(), &headers);
        assert!(facts.contains(&StreamFact::UsageReported {
            input_tokens: Some(7),
            output_tokens: Some(2),
        }));
    }
}
