//! Metrics extraction from provider response streams.
//!
//! The extractor consumes the same bytes that are forwarded to the caller and
//! turns them into a small closed set of facts. It never modifies the bytes
//! and never fails: a frame it cannot interpret yields [`StreamFact::ParseSkipped`]
//! and passthrough continues.

pub mod anthropic;
pub mod openai;

use axum::http::HeaderMap;

use crate::store::ApiFamily;

/// A semantic fact derived from response bytes.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFact {
    /// First response content arrived. Emitted exactly once per stream.
    FirstByte,
    /// A fragment of generated output text, in arrival order.
    TextDelta(String),
    /// An authoritative token count reported by the provider.
    UsageReported {
        input_tokens: Option<u64>,
        output_tokens: Option<u64>,
    },
    /// Logical end of generation.
    StreamEnded { finish_reason: Option<String> },
    /// A frame that could not be interpreted. Never fatal.
    ParseSkipped,
}

enum FamilyParser {
    Anthropic(anthropic::Parser),
    OpenAi(openai::Parser),
}

impl FamilyParser {
    fn parse_line(&mut self, line: &str, facts: &mut Vec<StreamFact>) {
        match self {
            FamilyParser::Anthropic(p) => p.parse_line(line, facts),
            FamilyParser::OpenAi(p) => p.parse_line(line, facts),
        }
    }
}

/// Incremental extractor over a streaming response.
///
/// Chunks may split SSE frames at arbitrary byte boundaries; a trailing
/// partial line is buffered and carried into the next `feed` call.
pub struct StreamExtractor {
    parser: FamilyParser,
    buffer: String,
    saw_first_byte: bool,
}

impl StreamExtractor {
    pub fn new(family: ApiFamily) -> Self {
        let parser = match family {
            ApiFamily::Anthropic => FamilyParser::Anthropic(anthropic::Parser::default()),
            ApiFamily::OpenAi => FamilyParser::OpenAi(openai::Parser::default()),
        };
        Self {
            parser,
            buffer: String::new(),
            saw_first_byte: false,
        }
    }

    /// Feed one chunk of response bytes, returning the facts it produced.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamFact> {
        let mut facts = Vec::new();
        if chunk.is_empty() {
            return facts;
        }
        if !self.saw_first_byte {
            self.saw_first_byte = true;
            facts.push(StreamFact::FirstByte);
        }

        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            self.parser
                .parse_line(line.trim_end_matches(['\n', '\r']), &mut facts);
        }
        facts
    }

    /// Flush any buffered partial line at end of stream.
    pub fn finish(&mut self) -> Vec<StreamFact> {
        let mut facts = Vec::new();
        if !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            self.parser
                .parse_line(line.trim_end_matches('\r'), &mut facts);
        }
        facts
    }
}

/// Extract facts from a complete non-streaming response body.
///
/// Still yields `FirstByte` (the body arrived), a `TextDelta` equivalent to
/// the full output, `UsageReported` when a usage object or usage response
/// header is present, and `StreamEnded`.
pub fn extract_buffered(family: ApiFamily, body: &[u8], headers: &HeaderMap) -> Vec<StreamFact> {
    match family {
        ApiFamily::Anthropic => anthropic::extract_buffered(body, headers),
        ApiFamily::OpenAi => openai::extract_buffered(body, headers),
    }
}

/// Parse provider usage headers, if any.
///
/// Some upstreams (and proxies in front of them) report token counts in
/// response headers before the body arrives.
pub fn usage_from_headers(family: ApiFamily, headers: &HeaderMap) -> (Option<u64>, Option<u64>) {
    match family {
        ApiFamily::Anthropic => anthropic::header_usage(headers),
        ApiFamily::OpenAi => openai::header_usage(headers),
    }
}

pub(crate) fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|&v| v > 0)
}
