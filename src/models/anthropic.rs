use serde::{Deserialize, Serialize};

/// Token usage information
///
/// Streaming `message_delta` events may carry only `output_tokens`, so both
/// fields are optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Input tokens
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    /// Output tokens
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
}

/// Streaming event from Anthropic SSE
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEvent {
    /// Event type
    #[serde(rename = "type")]
    pub event_type: String,
    /// Message data (for message_start)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<MessageData>,
    /// Content block index (for content_block_start, content_block_delta)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    /// Delta (for content_block_delta, message_delta)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta: Option<Delta>,
    /// Usage (for message_delta, message_stop)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

/// Message data in streaming events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageData {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

/// Delta for streaming updates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delta {
    /// Delta type (e.g., "text_delta")
    #[serde(rename = "type")]
    pub delta_type: String,
    /// Text content (for text deltas)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Stop reason (for message_delta)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
}

/// Anthropic Messages API Response (non-streaming)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesResponse {
    /// Unique identifier
    pub id: String,
    /// Model used
    pub model: String,
    /// Content blocks
    pub content: Vec<ContentBlock>,
    /// Stop reason
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    /// Token usage
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

/// Content block in a non-streaming response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentBlock {
    /// Block type (e.g., "text", "tool_use")
    #[serde(rename = "type")]
    pub block_type: String,
    /// Text content (for text blocks)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}
