//! Fallback token estimation for responses that never report usage.
//!
//! The heuristic is deliberately simple and documented as approximate: CJK
//! characters count roughly one token each, ASCII words about 0.75 tokens,
//! and everything else about one token per three characters. Counts produced
//! here stay flagged as estimated until an upstream-reported usage value
//! replaces them.

use serde_json::Value;

/// Estimate the token count of a piece of text.
///
/// Deterministic; returns 0 for empty text and at least 1 for non-empty text.
pub fn estimate_tokens(text: &str) -> u64 {
    if text.is_empty() {
        return 0;
    }

    let mut cjk = 0u64;
    let mut words = 0u64;
    let mut word_chars = 0u64;
    let mut in_word = false;

    for ch in text.chars() {
        if ('\u{4e00}'..='\u{9fff}').contains(&ch) {
            cjk += 1;
            in_word = false;
        } else if ch.is_ascii_alphabetic() {
            if !in_word {
                words += 1;
                in_word = true;
            }
            word_chars += 1;
        } else {
            in_word = false;
        }
    }

    let total = text.chars().count() as u64;
    // Remaining characters after CJK and word characters, ~3 chars per token.
    let other = total.saturating_sub(cjk).saturating_sub(word_chars);
    let estimate = cjk + words * 3 / 4 + other / 3;

    estimate.max(1)
}

/// Estimate the input token count of a request body.
///
/// Understands both the chat `messages` shape (string content or content
/// blocks) and the legacy `prompt` shape. Image blocks count as a fixed
/// placeholder since their token cost is not derivable from text.
pub fn estimate_input_tokens(body: &Value) -> u64 {
    let mut text = String::new();

    if let Some(messages) = body.get("messages").and_then(Value::as_array) {
        for msg in messages {
            let role = msg.get("role").and_then(Value::as_str).unwrap_or("");
            match msg.get("content") {
                Some(Value::String(content)) => {
                    text.push_str(role);
                    text.push_str(": ");
                    text.push_str(content);
                    text.push('\n');
                }
                Some(Value::Array(blocks)) => {
                    for block in blocks {
                        match block.get("type").and_then(Value::as_str) {
                            Some("text") => {
                                if let Some(t) = block.get("text").and_then(Value::as_str) {
                                    text.push_str(t);
                                }
                            }
                            Some("image") | Some("image_url") => text.push_str("[image] "),
                            _ => {}
                        }
                    }
                }
                _ => {}
            }
        }
    } else if let Some(prompt) = body.get("prompt") {
        match prompt {
            Value::String(p) => text.push_str(p),
            other => text.push_str(&other.to_string()),
        }
    }

    if text.is_empty() {
        0
    } else {
        estimate_tokens(&text)
    }
}
