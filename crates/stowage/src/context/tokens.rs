//! Token estimation for message lists.
//!
//! Every estimate uses the same fixed ratio of [`CHARS_PER_TOKEN`]
//! characters per token, applied to message text, tool-call names and
//! arguments, and tool-result payloads alike. The figure is model-agnostic:
//! it drives the compression threshold, not billing.

use crate::Message;
use crate::config::CHARS_PER_TOKEN;
use serde_json::Value;

/// Characters a message contributes to the estimate.
pub fn message_chars(msg: &Message) -> usize {
    let mut chars = msg.content.as_deref().map_or(0, |c| c.chars().count());
    if let Some(ref calls) = msg.tool_calls {
        for call in calls {
            chars += call.function.name.chars().count();
            chars += call.function.arguments.chars().count();
        }
    }
    chars
}

/// Tokens for a run of characters, rounded up.
pub fn tokens_for_chars(chars: usize) -> usize {
    chars.div_ceil(CHARS_PER_TOKEN)
}

/// Tokens for a single piece of text.
pub fn estimate_text(text: &str) -> usize {
    tokens_for_chars(text.chars().count())
}

/// Tokens for a JSON payload, measured on its compact serialization.
pub fn estimate_value(value: &Value) -> usize {
    match value {
        Value::String(s) => estimate_text(s),
        other => estimate_text(&other.to_string()),
    }
}

/// Estimated tokens for a whole message list.
pub fn estimate_tokens(messages: &[Message]) -> usize {
    tokens_for_chars(messages.iter().map(message_chars).sum())
}

/// Snapshot of context usage against the compressor's limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextUsage {
    pub estimated_tokens: usize,
    pub hard_limit: usize,
    pub safety_buffer: usize,
}

impl ContextUsage {
    /// Tokens left below the hard limit (zero once exceeded).
    pub fn remaining(&self) -> usize {
        self.hard_limit.saturating_sub(self.estimated_tokens)
    }

    /// Whether the remaining headroom has shrunk to the safety buffer.
    pub fn exceeds_threshold(&self) -> bool {
        self.remaining() <= self.safety_buffer
    }

    /// Format as a short log-friendly string.
    pub fn to_log_string(&self) -> String {
        let pct = if self.hard_limit > 0 {
            self.estimated_tokens as f64 / self.hard_limit as f64 * 100.0
        } else {
            100.0
        };
        format!(
            "context: ~{} tokens ({:.0}% of {}, {} remaining)",
            self.estimated_tokens,
            pct,
            self.hard_limit,
            self.remaining(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ToolCall;
    use serde_json::json;

    #[test]
    fn rounds_up() {
        assert_eq!(estimate_text(""), 0);
        assert_eq!(estimate_text("abc"), 1);
        assert_eq!(estimate_text("abcd"), 1);
        assert_eq!(estimate_text("abcde"), 2);
    }

    #[test]
    fn counts_characters_not_bytes() {
        assert_eq!(estimate_text("éééé"), 1);
    }

    #[test]
    fn tool_calls_and_results_count() {
        let call = Message::assistant_tool_calls(vec![ToolCall::function(
            "c1",
            "grep",
            r#"{"q":"x"}"#,
        )]);
        assert_eq!(message_chars(&call), 4 + 9);

        let result = Message::tool_result("c1", "12345678");
        assert_eq!(message_chars(&result), 8);
        assert_eq!(estimate_tokens(&[call, result]), 6);
    }

    #[test]
    fn value_estimate_uses_compact_json() {
        assert_eq!(estimate_value(&json!({"a": 1})), 2);
        assert_eq!(estimate_value(&json!("abcd")), 1);
    }

    #[test]
    fn usage_threshold_boundary() {
        let usage = ContextUsage {
            estimated_tokens: 900,
            hard_limit: 1000,
            safety_buffer: 100,
        };
        assert!(usage.exceeds_threshold());
        assert!(usage.to_log_string().contains("90%"));

        let under = ContextUsage {
            estimated_tokens: 899,
            ..usage
        };
        assert!(!under.exceeds_threshold());

        let over = ContextUsage {
            estimated_tokens: 1500,
            ..usage
        };
        assert_eq!(over.remaining(), 0);
        assert!(over.exceeds_threshold());
    }
}
