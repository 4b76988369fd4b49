//! Context-window management: token estimation, summarization and the
//! session compressor.
//!
//! - **[`tokens`]** — fixed-ratio token estimates for message lists.
//! - **[`summarizer`]** — the [`Summarizer`](summarizer::Summarizer)
//!   collaborator and [`ConversationSummary`](summarizer::ConversationSummary).
//! - **[`compressor`]** — [`ContextCompressor`]: archives tool results as
//!   artifacts and replaces history with a rolling summary.

pub mod compressor;
pub mod summarizer;
pub mod tokens;

pub use compressor::{CompressionOutcome, CompressionState, ContextCompressor};
pub use summarizer::ConversationSummary;

/// First `max` characters of `text`, with `...` appended when cut.
pub(crate) fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => format!("{}...", text.get(..cut).unwrap_or(text)),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_on_char_boundary() {
        assert_eq!(truncate_chars("hello", 10), "hello");
        assert_eq!(truncate_chars("hello", 5), "hello");
        assert_eq!(truncate_chars("hello", 3), "hel...");
        assert_eq!(truncate_chars("ééé", 1), "é...");
        assert_eq!(truncate_chars("abc", 0), "...");
    }
}
