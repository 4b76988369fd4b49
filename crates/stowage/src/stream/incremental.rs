//! Chunk-driven driver over [`TagParser`].
//!
//! Network chunks split text at arbitrary offsets, including inside a
//! marker. [`IncrementalParser`] keeps everything from the last safe
//! boundary onward in a buffer (BUFFERING) and parses only the prefix that
//! cannot contain part of a marker (SCANNING). Text is emitted exactly once.

use super::StreamPart;
use super::parser::TagParser;
use crate::artifact::ArtifactMap;
use tracing::trace;

/// Whether the parser is holding back a possible marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Scanning,
    Buffering,
}

/// Streaming front end for one message.
pub struct IncrementalParser<'p> {
    parser: &'p TagParser,
    buffer: String,
    hint: Option<ArtifactMap>,
    source_agent_id: Option<String>,
}

impl<'p> IncrementalParser<'p> {
    pub fn new(parser: &'p TagParser) -> Self {
        Self {
            parser,
            buffer: String::new(),
            hint: None,
            source_agent_id: None,
        }
    }

    /// Pre-fetched artifacts consulted before the ledger for references.
    pub fn with_hint(mut self, hint: ArtifactMap) -> Self {
        self.hint = Some(hint);
        self
    }

    pub fn with_source_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.source_agent_id = Some(agent_id.into());
        self
    }

    pub fn state(&self) -> ScanState {
        if self.buffer.is_empty() {
            ScanState::Scanning
        } else {
            ScanState::Buffering
        }
    }

    /// Text currently withheld.
    pub fn buffered(&self) -> &str {
        &self.buffer
    }

    /// Append a chunk and return the parts that are safe to emit now.
    pub async fn push(&mut self, chunk: &str) -> Vec<StreamPart> {
        self.buffer.push_str(chunk);
        let boundary = self.parser.find_safe_text_boundary(&self.buffer);
        if boundary == 0 {
            trace!(buffered = self.buffer.len(), "holding possible marker");
            return Vec::new();
        }
        let ready: String = self.buffer.drain(..boundary).collect();
        self.parser
            .parse_text(&ready, self.hint.as_ref(), self.source_agent_id.as_deref())
            .await
    }

    /// Flush whatever is still buffered at the end of the message.
    pub async fn finish(&mut self) -> Vec<StreamPart> {
        let rest = std::mem::take(&mut self.buffer);
        self.parser
            .parse_text(&rest, self.hint.as_ref(), self.source_agent_id.as_deref())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ledger::InMemoryLedger;
    use crate::artifact::tool_results::ToolResultStore;
    use crate::artifact::{ArtifactScope, ArtifactStore};
    use crate::stream::collect_text;
    use crate::stream::markers::{BLOCK_BODY_WINDOW, CREATE_CLOSE};
    use serde_json::json;
    use std::sync::Arc;

    fn parser() -> TagParser {
        let results = Arc::new(ToolResultStore::new());
        results.record("s1", "c1", "search", json!({"hits": [{"title": "T"}]}));
        let scope = ArtifactScope::new("t", "p", "ctx", "task", "s1");
        TagParser::new(ArtifactStore::new(
            scope,
            Arc::new(InMemoryLedger::new()),
            results,
        ))
    }

    #[tokio::test]
    async fn marker_split_across_chunks_is_withheld() {
        let parser = parser();
        let mut inc = IncrementalParser::new(&parser);

        let first = inc.push("Here: <artifact:cre").await;
        assert_eq!(first, vec![StreamPart::text("Here: ")]);
        assert_eq!(inc.state(), ScanState::Buffering);
        assert_eq!(inc.buffered(), "<artifact:cre");

        let second = inc
            .push(r#"ate id="a" tool="c1" type="doc" base="hits" /> done"#)
            .await;
        assert_eq!(second.len(), 2);
        assert_eq!(second[0].as_data().unwrap()["artifactId"], "a");
        assert_eq!(second[1], StreamPart::text(" done"));
        assert_eq!(inc.state(), ScanState::Scanning);
        assert!(inc.finish().await.is_empty());
    }

    #[tokio::test]
    async fn finish_flushes_a_bare_prefix_as_text() {
        let parser = parser();
        let mut inc = IncrementalParser::new(&parser);
        assert_eq!(inc.push("x <").await, vec![StreamPart::text("x ")]);
        assert_eq!(collect_text(&inc.finish().await), "<");
    }

    #[tokio::test]
    async fn every_split_point_yields_the_same_text() {
        let text = r#"Intro <artifact:create id="a" tool="c1" type="doc" base="hits" /> mid <artifact:ref id="a" tool="c1" /> end"#;
        let whole = {
            let parser = parser();
            parser.parse_text(text, None, None).await
        };
        let whole_text = collect_text(&whole);
        let whole_data: Vec<_> = whole.iter().filter_map(|p| p.as_data().cloned()).collect();

        for split in 0..=text.len() {
            let parser = parser();
            let mut inc = IncrementalParser::new(&parser);
            let (a, b) = text.split_at(split);
            let mut parts = inc.push(a).await;
            parts.extend(inc.push(b).await);
            parts.extend(inc.finish().await);
            assert_eq!(collect_text(&parts), whole_text, "split at {split}");
            let data: Vec<_> = parts.iter().filter_map(|p| p.as_data().cloned()).collect();
            assert_eq!(data, whole_data, "split at {split}");
            assert!(parser.take_warnings().is_empty(), "split at {split}");
        }
    }

    #[tokio::test]
    async fn unclosed_create_survives_any_split() {
        let text = r#"Intro <artifact:create id="a" tool="c1" type="doc" base="hits"> rest of the answer"#;
        for split in 0..=text.len() {
            let parser = parser();
            let mut inc = IncrementalParser::new(&parser);
            let (a, b) = text.split_at(split);
            let mut parts = inc.push(a).await;
            parts.extend(inc.push(b).await);
            parts.extend(inc.finish().await);
            assert_eq!(collect_text(&parts), "Intro  rest of the answer", "split at {split}");
            assert_eq!(parts.iter().filter(|p| p.as_data().is_some()).count(), 1);
        }
    }

    #[tokio::test]
    async fn unclosed_create_is_released_once_the_window_passes() {
        let parser = parser();
        let mut inc = IncrementalParser::new(&parser);
        let opening = r#"<artifact:create id="a" tool="c1" type="doc" base="hits">"#;
        assert!(inc.push(opening).await.is_empty());
        assert!(inc.push("body").await.is_empty());

        let filler = "x".repeat(BLOCK_BODY_WINDOW + CREATE_CLOSE.len());
        let parts = inc.push(&filler).await;
        assert_eq!(parts[0].as_data().unwrap()["artifactId"], "a");
        assert_eq!(collect_text(&parts), format!("body{filler}"));
        assert_eq!(inc.state(), ScanState::Scanning);
    }
}
