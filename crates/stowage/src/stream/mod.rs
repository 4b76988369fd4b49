//! Rewriting streamed model output around artifact markers.
//!
//! - **[`markers`]** — marker grammar and the chunk-safe scanner.
//! - **[`parser`]** — [`TagParser`](parser::TagParser): turns text (or
//!   structured output) into [`StreamPart`]s, creating and resolving
//!   artifacts along the way.
//! - **[`incremental`]** — [`IncrementalParser`](incremental::IncrementalParser):
//!   feeds network chunks through the tag parser without ever flushing a
//!   partial marker.

pub mod incremental;
pub mod markers;
pub mod parser;

use crate::artifact::Artifact;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One unit of rewritten model output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StreamPart {
    Text { text: String },
    Data { payload: Value },
}

impl StreamPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn data(payload: Value) -> Self {
        Self::Data { payload }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            Self::Data { .. } => None,
        }
    }

    pub fn as_data(&self) -> Option<&Value> {
        match self {
            Self::Data { payload } => Some(payload),
            Self::Text { .. } => None,
        }
    }
}

/// Concatenation of every text part, in order.
pub fn collect_text(parts: &[StreamPart]) -> String {
    parts.iter().filter_map(StreamPart::as_text).collect()
}

/// Data payload announcing an artifact's preview in the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactPart {
    pub artifact_id: String,
    pub tool_call_id: String,
    pub name: String,
    pub description: String,
    #[serde(rename = "type")]
    pub artifact_type: String,
    pub artifact_summary: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_agent_id: Option<String>,
}

impl ArtifactPart {
    pub fn from_artifact(artifact: &Artifact, source_agent_id: Option<&str>) -> Self {
        Self {
            artifact_id: artifact.artifact_id.clone(),
            tool_call_id: artifact.tool_call_id.clone(),
            name: artifact.name.clone(),
            description: artifact.description.clone(),
            artifact_type: artifact.artifact_type.clone(),
            artifact_summary: artifact.summary_data.clone(),
            source_agent_id: source_agent_id.map(str::to_string),
        }
    }

    pub fn into_part(self) -> StreamPart {
        StreamPart::data(serde_json::to_value(&self).unwrap_or_default())
    }
}

/// Accumulates parts so that adjacent text merges and no empty text part
/// is ever emitted.
#[derive(Debug, Default)]
pub(crate) struct PartsBuilder {
    parts: Vec<StreamPart>,
    text: String,
}

impl PartsBuilder {
    pub(crate) fn push_text(&mut self, text: &str) {
        self.text.push_str(text);
    }

    pub(crate) fn push_part(&mut self, part: StreamPart) {
        match part {
            StreamPart::Text { text } => self.text.push_str(&text),
            data => {
                self.flush_text();
                self.parts.push(data);
            }
        }
    }

    fn flush_text(&mut self) {
        if !self.text.is_empty() {
            let text = std::mem::take(&mut self.text);
            self.parts.push(StreamPart::Text { text });
        }
    }

    pub(crate) fn finish(mut self) -> Vec<StreamPart> {
        self.flush_text();
        self.parts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stream_part_wire_shape() {
        assert_eq!(
            serde_json::to_value(StreamPart::text("hi")).unwrap(),
            json!({"kind": "text", "text": "hi"})
        );
        assert_eq!(
            serde_json::to_value(StreamPart::data(json!({"a": 1}))).unwrap(),
            json!({"kind": "data", "payload": {"a": 1}})
        );
    }

    #[test]
    fn builder_merges_text_and_skips_empty() {
        let mut b = PartsBuilder::default();
        b.push_text("a");
        b.push_text("");
        b.push_text("b");
        b.push_part(StreamPart::data(json!(1)));
        b.push_text("");
        b.push_part(StreamPart::data(json!(2)));
        b.push_text("c");
        let parts = b.finish();
        assert_eq!(
            parts,
            vec![
                StreamPart::text("ab"),
                StreamPart::data(json!(1)),
                StreamPart::data(json!(2)),
                StreamPart::text("c"),
            ]
        );
    }

    #[test]
    fn artifact_part_omits_missing_agent() {
        let part = ArtifactPart {
            artifact_id: "a".into(),
            tool_call_id: "c".into(),
            name: "n".into(),
            description: "d".into(),
            artifact_type: "doc".into(),
            artifact_summary: json!({"title": "T"}),
            source_agent_id: None,
        };
        let v = serde_json::to_value(&part).unwrap();
        assert_eq!(v["artifactSummary"]["title"], "T");
        assert!(v.get("sourceAgentId").is_none());
    }
}
