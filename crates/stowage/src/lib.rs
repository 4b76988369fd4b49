//! Artifact extraction and context-window compression for LLM agent runtimes.
//!
//! `stowage` sits between an agent's tool-execution loop and the text it
//! streams back to clients. It solves two problems:
//!
//! 1. **Inline references to large tool results.** A model that wants to
//!    show a 40 KB search result does not re-emit it. It writes an
//!    `<artifact:create .../>` marker naming the tool call and a JMESPath
//!    selector. The [`TagParser`](stream::parser::TagParser) replaces the
//!    marker with a compact preview, and the
//!    [`ArtifactStore`](artifact::ArtifactStore) persists both the preview and
//!    the full projection so later turns can reference them by key.
//!
//! 2. **Bounded conversation cost.** The
//!    [`ContextCompressor`](context::ContextCompressor) estimates the token size
//!    of the in-flight message list. Once it approaches the configured limit,
//!    every unarchived tool result is saved as an artifact and the history is
//!    replaced by a rolling summary.
//!
//! # Where to find things
//!
//! - **Create and read artifacts:** [`artifact::ArtifactStore`]. Selectors are
//!   sanitized and evaluated in [`artifact::selector`]; preview/full splitting
//!   lives in [`artifact::schema`]; persistence goes through the
//!   [`Ledger`](artifact::ledger::Ledger) trait.
//! - **Rewrite streamed output:** [`stream::parser::TagParser`] for complete
//!   text, [`stream::incremental::IncrementalParser`] for network chunks.
//! - **Compress history:** [`context::ContextCompressor`] with a
//!   [`Summarizer`](context::summarizer::Summarizer) collaborator.
//! - **Observe:** implement [`EventHandler`](events::EventHandler), or use
//!   [`LoggingHandler`](events::LoggingHandler).
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`artifact`] | Artifact model, store, selectors, schema projection, ledger |
//! | [`stream`] | Marker grammar, tag parser, incremental driver |
//! | [`context`] | Token estimation, summarization, compressor |
//! | [`events`] | Observability events and handlers |
//! | [`config`] | Store and compressor configuration |
//! | [`error`] | Error types |

pub mod artifact;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod stream;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// Re-export schemars for downstream crates.
pub use schemars;

// ── Schema generation ──────────────────────────────────────────────

/// Generate a JSON Schema `serde_json::Value` from a type that implements
/// `schemars::JsonSchema`.
///
/// # Example
///
/// ```
/// use stowage::json_schema_for;
/// use schemars::JsonSchema;
/// use serde::Deserialize;
///
/// #[derive(Deserialize, JsonSchema)]
/// struct SearchHit {
///     title: String,
///     #[serde(default)]
///     url: Option<String>,
/// }
///
/// let schema = json_schema_for::<SearchHit>();
/// assert_eq!(schema["type"], "object");
/// assert!(schema["required"].as_array().unwrap().contains(&"title".into()));
/// ```
pub fn json_schema_for<T: JsonSchema>() -> serde_json::Value {
    let schema = schemars::schema_for!(T);
    serde_json::to_value(schema)
        .unwrap_or_else(|_| serde_json::json!({"type": "object", "properties": {}}))
}

// ── Message types ──────────────────────────────────────────────────

/// Role of a message in the conversation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::Tool => write!(f, "tool"),
        }
    }
}

/// A message in the conversation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Message {
    pub role: MessageRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn assistant_text(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn assistant_tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: None,
            tool_calls: Some(calls),
            tool_call_id: None,
        }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Tool,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(call_id.into()),
        }
    }

    /// Whether this message carries a tool result.
    pub fn is_tool_result(&self) -> bool {
        self.role == MessageRole::Tool && self.tool_call_id.is_some()
    }
}

// ── Tool call types ────────────────────────────────────────────────

/// The type of a tool call. Currently always `Function`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum CallType {
    #[serde(rename = "function")]
    Function,
}

/// A tool call issued by the model.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: CallType,
    pub function: FunctionCallData,
}

impl ToolCall {
    pub fn function(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            call_type: CallType::Function,
            function: FunctionCallData {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FunctionCallData {
    pub name: String,
    pub arguments: String,
}
