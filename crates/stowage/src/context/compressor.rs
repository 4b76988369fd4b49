//! Session-scoped context compression.
//!
//! The compressor watches the estimated size of the message list. When the
//! headroom below `hard_limit` shrinks to `safety_buffer` (or a caller asks
//! for it), a cycle runs:
//!
//! 1. Every tool result in the unprocessed suffix is archived as an
//!    artifact, except results already processed, results of
//!    non-archivable tools, and empty results (marked processed, no artifact).
//! 2. The whole conversation is summarized, seeded with the previous
//!    cycle's summary.
//! 3. A [`CompressionEvent`] is recorded.
//!
//! The manual trigger is reset at the end of every cycle, successful or not.

use super::summarizer::{ArchivedResults, ConversationSummary, Summarizer};
use super::tokens::{ContextUsage, estimate_tokens};
use super::truncate_chars;
use crate::artifact::cleanup::is_empty_value;
use crate::artifact::{Artifact, ArtifactStore};
use crate::config::CompressorConfig;
use crate::error::{ArtifactError, CompressionError};
use crate::events::{
    CompressionEvent, CompressionReason, EventHandler, NoopHandler, StowageEvent,
};
use crate::{Message, MessageRole};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::{BTreeSet, HashMap};
use std::hash::{DefaultHasher, Hasher};
use std::sync::Arc;
use tracing::{debug, warn};

/// Artifact type given to archived tool results.
pub const ARCHIVED_RESULT_TYPE: &str = "tool_result";

/// Persistent compression state for one session.
///
/// Serializable so a session can checkpoint and later resume through
/// [`ContextCompressor::from_state`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionState {
    /// Tool calls whose results were archived or judged empty.
    pub processed_tool_calls: BTreeSet<String>,
    /// Archived tool call id → artifact id.
    pub archived: ArchivedResults,
    /// Summary produced by the last successful cycle.
    pub cumulative_summary: Option<ConversationSummary>,
    /// Index of the first message not yet scanned for tool results.
    pub cursor: usize,
    /// Digest of the messages before `cursor`. A history that no longer
    /// starts with them is rescanned from the beginning.
    pub scanned_digest: Option<u64>,
    pub manual_requested: bool,
    /// Completed cycles.
    pub compression_count: usize,
}

/// What one cycle produced.
#[derive(Debug, Clone, PartialEq)]
pub struct CompressionOutcome {
    /// Artifacts created during the cycle, in message order.
    pub artifact_ids: Vec<String>,
    pub summary: ConversationSummary,
}

/// Compresses one session's conversation history.
pub struct ContextCompressor {
    config: CompressorConfig,
    state: CompressionState,
    store: ArtifactStore,
    summarizer: Arc<dyn Summarizer>,
    events: Arc<dyn EventHandler>,
}

impl ContextCompressor {
    pub fn new(
        config: CompressorConfig,
        store: ArtifactStore,
        summarizer: Arc<dyn Summarizer>,
    ) -> Self {
        Self::from_state(CompressionState::default(), config, store, summarizer)
    }

    /// Resume from a checkpointed state.
    pub fn from_state(
        state: CompressionState,
        config: CompressorConfig,
        store: ArtifactStore,
        summarizer: Arc<dyn Summarizer>,
    ) -> Self {
        Self {
            config,
            state,
            store,
            summarizer,
            events: Arc::new(NoopHandler),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventHandler>) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &CompressorConfig {
        &self.config
    }

    pub fn state(&self) -> &CompressionState {
        &self.state
    }

    /// Current usage of `messages` against the configured limits.
    pub fn usage(&self, messages: &[Message]) -> ContextUsage {
        ContextUsage {
            estimated_tokens: estimate_tokens(messages),
            hard_limit: self.config.hard_limit,
            safety_buffer: self.config.safety_buffer,
        }
    }

    /// True when a manual cycle was requested, or when the headroom below
    /// the hard limit is at most the safety buffer.
    pub fn is_compression_needed(&self, messages: &[Message]) -> bool {
        if self.state.manual_requested {
            return true;
        }
        let usage = self.usage(messages);
        debug!(usage = %usage.to_log_string(), "checked compression threshold");
        usage.exceeds_threshold()
    }

    /// Force the next [`is_compression_needed`](Self::is_compression_needed)
    /// check to return true.
    pub fn request_manual_compression(&mut self) {
        self.state.manual_requested = true;
    }

    /// The cumulative summary from the last successful cycle.
    pub fn get_compression_summary(&self) -> Option<&ConversationSummary> {
        self.state.cumulative_summary.as_ref()
    }

    /// Run one compression cycle over `messages`.
    ///
    /// A summarization failure is returned after archiving has completed;
    /// the cumulative summary is left unchanged in that case.
    pub async fn compress(
        &mut self,
        messages: &[Message],
    ) -> Result<CompressionOutcome, CompressionError> {
        let reason = if self.state.manual_requested {
            CompressionReason::Manual
        } else {
            CompressionReason::Automatic
        };
        let tokens_before = estimate_tokens(messages);
        self.events.on_event(&StowageEvent::CompressionStarted {
            reason,
            message_count: messages.len(),
            estimated_tokens: tokens_before,
        });
        debug!(%reason, messages = messages.len(), tokens_before, "compression started");

        let result = self.run_cycle(messages, reason, tokens_before).await;
        self.state.manual_requested = false;
        result
    }

    async fn run_cycle(
        &mut self,
        messages: &[Message],
        reason: CompressionReason,
        tokens_before: usize,
    ) -> Result<CompressionOutcome, CompressionError> {
        let artifact_ids = self.archive_suffix(messages, reason).await;

        let summary = self
            .summarizer
            .summarize(
                messages,
                self.state.cumulative_summary.as_ref(),
                &self.state.archived,
            )
            .await;
        let mut summary = match summary {
            Ok(summary) => summary,
            Err(e) => {
                warn!(error = %e, "compression cycle produced no summary");
                return Err(e);
            }
        };
        summary.record_artifacts(&self.state.archived);
        self.state.cumulative_summary = Some(summary.clone());
        self.state.compression_count += 1;

        let event = CompressionEvent {
            reason,
            message_count: messages.len(),
            artifact_count: artifact_ids.len(),
            tokens_before,
            tokens_after: estimate_tokens(&self.compacted_messages(messages)),
            compression_number: self.state.compression_count,
        };
        debug!(
            compression_number = event.compression_number,
            artifacts = event.artifact_count,
            tokens_before = event.tokens_before,
            tokens_after = event.tokens_after,
            "compression complete"
        );
        self.events.on_event(&StowageEvent::Compression(&event));

        Ok(CompressionOutcome {
            artifact_ids,
            summary,
        })
    }

    /// Archive the tool results after the cursor and advance it.
    ///
    /// The cursor stops at the first result whose save failed so that the
    /// next cycle retries it. A history that was replaced (for instance by
    /// [`compacted_messages`](Self::compacted_messages) plus new turns) is
    /// rescanned from the start; processed calls are still skipped.
    async fn archive_suffix(
        &mut self,
        messages: &[Message],
        reason: CompressionReason,
    ) -> Vec<String> {
        let replaced = match messages.get(..self.state.cursor) {
            None => true,
            Some(scanned) => self
                .state
                .scanned_digest
                .is_some_and(|digest| digest != history_digest(scanned)),
        };
        if replaced {
            debug!(
                cursor = self.state.cursor,
                messages = messages.len(),
                "message list was replaced, rescanning from the start"
            );
            self.state.cursor = 0;
        }
        let start = self.state.cursor;
        let tool_names = tool_names_by_call(messages);
        let mut created = Vec::new();
        let mut retry_from = None;

        for (offset, msg) in messages[start..].iter().enumerate() {
            let Some(call_id) = msg.tool_call_id.as_deref().filter(|_| msg.is_tool_result())
            else {
                continue;
            };
            if self.state.processed_tool_calls.contains(call_id) {
                continue;
            }
            let tool_name = tool_names.get(call_id).copied().unwrap_or("unknown");
            if !self.config.is_archivable(tool_name) {
                debug!(tool_call_id = call_id, tool_name, "tool is not archivable");
                continue;
            }

            let payload = parse_payload(msg.content.as_deref().unwrap_or_default());
            if is_empty_value(&payload) {
                debug!(tool_call_id = call_id, tool_name, "empty tool result, not archived");
                self.state.processed_tool_calls.insert(call_id.to_string());
                continue;
            }

            match self.archive(call_id, tool_name, payload, reason).await {
                Ok(artifact) => {
                    self.state.processed_tool_calls.insert(call_id.to_string());
                    self.state
                        .archived
                        .insert(call_id.to_string(), artifact.artifact_id.clone());
                    created.push(artifact.artifact_id);
                }
                Err(e) => {
                    warn!(
                        tool_call_id = call_id,
                        tool_name,
                        error = %e,
                        "failed to archive tool result, will retry next cycle"
                    );
                    retry_from.get_or_insert(start + offset);
                }
            }
        }

        self.state.cursor = retry_from.unwrap_or(messages.len());
        self.state.scanned_digest = Some(history_digest(&messages[..self.state.cursor]));
        created
    }

    async fn archive(
        &self,
        call_id: &str,
        tool_name: &str,
        payload: Value,
        reason: CompressionReason,
    ) -> Result<Artifact, ArtifactError> {
        let preview = match &payload {
            Value::String(s) => truncate_chars(s, self.config.preview_chars),
            other => truncate_chars(&other.to_string(), self.config.preview_chars),
        };
        let mut metadata = Map::new();
        metadata.insert("toolName".into(), json!(tool_name));
        metadata.insert("compressionReason".into(), json!(reason));
        metadata.insert("isCompressed".into(), json!(true));

        let artifact = Artifact {
            artifact_id: format!("compress_{tool_name}_{call_id}"),
            tool_call_id: call_id.to_string(),
            name: format!("{tool_name} result"),
            description: format!("Result of {tool_name} archived during context compression"),
            artifact_type: ARCHIVED_RESULT_TYPE.to_string(),
            summary_data: json!({ "toolName": tool_name, "preview": preview }),
            full_data: payload,
            task_id: self.store.scope().task_id.clone(),
            metadata,
            created_at: Utc::now(),
        };
        self.store.save_artifact(artifact).await
    }

    /// The history the next turn should see: the leading system messages,
    /// then one message carrying the cumulative summary. Without a summary
    /// the list is returned unchanged.
    pub fn compacted_messages(&self, messages: &[Message]) -> Vec<Message> {
        let Some(summary) = &self.state.cumulative_summary else {
            return messages.to_vec();
        };
        let mut out: Vec<Message> = messages
            .iter()
            .take_while(|m| m.role == MessageRole::System)
            .cloned()
            .collect();
        out.push(Message::user(format!(
            "<context_summary>\n{}\n</context_summary>",
            summary.to_context_text()
        )));
        out
    }
}

/// Tool name for every call id issued by the assistant.
fn tool_names_by_call(messages: &[Message]) -> HashMap<&str, &str> {
    messages
        .iter()
        .filter(|m| m.role == MessageRole::Assistant)
        .flat_map(|m| m.tool_calls.iter().flatten())
        .map(|c| (c.id.as_str(), c.function.name.as_str()))
        .collect()
}

/// Order-sensitive digest of a message run.
fn history_digest(messages: &[Message]) -> u64 {
    let mut hasher = DefaultHasher::new();
    for msg in messages {
        match serde_json::to_vec(msg) {
            Ok(bytes) => hasher.write(&bytes),
            Err(_) => hasher.write_u8(0),
        }
        hasher.write_u8(0xff);
    }
    hasher.finish()
}

/// Tool results are JSON when they parse as JSON, text otherwise.
fn parse_payload(content: &str) -> Value {
    serde_json::from_str(content).unwrap_or_else(|_| Value::String(content.to_string()))
}
