//! Raw tool result lookup.
//!
//! The tool-execution layer records every tool result under
//! `(session_id, tool_call_id)`. Results are immutable once recorded; this
//! crate only reads them.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;

/// Read access to recorded tool results.
pub trait ToolResultLookup: Send + Sync {
    /// The raw result of `tool_call_id` within `session_id`.
    fn get(&self, session_id: &str, tool_call_id: &str) -> Option<Value>;
}

/// In-memory tool result store, shared between the tool-execution side
/// (writer) and artifact creation (reader).
#[derive(Debug, Default)]
pub struct ToolResultStore {
    results: RwLock<HashMap<(String, String), RecordedResult>>,
}

/// A recorded tool result with the name of the tool that produced it.
#[derive(Debug, Clone)]
pub struct RecordedResult {
    pub tool_name: String,
    pub result: Value,
}

impl ToolResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a tool result. A second record for the same call is ignored.
    pub fn record(
        &self,
        session_id: impl Into<String>,
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        result: Value,
    ) {
        let mut results = self.results.write().unwrap_or_else(|e| e.into_inner());
        results
            .entry((session_id.into(), tool_call_id.into()))
            .or_insert_with(|| RecordedResult {
                tool_name: tool_name.into(),
                result,
            });
    }

    /// The recorded entry for a call, including its tool name.
    pub fn entry(&self, session_id: &str, tool_call_id: &str) -> Option<RecordedResult> {
        let results = self.results.read().unwrap_or_else(|e| e.into_inner());
        results
            .get(&(session_id.to_string(), tool_call_id.to_string()))
            .cloned()
    }

    /// Drop every result recorded for `session_id`.
    pub fn end_session(&self, session_id: &str) {
        let mut results = self.results.write().unwrap_or_else(|e| e.into_inner());
        results.retain(|(session, _), _| session != session_id);
    }

    pub fn len(&self) -> usize {
        self.results.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ToolResultLookup for ToolResultStore {
    fn get(&self, session_id: &str, tool_call_id: &str) -> Option<Value> {
        self.entry(session_id, tool_call_id).map(|r| r.result)
    }
}
