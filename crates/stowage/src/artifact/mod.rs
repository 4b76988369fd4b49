//! Artifacts: addressable, persisted projections of tool results.
//!
//! A model that wants to show a large tool result inline does not re-emit
//! it. It writes a directive naming the tool call and a path query; the
//! [`ArtifactStore`](store::ArtifactStore) projects the raw result into a
//! compact *summary* view and a complete *full* view, persists both through
//! the [`Ledger`](ledger::Ledger), and later serves either view back by
//! [`ArtifactKey`].
//!
//! - **[`selector`]** — sanitizes model-written JMESPath and evaluates it.
//! - **[`schema`]** — splits a component schema into preview/full views and
//!   extracts the matching sparse objects.
//! - **[`registry`]** — component schemas by artifact type.
//! - **[`tool_results`]** — raw tool results by `(session, tool_call_id)`.
//! - **[`ledger`]** — durable persistence interface and two implementations.
//! - **[`cleanup`]** — escape cleanup and the emptiness predicate.
//! - **[`store`]** — the store itself.

pub mod cleanup;
pub mod ledger;
pub mod registry;
pub mod schema;
pub mod selector;
pub mod store;
pub mod tool_results;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;

pub use store::ArtifactStore;

/// Placeholder name until the enrichment collaborator supplies one.
pub const PENDING_NAME: &str = "Processing...";

/// Placeholder description until the enrichment collaborator supplies one.
pub const PENDING_DESCRIPTION: &str = "Name and description being generated...";

/// Composite identity of an artifact.
///
/// `artifact_id` comes from the model's directive; `tool_call_id`
/// disambiguates the same id reused across calls.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactKey {
    pub artifact_id: String,
    pub tool_call_id: String,
}

impl ArtifactKey {
    pub fn new(artifact_id: impl Into<String>, tool_call_id: impl Into<String>) -> Self {
        Self {
            artifact_id: artifact_id.into(),
            tool_call_id: tool_call_id.into(),
        }
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.artifact_id, self.tool_call_id)
    }
}

/// Artifacts keyed by identity, as loaded in bulk for a context.
pub type ArtifactMap = HashMap<ArtifactKey, Artifact>;

/// A persisted projection of one tool result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub artifact_id: String,
    pub tool_call_id: String,
    pub name: String,
    pub description: String,
    #[serde(rename = "type")]
    pub artifact_type: String,
    /// Preview view: only the schema's `inPreview` fields.
    pub summary_data: Value,
    /// Full view: every declared field.
    pub full_data: Value,
    pub task_id: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    pub fn key(&self) -> ArtifactKey {
        ArtifactKey::new(&self.artifact_id, &self.tool_call_id)
    }

    /// Whether the name and description are still placeholders.
    pub fn is_pending(&self) -> bool {
        self.name == PENDING_NAME
    }

    /// Copy of this artifact with `full_data` dropped, for summary reads.
    pub fn summary_view(&self) -> Artifact {
        Artifact {
            full_data: Value::Null,
            ..self.clone()
        }
    }
}

/// A request to create an artifact from a recorded tool result.
///
/// Mirrors the attributes of an `artifact:create` directive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRequest {
    pub artifact_id: String,
    pub tool_call_id: String,
    #[serde(rename = "type")]
    pub artifact_type: String,
    /// JMESPath into the raw tool result selecting the artifact's data.
    pub base_selector: String,
    /// Per-field JMESPath overrides, relative to the base selection.
    #[serde(default)]
    pub details_selector: HashMap<String, String>,
}

impl ArtifactRequest {
    pub fn key(&self) -> ArtifactKey {
        ArtifactKey::new(&self.artifact_id, &self.tool_call_id)
    }
}

/// Where artifacts are written: tenant/project ledger scopes plus the
/// conversation (`context_id`) and unit of work (`task_id`) they belong
/// to. `session_id` keys the tool result lookup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactScope {
    pub tenant_id: String,
    pub project_id: String,
    pub context_id: String,
    pub task_id: String,
    pub session_id: String,
}

impl ArtifactScope {
    pub fn new(
        tenant_id: impl Into<String>,
        project_id: impl Into<String>,
        context_id: impl Into<String>,
        task_id: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            project_id: project_id.into(),
            context_id: context_id.into(),
            task_id: task_id.into(),
            session_id: session_id.into(),
        }
    }

    /// The tenant/project partition this scope writes into.
    pub fn ledger_scopes(&self) -> ledger::LedgerScopes {
        ledger::LedgerScopes {
            tenant_id: self.tenant_id.clone(),
            project_id: self.project_id.clone(),
        }
    }
}
