//! Error types for the artifact and compression subsystems.
//!
//! Most failures in this crate are expected runtime states (a missing tool
//! result, an unknown schema, a selector that does not match) and never
//! surface as errors: they resolve to `None` or an empty projection. The
//! enums here cover what is left:
//!
//! - [`ExtractionError`] — a path query failed to compile or evaluate. Always
//!   caught by the projector and composed with a field-access fallback.
//! - [`LedgerError`] — the durable ledger could not serve a read or write.
//! - [`ArtifactError`] — the one fatal path: an artifact could not be
//!   persisted after the model already referenced it.
//! - [`CompressionError`] — the summarization collaborator failed.
//! - [`SchemaError`] — a component schema is not valid JSON Schema.
//! - [`ConfigError`] — a config file could not be loaded.

use thiserror::Error;

/// A path query could not be compiled or evaluated.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExtractionError {
    #[error("invalid selector `{selector}`: {message}")]
    Compile { selector: String, message: String },

    #[error("selector `{selector}` failed to evaluate: {message}")]
    Evaluate { selector: String, message: String },
}

/// Errors reported by a [`Ledger`](crate::artifact::ledger::Ledger).
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The record is already stored. Writers treat this as success.
    #[error("artifact already exists")]
    AlreadyExists,

    #[error("ledger unavailable: {0}")]
    Unavailable(String),

    #[error("failed to serialize artifact: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("ledger I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Fatal artifact creation failure.
///
/// Raised only when an artifact (or its enriched name) could not be
/// persisted, or a detached persistence task panicked. Every other creation
/// problem degrades to `Ok(None)` or a best-effort projection.
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("failed to persist artifact {artifact_id}: {source}")]
    Creation {
        artifact_id: String,
        #[source]
        source: LedgerError,
    },

    #[error("failed to record enrichment for artifact {artifact_id}: {source}")]
    Enrichment {
        artifact_id: String,
        #[source]
        source: LedgerError,
    },

    #[error("persistence task for artifact {artifact_id} did not complete: {message}")]
    TaskJoin {
        artifact_id: String,
        message: String,
    },
}

impl ArtifactError {
    /// The artifact id this error is about.
    pub fn artifact_id(&self) -> &str {
        match self {
            ArtifactError::Creation { artifact_id, .. }
            | ArtifactError::Enrichment { artifact_id, .. }
            | ArtifactError::TaskJoin { artifact_id, .. } => artifact_id,
        }
    }
}

/// A compression cycle could not produce a summary.
#[derive(Debug, Error)]
pub enum CompressionError {
    #[error("summarization failed: {0}")]
    Summarization(String),
}

/// A component schema was rejected at registration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid schema for component `{component}`: {message}")]
pub struct SchemaError {
    pub component: String,
    pub message: String,
}

/// Configuration could not be loaded.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}
