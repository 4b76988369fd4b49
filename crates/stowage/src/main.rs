//! Replay a recorded agent transcript through the artifact and compression
//! pipeline and print what a live session would have produced.
//!
//! A transcript is a JSON file:
//!
//! ```json
//! {
//!   "session_id": "s1",
//!   "context_id": "ctx",
//!   "messages": [ ... ],
//!   "tool_results": [{"tool_call_id": "c1", "tool_name": "search", "result": {...}}],
//!   "schemas": {"search_results": { ... }},
//!   "model_output": "Found it: <artifact:create id=\"hits\" tool=\"c1\" type=\"search_results\" base=\"items\" />"
//! }
//! ```
//!
//! When `tool_results` is omitted, results are taken from the tool messages.
//!
//! # Examples
//!
//! ```sh
//! # Parse the model output and report the compression decision
//! stowage replay --transcript session.json
//!
//! # Stream the output in 16-character chunks and force a compression cycle
//! stowage replay --transcript session.json --chunk-size 16 --compress
//!
//! # Override limits
//! RUST_LOG=stowage=debug stowage replay --transcript session.json --config stowage.json
//! ```

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use stowage::artifact::ledger::InMemoryLedger;
use stowage::artifact::registry::SchemaRegistry;
use stowage::artifact::tool_results::ToolResultStore;
use stowage::artifact::{Artifact, ArtifactScope, ArtifactStore};
use stowage::config::StowageConfig;
use stowage::context::ContextCompressor;
use stowage::context::summarizer::{ConversationSummary, ExtractiveSummarizer};
use stowage::events::{
    CompositeEventHandler, CompressionEvent, EventHandler, FnEventHandler, LoggingHandler,
    StowageEvent,
};
use stowage::stream::StreamPart;
use stowage::stream::incremental::IncrementalParser;
use stowage::stream::parser::TagParser;
use stowage::{Message, MessageRole};
use tracing::info;

/// Debug tool for artifact extraction and context compression.
#[derive(Parser)]
#[command(name = "stowage")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Replay a recorded transcript and print the parts and summary as JSON.
    Replay {
        /// Path to the transcript JSON file
        #[arg(long)]
        transcript: PathBuf,

        /// Path to a stowage config JSON file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Feed the model output in chunks of this many characters
        #[arg(long)]
        chunk_size: Option<usize>,

        /// Run a compression cycle even when under the threshold
        #[arg(long)]
        compress: bool,
    },
}

// ── Transcript file ────────────────────────────────────────────────

#[derive(Deserialize)]
struct Transcript {
    #[serde(default = "default_id")]
    tenant_id: String,
    #[serde(default = "default_id")]
    project_id: String,
    #[serde(default = "default_id")]
    context_id: String,
    #[serde(default = "default_id")]
    task_id: String,
    #[serde(default = "default_id")]
    session_id: String,
    #[serde(default)]
    messages: Vec<Message>,
    tool_results: Option<Vec<RecordedToolResult>>,
    #[serde(default)]
    schemas: HashMap<String, Value>,
    #[serde(default)]
    model_output: String,
}

fn default_id() -> String {
    "replay".to_string()
}

#[derive(Deserialize)]
struct RecordedToolResult {
    tool_call_id: String,
    #[serde(default)]
    tool_name: String,
    result: Value,
}

// ── Report ─────────────────────────────────────────────────────────

#[derive(Serialize)]
struct Report {
    parts: Vec<StreamPart>,
    warnings: Vec<String>,
    artifacts: Vec<Artifact>,
    compression: CompressionReport,
}

#[derive(Serialize)]
struct CompressionReport {
    needed: bool,
    ran: bool,
    usage: String,
    artifact_ids: Vec<String>,
    event: Option<CompressionEvent>,
    summary: Option<ConversationSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("stowage=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Replay {
            transcript,
            config,
            chunk_size,
            compress,
        } => replay(transcript, config, chunk_size, compress).await,
    };

    match result {
        Ok(report) => match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                eprintln!("Error: failed to encode report: {e}");
                process::exit(1);
            }
        },
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    }
}

async fn replay(
    transcript_path: PathBuf,
    config_path: Option<PathBuf>,
    chunk_size: Option<usize>,
    force_compress: bool,
) -> Result<Report, String> {
    let config = match config_path {
        Some(path) => StowageConfig::from_file(&path).map_err(|e| e.to_string())?,
        None => StowageConfig::default(),
    };
    let transcript = load_transcript(&transcript_path)?;

    let mut registry = SchemaRegistry::new();
    for (artifact_type, schema) in &transcript.schemas {
        registry
            .register(artifact_type, schema.clone())
            .map_err(|e| e.to_string())?;
    }

    let results = Arc::new(ToolResultStore::new());
    record_tool_results(&results, &transcript);

    let compression_events = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = compression_events.clone();
    let events: Arc<dyn EventHandler> = Arc::new(
        CompositeEventHandler::new()
            .with(LoggingHandler)
            .with(FnEventHandler::new(move |event: &StowageEvent<'_>| {
                if let StowageEvent::Compression(record) = event {
                    sink.lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .push((*record).clone());
                }
            })),
    );

    let scope = ArtifactScope::new(
        &transcript.tenant_id,
        &transcript.project_id,
        &transcript.context_id,
        &transcript.task_id,
        &transcript.session_id,
    );
    let ledger = Arc::new(InMemoryLedger::new());
    let store = ArtifactStore::new(scope, ledger.clone(), results)
        .with_schemas(Arc::new(registry))
        .with_events(events.clone())
        .with_config(config.store.clone());

    // ── Model output ──
    let parser = TagParser::new(store.clone()).with_events(events.clone());
    let parts = match chunk_size {
        Some(size) if size > 0 => stream_in_chunks(&parser, &transcript.model_output, size).await,
        _ => parser.parse_text(&transcript.model_output, None, None).await,
    };
    parser.flush_pending().await.map_err(|e| e.to_string())?;
    let warnings = parser.take_warnings();

    // ── Compression ──
    let mut compressor = ContextCompressor::new(
        config.compressor.clone(),
        store,
        Arc::new(ExtractiveSummarizer::new()),
    )
    .with_events(events);
    if force_compress {
        compressor.request_manual_compression();
    }
    let usage = compressor.usage(&transcript.messages).to_log_string();
    let needed = compressor.is_compression_needed(&transcript.messages);
    let mut compression = CompressionReport {
        needed,
        ran: false,
        usage,
        artifact_ids: Vec::new(),
        event: None,
        summary: None,
        error: None,
    };
    if needed {
        compression.ran = true;
        match compressor.compress(&transcript.messages).await {
            Ok(outcome) => {
                compression.artifact_ids = outcome.artifact_ids;
                compression.summary = Some(outcome.summary);
            }
            Err(e) => compression.error = Some(e.to_string()),
        }
        compression.event = compression_events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last()
            .cloned();
    }

    let artifacts = ledger.artifacts();
    info!(
        parts = parts.len(),
        artifacts = artifacts.len(),
        "replay complete"
    );
    Ok(Report {
        parts,
        warnings,
        artifacts,
        compression,
    })
}

fn load_transcript(path: &Path) -> Result<Transcript, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read transcript '{}': {e}", path.display()))?;
    serde_json::from_str(&content)
        .map_err(|e| format!("failed to parse transcript '{}': {e}", path.display()))
}

/// Record explicit tool results, or fall back to the tool messages.
fn record_tool_results(results: &ToolResultStore, transcript: &Transcript) {
    let session = &transcript.session_id;
    if let Some(recorded) = &transcript.tool_results {
        for r in recorded {
            results.record(session, &r.tool_call_id, &r.tool_name, r.result.clone());
        }
        return;
    }

    let names: HashMap<&str, &str> = transcript
        .messages
        .iter()
        .filter(|m| m.role == MessageRole::Assistant)
        .flat_map(|m| m.tool_calls.iter().flatten())
        .map(|c| (c.id.as_str(), c.function.name.as_str()))
        .collect();
    for msg in transcript.messages.iter().filter(|m| m.is_tool_result()) {
        let Some(call_id) = msg.tool_call_id.as_deref() else {
            continue;
        };
        let content = msg.content.as_deref().unwrap_or_default();
        let value = serde_json::from_str(content)
            .unwrap_or_else(|_| Value::String(content.to_string()));
        let name = names.get(call_id).copied().unwrap_or("unknown");
        results.record(session, call_id, name, value);
    }
}

async fn stream_in_chunks(parser: &TagParser, text: &str, size: usize) -> Vec<StreamPart> {
    let chars: Vec<char> = text.chars().collect();
    let mut incremental = IncrementalParser::new(parser);
    let mut parts = Vec::new();
    for chunk in chars.chunks(size) {
        let chunk: String = chunk.iter().collect();
        parts.extend(incremental.push(&chunk).await);
    }
    parts.extend(incremental.finish().await);
    parts
}
