//! Observability events for artifact creation, stream parsing and context
//! compression.
//!
//! Nothing here changes behavior. The store, the tag parser and the
//! compressor report what they did through [`StowageEvent`] variants, and
//! callers implement [`EventHandler`] to log them, count them, or forward
//! them to a telemetry pipeline.
//!
//! # Choosing an event handler
//!
//! | Handler | Use case |
//! |---------|----------|
//! | [`NoopHandler`] | Tests or fire-and-forget runs |
//! | [`LoggingHandler`] | Structured logging via `tracing` |
//! | [`FnEventHandler`] | Quick closures for simple callbacks |
//! | [`CompositeEventHandler`] | Compose multiple handlers in order |

use crate::artifact::{Artifact, ArtifactKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, warn};

// ── Compression record ─────────────────────────────────────────────

/// Why a compression cycle ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionReason {
    /// The caller asked for it via `request_manual_compression`.
    Manual,
    /// The token estimate crossed the hard limit minus the safety buffer.
    Automatic,
}

impl fmt::Display for CompressionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Manual => f.write_str("manual"),
            Self::Automatic => f.write_str("automatic"),
        }
    }
}

/// The record of one completed compression cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionEvent {
    pub reason: CompressionReason,
    /// Messages in the list handed to `compress`.
    pub message_count: usize,
    /// Artifacts created during this cycle.
    pub artifact_count: usize,
    /// Token estimate of the list handed to `compress`.
    pub tokens_before: usize,
    /// Token estimate of the compacted list the next turn will see.
    pub tokens_after: usize,
    /// 1-based cycle number within the session.
    pub compression_number: usize,
}

// ── Events ─────────────────────────────────────────────────────────

/// Events emitted by the artifact store, the tag parser and the compressor.
#[derive(Debug)]
pub enum StowageEvent<'a> {
    /// A new artifact was extracted and persisted (or queued for persistence).
    ArtifactCreated { artifact: &'a Artifact },
    /// A create request matched an existing artifact, which was returned as is.
    ArtifactReused { key: &'a ArtifactKey },
    /// Artifact creation failed. The directive is dropped from the stream.
    ArtifactCreationFailed {
        artifact_id: &'a str,
        tool_call_id: &'a str,
        reason: &'a str,
    },
    /// The tag parser excised a marker it could not honor.
    ParserWarning { message: &'a str },
    /// The enrichment collaborator replaced an artifact's placeholder name.
    ArtifactEnriched { key: &'a ArtifactKey, name: &'a str },
    /// A compression cycle is starting.
    CompressionStarted {
        reason: CompressionReason,
        message_count: usize,
        estimated_tokens: usize,
    },
    /// A compression cycle completed.
    Compression(&'a CompressionEvent),
}

/// Handler for stowage events.
///
/// The default implementation ignores every event.
///
/// # Example
///
/// ```
/// use stowage::events::{EventHandler, StowageEvent};
///
/// struct Counter(std::sync::atomic::AtomicUsize);
///
/// impl EventHandler for Counter {
///     fn on_event(&self, event: &StowageEvent<'_>) {
///         if let StowageEvent::ArtifactCreated { .. } = event {
///             self.0.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
///         }
///     }
/// }
/// ```
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: &StowageEvent<'_>) {
        let _ = event;
    }
}

/// A handler that ignores every event.
pub struct NoopHandler;
impl EventHandler for NoopHandler {}

/// An event handler backed by a closure.
pub struct FnEventHandler<F>(F)
where
    F: Fn(&StowageEvent<'_>) + Send + Sync;

impl<F> FnEventHandler<F>
where
    F: Fn(&StowageEvent<'_>) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> EventHandler for FnEventHandler<F>
where
    F: Fn(&StowageEvent<'_>) + Send + Sync,
{
    fn on_event(&self, event: &StowageEvent<'_>) {
        (self.0)(event)
    }
}

/// An event handler that delegates to multiple inner handlers, in
/// registration order.
///
/// ```
/// use stowage::events::{CompositeEventHandler, LoggingHandler, NoopHandler};
///
/// let handler = CompositeEventHandler::new()
///     .with(LoggingHandler)
///     .with_if(false, NoopHandler);
/// assert_eq!(handler.len(), 1);
/// ```
pub struct CompositeEventHandler {
    handlers: Vec<Box<dyn EventHandler>>,
}

impl CompositeEventHandler {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    /// Add a handler to the chain.
    pub fn with(mut self, handler: impl EventHandler + 'static) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    /// Conditionally add a handler to the chain.
    pub fn with_if(self, condition: bool, handler: impl EventHandler + 'static) -> Self {
        if condition { self.with(handler) } else { self }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Default for CompositeEventHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHandler for CompositeEventHandler {
    fn on_event(&self, event: &StowageEvent<'_>) {
        for handler in &self.handlers {
            handler.on_event(event);
        }
    }
}

/// An event handler that logs events via `tracing`.
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn on_event(&self, event: &StowageEvent<'_>) {
        match event {
            StowageEvent::ArtifactCreated { artifact } => {
                debug!(
                    artifact_id = %artifact.artifact_id,
                    tool_call_id = %artifact.tool_call_id,
                    artifact_type = %artifact.artifact_type,
                    "Artifact created"
                );
            }
            StowageEvent::ArtifactReused { key } => {
                debug!("Artifact {key} already exists; reusing");
            }
            StowageEvent::ArtifactCreationFailed {
                artifact_id,
                tool_call_id,
                reason,
            } => {
                warn!(artifact_id, tool_call_id, "Artifact creation failed: {reason}");
            }
            StowageEvent::ParserWarning { message } => {
                warn!("Artifact marker dropped: {message}");
            }
            StowageEvent::ArtifactEnriched { key, name } => {
                debug!("Artifact {key} enriched as \"{name}\"");
            }
            StowageEvent::CompressionStarted {
                reason,
                message_count,
                estimated_tokens,
            } => {
                info!(
                    "Compression ({reason}) starting: {message_count} messages, ~{estimated_tokens} tokens"
                );
            }
            StowageEvent::Compression(record) => {
                info!(
                    "Context compression #{} ({}) archived {} artifact(s): ~{} -> ~{} tokens",
                    record.compression_number,
                    record.reason,
                    record.artifact_count,
                    record.tokens_before,
                    record.tokens_after,
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn composite_dispatches_to_all_handlers() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let a = seen.clone();
        let b = seen.clone();
        let handler = CompositeEventHandler::new()
            .with(FnEventHandler::new(move |e| {
                if let StowageEvent::ParserWarning { message } = e {
                    a.lock().unwrap().push(format!("a:{message}"));
                }
            }))
            .with(FnEventHandler::new(move |e| {
                if let StowageEvent::ParserWarning { message } = e {
                    b.lock().unwrap().push(format!("b:{message}"));
                }
            }));

        handler.on_event(&StowageEvent::ParserWarning { message: "x" });
        assert_eq!(*seen.lock().unwrap(), vec!["a:x", "b:x"]);
    }

    #[test]
    fn with_if_skips_when_false() {
        let handler = CompositeEventHandler::new()
            .with_if(false, NoopHandler)
            .with_if(true, LoggingHandler);
        assert_eq!(handler.len(), 1);
    }

    #[test]
    fn compression_event_serializes_reason_lowercase() {
        let record = CompressionEvent {
            reason: CompressionReason::Manual,
            message_count: 4,
            artifact_count: 2,
            tokens_before: 900,
            tokens_after: 120,
            compression_number: 1,
        };
        let v = serde_json::to_value(&record).unwrap();
        assert_eq!(v["reason"], "manual");
        assert_eq!(v["artifact_count"], 2);
    }

    #[test]
    fn logging_handler_accepts_every_variant() {
        let key = ArtifactKey::new("a", "c");
        let record = CompressionEvent {
            reason: CompressionReason::Automatic,
            message_count: 1,
            artifact_count: 0,
            tokens_before: 10,
            tokens_after: 5,
            compression_number: 2,
        };
        let h = LoggingHandler;
        h.on_event(&StowageEvent::ArtifactReused { key: &key });
        h.on_event(&StowageEvent::ArtifactEnriched {
            key: &key,
            name: "Title",
        });
        h.on_event(&StowageEvent::CompressionStarted {
            reason: CompressionReason::Automatic,
            message_count: 1,
            estimated_tokens: 10,
        });
        h.on_event(&StowageEvent::Compression(&record));
    }
}
