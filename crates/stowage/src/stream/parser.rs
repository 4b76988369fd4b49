//! The tag parser: artifact markers in, [`StreamPart`]s out.
//!
//! [`TagParser::parse_text`] handles complete text. Create markers are
//! resolved first, each through
//! [`ArtifactStore::create_artifact_detached`], so a reference later in the
//! same text can point at an artifact created earlier in it. Markers are
//! then replaced in document order with [`ArtifactPart`] data parts.
//!
//! A marker that cannot be honored (missing attributes, no tool result, an
//! unknown reference) is cut from the output and recorded as a warning.
//! Raw marker text never reaches the stream.
//!
//! Ledger writes started by create markers run in the background. Call
//! [`TagParser::flush_pending`] once the response is finished; it is the
//! only place a persistence failure surfaces.

use super::markers::{self, MarkerKind, ReferenceDirective};
use super::{ArtifactPart, PartsBuilder, StreamPart};
use crate::artifact::store::PendingPersist;
use crate::artifact::{Artifact, ArtifactMap, ArtifactRequest, ArtifactStore};
use crate::error::ArtifactError;
use crate::events::{EventHandler, NoopHandler, StowageEvent};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// What a structured output object represents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComponentShape {
    /// Not an artifact component; passed through unchanged.
    Unknown,
    Reference(ReferenceDirective),
    Create(ArtifactRequest),
}

impl ComponentShape {
    /// Classify `obj` by its fields. Fields may sit at the top level or
    /// under `props`.
    ///
    /// - create: `id`, `tool_call_id`, `type`, `base_selector` (plus an
    ///   optional `details_selector` object)
    /// - reference: `artifact_id`, `tool_call_id`
    pub fn classify(obj: &Value) -> Self {
        let props = obj.get("props").filter(|p| p.is_object()).unwrap_or(obj);
        let field = |name: &str| {
            props
                .get(name)
                .and_then(Value::as_str)
                .filter(|s| !s.trim().is_empty())
        };

        if let (Some(id), Some(tool), Some(ty), Some(base)) = (
            field("id"),
            field("tool_call_id"),
            field("type"),
            field("base_selector"),
        ) {
            let details_selector = props
                .get("details_selector")
                .and_then(Value::as_object)
                .map(|m| {
                    m.iter()
                        .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                        .collect()
                })
                .unwrap_or_default();
            return Self::Create(ArtifactRequest {
                artifact_id: id.to_string(),
                tool_call_id: tool.to_string(),
                artifact_type: ty.to_string(),
                base_selector: base.to_string(),
                details_selector,
            });
        }
        if let (Some(id), Some(tool)) = (field("artifact_id"), field("tool_call_id")) {
            return Self::Reference(ReferenceDirective {
                artifact_id: id.to_string(),
                tool_call_id: tool.to_string(),
            });
        }
        Self::Unknown
    }
}

/// Rewrites model output around artifact markers for one response.
pub struct TagParser {
    store: ArtifactStore,
    events: Arc<dyn EventHandler>,
    pending: Mutex<Vec<PendingPersist>>,
    warnings: Mutex<Vec<String>>,
}

impl TagParser {
    pub fn new(store: ArtifactStore) -> Self {
        Self {
            store,
            events: Arc::new(NoopHandler),
            pending: Mutex::new(Vec::new()),
            warnings: Mutex::new(Vec::new()),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventHandler>) -> Self {
        self.events = events;
        self
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    // ── Scanning ──

    /// Whether `text` contains at least one complete marker.
    pub fn has_artifact_markers(&self, text: &str) -> bool {
        !markers::scan(text).markers.is_empty()
    }

    /// Whether `text` ends inside a marker that has not been closed yet.
    pub fn has_incomplete_artifact(&self, text: &str) -> bool {
        markers::scan(text).incomplete.is_some()
    }

    /// Byte offset up to which `text` can be flushed without splitting a
    /// marker. Equal to `text.len()` when nothing is pending.
    pub fn find_safe_text_boundary(&self, text: &str) -> usize {
        markers::scan(text).safe_boundary(text.len())
    }

    // ── Parsing ──

    /// Replace every marker in `text` with a data part.
    ///
    /// `hint` is a pre-fetched artifact batch consulted before the ledger
    /// when resolving references. `text` is taken as finished: a create
    /// opening tag without its closing tag is a marker on its own, an
    /// unterminated tag at the end is cut, and a bare prefix such as
    /// `<arti` stays as text.
    pub async fn parse_text(
        &self,
        text: &str,
        hint: Option<&ArtifactMap>,
        source_agent_id: Option<&str>,
    ) -> Vec<StreamPart> {
        let scan = markers::scan_complete(text);
        let mut resolved: Vec<Option<StreamPart>> = vec![None; scan.markers.len()];

        for (i, marker) in scan.markers.iter().enumerate() {
            if marker.kind != MarkerKind::Create {
                continue;
            }
            resolved[i] = match marker.create_request() {
                Ok(request) => self.create_part(&request, source_agent_id),
                Err(missing) => {
                    self.warn(format!(
                        "artifact:create is missing required attributes: {}",
                        missing.join(", ")
                    ));
                    None
                }
            };
        }
        for (i, marker) in scan.markers.iter().enumerate() {
            if marker.kind != MarkerKind::Reference {
                continue;
            }
            resolved[i] = match marker.reference() {
                Ok(reference) => self.reference_part(&reference, hint, source_agent_id).await,
                Err(missing) => {
                    self.warn(format!(
                        "artifact:ref is missing required attributes: {}",
                        missing.join(", ")
                    ));
                    None
                }
            };
        }

        let mut out = PartsBuilder::default();
        let mut cursor = 0;
        for (marker, part) in scan.markers.iter().zip(resolved) {
            out.push_text(text.get(cursor..marker.span.start).unwrap_or_default());
            if let Some(part) = part {
                out.push_part(part);
            }
            cursor = marker.span.end;
        }
        let tail_end = match scan.incomplete {
            Some(incomplete) if incomplete.opened => {
                self.warn(format!(
                    "unterminated artifact marker at byte {}",
                    incomplete.from
                ));
                incomplete.from
            }
            _ => text.len(),
        };
        out.push_text(text.get(cursor..tail_end).unwrap_or_default());
        out.finish()
    }

    /// Structural counterpart of [`parse_text`](Self::parse_text) for one
    /// object of structured output.
    ///
    /// Unknown shapes pass through as a data part. A recognized shape that
    /// cannot be honored yields `None`.
    pub async fn parse_object(
        &self,
        obj: &Value,
        hint: Option<&ArtifactMap>,
        source_agent_id: Option<&str>,
    ) -> Option<StreamPart> {
        match ComponentShape::classify(obj) {
            ComponentShape::Unknown => Some(StreamPart::data(obj.clone())),
            ComponentShape::Create(request) => self.create_part(&request, source_agent_id),
            ComponentShape::Reference(reference) => {
                self.reference_part(&reference, hint, source_agent_id).await
            }
        }
    }

    // ── Persistence and warnings ──

    /// Wait for every background ledger write started so far.
    ///
    /// All writes are awaited even if one fails; the first failure is
    /// returned.
    pub async fn flush_pending(&self) -> Result<Vec<Artifact>, ArtifactError> {
        let pending = std::mem::take(&mut *self.pending.lock().unwrap_or_else(|e| e.into_inner()));
        let outcomes =
            futures::future::join_all(pending.into_iter().map(PendingPersist::wait)).await;
        let mut stored = Vec::with_capacity(outcomes.len());
        let mut first_error = None;
        for outcome in outcomes {
            match outcome {
                Ok(artifact) => stored.push(artifact),
                Err(e) => {
                    warn!(artifact_id = e.artifact_id(), "{e}");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(stored),
        }
    }

    /// Number of background ledger writes not yet flushed.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Drain the aggregated warnings.
    pub fn take_warnings(&self) -> Vec<String> {
        std::mem::take(&mut *self.warnings.lock().unwrap_or_else(|e| e.into_inner()))
    }

    fn warn(&self, message: String) {
        debug!("{message}");
        self.events
            .on_event(&StowageEvent::ParserWarning { message: &message });
        self.warnings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message);
    }

    fn create_part(
        &self,
        request: &ArtifactRequest,
        source_agent_id: Option<&str>,
    ) -> Option<StreamPart> {
        let Some(detached) = self.store.create_artifact_detached(request) else {
            let reason = "no tool result recorded for this call";
            self.events.on_event(&StowageEvent::ArtifactCreationFailed {
                artifact_id: &request.artifact_id,
                tool_call_id: &request.tool_call_id,
                reason,
            });
            self.warn(format!(
                "artifact {} not created: {reason} ({})",
                request.artifact_id, request.tool_call_id
            ));
            return None;
        };
        if let Some(write) = detached.persistence {
            self.pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(write);
        }
        Some(ArtifactPart::from_artifact(&detached.artifact, source_agent_id).into_part())
    }

    async fn reference_part(
        &self,
        reference: &ReferenceDirective,
        hint: Option<&ArtifactMap>,
        source_agent_id: Option<&str>,
    ) -> Option<StreamPart> {
        match self
            .store
            .get_artifact_summary(&reference.artifact_id, &reference.tool_call_id, hint)
            .await
        {
            Some(artifact) => Some(ArtifactPart::from_artifact(&artifact, source_agent_id).into_part()),
            None => {
                self.warn(format!(
                    "artifact {}@{} not found",
                    reference.artifact_id, reference.tool_call_id
                ));
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ArtifactScope;
    use crate::artifact::ledger::InMemoryLedger;
    use crate::artifact::tool_results::ToolResultStore;
    use crate::stream::collect_text;
    use serde_json::json;

    fn parser() -> (TagParser, Arc<InMemoryLedger>) {
        let ledger = Arc::new(InMemoryLedger::new());
        let results = Arc::new(ToolResultStore::new());
        results.record(
            "s1",
            "call_1",
            "search",
            json!({"results": [{"title": "Intro", "body": "..."}]}),
        );
        let scope = ArtifactScope::new("t", "p", "ctx", "task", "s1");
        let store = ArtifactStore::new(scope, ledger.clone(), results);
        (TagParser::new(store), ledger)
    }

    const CREATE: &str =
        r#"<artifact:create id="hits" tool="call_1" type="doc" base="results" />"#;
    const REF: &str = r#"<artifact:ref id="hits" tool="call_1" />"#;

    #[tokio::test]
    async fn plain_text_is_one_part() {
        let (p, _) = parser();
        let parts = p.parse_text("just text", None, None).await;
        assert_eq!(parts, vec![StreamPart::text("just text")]);
        assert!(p.parse_text("", None, None).await.is_empty());
    }

    #[tokio::test]
    async fn create_then_ref_in_one_text() {
        let (p, ledger) = parser();
        let text = format!("Found: {CREATE} and again {REF}.");
        let parts = p.parse_text(&text, None, Some("agent-1")).await;

        assert_eq!(parts.len(), 5);
        assert_eq!(parts[0], StreamPart::text("Found: "));
        let payload = parts[1].as_data().unwrap();
        assert_eq!(payload["artifactId"], "hits");
        assert_eq!(payload["artifactSummary"]["title"], "Intro");
        assert_eq!(payload["sourceAgentId"], "agent-1");
        assert_eq!(parts[2], StreamPart::text(" and again "));
        assert_eq!(parts[3].as_data().unwrap()["artifactId"], "hits");
        assert_eq!(parts[4], StreamPart::text("."));

        assert_eq!(p.flush_pending().await.unwrap().len(), 1);
        assert_eq!(ledger.row_count(), 1);
        assert!(p.take_warnings().is_empty());
    }

    #[tokio::test]
    async fn invalid_create_is_excised_with_warning() {
        let (p, _) = parser();
        let text = r#"before <artifact:create id="x" tool="call_1" /> after"#;
        let parts = p.parse_text(text, None, None).await;
        assert_eq!(parts, vec![StreamPart::text("before  after")]);
        let warnings = p.take_warnings();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("type, base"));
    }

    #[tokio::test]
    async fn create_without_tool_result_is_excised() {
        let (p, _) = parser();
        let text = r#"a<artifact:create id="x" tool="missing" type="doc" base="@" />b"#;
        let parts = p.parse_text(text, None, None).await;
        assert_eq!(parts, vec![StreamPart::text("ab")]);
        assert_eq!(p.pending_count(), 0);
        assert_eq!(p.take_warnings().len(), 1);
    }

    #[tokio::test]
    async fn unknown_reference_is_excised() {
        let (p, _) = parser();
        let parts = p.parse_text(&format!("{REF}tail"), None, None).await;
        assert_eq!(parts, vec![StreamPart::text("tail")]);
        assert!(p.take_warnings()[0].contains("not found"));
    }

    #[tokio::test]
    async fn reference_resolves_from_hint() {
        let (p, _) = parser();
        let artifact = Artifact {
            artifact_id: "hits".into(),
            tool_call_id: "call_1".into(),
            name: "Hits".into(),
            description: "d".into(),
            artifact_type: "doc".into(),
            summary_data: json!({"title": "From hint"}),
            full_data: json!({}),
            task_id: "task".into(),
            metadata: Default::default(),
            created_at: chrono::Utc::now(),
        };
        let hint = ArtifactMap::from([(artifact.key(), artifact)]);
        let parts = p.parse_text(REF, Some(&hint), None).await;
        assert_eq!(parts[0].as_data().unwrap()["name"], "Hits");
    }

    #[tokio::test]
    async fn unterminated_marker_is_cut_but_prefix_is_text() {
        let (p, _) = parser();
        let parts = p
            .parse_text(r#"end <artifact:ref id="hits"#, None, None)
            .await;
        assert_eq!(collect_text(&parts), "end ");
        let parts = p.parse_text("a <arti", None, None).await;
        assert_eq!(collect_text(&parts), "a <arti");
    }

    #[tokio::test]
    async fn unclosed_create_keeps_the_rest_of_the_answer() {
        let (p, ledger) = parser();
        let text = r#"Intro <artifact:create id="hits" tool="call_1" type="doc" base="results"> and the rest of the answer."#;
        let parts = p.parse_text(text, None, None).await;

        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], StreamPart::text("Intro "));
        assert_eq!(parts[1].as_data().unwrap()["artifactId"], "hits");
        assert_eq!(parts[2], StreamPart::text(" and the rest of the answer."));
        p.flush_pending().await.unwrap();
        assert_eq!(ledger.row_count(), 1);
        assert!(p.take_warnings().is_empty());
    }

    #[tokio::test]
    async fn boundary_queries() {
        let (p, _) = parser();
        assert!(p.has_artifact_markers(REF));
        assert!(!p.has_artifact_markers("<artifact:ref id="));
        assert!(p.has_incomplete_artifact("x <artifact:cr"));
        assert_eq!(p.find_safe_text_boundary("abc <artifact:"), 4);
        assert_eq!(p.find_safe_text_boundary("abc"), 3);
    }

    #[test]
    fn classify_shapes() {
        assert_eq!(
            ComponentShape::classify(&json!({"artifact_id": "a", "tool_call_id": "c"})),
            ComponentShape::Reference(ReferenceDirective {
                artifact_id: "a".into(),
                tool_call_id: "c".into()
            })
        );
        let create = ComponentShape::classify(&json!({
            "name": "ArtifactCreate",
            "props": {
                "id": "a", "tool_call_id": "c", "type": "doc", "base_selector": "results",
                "details_selector": {"title": "meta.name"}
            }
        }));
        match create {
            ComponentShape::Create(req) => {
                assert_eq!(req.base_selector, "results");
                assert_eq!(req.details_selector["title"], "meta.name");
            }
            other => panic!("expected create, got {other:?}"),
        }
        assert_eq!(
            ComponentShape::classify(&json!({"artifact_id": "a"})),
            ComponentShape::Unknown
        );
    }

    #[tokio::test]
    async fn parse_object_passes_unknown_through() {
        let (p, _) = parser();
        let obj = json!({"chart": [1, 2, 3]});
        assert_eq!(
            p.parse_object(&obj, None, None).await,
            Some(StreamPart::data(obj.clone()))
        );
        let create = json!({"id": "hits", "tool_call_id": "call_1", "type": "doc", "base_selector": "results"});
        let part = p.parse_object(&create, None, None).await.unwrap();
        assert_eq!(part.as_data().unwrap()["artifactSummary"]["title"], "Intro");
        let missing = json!({"artifact_id": "nope", "tool_call_id": "call_1"});
        assert!(p.parse_object(&missing, None, None).await.is_none());
    }

    #[tokio::test]
    async fn flush_pending_surfaces_ledger_failure() {
        let (p, ledger) = parser();
        ledger.set_writes_failing(true);
        let parts = p.parse_text(CREATE, None, None).await;
        // The preview is emitted before persistence completes.
        assert_eq!(parts.len(), 1);
        let err = p.flush_pending().await.unwrap_err();
        assert_eq!(err.artifact_id(), "hits");
        assert_eq!(p.pending_count(), 0);
    }
}
