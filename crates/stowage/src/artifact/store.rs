//! The artifact store: extraction, caching, retrieval and persistence.
//!
//! One store serves one session. It owns a request-scoped cache of
//! artifacts it has created or loaded, and a bounded selector cache. The
//! durable [`Ledger`] is the only state shared with other sessions.
//!
//! Creation is serialized per [`ArtifactKey`]: two concurrent requests for
//! the same key produce one ledger row, and the second caller receives the
//! first caller's record. Requests for different keys never wait on each
//! other.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use serde_json::json;
//! use stowage::artifact::{ArtifactRequest, ArtifactScope, ArtifactStore};
//! use stowage::artifact::ledger::InMemoryLedger;
//! use stowage::artifact::tool_results::ToolResultStore;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let results = Arc::new(ToolResultStore::new());
//! results.record("s1", "call-1", "search", json!({"hits": [{"title": "Intro"}]}));
//!
//! let scope = ArtifactScope::new("tenant", "project", "ctx", "task", "s1");
//! let store = ArtifactStore::new(scope, Arc::new(InMemoryLedger::new()), results);
//!
//! let request = ArtifactRequest {
//!     artifact_id: "a1".into(),
//!     tool_call_id: "call-1".into(),
//!     artifact_type: "doc".into(),
//!     base_selector: "hits".into(),
//!     details_selector: Default::default(),
//! };
//! let artifact = store.create_artifact(&request).await.unwrap().unwrap();
//! assert_eq!(artifact.full_data, json!({"title": "Intro"}));
//! # }
//! ```

use super::cleanup::{clean_value, is_empty_value};
use super::ledger::{Ledger, LedgerQuery};
use super::registry::{ComponentSchemas, SchemaRegistry};
use super::schema;
use super::selector::SelectorCache;
use super::tool_results::ToolResultLookup;
use super::{
    Artifact, ArtifactKey, ArtifactMap, ArtifactRequest, ArtifactScope, PENDING_DESCRIPTION,
    PENDING_NAME,
};
use crate::config::StoreConfig;
use crate::error::{ArtifactError, LedgerError};
use crate::events::{EventHandler, NoopHandler, StowageEvent};
use chrono::Utc;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

// ── Enrichment collaborator ───────────────────────────────────────

/// A generated display name and description for an artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enrichment {
    pub name: String,
    pub description: String,
}

/// Boxed future returned by [`Enricher::enrich`].
pub type EnrichFuture<'a> = Pin<Box<dyn Future<Output = Option<Enrichment>> + Send + 'a>>;

/// Out-of-band producer of artifact names and descriptions (typically an
/// LLM call). `None` leaves the placeholders in place.
pub trait Enricher: Send + Sync {
    fn enrich<'a>(&'a self, artifact: &'a Artifact) -> EnrichFuture<'a>;
}

// ── Detached creation ─────────────────────────────────────────────

/// An artifact whose projections are known and cached, with its ledger
/// write possibly still in flight.
#[derive(Debug)]
pub struct DetachedArtifact {
    pub artifact: Artifact,
    /// `None` when the artifact was already cached and nothing was written.
    pub persistence: Option<PendingPersist>,
}

/// Handle to a spawned ledger write.
#[derive(Debug)]
pub struct PendingPersist {
    key: ArtifactKey,
    handle: JoinHandle<Result<Artifact, ArtifactError>>,
}

impl PendingPersist {
    pub fn key(&self) -> &ArtifactKey {
        &self.key
    }

    /// Wait for the write. Returns the stored record, which is the
    /// pre-existing one when the ledger already held this key.
    pub async fn wait(self) -> Result<Artifact, ArtifactError> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) => Err(ArtifactError::TaskJoin {
                artifact_id: self.key.artifact_id,
                message: e.to_string(),
            }),
        }
    }
}

// ── Store ─────────────────────────────────────────────────────────

type KeyLocks = HashMap<ArtifactKey, Arc<tokio::sync::Mutex<()>>>;

/// Held while writing one key.
struct KeyGuard {
    locks: Arc<Mutex<KeyLocks>>,
    key: ArtifactKey,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        // Only the map holds it: no writer is waiting.
        if locks
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.key);
        }
    }
}

/// Session-scoped artifact store. Cheap to clone; clones share caches.
#[derive(Clone)]
pub struct ArtifactStore {
    scope: ArtifactScope,
    ledger: Arc<dyn Ledger>,
    tool_results: Arc<dyn ToolResultLookup>,
    schemas: Arc<dyn ComponentSchemas>,
    selectors: Arc<SelectorCache>,
    cache: Arc<Mutex<ArtifactMap>>,
    key_locks: Arc<Mutex<KeyLocks>>,
    events: Arc<dyn EventHandler>,
    enricher: Option<Arc<dyn Enricher>>,
    config: StoreConfig,
}

impl ArtifactStore {
    /// Create a store with no component schemas, no enrichment and no
    /// event handler.
    pub fn new(
        scope: ArtifactScope,
        ledger: Arc<dyn Ledger>,
        tool_results: Arc<dyn ToolResultLookup>,
    ) -> Self {
        let config = StoreConfig::default();
        Self {
            scope,
            ledger,
            tool_results,
            schemas: Arc::new(SchemaRegistry::new()),
            selectors: Arc::new(SelectorCache::new(config.selector_cache_capacity)),
            cache: Arc::new(Mutex::new(HashMap::new())),
            key_locks: Arc::new(Mutex::new(HashMap::new())),
            events: Arc::new(NoopHandler),
            enricher: None,
            config,
        }
    }

    pub fn with_schemas(mut self, schemas: Arc<dyn ComponentSchemas>) -> Self {
        self.schemas = schemas;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventHandler>) -> Self {
        self.events = events;
        self
    }

    pub fn with_enricher(mut self, enricher: Arc<dyn Enricher>) -> Self {
        self.enricher = Some(enricher);
        self
    }

    /// Apply `config`. Resets the selector cache to the configured capacity.
    pub fn with_config(mut self, config: StoreConfig) -> Self {
        self.selectors = Arc::new(SelectorCache::new(config.selector_cache_capacity));
        self.config = config;
        self
    }

    pub fn scope(&self) -> &ArtifactScope {
        &self.scope
    }

    pub fn selectors(&self) -> &SelectorCache {
        &self.selectors
    }

    /// Number of artifacts in the request-scoped cache.
    pub fn cached_count(&self) -> usize {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    // ── Creation ──

    /// Create an artifact from the recorded result of `request.tool_call_id`.
    ///
    /// Returns `Ok(None)` when no tool result is recorded for the call. A
    /// second request for the same key returns the existing record. The
    /// only error is a failed ledger write.
    pub async fn create_artifact(
        &self,
        request: &ArtifactRequest,
    ) -> Result<Option<Artifact>, ArtifactError> {
        let key = request.key();
        let _guard = self.lock_key(&key).await;

        if let Some(existing) = self.cached(&key) {
            self.events.on_event(&StowageEvent::ArtifactReused { key: &key });
            return Ok(Some(existing));
        }
        let Some(artifact) = self.build_artifact(request) else {
            return Ok(None);
        };
        let stored = self.persist(artifact).await?;
        Ok(Some(stored))
    }

    /// Create an artifact without waiting for the ledger.
    ///
    /// Projections are computed and cached before this returns, so the
    /// caller can emit the preview immediately. The ledger write runs on a
    /// spawned task; the returned [`PendingPersist`] surfaces its outcome.
    /// Must be called from within a Tokio runtime.
    pub fn create_artifact_detached(&self, request: &ArtifactRequest) -> Option<DetachedArtifact> {
        let key = request.key();
        if let Some(existing) = self.cached(&key) {
            self.events.on_event(&StowageEvent::ArtifactReused { key: &key });
            return Some(DetachedArtifact {
                artifact: existing,
                persistence: None,
            });
        }
        let artifact = self.build_artifact(request)?;
        self.cache_insert(artifact.clone());

        let store = self.clone();
        let pending = artifact.clone();
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            let _guard = store.lock_key(&task_key).await;
            store.persist(pending).await
        });
        Some(DetachedArtifact {
            artifact,
            persistence: Some(PendingPersist { key, handle }),
        })
    }

    /// Persist an artifact whose projections were computed by the caller.
    ///
    /// When a schema is registered for the artifact's type, the summary and
    /// full views are filtered through it first. A key the ledger already
    /// holds counts as success and returns the stored record.
    pub async fn save_artifact(&self, mut artifact: Artifact) -> Result<Artifact, ArtifactError> {
        if let Some(schema) = self.schemas.lookup(&artifact.artifact_type) {
            let projection = schema::project(&schema);
            let no_overrides = HashMap::new();
            let summary = schema::extract(
                &artifact.summary_data,
                &projection.preview_schema,
                &no_overrides,
                &self.selectors,
            );
            let full = schema::extract(
                &artifact.full_data,
                &projection.full_schema,
                &no_overrides,
                &self.selectors,
            );
            artifact.summary_data = Value::Object(summary);
            let full = Value::Object(full);
            if !is_empty_value(&full) {
                artifact.full_data = full;
            }
        }
        clean_value(&mut artifact.summary_data);
        clean_value(&mut artifact.full_data);

        let key = artifact.key();
        let _guard = self.lock_key(&key).await;
        self.persist(artifact).await
    }

    // ── Retrieval ──

    /// The summary view of an artifact: cache, then `hint`, then ledger.
    ///
    /// Ledger failures are logged and reported as not found.
    pub async fn get_artifact_summary(
        &self,
        artifact_id: &str,
        tool_call_id: &str,
        hint: Option<&ArtifactMap>,
    ) -> Option<Artifact> {
        self.resolve(artifact_id, tool_call_id, hint)
            .await
            .map(|a| a.summary_view())
    }

    /// The full artifact, resolved like
    /// [`get_artifact_summary`](Self::get_artifact_summary).
    pub async fn get_artifact_full(
        &self,
        artifact_id: &str,
        tool_call_id: &str,
        hint: Option<&ArtifactMap>,
    ) -> Option<Artifact> {
        self.resolve(artifact_id, tool_call_id, hint).await
    }

    /// Every artifact under `context_id`, across all of its tasks.
    ///
    /// Tasks whose artifacts fail to load are skipped.
    pub async fn get_context_artifacts(&self, context_id: &str) -> ArtifactMap {
        let scopes = self.scope.ledger_scopes();
        let mut out = ArtifactMap::new();
        let task_ids = match self.ledger.task_ids(&scopes, context_id).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(context_id, error = %e, "Failed to list tasks for context");
                return out;
            }
        };
        for task_id in task_ids {
            let query = LedgerQuery::Task(task_id.clone());
            match self.ledger.query(&scopes, &query).await {
                Ok(artifacts) => {
                    for artifact in artifacts {
                        out.insert(artifact.key(), artifact);
                    }
                }
                Err(e) => warn!(context_id, task_id, error = %e, "Skipping task artifacts"),
            }
        }
        debug!(context_id, count = out.len(), "Loaded context artifacts");
        out
    }

    // ── Enrichment ──

    /// Replace an artifact's name and description in the cache and ledger.
    ///
    /// Returns `Ok(None)` when the artifact is unknown.
    pub async fn apply_enrichment(
        &self,
        key: &ArtifactKey,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Result<Option<Artifact>, ArtifactError> {
        let Some(mut artifact) = self.resolve(&key.artifact_id, &key.tool_call_id, None).await
        else {
            return Ok(None);
        };
        artifact.name = name.into();
        artifact.description = description.into();

        let scopes = self.scope.ledger_scopes();
        self.ledger
            .update(&scopes, &self.scope.context_id, &artifact)
            .await
            .map_err(|source| ArtifactError::Enrichment {
                artifact_id: key.artifact_id.clone(),
                source,
            })?;
        self.cache_insert(artifact.clone());
        self.events.on_event(&StowageEvent::ArtifactEnriched {
            key,
            name: &artifact.name,
        });
        Ok(Some(artifact))
    }

    fn spawn_enrichment(&self, artifact: Artifact) {
        let Some(enricher) = self.enricher.clone() else {
            return;
        };
        let store = self.clone();
        tokio::spawn(async move {
            let Some(enrichment) = enricher.enrich(&artifact).await else {
                debug!(artifact_id = %artifact.artifact_id, "Enricher returned nothing");
                return;
            };
            if let Err(e) = store
                .apply_enrichment(&artifact.key(), enrichment.name, enrichment.description)
                .await
            {
                warn!("{e}");
            }
        });
    }

    // ── Internals ──

    /// Serialize writes for one key. The map entry is dropped with the last
    /// guard for the key.
    async fn lock_key(&self, key: &ArtifactKey) -> KeyGuard {
        let lock = {
            let mut locks = self.key_locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.entry(key.clone()).or_default().clone()
        };
        let guard = lock.lock_owned().await;
        KeyGuard {
            locks: self.key_locks.clone(),
            key: key.clone(),
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    fn key_lock_count(&self) -> usize {
        self.key_locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn cached(&self, key: &ArtifactKey) -> Option<Artifact> {
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    fn cache_insert(&self, artifact: Artifact) {
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(artifact.key(), artifact);
    }

    async fn resolve(
        &self,
        artifact_id: &str,
        tool_call_id: &str,
        hint: Option<&ArtifactMap>,
    ) -> Option<Artifact> {
        let key = ArtifactKey::new(artifact_id, tool_call_id);
        if let Some(hit) = self.cached(&key) {
            return Some(hit);
        }
        if let Some(hit) = hint.and_then(|map| map.get(&key)) {
            return Some(hit.clone());
        }
        let query = LedgerQuery::Artifact {
            artifact_id: artifact_id.to_string(),
            tool_call_id: Some(tool_call_id.to_string()),
        };
        match self.ledger.query(&self.scope.ledger_scopes(), &query).await {
            Ok(found) => {
                let artifact = found.into_iter().next()?;
                self.cache_insert(artifact.clone());
                Some(artifact)
            }
            Err(e) => {
                warn!(artifact_id, tool_call_id, error = %e, "Ledger read failed; treating as not found");
                None
            }
        }
    }

    /// Write to the ledger and cache the stored record. The caller holds
    /// the key lock.
    async fn persist(&self, artifact: Artifact) -> Result<Artifact, ArtifactError> {
        let scopes = self.scope.ledger_scopes();
        let stored = match self
            .ledger
            .upsert(&scopes, &self.scope.context_id, &artifact)
            .await
        {
            Ok(outcome) if outcome.created => {
                self.events
                    .on_event(&StowageEvent::ArtifactCreated { artifact: &artifact });
                if self.config.enrich && artifact.is_pending() {
                    self.spawn_enrichment(artifact.clone());
                }
                artifact
            }
            Ok(outcome) => {
                let key = artifact.key();
                self.events.on_event(&StowageEvent::ArtifactReused { key: &key });
                outcome.existing.unwrap_or(artifact)
            }
            Err(LedgerError::AlreadyExists) => {
                let key = artifact.key();
                self.events.on_event(&StowageEvent::ArtifactReused { key: &key });
                artifact
            }
            Err(source) => {
                let reason = source.to_string();
                self.events.on_event(&StowageEvent::ArtifactCreationFailed {
                    artifact_id: &artifact.artifact_id,
                    tool_call_id: &artifact.tool_call_id,
                    reason: &reason,
                });
                // Never serve an unpersisted record from the cache.
                self.cache
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&artifact.key());
                return Err(ArtifactError::Creation {
                    artifact_id: artifact.artifact_id,
                    source,
                });
            }
        };
        self.cache_insert(stored.clone());
        Ok(stored)
    }

    fn build_artifact(&self, request: &ArtifactRequest) -> Option<Artifact> {
        let Some(raw) = self
            .tool_results
            .get(&self.scope.session_id, &request.tool_call_id)
        else {
            warn!(
                artifact_id = %request.artifact_id,
                tool_call_id = %request.tool_call_id,
                "Tool result not found; artifact not created"
            );
            return None;
        };
        let (mut summary_data, mut full_data) = self.project_request(request, &raw);
        clean_value(&mut summary_data);
        clean_value(&mut full_data);

        Some(Artifact {
            artifact_id: request.artifact_id.clone(),
            tool_call_id: request.tool_call_id.clone(),
            name: PENDING_NAME.to_string(),
            description: PENDING_DESCRIPTION.to_string(),
            artifact_type: request.artifact_type.clone(),
            summary_data,
            full_data,
            task_id: self.scope.task_id.clone(),
            metadata: Map::new(),
            created_at: Utc::now(),
        })
    }

    /// Derive `(summary, full)` for a request from the raw tool result.
    fn project_request(&self, request: &ArtifactRequest, raw: &Value) -> (Value, Value) {
        let selected = self.select_base(request, raw);

        let (summary, full) = match self.schemas.lookup(&request.artifact_type) {
            Some(component) => {
                let projection = schema::project(&component);
                let summary = schema::extract(
                    &selected,
                    &projection.preview_schema,
                    &request.details_selector,
                    &self.selectors,
                );
                let full = schema::extract(
                    &selected,
                    &projection.full_schema,
                    &request.details_selector,
                    &self.selectors,
                );
                (Value::Object(summary), Value::Object(full))
            }
            None => (selected.clone(), selected.clone()),
        };

        if is_empty_value(&full) {
            debug!(
                artifact_id = %request.artifact_id,
                "Projection is empty; keeping the base selection"
            );
            let mut fallback = Map::new();
            fallback.insert(request.base_selector.clone(), selected);
            return (summary, Value::Object(fallback));
        }
        (summary, full)
    }

    /// Evaluate the base selector. Arrays yield their first element; an
    /// empty array, a miss or a selector error yields `{}`.
    fn select_base(&self, request: &ArtifactRequest, raw: &Value) -> Value {
        let selected = match self.selectors.search(&request.base_selector, raw) {
            Ok(value) => value,
            Err(e) => {
                warn!(
                    artifact_id = %request.artifact_id,
                    error = %e,
                    "Base selector failed; using an empty selection"
                );
                Value::Null
            }
        };
        let selected = match selected {
            Value::Array(items) => items.into_iter().next().unwrap_or(Value::Null),
            other => other,
        };
        if selected.is_null() {
            Value::Object(Map::new())
        } else {
            selected
        }
    }
}
