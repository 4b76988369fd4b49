//! Durable artifact persistence.
//!
//! The [`Ledger`] is the single source of truth shared across sessions. Its
//! writes must be safe under concurrency: an upsert for a key that already
//! exists reports the existing row instead of failing, and the store treats
//! that as success.
//!
//! Two implementations ship with the crate:
//! - [`InMemoryLedger`] — process-local, with switchable failure modes for
//!   exercising the store's degradation paths.
//! - [`FileLedger`] — one JSON file per artifact, written atomically.

use super::{Artifact, ArtifactKey};
use crate::error::LedgerError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, warn};

/// Boxed future returned by [`Ledger`] methods.
pub type LedgerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, LedgerError>> + Send + 'a>>;

/// Tenant/project partition of the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerScopes {
    pub tenant_id: String,
    pub project_id: String,
}

/// What to read back from the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerQuery {
    /// Every artifact written for one unit of work.
    Task(String),
    /// One artifact id, optionally narrowed to a tool call.
    Artifact {
        artifact_id: String,
        tool_call_id: Option<String>,
    },
    /// Every artifact under a conversation.
    Context(String),
}

/// Result of [`Ledger::upsert`].
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertOutcome {
    /// `false` when a row with the same key already existed.
    pub created: bool,
    /// The stored row when `created` is `false`.
    pub existing: Option<Artifact>,
}

impl UpsertOutcome {
    pub fn created() -> Self {
        Self {
            created: true,
            existing: None,
        }
    }

    pub fn existing(artifact: Artifact) -> Self {
        Self {
            created: false,
            existing: Some(artifact),
        }
    }
}

/// Durable artifact storage.
///
/// Uses boxed futures so the trait stays dyn-compatible.
pub trait Ledger: Send + Sync {
    /// Insert `artifact` under `context_id` unless its key already exists.
    fn upsert<'a>(
        &'a self,
        scopes: &'a LedgerScopes,
        context_id: &'a str,
        artifact: &'a Artifact,
    ) -> LedgerFuture<'a, UpsertOutcome>;

    /// Overwrite an existing row (used for name/description enrichment).
    fn update<'a>(
        &'a self,
        scopes: &'a LedgerScopes,
        context_id: &'a str,
        artifact: &'a Artifact,
    ) -> LedgerFuture<'a, ()>;

    fn query<'a>(
        &'a self,
        scopes: &'a LedgerScopes,
        query: &'a LedgerQuery,
    ) -> LedgerFuture<'a, Vec<Artifact>>;

    /// Ids of every unit of work that has artifacts under `context_id`.
    fn task_ids<'a>(
        &'a self,
        scopes: &'a LedgerScopes,
        context_id: &'a str,
    ) -> LedgerFuture<'a, Vec<String>>;
}

fn matches_query(context_id: &str, artifact: &Artifact, query: &LedgerQuery) -> bool {
    match query {
        LedgerQuery::Task(task_id) => &artifact.task_id == task_id,
        LedgerQuery::Artifact {
            artifact_id,
            tool_call_id,
        } => {
            &artifact.artifact_id == artifact_id
                && tool_call_id
                    .as_ref()
                    .is_none_or(|id| &artifact.tool_call_id == id)
        }
        LedgerQuery::Context(id) => context_id == id,
    }
}

// ── InMemoryLedger ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Row {
    scopes: LedgerScopes,
    context_id: String,
    artifact: Artifact,
}

/// Process-local ledger.
///
/// [`set_reads_failing`](Self::set_reads_failing) and
/// [`set_writes_failing`](Self::set_writes_failing) make every subsequent
/// read or write return [`LedgerError::Unavailable`].
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    rows: Mutex<Vec<Row>>,
    reads_failing: AtomicBool,
    writes_failing: AtomicBool,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_reads_failing(&self, failing: bool) {
        self.reads_failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_writes_failing(&self, failing: bool) {
        self.writes_failing.store(failing, Ordering::SeqCst);
    }

    /// Number of stored rows across all scopes.
    pub fn row_count(&self) -> usize {
        self.rows.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Every stored artifact, in insertion order.
    pub fn artifacts(&self) -> Vec<Artifact> {
        self.rows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|r| r.artifact.clone())
            .collect()
    }

    fn check(&self, flag: &AtomicBool, op: &str) -> Result<(), LedgerError> {
        if flag.load(Ordering::SeqCst) {
            Err(LedgerError::Unavailable(format!("{op} rejected")))
        } else {
            Ok(())
        }
    }
}

impl Ledger for InMemoryLedger {
    fn upsert<'a>(
        &'a self,
        scopes: &'a LedgerScopes,
        context_id: &'a str,
        artifact: &'a Artifact,
    ) -> LedgerFuture<'a, UpsertOutcome> {
        Box::pin(async move {
            self.check(&self.writes_failing, "write")?;
            let mut rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
            let key = artifact.key();
            if let Some(row) = rows
                .iter()
                .find(|r| &r.scopes == scopes && r.artifact.key() == key)
            {
                return Ok(UpsertOutcome::existing(row.artifact.clone()));
            }
            rows.push(Row {
                scopes: scopes.clone(),
                context_id: context_id.to_string(),
                artifact: artifact.clone(),
            });
            Ok(UpsertOutcome::created())
        })
    }

    fn update<'a>(
        &'a self,
        scopes: &'a LedgerScopes,
        context_id: &'a str,
        artifact: &'a Artifact,
    ) -> LedgerFuture<'a, ()> {
        Box::pin(async move {
            self.check(&self.writes_failing, "write")?;
            let mut rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
            let key = artifact.key();
            match rows
                .iter_mut()
                .find(|r| &r.scopes == scopes && r.artifact.key() == key)
            {
                Some(row) => row.artifact = artifact.clone(),
                None => rows.push(Row {
                    scopes: scopes.clone(),
                    context_id: context_id.to_string(),
                    artifact: artifact.clone(),
                }),
            }
            Ok(())
        })
    }

    fn query<'a>(
        &'a self,
        scopes: &'a LedgerScopes,
        query: &'a LedgerQuery,
    ) -> LedgerFuture<'a, Vec<Artifact>> {
        Box::pin(async move {
            self.check(&self.reads_failing, "read")?;
            let rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
            Ok(rows
                .iter()
                .filter(|r| &r.scopes == scopes && matches_query(&r.context_id, &r.artifact, query))
                .map(|r| r.artifact.clone())
                .collect())
        })
    }

    fn task_ids<'a>(
        &'a self,
        scopes: &'a LedgerScopes,
        context_id: &'a str,
    ) -> LedgerFuture<'a, Vec<String>> {
        Box::pin(async move {
            self.check(&self.reads_failing, "read")?;
            let rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
            let mut ids: Vec<String> = Vec::new();
            for row in rows
                .iter()
                .filter(|r| &r.scopes == scopes && r.context_id == context_id)
            {
                if !ids.contains(&row.artifact.task_id) {
                    ids.push(row.artifact.task_id.clone());
                }
            }
            Ok(ids)
        })
    }
}

// ── FileLedger ─────────────────────────────────────────────────────

/// Ledger backed by a directory tree of JSON files.
///
/// Directory layout:
/// ```text
/// root/
///   <tenant>/<project>/
///     <context>/
///       <task>/
///         <artifact_id>.<tool_call_id>.json
/// ```
///
/// Every segment is percent-encoded ([`encode_component`]), so distinct ids
/// never share a path. Each record is written to a per-writer temp file and
/// then published: an upsert hard-links it into place, which fails for all
/// but one concurrent creator; an update renames over the old record.
/// Readers never observe a partial record.
#[derive(Debug, Clone)]
pub struct FileLedger {
    root: PathBuf,
}

impl FileLedger {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn scope_dir(&self, scopes: &LedgerScopes) -> PathBuf {
        self.root
            .join(encode_component(&scopes.tenant_id))
            .join(encode_component(&scopes.project_id))
    }

    fn record_path(&self, scopes: &LedgerScopes, context_id: &str, artifact: &Artifact) -> PathBuf {
        self.scope_dir(scopes)
            .join(encode_component(context_id))
            .join(encode_component(&artifact.task_id))
            .join(record_filename(&artifact.key()))
    }

    /// Write `artifact` to a temp file beside `path` that no other writer
    /// shares.
    async fn write_temp(path: &Path, artifact: &Artifact) -> Result<PathBuf, LedgerError> {
        static SEQ: AtomicU64 = AtomicU64::new(0);
        let dir = path
            .parent()
            .ok_or_else(|| LedgerError::Unavailable(format!("no parent for {}", path.display())))?;
        tokio::fs::create_dir_all(dir).await?;
        let tmp = dir.join(format!(
            ".{}.{}.{}.tmp",
            path.file_name().and_then(|n| n.to_str()).unwrap_or("record"),
            std::process::id(),
            SEQ.fetch_add(1, Ordering::Relaxed),
        ));
        let json = serde_json::to_string_pretty(artifact)?;
        tokio::fs::write(&tmp, json).await?;
        Ok(tmp)
    }

    /// Publish `artifact` at `path` unless a record is already there.
    /// Returns `false` when another writer got there first.
    async fn create_exclusive(path: &Path, artifact: &Artifact) -> Result<bool, LedgerError> {
        let tmp = Self::write_temp(path, artifact).await?;
        let linked = tokio::fs::hard_link(&tmp, path).await;
        if let Err(e) = tokio::fs::remove_file(&tmp).await {
            debug!(path = %tmp.display(), error = %e, "temp record left behind");
        }
        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn replace(path: &Path, artifact: &Artifact) -> Result<(), LedgerError> {
        let tmp = Self::write_temp(path, artifact).await?;
        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn read_record(path: &Path) -> Result<Artifact, LedgerError> {
        let json = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Every `(context_id, artifact)` stored under `scopes`. Malformed files
    /// are skipped with a warning.
    async fn rows(&self, scopes: &LedgerScopes) -> Result<Vec<(String, Artifact)>, LedgerError> {
        let mut out = Vec::new();
        let scope_dir = self.scope_dir(scopes);
        for context_dir in subdirs(&scope_dir).await? {
            let Some(context_id) = decode_component(&dir_name(&context_dir)) else {
                continue;
            };
            for task_dir in subdirs(&context_dir).await? {
                let mut entries = tokio::fs::read_dir(&task_dir).await?;
                while let Some(entry) = entries.next_entry().await? {
                    let path = entry.path();
                    if path.extension().and_then(|e| e.to_str()) != Some("json") {
                        continue;
                    }
                    match Self::read_record(&path).await {
                        Ok(artifact) => out.push((context_id.clone(), artifact)),
                        Err(e) => warn!("Skipping malformed artifact at {}: {e}", path.display()),
                    }
                }
            }
        }
        Ok(out)
    }
}

impl Ledger for FileLedger {
    fn upsert<'a>(
        &'a self,
        scopes: &'a LedgerScopes,
        context_id: &'a str,
        artifact: &'a Artifact,
    ) -> LedgerFuture<'a, UpsertOutcome> {
        Box::pin(async move {
            let path = self.record_path(scopes, context_id, artifact);
            let fresh = !tokio::fs::try_exists(&path).await?
                && Self::create_exclusive(&path, artifact).await?;
            if fresh {
                debug!(path = %path.display(), "artifact written");
                return Ok(UpsertOutcome::created());
            }
            let existing = Self::read_record(&path).await?;
            Ok(UpsertOutcome::existing(existing))
        })
    }

    fn update<'a>(
        &'a self,
        scopes: &'a LedgerScopes,
        context_id: &'a str,
        artifact: &'a Artifact,
    ) -> LedgerFuture<'a, ()> {
        Box::pin(async move {
            let path = self.record_path(scopes, context_id, artifact);
            Self::replace(&path, artifact).await
        })
    }

    fn query<'a>(
        &'a self,
        scopes: &'a LedgerScopes,
        query: &'a LedgerQuery,
    ) -> LedgerFuture<'a, Vec<Artifact>> {
        Box::pin(async move {
            Ok(self
                .rows(scopes)
                .await?
                .into_iter()
                .filter(|(context_id, artifact)| matches_query(context_id, artifact, query))
                .map(|(_, artifact)| artifact)
                .collect())
        })
    }

    fn task_ids<'a>(
        &'a self,
        scopes: &'a LedgerScopes,
        context_id: &'a str,
    ) -> LedgerFuture<'a, Vec<String>> {
        Box::pin(async move {
            let mut ids: Vec<String> = Vec::new();
            for (ctx, artifact) in self.rows(scopes).await? {
                if ctx == context_id && !ids.contains(&artifact.task_id) {
                    ids.push(artifact.task_id);
                }
            }
            Ok(ids)
        })
    }
}

/// Percent-encode `raw` into a single path segment. ASCII alphanumerics,
/// `-` and `_` are kept; every other byte (`.` included) becomes `%XX`. The
/// empty string maps to a lone `%`.
fn encode_component(raw: &str) -> String {
    if raw.is_empty() {
        return "%".to_string();
    }
    let mut out = String::with_capacity(raw.len());
    for b in raw.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_') {
            out.push(char::from(b));
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

/// Inverse of [`encode_component`]; `None` for names it never produces.
fn decode_component(encoded: &str) -> Option<String> {
    if encoded == "%" {
        return Some(String::new());
    }
    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while let Some(&b) = bytes.get(i) {
        if b == b'%' {
            let hex = std::str::from_utf8(bytes.get(i + 1..i + 3)?).ok()?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(b);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

fn record_filename(key: &ArtifactKey) -> String {
    format!(
        "{}.{}.json",
        encode_component(&key.artifact_id),
        encode_component(&key.tool_call_id)
    )
}

fn dir_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Subdirectories of `dir`; a missing directory has none.
async fn subdirs(dir: &Path) -> Result<Vec<PathBuf>, LedgerError> {
    let mut out = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await.is_ok_and(|ft| ft.is_dir()) {
            out.push(entry.path());
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::{Map, json};

    fn scopes() -> LedgerScopes {
        LedgerScopes {
            tenant_id: "t".into(),
            project_id: "p".into(),
        }
    }

    fn artifact(id: &str, call: &str, task: &str) -> Artifact {
        Artifact {
            artifact_id: id.into(),
            tool_call_id: call.into(),
            name: "n".into(),
            description: "d".into(),
            artifact_type: "doc".into(),
            summary_data: json!({"title": id}),
            full_data: json!({"title": id, "body": "b"}),
            task_id: task.into(),
            metadata: Map::new(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn in_memory_upsert_is_idempotent() {
        let ledger = InMemoryLedger::new();
        let a = artifact("a1", "c1", "task1");
        let first = ledger.upsert(&scopes(), "ctx", &a).await.unwrap();
        assert!(first.created);

        let mut changed = a.clone();
        changed.name = "other".into();
        let second = ledger.upsert(&scopes(), "ctx", &changed).await.unwrap();
        assert!(!second.created);
        assert_eq!(second.existing.unwrap().name, "n");
        assert_eq!(ledger.row_count(), 1);
    }

    #[tokio::test]
    async fn in_memory_queries() {
        let ledger = InMemoryLedger::new();
        ledger
            .upsert(&scopes(), "ctx", &artifact("a1", "c1", "task1"))
            .await
            .unwrap();
        ledger
            .upsert(&scopes(), "ctx", &artifact("a2", "c2", "task2"))
            .await
            .unwrap();
        ledger
            .upsert(&scopes(), "other", &artifact("a3", "c3", "task3"))
            .await
            .unwrap();

        let by_task = ledger
            .query(&scopes(), &LedgerQuery::Task("task1".into()))
            .await
            .unwrap();
        assert_eq!(by_task.len(), 1);

        let by_id = ledger
            .query(
                &scopes(),
                &LedgerQuery::Artifact {
                    artifact_id: "a2".into(),
                    tool_call_id: Some("wrong".into()),
                },
            )
            .await
            .unwrap();
        assert!(by_id.is_empty());

        let by_ctx = ledger
            .query(&scopes(), &LedgerQuery::Context("ctx".into()))
            .await
            .unwrap();
        assert_eq!(by_ctx.len(), 2);

        let tasks = ledger.task_ids(&scopes(), "ctx").await.unwrap();
        assert_eq!(tasks, vec!["task1".to_string(), "task2".to_string()]);
    }

    #[tokio::test]
    async fn in_memory_failure_modes() {
        let ledger = InMemoryLedger::new();
        ledger.set_writes_failing(true);
        let err = ledger
            .upsert(&scopes(), "ctx", &artifact("a", "c", "t"))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Unavailable(_)));

        ledger.set_reads_failing(true);
        assert!(
            ledger
                .query(&scopes(), &LedgerQuery::Context("ctx".into()))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn file_ledger_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = FileLedger::new(dir.path());
        let a = artifact("a/1", "c1", "task1");

        assert!(ledger.upsert(&scopes(), "ctx", &a).await.unwrap().created);
        let again = ledger.upsert(&scopes(), "ctx", &a).await.unwrap();
        assert!(!again.created);
        assert_eq!(again.existing.unwrap().artifact_id, "a/1");

        let found = ledger
            .query(
                &scopes(),
                &LedgerQuery::Artifact {
                    artifact_id: "a/1".into(),
                    tool_call_id: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].full_data["body"], "b");

        let tasks = ledger.task_ids(&scopes(), "ctx").await.unwrap();
        assert_eq!(tasks, vec!["task1".to_string()]);
    }

    #[tokio::test]
    async fn file_ledger_update_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = FileLedger::new(dir.path());
        let mut a = artifact("a1", "c1", "task1");
        ledger.upsert(&scopes(), "ctx", &a).await.unwrap();
        a.name = "Enriched".into();
        ledger.update(&scopes(), "ctx", &a).await.unwrap();

        let found = ledger
            .query(&scopes(), &LedgerQuery::Task("task1".into()))
            .await
            .unwrap();
        assert_eq!(found[0].name, "Enriched");
    }

    #[tokio::test]
    async fn file_ledger_missing_scope_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = FileLedger::new(dir.path());
        let found = ledger
            .query(&scopes(), &LedgerQuery::Context("nope".into()))
            .await
            .unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn path_components_are_reversible() {
        assert_eq!(encode_component("a/b"), "a%2Fb");
        assert_eq!(encode_component(".."), "%2E%2E");
        assert_eq!(encode_component(""), "%");
        assert_eq!(encode_component("call_01-x"), "call_01-x");
        for raw in ["a/b", "a_b", "", "..", "ctx:é 1", "100%"] {
            assert_eq!(decode_component(&encode_component(raw)).as_deref(), Some(raw));
        }
        assert_eq!(decode_component("bad%2"), None);
    }

    #[tokio::test]
    async fn file_ledger_keeps_similar_keys_apart() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = FileLedger::new(dir.path());
        let keys = [
            ("a/1", "c"),
            ("a_1", "c"),
            ("a__b", "c"),
            ("a", "b__c"),
            ("a.b", "c"),
            ("a", "b.c"),
        ];
        for (id, call) in keys {
            let outcome = ledger
                .upsert(&scopes(), "ctx", &artifact(id, call, "task1"))
                .await
                .unwrap();
            assert!(outcome.created, "{id} / {call}");
        }
        let all = ledger
            .query(&scopes(), &LedgerQuery::Task("task1".into()))
            .await
            .unwrap();
        assert_eq!(all.len(), 6);
    }

    #[tokio::test]
    async fn file_ledger_context_query_uses_the_raw_id() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = FileLedger::new(dir.path());
        ledger
            .upsert(&scopes(), "conv/42", &artifact("a1", "c1", "task1"))
            .await
            .unwrap();
        ledger
            .upsert(&scopes(), "conv_42", &artifact("a2", "c2", "task2"))
            .await
            .unwrap();

        let found = ledger
            .query(&scopes(), &LedgerQuery::Context("conv/42".into()))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].artifact_id, "a1");
        assert_eq!(
            ledger.task_ids(&scopes(), "conv/42").await.unwrap(),
            vec!["task1".to_string()]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn file_ledger_concurrent_upserts_create_once() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = FileLedger::new(dir.path());
        for round in 0..20 {
            let a = artifact(&format!("a{round}"), "c1", "task1");
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let ledger = ledger.clone();
                    let a = a.clone();
                    tokio::spawn(async move { ledger.upsert(&scopes(), "ctx", &a).await })
                })
                .collect();
            let mut created = 0;
            for handle in handles {
                let outcome = handle.await.unwrap().unwrap();
                if outcome.created {
                    created += 1;
                } else {
                    assert_eq!(outcome.existing.unwrap().artifact_id, a.artifact_id);
                }
            }
            assert_eq!(created, 1, "round {round}");
        }

        let task_dir = dir.path().join("t").join("p").join("ctx").join("task1");
        let mut entries = std::fs::read_dir(task_dir).unwrap();
        assert!(entries.all(|e| e.unwrap().path().extension().unwrap() == "json"));
    }
}
