//! Summarization collaborator for context compression.
//!
//! Each compression cycle summarizes the *entire* conversation, seeded with
//! the previous cycle's summary so that summaries compose instead of
//! dropping earlier context. The collaborator sits behind the
//! [`Summarizer`] trait; two implementations ship with the crate:
//!
//! - [`PromptSummarizer`] builds a system/user prompt pair and hands it to a
//!   [`Completion`] backend (any LLM client), parsing the JSON reply into a
//!   [`ConversationSummary`].
//! - [`ExtractiveSummarizer`] derives a summary locally without a model,
//!   for offline replays and tests.

use super::truncate_chars;
use crate::error::CompressionError;
use crate::{Message, MessageRole, json_schema_for};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, warn};

/// Archived tool results: tool call id → artifact id.
pub type ArchivedResults = BTreeMap<String, String>;

/// Boxed future returned by [`Summarizer::summarize`].
pub type SummaryFuture<'a> =
    Pin<Box<dyn Future<Output = Result<ConversationSummary, CompressionError>> + Send + 'a>>;

/// Boxed future returned by [`Completion::complete`].
pub type CompletionFuture<'a> = Pin<Box<dyn Future<Output = Result<String, String>> + Send + 'a>>;

// ── Summary ────────────────────────────────────────────────────────

/// Reference to an archived tool result kept alive by the summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ArtifactRef {
    pub artifact_id: String,
    pub tool_call_id: String,
}

/// Distilled state of a conversation, replacing its history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ConversationSummary {
    /// What the conversation has covered so far.
    pub high_level: String,
    /// What the user is ultimately trying to achieve.
    pub user_intent: String,
    pub decisions: Vec<String>,
    pub open_questions: Vec<String>,
    pub next_steps: Vec<String>,
    /// Archived tool results the conversation still depends on.
    pub related_artifacts: Vec<ArtifactRef>,
}

impl ConversationSummary {
    /// A summary carrying only free text.
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            high_level: text.into(),
            ..Default::default()
        }
    }

    /// Add a reference for every archived result the summary does not
    /// already mention.
    pub fn record_artifacts(&mut self, archived: &ArchivedResults) {
        for (tool_call_id, artifact_id) in archived {
            let known = self
                .related_artifacts
                .iter()
                .any(|r| &r.tool_call_id == tool_call_id && &r.artifact_id == artifact_id);
            if !known {
                self.related_artifacts.push(ArtifactRef {
                    artifact_id: artifact_id.clone(),
                    tool_call_id: tool_call_id.clone(),
                });
            }
        }
    }

    /// Render as the text of a context message.
    pub fn to_context_text(&self) -> String {
        let mut out = String::new();
        push_section(&mut out, "Summary", &self.high_level);
        push_section(&mut out, "User intent", &self.user_intent);
        push_list(&mut out, "Decisions", &self.decisions);
        push_list(&mut out, "Open questions", &self.open_questions);
        push_list(&mut out, "Next steps", &self.next_steps);
        if !self.related_artifacts.is_empty() {
            out.push_str("## Archived tool results\n");
            for r in &self.related_artifacts {
                let _ = writeln!(
                    out,
                    "- artifact `{}` (tool call `{}`)",
                    r.artifact_id, r.tool_call_id
                );
            }
            out.push('\n');
        }
        out.trim_end().to_string()
    }
}

fn push_section(out: &mut String, title: &str, body: &str) {
    if !body.trim().is_empty() {
        let _ = write!(out, "## {title}\n{}\n\n", body.trim());
    }
}

fn push_list(out: &mut String, title: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }
    let _ = writeln!(out, "## {title}");
    for item in items {
        let _ = writeln!(out, "- {item}");
    }
    out.push('\n');
}

// ── Collaborators ──────────────────────────────────────────────────

/// Produces a [`ConversationSummary`] for a message list.
pub trait Summarizer: Send + Sync {
    /// Summarize `messages`, folding in `prior` when present. `archived`
    /// maps every archived tool call to its artifact id so the summary can
    /// point at results no longer in the history.
    fn summarize<'a>(
        &'a self,
        messages: &'a [Message],
        prior: Option<&'a ConversationSummary>,
        archived: &'a ArchivedResults,
    ) -> SummaryFuture<'a>;
}

/// A one-shot text completion backend.
pub trait Completion: Send + Sync {
    fn complete<'a>(&'a self, system: &'a str, user: &'a str) -> CompletionFuture<'a>;
}

// ── Prompt summarizer ──────────────────────────────────────────────

const SUMMARIZATION_PROMPT: &str = "\
Summarize the following conversation. Capture:
- What has been accomplished and what was found
- What the user is ultimately trying to achieve
- Decisions made, including approaches that were rejected and why
- Questions that are still open
- The next concrete steps

Rules:
- Only include facts explicitly stated in the messages. Do not infer or extrapolate.
- Preserve identifiers, file paths and error messages verbatim.
- Tool results marked as archived are stored as artifacts. Refer to them by artifact id \
  and list the ones that still matter in related_artifacts.
- If there is an existing summary, merge the new information into it. The result must be \
  a standalone summary that replaces the existing one entirely.";

/// Tuning for [`PromptSummarizer`].
#[derive(Debug, Clone)]
pub struct SummarizerConfig {
    /// Characters of an archived tool result quoted in the prompt.
    pub max_archived_chars: usize,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            max_archived_chars: 400,
        }
    }
}

/// Summarizes through a [`Completion`] backend.
pub struct PromptSummarizer {
    completion: Arc<dyn Completion>,
    config: SummarizerConfig,
}

impl PromptSummarizer {
    pub fn new(completion: Arc<dyn Completion>) -> Self {
        Self {
            completion,
            config: SummarizerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: SummarizerConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the (system, user) prompt pair for one summarization call.
    pub fn build_summarization_request(
        &self,
        messages: &[Message],
        prior: Option<&ConversationSummary>,
        archived: &ArchivedResults,
    ) -> (String, String) {
        let schema = json_schema_for::<ConversationSummary>();
        let system = format!(
            "{SUMMARIZATION_PROMPT}\n\nRespond with a single JSON object matching this schema:\n{}",
            serde_json::to_string_pretty(&schema).unwrap_or_default()
        );

        let mut content = String::new();
        if let Some(prior) = prior {
            content.push_str("=== EXISTING SUMMARY ===\n");
            content.push_str(&serde_json::to_string_pretty(prior).unwrap_or_default());
            content.push_str("\n\n");
        }
        if !archived.is_empty() {
            content.push_str("=== ARCHIVED TOOL RESULTS ===\n");
            for (call, artifact) in archived {
                let _ = writeln!(content, "- tool call {call} -> artifact {artifact}");
            }
            content.push('\n');
        }
        content.push_str("=== CONVERSATION ===\n");
        for msg in messages {
            self.format_message(&mut content, msg, archived);
        }

        (system, content)
    }

    fn format_message(&self, out: &mut String, msg: &Message, archived: &ArchivedResults) {
        let text = msg.content.as_deref().unwrap_or_default();
        match (&msg.role, msg.tool_call_id.as_deref()) {
            (MessageRole::Tool, Some(call)) => match archived.get(call) {
                Some(artifact) => {
                    let preview = truncate_chars(text, self.config.max_archived_chars);
                    let _ = write!(
                        out,
                        "[tool {call}] (archived as artifact {artifact}): {preview}\n\n"
                    );
                }
                None => {
                    let _ = write!(out, "[tool {call}]: {text}\n\n");
                }
            },
            (role, _) => {
                if !text.is_empty() {
                    let _ = write!(out, "[{role}]: {text}\n\n");
                }
                for call in msg.tool_calls.iter().flatten() {
                    let _ = write!(
                        out,
                        "[{role}] called {}({}) as {}\n\n",
                        call.function.name, call.function.arguments, call.id
                    );
                }
            }
        }
    }
}

/// Parse a completion reply into a summary.
///
/// Accepts a bare JSON object or one wrapped in a code fence. Anything else
/// becomes a plain-text summary; an empty reply is an error.
pub fn parse_reply(reply: &str) -> Result<ConversationSummary, CompressionError> {
    let trimmed = reply.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed);
    if body.is_empty() {
        return Err(CompressionError::Summarization(
            "summarizer returned an empty reply".into(),
        ));
    }
    match serde_json::from_str::<ConversationSummary>(body) {
        Ok(summary) => Ok(summary),
        Err(e) => {
            debug!(error = %e, "summary reply is not JSON, keeping it as text");
            Ok(ConversationSummary::plain(body))
        }
    }
}

impl Summarizer for PromptSummarizer {
    fn summarize<'a>(
        &'a self,
        messages: &'a [Message],
        prior: Option<&'a ConversationSummary>,
        archived: &'a ArchivedResults,
    ) -> SummaryFuture<'a> {
        Box::pin(async move {
            let (system, user) = self.build_summarization_request(messages, prior, archived);
            let reply = self
                .completion
                .complete(&system, &user)
                .await
                .map_err(|e| {
                    warn!(error = %e, "summarization call failed");
                    CompressionError::Summarization(e)
                })?;
            parse_reply(&reply)
        })
    }
}

// ── Extractive summarizer ──────────────────────────────────────────

/// Builds a summary from the messages themselves, without a model.
///
/// The user intent is the first user message; the high-level text records
/// the conversation's shape and its latest request. Decisions, open
/// questions and next steps carry over from the prior summary.
#[derive(Debug, Clone)]
pub struct ExtractiveSummarizer {
    max_quote_chars: usize,
}

impl ExtractiveSummarizer {
    pub fn new() -> Self {
        Self {
            max_quote_chars: 200,
        }
    }

    pub fn with_max_quote_chars(mut self, chars: usize) -> Self {
        self.max_quote_chars = chars;
        self
    }

    fn build(
        &self,
        messages: &[Message],
        prior: Option<&ConversationSummary>,
    ) -> ConversationSummary {
        let user_texts: Vec<&str> = messages
            .iter()
            .filter(|m| m.role == MessageRole::User)
            .filter_map(|m| m.content.as_deref())
            .collect();
        let tool_results = messages.iter().filter(|m| m.is_tool_result()).count();

        let user_intent = match prior {
            Some(p) if !p.user_intent.is_empty() => p.user_intent.clone(),
            _ => user_texts
                .first()
                .map(|t| truncate_chars(t, self.max_quote_chars))
                .unwrap_or_default(),
        };

        let mut high_level = format!(
            "{} messages, {} tool results.",
            messages.len(),
            tool_results
        );
        if let Some(latest) = user_texts.last() {
            let _ = write!(
                high_level,
                " Latest request: {}",
                truncate_chars(latest, self.max_quote_chars)
            );
        }
        if let Some(p) = prior.filter(|p| !p.high_level.is_empty()) {
            high_level = format!("{}\n{high_level}", p.high_level);
        }

        let mut summary = ConversationSummary {
            high_level,
            user_intent,
            ..Default::default()
        };
        if let Some(p) = prior {
            summary.decisions = p.decisions.clone();
            summary.open_questions = p.open_questions.clone();
            summary.next_steps = p.next_steps.clone();
            summary.related_artifacts = p.related_artifacts.clone();
        }
        summary
    }
}

impl Default for ExtractiveSummarizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Summarizer for ExtractiveSummarizer {
    fn summarize<'a>(
        &'a self,
        messages: &'a [Message],
        prior: Option<&'a ConversationSummary>,
        archived: &'a ArchivedResults,
    ) -> SummaryFuture<'a> {
        Box::pin(async move {
            let mut summary = self.build(messages, prior);
            summary.record_artifacts(archived);
            Ok(summary)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ToolCall;
    use std::sync::Mutex;

    struct FixedCompletion {
        reply: Result<String, String>,
        seen: Mutex<Vec<(String, String)>>,
    }

    impl FixedCompletion {
        fn new(reply: Result<&str, &str>) -> Self {
            Self {
                reply: reply.map(str::to_string).map_err(str::to_string),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl Completion for FixedCompletion {
        fn complete<'a>(&'a self, system: &'a str, user: &'a str) -> CompletionFuture<'a> {
            self.seen
                .lock()
                .unwrap()
                .push((system.to_string(), user.to_string()));
            let reply = self.reply.clone();
            Box::pin(async move { reply })
        }
    }

    fn conversation() -> Vec<Message> {
        vec![
            Message::system("You are an agent."),
            Message::user("Find the failing test"),
            Message::assistant_tool_calls(vec![ToolCall::function(
                "c1",
                "grep",
                r#"{"q":"FAIL"}"#,
            )]),
            Message::tool_result("c1", "x".repeat(1000)),
            Message::tool_result("c2", "short result"),
        ]
    }

    #[test]
    fn request_without_prior_summary() {
        let summarizer = PromptSummarizer::new(Arc::new(FixedCompletion::new(Ok("{}"))));
        let (system, user) =
            summarizer.build_summarization_request(&conversation(), None, &ArchivedResults::new());
        assert!(system.contains("Summarize"));
        assert!(system.contains("related_artifacts"));
        assert!(!user.contains("EXISTING SUMMARY"));
        assert!(user.contains("[user]: Find the failing test"));
        assert!(user.contains("called grep"));
        assert!(user.contains(&"x".repeat(1000)));
    }

    #[test]
    fn request_truncates_archived_results() {
        let summarizer = PromptSummarizer::new(Arc::new(FixedCompletion::new(Ok("{}"))));
        let mut archived = ArchivedResults::new();
        archived.insert("c1".into(), "compress_grep_c1".into());
        let prior = ConversationSummary::plain("Earlier: looked at CI config.");

        let (_, user) =
            summarizer.build_summarization_request(&conversation(), Some(&prior), &archived);
        assert!(user.contains("=== EXISTING SUMMARY ==="));
        assert!(user.contains("Earlier: looked at CI config."));
        assert!(user.contains("tool call c1 -> artifact compress_grep_c1"));
        assert!(user.contains("(archived as artifact compress_grep_c1)"));
        assert!(!user.contains(&"x".repeat(1000)));
        assert!(user.contains("[tool c2]: short result"));
    }

    #[test]
    fn parse_json_reply() {
        let summary = parse_reply(
            r#"```json
{"high_level": "Found it", "user_intent": "fix CI", "next_steps": ["patch"]}
```"#,
        )
        .unwrap();
        assert_eq!(summary.high_level, "Found it");
        assert_eq!(summary.next_steps, vec!["patch"]);
        assert!(summary.decisions.is_empty());
    }

    #[test]
    fn parse_plain_reply() {
        let summary = parse_reply("  The user wants CI fixed.  ").unwrap();
        assert_eq!(summary, ConversationSummary::plain("The user wants CI fixed."));
    }

    #[test]
    fn parse_empty_reply_is_error() {
        assert!(parse_reply("   ").is_err());
        assert!(parse_reply("```json\n```").is_err());
    }

    #[tokio::test]
    async fn prompt_summarizer_round_trip() {
        let completion = Arc::new(FixedCompletion::new(Ok(r#"{"high_level": "done"}"#)));
        let summarizer = PromptSummarizer::new(completion.clone());
        let summary = summarizer
            .summarize(&conversation(), None, &ArchivedResults::new())
            .await
            .unwrap();
        assert_eq!(summary.high_level, "done");
        assert_eq!(completion.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn prompt_summarizer_surfaces_backend_failure() {
        let summarizer = PromptSummarizer::new(Arc::new(FixedCompletion::new(Err("503"))));
        let err = summarizer
            .summarize(&conversation(), None, &ArchivedResults::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("503"));
    }

    #[tokio::test]
    async fn extractive_summary_composes_with_prior() {
        let mut archived = ArchivedResults::new();
        archived.insert("c1".into(), "compress_grep_c1".into());
        let prior = ConversationSummary {
            high_level: "Cycle one.".into(),
            user_intent: "Fix CI".into(),
            decisions: vec!["use nextest".into()],
            ..Default::default()
        };

        let summary = ExtractiveSummarizer::new()
            .summarize(&conversation(), Some(&prior), &archived)
            .await
            .unwrap();
        assert_eq!(summary.user_intent, "Fix CI");
        assert!(summary.high_level.starts_with("Cycle one.\n"));
        assert!(summary.high_level.contains("5 messages, 2 tool results."));
        assert_eq!(summary.decisions, vec!["use nextest"]);
        assert_eq!(
            summary.related_artifacts,
            vec![ArtifactRef {
                artifact_id: "compress_grep_c1".into(),
                tool_call_id: "c1".into(),
            }]
        );
    }

    #[test]
    fn record_artifacts_is_idempotent() {
        let mut archived = ArchivedResults::new();
        archived.insert("c1".into(), "a1".into());
        let mut summary = ConversationSummary::default();
        summary.record_artifacts(&archived);
        summary.record_artifacts(&archived);
        assert_eq!(summary.related_artifacts.len(), 1);
    }

    #[test]
    fn context_text_skips_empty_sections() {
        let mut summary = ConversationSummary::plain("Did things.");
        summary.next_steps = vec!["ship".into()];
        let text = summary.to_context_text();
        assert!(text.starts_with("## Summary\nDid things."));
        assert!(text.contains("## Next steps\n- ship"));
        assert!(!text.contains("User intent"));
        assert!(!text.contains("Archived"));
    }
}
