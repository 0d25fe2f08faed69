/// Context budget management and compaction.
///
/// The budget reserves headroom for the model's response plus a safety
/// buffer; everything else is usable context. When usage crosses the HIGH
/// tier the oldest window of the conversation is summarised through the
/// provider and replaced with a single tagged assistant message. The
/// summary is entity-compressed and carries its legend inline, so the
/// persisted text stays compact and the UI stream can decompress it.
use serde::{Deserialize, Serialize};

use crate::client::ModelProvider;
use crate::compress::{self, Entity};
use crate::error::CompactionError;
use crate::estimator;
use crate::messages::{Message, Role};
use crate::tools::ToolDef;

/// Marker prefixing every compaction summary message.
pub const SUMMARY_MARKER: &str = "[Conversation summary]";

const SUMMARY_SYSTEM: &str = "You summarise coding-assistant conversations. \
Produce a dense summary that preserves: the user's goals, decisions made, \
files touched with their paths, commands run and their outcomes, and any \
unresolved problems. Write plain prose, no headings.";

// ── Budget ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct ContextBudget {
    pub context_window: u32,
    pub output_reserve: u32,
    pub safety_buffer: u32,
}

impl ContextBudget {
    /// Model-tier-aware defaults: 15% of the window reserved for output,
    /// 5% safety margin against estimator error.
    pub fn for_window(context_window: u32) -> Self {
        Self {
            context_window,
            output_reserve: (context_window as f32 * 0.15) as u32,
            safety_buffer: (context_window as f32 * 0.05) as u32,
        }
    }

    pub fn max_tokens(&self) -> u32 {
        self.context_window
            .saturating_sub(self.output_reserve)
            .saturating_sub(self.safety_buffer)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ContextStatus {
    Healthy,
    Moderate,
    High,
    Critical,
}

impl ContextStatus {
    pub fn from_percent(usage: f64) -> Self {
        if usage >= 0.9 {
            ContextStatus::Critical
        } else if usage >= 0.75 {
            ContextStatus::High
        } else if usage >= 0.5 {
            ContextStatus::Moderate
        } else {
            ContextStatus::Healthy
        }
    }
}

// ── Status report ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize)]
pub struct RoleCounts {
    pub user: usize,
    pub assistant: usize,
    pub tool: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompressionStats {
    pub entities: usize,
    pub original_size: usize,
    pub compressed_size: usize,
    pub ratio: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContextReport {
    pub total_tokens: usize,
    pub max_tokens: u32,
    pub usage_percent: f64,
    pub status: ContextStatus,
    pub message_tokens: usize,
    pub system_tokens: usize,
    pub tool_tokens: usize,
    pub counts: RoleCounts,
    pub compression: Option<CompressionStats>,
    /// Paths the conversation is actively talking about.
    pub working_set: Vec<String>,
}

// ── Compaction outcomes ───────────────────────────────────────────────────────

#[derive(Debug)]
pub enum CompactOutcome {
    /// Nothing to do — under threshold or already compacted.
    NotNeeded,
    Compacted {
        removed_messages: usize,
        entities: Vec<Entity>,
    },
}

// ── Manager ───────────────────────────────────────────────────────────────────

pub struct ContextManager {
    budget: ContextBudget,
    /// The most recent messages are never summarised away.
    keep_recent: usize,
    last_compression: Option<CompressionStats>,
}

impl ContextManager {
    pub fn new(budget: ContextBudget) -> Self {
        Self { budget, keep_recent: 4, last_compression: None }
    }

    pub fn budget(&self) -> &ContextBudget {
        &self.budget
    }

    pub fn usage(&self, messages: &[Message], system_prompt: &str, tools: &[ToolDef]) -> (usize, ContextStatus) {
        let total = estimator::estimate_total(messages, system_prompt, tools);
        let percent = total as f64 / self.budget.max_tokens().max(1) as f64;
        (total, ContextStatus::from_percent(percent))
    }

    /// Structured report for the status line / status command.
    pub fn status(&self, messages: &[Message], system_prompt: &str, tools: &[ToolDef]) -> ContextReport {
        let message_tokens: usize = messages.iter().map(estimator::estimate_message).sum();
        let system_tokens = estimator::estimate(system_prompt);
        let tool_tokens = estimator::estimate_tool_defs(tools);
        let total = message_tokens + system_tokens + tool_tokens;
        let max = self.budget.max_tokens();
        let usage_percent = total as f64 / max.max(1) as f64;

        let mut counts = RoleCounts::default();
        for m in messages {
            match m.role {
                Role::User => counts.user += 1,
                Role::Assistant => counts.assistant += 1,
                Role::Tool => counts.tool += 1,
            }
        }

        let working_set: Vec<String> = compress::extract_entities(messages)
            .into_iter()
            .filter(|e| matches!(e.kind, compress::EntityKind::Path))
            .map(|e| e.value)
            .take(10)
            .collect();

        ContextReport {
            total_tokens: total,
            max_tokens: max,
            usage_percent,
            status: ContextStatus::from_percent(usage_percent),
            message_tokens,
            system_tokens,
            tool_tokens,
            counts,
            compression: self.last_compression.clone(),
            working_set,
        }
    }

    /// Called before each model turn. Compacts when usage is HIGH or worse.
    pub async fn auto_compact_if_needed(
        &mut self,
        messages: &mut Vec<Message>,
        system_prompt: &str,
        tools: &[ToolDef],
        provider: &dyn ModelProvider,
    ) -> Result<CompactOutcome, CompactionError> {
        let (_, status) = self.usage(messages, system_prompt, tools);
        if status < ContextStatus::High {
            return Ok(CompactOutcome::NotNeeded);
        }
        self.compact(messages, provider).await
    }

    /// Summarise the oldest window (everything but the last `keep_recent`
    /// messages) and replace it with one tagged assistant message. On
    /// provider failure the original messages are preserved untouched.
    pub async fn compact(
        &mut self,
        messages: &mut Vec<Message>,
        provider: &dyn ModelProvider,
    ) -> Result<CompactOutcome, CompactionError> {
        if messages.len() <= self.keep_recent {
            return Ok(CompactOutcome::NotNeeded);
        }
        let window_end = messages.len() - self.keep_recent;
        let window = &messages[..window_end];

        // Idempotence: a window that is just prior summaries, or one that
        // doesn't clear half the budget, is left alone.
        let all_summaries = window
            .iter()
            .all(|m| m.text_content().starts_with(SUMMARY_MARKER));
        let window_tokens: usize = window.iter().map(estimator::estimate_message).sum();
        if all_summaries || window_tokens * 2 <= self.budget.max_tokens() as usize {
            return Ok(CompactOutcome::NotNeeded);
        }

        let transcript = render_window(window);
        let summary = provider
            .complete(SUMMARY_SYSTEM, &transcript)
            .await
            .map_err(|e| CompactionError(format!("summary call failed: {e}")))?;
        if summary.trim().is_empty() {
            return Err(CompactionError("provider returned an empty summary".into()));
        }

        // Entity-compress the summary; the legend rides along inline.
        let summary_msg = Message::assistant(summary);
        let compressed = compress::compress(std::slice::from_ref(&summary_msg));
        let body = compressed.messages[0].text_content();
        let legend = compress::generate_legend(&compressed.entities);
        let text = if legend.is_empty() {
            format!("{SUMMARY_MARKER}\n\n{body}")
        } else {
            format!("{SUMMARY_MARKER}\n\n{legend}\n{body}")
        };

        self.last_compression = Some(CompressionStats {
            entities: compressed.entities.len(),
            original_size: compressed.original_size,
            compressed_size: compressed.compressed_size,
            ratio: compressed.compression_ratio,
        });

        let removed = window_end;
        messages.splice(..window_end, [Message::assistant(text)]);

        Ok(CompactOutcome::Compacted { removed_messages: removed, entities: compressed.entities })
    }
}

/// Flatten a message window into a plain transcript for summarisation.
fn render_window(window: &[Message]) -> String {
    let mut out = String::new();
    for m in window {
        let text = m.text_content();
        if text.is_empty() {
            continue;
        }
        out.push_str(m.role.as_str());
        out.push_str(": ");
        out.push_str(&text);
        out.push('\n');
    }
    out
}

/// Entities from every summary legend still present in the conversation.
/// Used to prime streaming decompression after a reload.
pub fn collect_legend_entities(messages: &[Message]) -> Vec<Entity> {
    let mut entities = Vec::new();
    for m in messages {
        let text = m.text_content();
        if text.starts_with(SUMMARY_MARKER) {
            entities.extend(compress::parse_legend(&text));
        }
    }
    entities
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ModelResponse, StopReason, TextSink};
    use crate::error::ProviderError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;

    struct FakeProvider {
        calls: AtomicUsize,
        fail: bool,
    }

    impl FakeProvider {
        fn new(fail: bool) -> Self {
            Self { calls: AtomicUsize::new(0), fail }
        }
    }

    #[async_trait]
    impl ModelProvider for FakeProvider {
        fn model(&self) -> &str {
            "fake"
        }

        async fn chat(
            &self,
            _system: &str,
            _messages: &[Message],
            _tools: &[ToolDef],
            _on_text: TextSink<'_>,
            _cancel: &CancellationToken,
        ) -> Result<ModelResponse, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ProviderError::Fatal("boom".into()));
            }
            Ok(ModelResponse {
                blocks: vec![crate::messages::ContentBlock::Text {
                    text: "User refactored src/auth/service.rs and ran tests.".into(),
                }],
                stop_reason: StopReason::EndTurn,
                input_tokens: 0,
                output_tokens: 0,
            })
        }
    }

    fn long_conversation() -> Vec<Message> {
        let mut messages = Vec::new();
        for i in 0..30 {
            messages.push(Message::user(format!("question {i}: {}", "lorem ipsum ".repeat(120))));
            messages.push(Message::assistant(format!("answer {i}: {}", "dolor sit amet ".repeat(120))));
        }
        messages
    }

    #[test]
    fn test_budget_arithmetic() {
        let b = ContextBudget::for_window(100_000);
        assert_eq!(b.output_reserve, 15_000);
        assert_eq!(b.safety_buffer, 5_000);
        assert_eq!(b.max_tokens(), 80_000);
    }

    #[test]
    fn test_status_tiers() {
        assert_eq!(ContextStatus::from_percent(0.1), ContextStatus::Healthy);
        assert_eq!(ContextStatus::from_percent(0.5), ContextStatus::Moderate);
        assert_eq!(ContextStatus::from_percent(0.75), ContextStatus::High);
        assert_eq!(ContextStatus::from_percent(0.9), ContextStatus::Critical);
        assert!(ContextStatus::High < ContextStatus::Critical);
    }

    #[test]
    fn test_report_breakdown() {
        let mgr = ContextManager::new(ContextBudget::for_window(32_768));
        let messages = vec![
            Message::user("look at src/main.rs and src/main.rs again"),
            Message::assistant("done"),
        ];
        let report = mgr.status(&messages, "system", &[]);
        assert_eq!(report.counts.user, 1);
        assert_eq!(report.counts.assistant, 1);
        assert!(report.total_tokens > 0);
        assert_eq!(report.working_set, vec!["src/main.rs".to_string()]);
    }

    #[tokio::test]
    async fn test_compact_replaces_window_with_summary() {
        let mut mgr = ContextManager::new(ContextBudget::for_window(4_096));
        let provider = FakeProvider::new(false);
        let mut messages = long_conversation();
        let before = messages.len();

        let outcome = mgr.compact(&mut messages, &provider).await.unwrap();
        match outcome {
            CompactOutcome::Compacted { removed_messages, .. } => {
                assert_eq!(removed_messages, before - 4);
            }
            CompactOutcome::NotNeeded => panic!("expected compaction"),
        }
        assert_eq!(messages.len(), 5); // summary + kept tail
        assert!(messages[0].text_content().starts_with(SUMMARY_MARKER));
    }

    #[tokio::test]
    async fn test_compact_is_idempotent() {
        let mut mgr = ContextManager::new(ContextBudget::for_window(4_096));
        let provider = FakeProvider::new(false);
        let mut messages = long_conversation();

        mgr.compact(&mut messages, &provider).await.unwrap();
        let snapshot: Vec<String> = messages.iter().map(|m| m.text_content()).collect();
        let calls_after_first = provider.calls.load(Ordering::SeqCst);

        let outcome = mgr.compact(&mut messages, &provider).await.unwrap();
        assert!(matches!(outcome, CompactOutcome::NotNeeded));
        let snapshot2: Vec<String> = messages.iter().map(|m| m.text_content()).collect();
        assert_eq!(snapshot, snapshot2);
        assert_eq!(provider.calls.load(Ordering::SeqCst), calls_after_first);
    }

    #[tokio::test]
    async fn test_failed_compaction_preserves_messages() {
        let mut mgr = ContextManager::new(ContextBudget::for_window(4_096));
        let provider = FakeProvider::new(true);
        let mut messages = long_conversation();
        let before: Vec<String> = messages.iter().map(|m| m.text_content()).collect();

        let err = mgr.compact(&mut messages, &provider).await;
        assert!(err.is_err());
        let after: Vec<String> = messages.iter().map(|m| m.text_content()).collect();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_auto_compact_skips_when_healthy() {
        let mut mgr = ContextManager::new(ContextBudget::for_window(200_000));
        let provider = FakeProvider::new(false);
        let mut messages = vec![Message::user("short"), Message::assistant("ok")];
        let outcome = mgr
            .auto_compact_if_needed(&mut messages, "sys", &[], &provider)
            .await
            .unwrap();
        assert!(matches!(outcome, CompactOutcome::NotNeeded));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_collect_legend_entities() {
        let summary = format!(
            "{SUMMARY_MARKER}\n\n## Entity References\n\n### Paths\n- E1: src/auth.rs\n\nE1 was refactored."
        );
        let messages = vec![Message::assistant(summary), Message::user("next")];
        let entities = collect_legend_entities(&messages);
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].id, "E1");
        assert_eq!(entities[0].value, "src/auth.rs");
    }
}
