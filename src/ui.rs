/// UI contract — a tagged-union event stream.
///
/// The core produces values; the UI decides how to render them. Events
/// flow over an unbounded channel so the agent loop never blocks on a
/// slow consumer. Confirmations are the one round-trip: the event carries
/// a oneshot the consumer answers, and at most one confirmation is active
/// at a time (the orchestrator's broker queues the rest FIFO).
use tokio::sync::{mpsc, oneshot};

use crate::agent::AgentStatus;
use crate::context::ContextStatus;
use crate::ipc::WorkerStatus;
use crate::orchestrator::WorkerResult;
use crate::permissions::{ConfirmationDecision, ToolConfirmation};

pub type UiSender = mpsc::UnboundedSender<UiEvent>;
pub type UiReceiver = mpsc::UnboundedReceiver<UiEvent>;

pub fn channel() -> (UiSender, UiReceiver) {
    mpsc::unbounded_channel()
}

/// A confirmation surfaced to the user. Dropping `reply` without
/// answering counts as abort.
pub struct ConfirmationRequest {
    pub id: String,
    /// Which child asked, if any; None means the parent agent itself.
    pub worker_id: Option<String>,
    pub confirmation: ToolConfirmation,
    pub reply: oneshot::Sender<ConfirmationDecision>,
}

pub enum UiEvent {
    /// A streamed (already decompressed) text chunk from the model.
    Chunk(String),
    /// Agent state machine transition.
    StatusChanged(AgentStatus),
    /// A tool call is about to execute.
    ToolCall { name: String, args_summary: String },
    /// Result of a tool call.
    ToolResult { summary: String, is_error: bool },
    /// The same tool was called twice with identical arguments.
    LoopWarning { tool_name: String },
    /// Per-turn tool budget exhausted.
    ToolBudgetHit { limit: usize },
    /// Context usage after estimation (sent before each model call).
    ContextUpdate { used: usize, max: u32, status: ContextStatus },
    CompactionStart,
    CompactionDone { removed_messages: usize, entities: usize },
    CompactionFailed(String),
    /// A confirmation awaiting the user. Strictly one active at a time.
    Confirmation(ConfirmationRequest),
    /// Indexer progress line.
    IndexStatus(String),
    /// A child agent changed state.
    WorkerUpdate {
        id: String,
        status: WorkerStatus,
        current_tool: Option<String>,
        progress: Option<u8>,
    },
    /// A child agent reached a terminal state.
    WorkerDone(Box<WorkerResult>),
    /// The parent agent finished a turn.
    AgentDone {
        input_tokens: u64,
        output_tokens: u64,
        tool_calls: usize,
        duration_ms: u64,
    },
    /// User-visible failure; plain string, the UI applies style.
    AgentError(String),
    /// Informational line.
    Info(String),
}

/// Format a tool input for one-line display.
pub fn format_args_summary(args: &serde_json::Value) -> String {
    if let Some(obj) = args.as_object() {
        let pairs: Vec<String> = obj
            .iter()
            .map(|(k, v)| {
                let val = match v {
                    serde_json::Value::String(s) => {
                        if s.chars().count() > 60 {
                            let truncated: String = s.chars().take(57).collect();
                            format!("\"{truncated}…\"")
                        } else {
                            format!("\"{s}\"")
                        }
                    }
                    other => {
                        let s = other.to_string();
                        if s.chars().count() > 40 {
                            let truncated: String = s.chars().take(37).collect();
                            format!("{truncated}…")
                        } else {
                            s
                        }
                    }
                };
                format!("{k}={val}")
            })
            .collect();
        pairs.join(", ")
    } else {
        args.to_string()
    }
}

/// Minimal console consumer: prints events as plain text and answers
/// confirmations from stdin. Real front-ends replace this wholesale.
pub async fn run_console(mut rx: UiReceiver, auto_approve_all: bool) {
    use tokio::io::{AsyncBufReadExt, BufReader};

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    while let Some(event) = rx.recv().await {
        match event {
            UiEvent::Chunk(text) => {
                use std::io::Write as _;
                print!("{text}");
                let _ = std::io::stdout().flush();
            }
            UiEvent::StatusChanged(_) => {}
            UiEvent::ToolCall { name, args_summary } => {
                println!("\n→ {name}({args_summary})");
            }
            UiEvent::ToolResult { summary, is_error } => {
                let mark = if is_error { "✗" } else { "✓" };
                println!("{mark} {}", summary.lines().next().unwrap_or(""));
            }
            UiEvent::LoopWarning { tool_name } => {
                println!("⚠ loop detected on {tool_name}");
            }
            UiEvent::ToolBudgetHit { limit } => {
                println!("⚠ tool budget of {limit} calls reached");
            }
            UiEvent::ContextUpdate { used, max, status } => {
                tracing::debug!(used, max, ?status, "context update");
            }
            UiEvent::CompactionStart => println!("⟳ compacting context…"),
            UiEvent::CompactionDone { removed_messages, entities } => {
                println!("⟳ compacted {removed_messages} messages ({entities} entities)");
            }
            UiEvent::CompactionFailed(e) => println!("⚠ compaction failed: {e}"),
            UiEvent::Confirmation(req) => {
                let c = &req.confirmation;
                let danger = if c.is_dangerous {
                    format!(" [DANGEROUS: {}]", c.danger_reason.as_deref().unwrap_or("unspecified"))
                } else {
                    String::new()
                };
                let worker = req
                    .worker_id
                    .as_deref()
                    .map(|w| format!("[{w}] "))
                    .unwrap_or_default();
                println!(
                    "\n{worker}{} wants to run {}{danger}\n  {}",
                    "agent",
                    c.tool_name,
                    format_args_summary(&c.input)
                );

                let decision = if auto_approve_all && !c.is_dangerous {
                    ConfirmationDecision::Approve
                } else {
                    println!("  approve? [y]es / [n]o / [a]bort");
                    match stdin.next_line().await {
                        Ok(Some(line)) => match line.trim() {
                            "y" | "yes" => ConfirmationDecision::Approve,
                            "a" | "abort" => ConfirmationDecision::Abort,
                            _ => ConfirmationDecision::Deny,
                        },
                        _ => ConfirmationDecision::Abort,
                    }
                };
                let _ = req.reply.send(decision);
            }
            UiEvent::IndexStatus(line) => println!("[index] {line}"),
            UiEvent::WorkerUpdate { id, status, current_tool, .. } => {
                let tool = current_tool.map(|t| format!(" ({t})")).unwrap_or_default();
                println!("[{id}] {status:?}{tool}");
            }
            UiEvent::WorkerDone(result) => {
                let mark = if result.success { "✓" } else { "✗" };
                println!(
                    "{mark} worker {} on {} — {} tool calls, {} files changed",
                    result.worker_id,
                    result.branch,
                    result.tool_call_count,
                    result.files_changed.len()
                );
            }
            UiEvent::AgentDone { input_tokens, output_tokens, tool_calls, duration_ms } => {
                println!(
                    "\n— done in {:.1}s ({input_tokens} in / {output_tokens} out tokens, {tool_calls} tool calls)",
                    duration_ms as f64 / 1000.0
                );
            }
            UiEvent::AgentError(e) => eprintln!("error: {e}"),
            UiEvent::Info(line) => println!("{line}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_args_summary_truncates_long_strings() {
        let args = json!({"path": "src/main.rs", "content": "x".repeat(200)});
        let summary = format_args_summary(&args);
        assert!(summary.contains("path=\"src/main.rs\""));
        assert!(summary.contains('…'));
        assert!(summary.len() < 200);
    }

    #[test]
    fn test_args_summary_non_object() {
        assert_eq!(format_args_summary(&json!("bare")), "\"bare\"");
    }
}
