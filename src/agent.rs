/// The agent loop — one conversation, driven turn by turn.
///
/// State machine per turn:
///   idle → thinking → {text_final | tool_plan}
///   tool_plan → waiting_permission → tool_executing → thinking
///   any → cancelled | failed
///
/// Before each model call the context manager may compact; compacted
/// summaries are entity-compressed, and every streamed chunk passes
/// through streaming decompression before the UI sees it.
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::client::{ModelProvider, StopReason};
use crate::compress::{self, Entity};
use crate::context::{CompactOutcome, ContextManager};
use crate::messages::{ContentBlock, Message};
use crate::permissions::{ConfirmationDecision, PermissionEngine, ToolConfirmation};
use crate::rag::retriever::Retriever;
use crate::tools::{ExecContext, ToolRegistry};
use crate::ui::{format_args_summary, ConfirmationRequest, UiEvent, UiSender};

const MAX_TOOL_CALLS: usize = 40;

// ── Status ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    Idle,
    Thinking,
    ToolPlan,
    WaitingPermission,
    ToolExecuting,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, Default)]
pub struct TurnStats {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub tool_call_count: usize,
    pub duration_ms: u64,
}

#[derive(Debug)]
pub struct TurnOutcome {
    pub response: String,
    pub stats: TurnStats,
    pub cancelled: bool,
}

// ── Permission gateway ────────────────────────────────────────────────────────

/// Where confirmation requests go: the parent asks its own UI; a child
/// forwards over IPC to the orchestrator.
#[async_trait]
pub trait PermissionGateway: Send + Sync {
    async fn confirm(&self, confirmation: ToolConfirmation) -> Result<ConfirmationDecision>;
}

/// Parent-mode gateway: one confirmation on the UI at a time.
pub struct UiGateway {
    ui_tx: UiSender,
    counter: AtomicU64,
}

impl UiGateway {
    pub fn new(ui_tx: UiSender) -> Self {
        Self { ui_tx, counter: AtomicU64::new(1) }
    }
}

#[async_trait]
impl PermissionGateway for UiGateway {
    async fn confirm(&self, confirmation: ToolConfirmation) -> Result<ConfirmationDecision> {
        let (reply, rx) = oneshot::channel();
        let id = format!("confirm-{}", self.counter.fetch_add(1, Ordering::Relaxed));
        self.ui_tx
            .send(UiEvent::Confirmation(ConfirmationRequest {
                id,
                worker_id: None,
                confirmation,
                reply,
            }))
            .map_err(|_| anyhow!("UI channel closed"))?;
        // A dropped reply means the consumer went away: abort, don't hang.
        Ok(rx.await.unwrap_or(ConfirmationDecision::Abort))
    }
}

// ── Loop detection ────────────────────────────────────────────────────────────

/// Track recent tool calls to catch doom loops: the same tool with the
/// same arguments twice in the recent window short-circuits.
#[derive(Default)]
struct LoopDetector {
    recent: Vec<String>,
}

impl LoopDetector {
    fn record(&mut self, tool_name: &str, args: &str) -> bool {
        let fp = format!("{tool_name}::{}", &args[..args.len().min(200)]);
        self.recent.push(fp.clone());
        if self.recent.len() > 5 {
            self.recent.remove(0);
        }
        self.recent.iter().filter(|f| **f == fp).count() >= 2
    }
}

// ── Agent ─────────────────────────────────────────────────────────────────────

pub struct AgentOptions {
    pub provider: Arc<dyn ModelProvider>,
    pub registry: ToolRegistry,
    pub permissions: Arc<PermissionEngine>,
    pub gateway: Arc<dyn PermissionGateway>,
    pub context: ContextManager,
    pub retriever: Option<Arc<Retriever>>,
    pub ui_tx: UiSender,
    pub system_prompt: String,
    pub cancel: CancellationToken,
    /// Path prefix bounding filesystem tools (readers).
    pub scope: Option<PathBuf>,
}

pub struct Agent {
    provider: Arc<dyn ModelProvider>,
    registry: ToolRegistry,
    permissions: Arc<PermissionEngine>,
    gateway: Arc<dyn PermissionGateway>,
    context: ContextManager,
    retriever: Option<Arc<Retriever>>,
    ui_tx: UiSender,
    system_prompt: String,
    cancel: CancellationToken,
    scope: Option<PathBuf>,

    messages: Vec<Message>,
    active_entities: Vec<Entity>,
    status: AgentStatus,
    loop_detector: LoopDetector,
    provider_observers: Vec<Box<dyn Fn(&str) + Send + Sync>>,
    status_observer: Option<Box<dyn Fn(AgentStatus, Option<&str>) + Send + Sync>>,
}

impl Agent {
    pub fn new(options: AgentOptions) -> Self {
        Self {
            provider: options.provider,
            registry: options.registry,
            permissions: options.permissions,
            gateway: options.gateway,
            context: options.context,
            retriever: options.retriever,
            ui_tx: options.ui_tx,
            system_prompt: options.system_prompt,
            cancel: options.cancel,
            scope: options.scope,
            messages: Vec::new(),
            active_entities: Vec::new(),
            status: AgentStatus::Idle,
            loop_detector: LoopDetector::default(),
            provider_observers: Vec::new(),
            status_observer: None,
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Replay a stored conversation. Orphaned tool results are filtered
    /// here, and summary legends re-prime streaming decompression.
    pub fn load_messages(&mut self, messages: Vec<Message>) {
        self.messages = crate::messages::filter_orphaned_tool_results(&messages);
        self.active_entities = crate::context::collect_legend_entities(&self.messages);
    }

    /// Swap the model provider between turns. Mid-turn switches are
    /// rejected; observers hear about successful swaps.
    pub fn set_provider(&mut self, provider: Arc<dyn ModelProvider>) -> Result<()> {
        if self.status != AgentStatus::Idle {
            return Err(anyhow!("cannot switch provider mid-turn"));
        }
        self.provider = provider;
        // A different model means a different tokenizer; stale calibration
        // samples would skew the estimator.
        crate::estimator::reset_calibration();
        let model = self.provider.model().to_string();
        for observer in &self.provider_observers {
            observer(&model);
        }
        Ok(())
    }

    /// Structured context report for the status line.
    pub fn context_report(&self) -> crate::context::ContextReport {
        self.context
            .status(&self.messages, &self.system_prompt, &self.registry.definitions())
    }

    pub fn on_provider_change(&mut self, observer: Box<dyn Fn(&str) + Send + Sync>) {
        self.provider_observers.push(observer);
    }

    pub fn set_status_observer(&mut self, observer: Box<dyn Fn(AgentStatus, Option<&str>) + Send + Sync>) {
        self.status_observer = Some(observer);
    }

    fn set_status(&mut self, status: AgentStatus, current_tool: Option<&str>) {
        self.status = status;
        if let Some(observer) = &self.status_observer {
            observer(status, current_tool);
        }
        let _ = self.ui_tx.send(UiEvent::StatusChanged(status));
    }

    fn exec_context(&self) -> ExecContext {
        ExecContext { scope: self.scope.clone(), cancel: self.cancel.clone() }
    }

    /// Drive one turn to completion.
    pub async fn run_turn(&mut self, task: &str) -> Result<TurnOutcome> {
        if self.status != AgentStatus::Idle {
            return Err(anyhow!("turn already in progress"));
        }
        let started = std::time::Instant::now();
        let mut stats = TurnStats::default();

        self.messages.push(Message::user(task));

        // RAG context is looked up once per turn, against the task text.
        let system_prompt = match self.rag_context(task).await {
            Some(ctx) => format!("{}\n\n{ctx}", self.system_prompt),
            None => self.system_prompt.clone(),
        };
        let tools = self.registry.definitions();

        let outcome = loop {
            if self.cancel.is_cancelled() {
                self.set_status(AgentStatus::Cancelled, None);
                break TurnOutcome {
                    response: String::new(),
                    stats: finish(&mut stats, started),
                    cancelled: true,
                };
            }

            // 1. Reclaim budget before the call.
            let (_, pre_status) = self.context.usage(&self.messages, &system_prompt, &tools);
            if pre_status >= crate::context::ContextStatus::High {
                let _ = self.ui_tx.send(UiEvent::CompactionStart);
            }
            match self
                .context
                .auto_compact_if_needed(&mut self.messages, &system_prompt, &tools, self.provider.as_ref())
                .await
            {
                Ok(CompactOutcome::Compacted { removed_messages, entities }) => {
                    self.active_entities = crate::context::collect_legend_entities(&self.messages);
                    let _ = self.ui_tx.send(UiEvent::CompactionDone {
                        removed_messages,
                        entities: entities.len(),
                    });
                }
                Ok(CompactOutcome::NotNeeded) => {}
                Err(e) => {
                    let _ = self.ui_tx.send(UiEvent::CompactionFailed(e.to_string()));
                }
            }

            let (used, ctx_status) = self.context.usage(&self.messages, &system_prompt, &tools);
            let _ = self.ui_tx.send(UiEvent::ContextUpdate {
                used,
                max: self.context.budget().max_tokens(),
                status: ctx_status,
            });

            // 2. Model call, with streaming decompression on the way out.
            self.set_status(AgentStatus::Thinking, None);
            let carry = Arc::new(Mutex::new(String::new()));
            let entities = self.active_entities.clone();
            let ui = self.ui_tx.clone();
            let carry_in = carry.clone();
            let on_text = move |chunk: &str| {
                let mut held = carry_in.lock().expect("stream carry");
                let combined = format!("{held}{chunk}");
                let step = compress::decompress_streaming(&combined, &entities);
                *held = step.remaining;
                if !step.decompressed.is_empty() {
                    let _ = ui.send(UiEvent::Chunk(step.decompressed));
                }
            };

            let response = match self
                .provider
                .chat(&system_prompt, &self.messages, &tools, &on_text, &self.cancel)
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    if self.cancel.is_cancelled() {
                        self.set_status(AgentStatus::Cancelled, None);
                        break TurnOutcome {
                            response: String::new(),
                            stats: finish(&mut stats, started),
                            cancelled: true,
                        };
                    }
                    self.set_status(AgentStatus::Failed, None);
                    let _ = self.ui_tx.send(UiEvent::AgentError(e.to_string()));
                    self.status = AgentStatus::Idle;
                    return Err(anyhow!("provider error: {e}"));
                }
            };

            // Flush any held-back partial id as literal text.
            let leftover = carry.lock().expect("stream carry").split_off(0);
            if !leftover.is_empty() {
                let _ = self.ui_tx.send(UiEvent::Chunk(leftover));
            }

            stats.input_tokens += response.input_tokens as u64;
            stats.output_tokens += response.output_tokens as u64;
            if response.input_tokens > 0 {
                let chars: usize = self
                    .messages
                    .iter()
                    .map(|m| m.text_content().chars().count())
                    .sum::<usize>()
                    + system_prompt.chars().count();
                crate::estimator::update_calibration(response.input_tokens, chars);
            }

            let response_text = response.text();
            self.messages.push(Message::assistant_blocks(response.blocks.clone()));

            let tool_uses: Vec<(String, String, Value)> = response
                .tool_uses()
                .into_iter()
                .map(|(id, name, input)| (id.to_string(), name.to_string(), input.clone()))
                .collect();

            if tool_uses.is_empty() || response.stop_reason != StopReason::ToolUse {
                self.set_status(AgentStatus::Idle, None);
                break TurnOutcome {
                    response: response_text,
                    stats: finish(&mut stats, started),
                    cancelled: false,
                };
            }

            // 3. Execute the planned tool calls.
            self.set_status(AgentStatus::ToolPlan, None);

            if stats.tool_call_count >= MAX_TOOL_CALLS {
                let _ = self.ui_tx.send(UiEvent::ToolBudgetHit { limit: MAX_TOOL_CALLS });
                self.set_status(AgentStatus::Idle, None);
                break TurnOutcome {
                    response: response_text,
                    stats: finish(&mut stats, started),
                    cancelled: false,
                };
            }

            let mut results: Vec<ContentBlock> = Vec::new();
            let mut aborted = false;
            for (id, name, input) in tool_uses {
                stats.tool_call_count += 1;
                let (block, abort) = self.handle_tool_use(&id, &name, &input).await;
                results.push(block);
                if abort {
                    aborted = true;
                    break;
                }
            }
            self.messages.push(Message::tool_results(results));

            if aborted {
                self.set_status(AgentStatus::Cancelled, None);
                break TurnOutcome {
                    response: response_text,
                    stats: finish(&mut stats, started),
                    cancelled: true,
                };
            }
            // Back to thinking with the tool results appended.
        };

        self.status = AgentStatus::Idle;
        let _ = self.ui_tx.send(UiEvent::AgentDone {
            input_tokens: outcome.stats.input_tokens,
            output_tokens: outcome.stats.output_tokens,
            tool_calls: outcome.stats.tool_call_count,
            duration_ms: outcome.stats.duration_ms,
        });
        Ok(outcome)
    }

    /// Evaluate permissions and run one tool call. Returns the result
    /// block and whether the user aborted the turn.
    async fn handle_tool_use(&mut self, id: &str, name: &str, input: &Value) -> (ContentBlock, bool) {
        let _ = self.ui_tx.send(UiEvent::ToolCall {
            name: name.to_string(),
            args_summary: format_args_summary(input),
        });

        // Doom-loop short circuit before anything else.
        if self.loop_detector.record(name, &input.to_string()) {
            let _ = self.ui_tx.send(UiEvent::LoopWarning { tool_name: name.to_string() });
            return (
                error_result(
                    id,
                    format!(
                        "[Loop detected: {name} called with identical arguments. \
                         Try a different approach or more specific arguments.]"
                    ),
                ),
                false,
            );
        }

        let decision = self.permissions.evaluate(name, input);

        if decision.should_block {
            let reason = decision
                .danger_reason
                .unwrap_or_else(|| "matches the blocked-command list".to_string());
            let _ = self.ui_tx.send(UiEvent::ToolResult {
                summary: format!("blocked {name}: {reason}"),
                is_error: true,
            });
            return (
                error_result(id, format!("[Blocked: this command {reason}. It was not executed.]")),
                false,
            );
        }

        if !decision.auto_approved {
            self.set_status(AgentStatus::WaitingPermission, Some(name));
            let confirmation = ToolConfirmation {
                tool_name: name.to_string(),
                input: input.clone(),
                is_dangerous: decision.is_dangerous,
                danger_reason: decision.danger_reason.clone(),
            };
            let verdict = self
                .gateway
                .confirm(confirmation)
                .await
                .unwrap_or(ConfirmationDecision::Abort);
            match verdict {
                ConfirmationDecision::Approve => {}
                ConfirmationDecision::ApprovePattern(pattern) => {
                    self.permissions.add_pattern(&pattern);
                }
                ConfirmationDecision::ApproveCategory(category) => {
                    self.permissions.approve_category(&category);
                }
                ConfirmationDecision::Deny => {
                    let _ = self.ui_tx.send(UiEvent::ToolResult {
                        summary: format!("{name} denied by user"),
                        is_error: true,
                    });
                    return (error_result(id, "[Denied by user]".to_string()), false);
                }
                ConfirmationDecision::Abort => {
                    return (error_result(id, "[Aborted by user]".to_string()), true);
                }
            }
        }

        self.set_status(AgentStatus::ToolExecuting, Some(name));
        let Some(handler) = self.registry.get(name) else {
            return (error_result(id, format!("[Unknown tool: '{name}']")), false);
        };

        match handler.execute(input, &self.exec_context()).await {
            Ok(output) => {
                let _ = self.ui_tx.send(UiEvent::ToolResult {
                    summary: output.lines().next().unwrap_or("").to_string(),
                    is_error: false,
                });
                (
                    ContentBlock::ToolResult {
                        tool_use_id: id.to_string(),
                        content: output,
                        is_error: false,
                    },
                    false,
                )
            }
            Err(e) => {
                let _ = self.ui_tx.send(UiEvent::ToolResult {
                    summary: e.to_string(),
                    is_error: true,
                });
                (error_result(id, format!("[Tool error: {e}]")), false)
            }
        }
    }

    async fn rag_context(&self, task: &str) -> Option<String> {
        let retriever = self.retriever.as_ref()?;
        match retriever.search(task, None, None).await {
            Ok(results) if !results.is_empty() => Some(retriever.format_for_context(&results)),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(error = %e, "retrieval failed — continuing without context");
                None
            }
        }
    }
}

fn error_result(id: &str, content: String) -> ContentBlock {
    ContentBlock::ToolResult { tool_use_id: id.to_string(), content, is_error: true }
}

fn finish(stats: &mut TurnStats, started: std::time::Instant) -> TurnStats {
    stats.duration_ms = started.elapsed().as_millis() as u64;
    stats.clone()
}
