/// Child agent bootstrap — the same executable in worker/reader mode.
///
/// Startup handshake: connect → `handshake` → `handshake_ack` (tool list,
/// auto-approve patterns, optional model override) → run one agent turn
/// whose permission gateway forwards every confirmation to the parent
/// over IPC. Children hold no references to parent objects; everything
/// crosses the socket.
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use crate::agent::{Agent, AgentOptions, AgentStatus, PermissionGateway};
use crate::client::{Client, ModelProvider};
use crate::config::ResolvedConfig;
use crate::context::{ContextBudget, ContextManager};
use crate::error::IpcError;
use crate::ipc::{self, IpcConnection, IpcPayload, TaskOutcome, TokensUsed, WorkerStatus};
use crate::permissions::{ConfirmationDecision, PermissionEngine, ToolConfirmation};
use crate::tools::ToolRegistry;
use crate::ui::UiEvent;

const WORKER_SYSTEM_PROMPT: &str = "You are a focused coding agent working on one task in an \
isolated checkout. Use the available tools, keep changes minimal, commit your work with git \
when done, and finish with a short summary of what you changed.";

const READER_SYSTEM_PROMPT: &str = "You are a read-only analysis agent. Inspect the codebase \
with the available tools and answer the task. You cannot modify anything.";

// ── Arguments ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ChildArgs {
    pub socket: PathBuf,
    pub child_id: String,
    pub task: String,
    pub reader: bool,
    pub branch: Option<String>,
    pub base_branch: Option<String>,
    pub worktree: Option<PathBuf>,
    pub scope: Option<PathBuf>,
}

// ── Outbound side (shared by gateway, status observer, main flow) ─────────────

#[derive(Clone)]
struct Outbound {
    tx: mpsc::UnboundedSender<(String, IpcPayload)>,
    prefix: String,
    counter: Arc<AtomicU64>,
}

impl Outbound {
    fn new(prefix: &str) -> (Self, mpsc::UnboundedReceiver<(String, IpcPayload)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self { tx, prefix: prefix.to_string(), counter: Arc::new(AtomicU64::new(1)) },
            rx,
        )
    }

    fn send(&self, payload: IpcPayload) -> String {
        let id = format!("{}-{}", self.prefix, self.counter.fetch_add(1, Ordering::Relaxed));
        let _ = self.tx.send((id.clone(), payload));
        id
    }

    fn send_with_id(&self, id: &str, payload: IpcPayload) {
        let _ = self.tx.send((id.to_string(), payload));
    }
}

// ── IPC permission gateway ────────────────────────────────────────────────────

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<ConfirmationDecision>>>>;

struct IpcGateway {
    outbound: Outbound,
    pending: PendingMap,
    cancel: CancellationToken,
}

#[async_trait]
impl PermissionGateway for IpcGateway {
    async fn confirm(&self, confirmation: ToolConfirmation) -> Result<ConfirmationDecision> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let request_id = self.outbound.send(IpcPayload::PermissionRequest { confirmation });
        self.pending.lock().await.insert(request_id.clone(), reply_tx);

        // A cancel (or a dead connection) resolves as abort.
        let decision = tokio::select! {
            reply = reply_rx => reply.unwrap_or(ConfirmationDecision::Abort),
            _ = self.cancel.cancelled() => ConfirmationDecision::Abort,
        };
        self.pending.lock().await.remove(&request_id);
        Ok(decision)
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

/// Run a child to completion. Returns the process exit code.
pub async fn child_main(args: ChildArgs, resolved: &ResolvedConfig) -> Result<i32> {
    let mut conn = ipc::connect(&args.socket, &args.child_id)
        .await
        .map_err(|e| anyhow!("cannot reach orchestrator: {e}"))?;

    conn.send(IpcPayload::Handshake {
        child_id: args.child_id.clone(),
        worktree: args.worktree.as_ref().map(|p| p.to_string_lossy().into_owned()),
        branch: args.branch.clone(),
        task: args.task.clone(),
    })
    .await?;

    let ack = conn.recv().await?;
    let (model_override, tools, auto_approve) = match ack.payload {
        IpcPayload::HandshakeAck { accepted: true, model_override, tools, auto_approve } => {
            (model_override, tools, auto_approve)
        }
        IpcPayload::HandshakeAck { accepted: false, .. } => {
            bail!("orchestrator rejected handshake for '{}'", args.child_id)
        }
        other => bail!("expected handshake_ack, got {other:?}"),
    };

    let model = model_override.unwrap_or_else(|| resolved.model.clone());
    let provider: Arc<dyn ModelProvider> = Arc::new(
        Client::new(resolved.endpoint.clone(), model).with_api_key(resolved.api_key.clone()),
    );

    run_session(conn, provider, tools, auto_approve, args, resolved.context_tokens).await
}

/// Everything after the handshake, with the provider injected.
pub async fn run_session(
    conn: IpcConnection,
    provider: Arc<dyn ModelProvider>,
    tools: Vec<String>,
    auto_approve: Vec<String>,
    args: ChildArgs,
    context_tokens: u32,
) -> Result<i32> {
    // Workers operate inside their worktree.
    if let Some(worktree) = &args.worktree {
        std::env::set_current_dir(worktree)
            .map_err(|e| anyhow!("cannot enter worktree {}: {e}", worktree.display()))?;
    }

    let cancel = CancellationToken::new();
    let (outbound, mut out_rx) = Outbound::new(&args.child_id);
    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));

    let (mut reader, mut writer) = conn.split();

    // Writer task drains the outbound queue; it ends when every sender is
    // dropped, which is how task_complete is guaranteed to flush.
    let writer_task = tokio::spawn(async move {
        while let Some((id, payload)) = out_rx.recv().await {
            if writer.send_with_id(&id, payload).await.is_err() {
                break;
            }
        }
    });

    // Reader task: permission responses, cancel, pings.
    let reader_pending = pending.clone();
    let reader_cancel = cancel.clone();
    let reader_outbound = outbound.clone();
    let reader_task = tokio::spawn(async move {
        loop {
            match reader.recv().await {
                Ok(envelope) => match envelope.payload {
                    IpcPayload::PermissionResponse { decision } => {
                        if let Some(tx) = reader_pending.lock().await.remove(&envelope.id) {
                            let _ = tx.send(decision);
                        }
                    }
                    IpcPayload::Cancel { reason } => {
                        tracing::info!(%reason, "cancel received from orchestrator");
                        reader_cancel.cancel();
                    }
                    IpcPayload::Ping => {
                        reader_outbound.send_with_id(&envelope.id, IpcPayload::Pong);
                    }
                    other => {
                        tracing::debug!("ignoring message from parent: {other:?}");
                    }
                },
                Err(IpcError::Disconnect) => {
                    // Parent is gone; nothing left to ask. Abort everything.
                    reader_cancel.cancel();
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "IPC read failed");
                }
            }
        }
    });

    // Bridge agent UI events to parent log/status messages.
    let (ui_tx, mut ui_rx) = crate::ui::channel();
    let events_outbound = outbound.clone();
    let ui_task = tokio::spawn(async move {
        while let Some(event) = ui_rx.recv().await {
            match event {
                UiEvent::ToolCall { name, args_summary } => {
                    events_outbound.send(IpcPayload::Log {
                        level: "info".into(),
                        content: format!("tool {name}({args_summary})"),
                    });
                }
                UiEvent::AgentError(e) => {
                    events_outbound.send(IpcPayload::Log { level: "error".into(), content: e });
                }
                UiEvent::CompactionDone { removed_messages, .. } => {
                    events_outbound.send(IpcPayload::Log {
                        level: "debug".into(),
                        content: format!("compacted {removed_messages} messages"),
                    });
                }
                _ => {}
            }
        }
    });

    // Build the agent. Readers get the read-only registry and a scope.
    let registry = if args.reader {
        ToolRegistry::standard().read_only().retain(&tools)
    } else {
        ToolRegistry::standard().retain(&tools)
    };
    let gateway = Arc::new(IpcGateway {
        outbound: outbound.clone(),
        pending: pending.clone(),
        cancel: cancel.clone(),
    });
    let system_prompt = if args.reader { READER_SYSTEM_PROMPT } else { WORKER_SYSTEM_PROMPT };

    let mut agent = Agent::new(AgentOptions {
        provider,
        registry,
        permissions: Arc::new(PermissionEngine::new(&auto_approve, &[])),
        gateway,
        context: ContextManager::new(ContextBudget::for_window(context_tokens)),
        retriever: None,
        ui_tx,
        system_prompt: system_prompt.to_string(),
        cancel: cancel.clone(),
        scope: args.scope.clone(),
    });

    let status_outbound = outbound.clone();
    agent.set_status_observer(Box::new(move |status, current_tool| {
        status_outbound.send(IpcPayload::StatusUpdate {
            status: map_status(status),
            current_tool: current_tool.map(str::to_string),
            progress: None,
            tokens_used: None,
        });
    }));

    // Drive the task.
    let outcome = agent.run_turn(&args.task).await;
    // Release the agent's outbound clones (status observer, gateway) so
    // the writer can drain to completion below.
    drop(agent);

    let exit_code = match outcome {
        Ok(outcome) if outcome.cancelled => {
            outbound.send(IpcPayload::StatusUpdate {
                status: WorkerStatus::Cancelled,
                current_tool: None,
                progress: None,
                tokens_used: None,
            });
            130
        }
        Ok(outcome) => {
            let (commits, files_changed) = match (&args.worktree, &args.base_branch) {
                (Some(worktree), Some(base)) => collect_git_artifacts(worktree, base),
                _ => (Vec::new(), Vec::new()),
            };
            outbound.send(IpcPayload::TaskComplete {
                result: TaskOutcome {
                    response: outcome.response,
                    commits,
                    files_changed,
                    pr_url: None,
                    tool_call_count: outcome.stats.tool_call_count,
                    tokens_used: TokensUsed {
                        input: outcome.stats.input_tokens,
                        output: outcome.stats.output_tokens,
                    },
                },
            });
            0
        }
        Err(e) => {
            outbound.send(IpcPayload::TaskError { message: e.to_string() });
            1
        }
    };

    // Drop every outbound sender so the writer drains and finishes; the
    // final task_complete/task_error is flushed before we exit.
    drop(outbound);
    reader_task.abort();
    let _ = reader_task.await;
    let _ = ui_task.await;
    let _ = writer_task.await;

    Ok(exit_code)
}

fn map_status(status: AgentStatus) -> WorkerStatus {
    match status {
        AgentStatus::Idle => WorkerStatus::Idle,
        AgentStatus::Thinking => WorkerStatus::Thinking,
        AgentStatus::ToolPlan | AgentStatus::ToolExecuting => WorkerStatus::ToolCall,
        AgentStatus::WaitingPermission => WorkerStatus::WaitingPermission,
        AgentStatus::Cancelled => WorkerStatus::Cancelled,
        AgentStatus::Failed => WorkerStatus::Failed,
    }
}

/// Commits and changed files on the worker's branch relative to base.
/// Fail-soft: git trouble yields empty lists, never an error.
fn collect_git_artifacts(worktree: &std::path::Path, base_branch: &str) -> (Vec<String>, Vec<String>) {
    let run = |git_args: &[&str]| -> Option<String> {
        let output = std::process::Command::new("git")
            .args(git_args)
            .current_dir(worktree)
            .output()
            .ok()?;
        output
            .status
            .success()
            .then(|| String::from_utf8_lossy(&output.stdout).into_owned())
    };

    let commits = run(&["rev-list", &format!("{base_branch}..HEAD")])
        .map(|out| out.lines().map(str::to_string).collect())
        .unwrap_or_default();

    let mut files: Vec<String> = run(&["diff", "--name-only", &format!("{base_branch}..HEAD")])
        .map(|out| out.lines().map(str::to_string).collect())
        .unwrap_or_default();
    if let Some(porcelain) = run(&["status", "--porcelain"]) {
        for line in porcelain.lines() {
            if let Some(name) = line.get(3..) {
                if !files.iter().any(|f| f == name) {
                    files.push(name.to_string());
                }
            }
        }
    }
    files.sort();
    (commits, files)
}
