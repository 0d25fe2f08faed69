/// Orchestrator — spawns child agents, routes their permission requests
/// to the single human at the parent, and aggregates results.
///
/// Writers get a per-branch worktree; readers run in place with a
/// read-only tool subset. Children are full subprocesses of this
/// executable in child mode, talking NDJSON over the orchestrator's
/// UNIX socket. One confirmation is active on the UI at a time;
/// the broker queues the rest FIFO.
use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::ipc::{self, Envelope, IpcPayload, IpcServer, TaskOutcome, TokensUsed, WorkerStatus};
use crate::permissions::{ConfirmationDecision, ToolConfirmation};
use crate::tools::ToolRegistry;
use crate::ui::{ConfirmationRequest, UiEvent, UiSender};
use crate::worktree::{valid_branch_name, WorktreeManager};

const PING_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);
/// Terminal results linger this long waiting for a consumer.
const RESULT_TTL: chrono::Duration = chrono::Duration::minutes(10);

// ── Public data model ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub id: String,
    pub branch: String,
    pub task: String,
    pub base_branch: String,
    pub model: Option<String>,
    pub auto_approve_tools: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ReaderConfig {
    pub id: String,
    pub task: String,
    /// Filesystem scope prefix enforced on the child's tools.
    pub scope: Option<PathBuf>,
    pub model: Option<String>,
    pub auto_approve_tools: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerResult {
    pub worker_id: String,
    pub branch: String,
    pub success: bool,
    pub duration_ms: u64,
    pub tool_call_count: usize,
    pub tokens_used: TokensUsed,
    pub commits: Vec<String>,
    pub files_changed: Vec<String>,
    pub pr_url: Option<String>,
    pub response: String,
    pub error: Option<String>,
}

/// Read-only view of one child's state.
#[derive(Debug, Clone)]
pub struct ChildSnapshot {
    pub id: String,
    pub kind: ChildKind,
    pub status: WorkerStatus,
    pub current_tool: Option<String>,
    pub progress: Option<u8>,
    pub tokens_used: TokensUsed,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildKind {
    Worker,
    Reader,
}

// ── Internal state ────────────────────────────────────────────────────────────

struct ChildState {
    kind: ChildKind,
    branch: String,
    model: Option<String>,
    auto_approve_tools: Vec<String>,

    status: WorkerStatus,
    current_tool: Option<String>,
    progress: Option<u8>,
    tokens_used: TokensUsed,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    error: Option<String>,

    worktree: Option<PathBuf>,
    /// Held so kill_on_drop reaps the subprocess with its entry.
    process: Option<tokio::process::Child>,
    outbound: Option<mpsc::UnboundedSender<(String, IpcPayload)>>,
    result: Option<WorkerResult>,
}

impl ChildState {
    fn snapshot(&self, id: &str) -> ChildSnapshot {
        ChildSnapshot {
            id: id.to_string(),
            kind: self.kind,
            status: self.status,
            current_tool: self.current_tool.clone(),
            progress: self.progress,
            tokens_used: self.tokens_used,
            started_at: self.started_at,
            completed_at: self.completed_at,
            error: self.error.clone(),
        }
    }
}

struct PendingConfirmation {
    child_id: String,
    request_id: String,
    confirmation: ToolConfirmation,
}

// ── Orchestrator ──────────────────────────────────────────────────────────────

pub struct Orchestrator {
    children: Arc<Mutex<HashMap<String, ChildState>>>,
    worktrees: Arc<WorktreeManager>,
    ui_tx: UiSender,
    socket_path: PathBuf,
    broker_tx: mpsc::UnboundedSender<PendingConfirmation>,
}

impl Orchestrator {
    /// Bind the IPC socket and start the accept loop and the permission
    /// broker. The returned handle is cheap to clone by reference.
    pub async fn start(
        worktrees: Arc<WorktreeManager>,
        ui_tx: UiSender,
        socket_path: PathBuf,
    ) -> Result<Arc<Self>> {
        let server = IpcServer::bind(&socket_path)
            .await
            .map_err(|e| anyhow!("failed to bind orchestrator socket: {e}"))?;

        // Dangling worktrees from a crashed run are pruned up front.
        if let Err(e) = worktrees.cleanup() {
            tracing::warn!(error = %e, "worktree cleanup failed");
        }

        let (broker_tx, broker_rx) = mpsc::unbounded_channel();
        let orchestrator = Arc::new(Self {
            children: Arc::new(Mutex::new(HashMap::new())),
            worktrees,
            ui_tx,
            socket_path,
            broker_tx,
        });

        tokio::spawn(Self::accept_loop(orchestrator.clone(), server));
        tokio::spawn(Self::permission_broker(orchestrator.clone(), broker_rx));
        Ok(orchestrator)
    }

    pub fn socket_path(&self) -> &PathBuf {
        &self.socket_path
    }

    // ── Spawning ──────────────────────────────────────────────────────────────

    /// Create the worktree, register the worker, launch the subprocess.
    /// A worktree failure means no child is spawned at all.
    pub async fn spawn_worker(&self, config: WorkerConfig) -> Result<()> {
        if !valid_branch_name(&config.branch) {
            bail!("invalid branch name '{}'", config.branch);
        }
        let worktree = self
            .worktrees
            .create(&config.branch, &config.base_branch)
            .map_err(|e| anyhow!("worktree creation failed, worker not spawned: {e}"))?;

        let mut state = ChildState {
            kind: ChildKind::Worker,
            branch: config.branch.clone(),
            model: config.model.clone(),
            auto_approve_tools: config.auto_approve_tools.clone(),
            status: WorkerStatus::Starting,
            current_tool: None,
            progress: None,
            tokens_used: TokensUsed::default(),
            started_at: Utc::now(),
            completed_at: None,
            error: None,
            worktree: Some(worktree.clone()),
            process: None,
            outbound: None,
            result: None,
        };

        let worktree_arg = worktree.to_string_lossy().into_owned();
        match self.launch_child(&config.id, &[
            "--child-worker",
            "--child-id", &config.id,
            "--child-task", &config.task,
            "--branch", &config.branch,
            "--base-branch", &config.base_branch,
            "--worktree", &worktree_arg,
        ]) {
            Ok(child) => state.process = Some(child),
            Err(e) => {
                let _ = self.worktrees.remove(&worktree);
                return Err(e);
            }
        }

        self.children.lock().await.insert(config.id.clone(), state);
        Ok(())
    }

    /// Readers skip the worktree entirely.
    pub async fn spawn_reader(&self, config: ReaderConfig) -> Result<()> {
        let mut args: Vec<String> = vec![
            "--child-reader".into(),
            "--child-id".into(), config.id.clone(),
            "--child-task".into(), config.task.clone(),
        ];
        if let Some(scope) = &config.scope {
            args.push("--scope".into());
            args.push(scope.to_string_lossy().into_owned());
        }
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let child = self.launch_child(&config.id, &arg_refs)?;

        let state = ChildState {
            kind: ChildKind::Reader,
            branch: String::new(),
            model: config.model,
            auto_approve_tools: config.auto_approve_tools,
            status: WorkerStatus::Starting,
            current_tool: None,
            progress: None,
            tokens_used: TokensUsed::default(),
            started_at: Utc::now(),
            completed_at: None,
            error: None,
            worktree: None,
            process: Some(child),
            outbound: None,
            result: None,
        };
        self.children.lock().await.insert(config.id.clone(), state);
        Ok(())
    }

    fn launch_child(&self, child_id: &str, args: &[&str]) -> Result<tokio::process::Child> {
        let exe = std::env::current_exe()?;
        let child = tokio::process::Command::new(exe)
            .args(args)
            .arg("--socket")
            .arg(&self.socket_path)
            .env("CODI_SOCKET", &self.socket_path)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| anyhow!("failed to spawn child '{child_id}': {e}"))?;
        Ok(child)
    }

    // ── Queries ───────────────────────────────────────────────────────────────

    pub async fn get_worker(&self, id: &str) -> Option<ChildSnapshot> {
        let children = self.children.lock().await;
        children
            .get(id)
            .filter(|c| c.kind == ChildKind::Worker)
            .map(|c| c.snapshot(id))
    }

    pub async fn get_reader(&self, id: &str) -> Option<ChildSnapshot> {
        let children = self.children.lock().await;
        children
            .get(id)
            .filter(|c| c.kind == ChildKind::Reader)
            .map(|c| c.snapshot(id))
    }

    pub async fn list_children(&self) -> Vec<ChildSnapshot> {
        let children = self.children.lock().await;
        let mut all: Vec<ChildSnapshot> =
            children.iter().map(|(id, c)| c.snapshot(id)).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Remove and return a terminal child's result.
    pub async fn take_result(&self, id: &str) -> Option<WorkerResult> {
        let mut children = self.children.lock().await;
        if children.get(id).is_some_and(|c| c.status.is_terminal()) {
            children.remove(id).and_then(|c| c.result)
        } else {
            None
        }
    }

    // ── Cancellation & shutdown ───────────────────────────────────────────────

    /// Cancel one child: notify it, mark it cancelled, clean up.
    pub async fn cancel(&self, id: &str, reason: &str) {
        let outbound = {
            let mut children = self.children.lock().await;
            let Some(child) = children.get_mut(id) else { return };
            if child.status.is_terminal() {
                return;
            }
            child.status = WorkerStatus::Cancelled;
            child.error = Some(format!("cancelled: {reason}"));
            child.outbound.clone()
        };
        if let Some(tx) = outbound {
            let _ = tx.send(("cancel".to_string(), IpcPayload::Cancel { reason: reason.to_string() }));
        }
        self.finalize(id, None, Some(format!("cancelled: {reason}")), WorkerStatus::Cancelled)
            .await;
    }

    /// Completes when no non-terminal children remain; reaps results
    /// past their TTL along the way.
    pub async fn wait_all(&self) {
        loop {
            {
                let mut children = self.children.lock().await;
                let now = Utc::now();
                children.retain(|_, c| {
                    !(c.status.is_terminal()
                        && c.completed_at
                            .is_some_and(|done| now.signed_duration_since(done) > RESULT_TTL))
                });
                if children.values().all(|c| c.status.is_terminal()) {
                    return;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
    }

    // ── IPC server side ───────────────────────────────────────────────────────

    async fn accept_loop(self: Arc<Self>, server: IpcServer) {
        loop {
            match server.accept("orch").await {
                Ok(conn) => {
                    let orchestrator = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = orchestrator.handle_connection(conn).await {
                            tracing::debug!(error = %e, "child connection ended");
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed — orchestrator socket closing");
                    return;
                }
            }
        }
    }

    async fn handle_connection(&self, mut conn: ipc::IpcConnection) -> Result<()> {
        // First message must be the handshake.
        let envelope = conn.recv().await?;
        let (child_id, _worktree, _branch) = match envelope.payload {
            IpcPayload::Handshake { child_id, worktree, branch, .. } => (child_id, worktree, branch),
            other => {
                bail!("expected handshake, got {other:?}");
            }
        };

        let ack = {
            let mut children = self.children.lock().await;
            match children.get_mut(&child_id) {
                Some(child) if child.status == WorkerStatus::Starting => {
                    let tools = match child.kind {
                        ChildKind::Worker => ToolRegistry::standard().names(),
                        ChildKind::Reader => ToolRegistry::standard().read_only().names(),
                    };
                    IpcPayload::HandshakeAck {
                        accepted: true,
                        model_override: child.model.clone(),
                        tools,
                        auto_approve: child.auto_approve_tools.clone(),
                    }
                }
                _ => IpcPayload::HandshakeAck {
                    accepted: false,
                    model_override: None,
                    tools: Vec::new(),
                    auto_approve: Vec::new(),
                },
            }
        };
        let accepted = matches!(ack, IpcPayload::HandshakeAck { accepted: true, .. });
        conn.send_with_id(&envelope.id, ack).await?;
        if !accepted {
            bail!("rejected handshake from unknown child '{child_id}'");
        }

        // Register the outbound channel and transition to idle.
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<(String, IpcPayload)>();
        {
            let mut children = self.children.lock().await;
            if let Some(child) = children.get_mut(&child_id) {
                child.outbound = Some(out_tx);
                child.status = WorkerStatus::Idle;
            }
        }
        self.emit_update(&child_id).await;

        let (mut reader, mut writer) = conn.split();
        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.tick().await; // immediate first tick consumed
        let mut missed_pongs = 0u8;
        let mut awaiting_pong = false;

        let disconnect_reason: Option<String> = loop {
            tokio::select! {
                incoming = reader.recv() => match incoming {
                    Ok(env) => {
                        if matches!(env.payload, IpcPayload::Pong) {
                            awaiting_pong = false;
                            missed_pongs = 0;
                            continue;
                        }
                        if self.handle_message(&child_id, env).await {
                            break None; // terminal message handled
                        }
                    }
                    Err(e) => break Some(e.to_string()),
                },
                outgoing = out_rx.recv() => match outgoing {
                    Some((id, payload)) => {
                        if writer.send_with_id(&id, payload).await.is_err() {
                            break Some("IPC disconnect".to_string());
                        }
                    }
                    None => break None,
                },
                _ = ping.tick() => {
                    if awaiting_pong {
                        missed_pongs += 1;
                        if missed_pongs >= 2 {
                            break Some("child unresponsive (missed pongs)".to_string());
                        }
                    }
                    awaiting_pong = true;
                    if writer.send(IpcPayload::Ping).await.is_err() {
                        break Some("IPC disconnect".to_string());
                    }
                }
            }
        };

        if let Some(reason) = disconnect_reason {
            let needs_fail = {
                let children = self.children.lock().await;
                children.get(&child_id).is_some_and(|c| !c.status.is_terminal())
            };
            if needs_fail {
                let error = if reason.contains("unresponsive") {
                    reason
                } else {
                    "IPC disconnect".to_string()
                };
                self.finalize(&child_id, None, Some(error), WorkerStatus::Failed).await;
            }
        }
        Ok(())
    }

    /// Returns true when the message was terminal for the child.
    async fn handle_message(&self, child_id: &str, envelope: Envelope) -> bool {
        match envelope.payload {
            IpcPayload::StatusUpdate { status, current_tool, progress, tokens_used } => {
                {
                    let mut children = self.children.lock().await;
                    if let Some(child) = children.get_mut(child_id) {
                        if !child.status.is_terminal() {
                            child.status = status;
                        }
                        child.current_tool = current_tool;
                        child.progress = progress;
                        if let Some(t) = tokens_used {
                            child.tokens_used = t;
                        }
                    }
                }
                self.emit_update(child_id).await;
                false
            }
            IpcPayload::Log { level, content } => {
                tracing::debug!(child = child_id, %level, "{content}");
                false
            }
            IpcPayload::PermissionRequest { confirmation } => {
                let _ = self.broker_tx.send(PendingConfirmation {
                    child_id: child_id.to_string(),
                    request_id: envelope.id,
                    confirmation,
                });
                false
            }
            IpcPayload::TaskComplete { result } => {
                self.finalize(child_id, Some(result), None, WorkerStatus::Complete).await;
                true
            }
            IpcPayload::TaskError { message } => {
                self.finalize(child_id, None, Some(message), WorkerStatus::Failed).await;
                true
            }
            other => {
                tracing::warn!(child = child_id, "unexpected message: {other:?}");
                false
            }
        }
    }

    /// Move a child to a terminal state: build its result, clean up the
    /// worktree, emit the final event.
    async fn finalize(
        &self,
        child_id: &str,
        outcome: Option<TaskOutcome>,
        error: Option<String>,
        status: WorkerStatus,
    ) {
        let (result, worktree) = {
            let mut children = self.children.lock().await;
            let Some(child) = children.get_mut(child_id) else { return };
            if child.result.is_some() {
                return; // already finalized
            }
            child.status = status;
            child.completed_at = Some(Utc::now());
            child.error = error.clone();
            child.current_tool = None;

            let duration_ms = child
                .completed_at
                .unwrap()
                .signed_duration_since(child.started_at)
                .num_milliseconds()
                .max(0) as u64;
            let outcome = outcome.unwrap_or_default();
            if outcome.tokens_used != TokensUsed::default() {
                child.tokens_used = outcome.tokens_used;
            }
            let result = WorkerResult {
                worker_id: child_id.to_string(),
                branch: child.branch.clone(),
                success: status == WorkerStatus::Complete,
                duration_ms,
                tool_call_count: outcome.tool_call_count,
                tokens_used: child.tokens_used,
                commits: outcome.commits,
                files_changed: outcome.files_changed,
                pr_url: outcome.pr_url,
                response: outcome.response,
                error,
            };
            child.result = Some(result.clone());
            (result, child.worktree.take())
        };

        if let Some(path) = worktree {
            if let Err(e) = self.worktrees.remove(&path) {
                tracing::warn!(error = %e, "worktree cleanup failed");
            }
        }

        let _ = self.ui_tx.send(UiEvent::WorkerDone(Box::new(result)));
    }

    async fn emit_update(&self, child_id: &str) {
        let children = self.children.lock().await;
        if let Some(child) = children.get(child_id) {
            let _ = self.ui_tx.send(UiEvent::WorkerUpdate {
                id: child_id.to_string(),
                status: child.status,
                current_tool: child.current_tool.clone(),
                progress: child.progress,
            });
        }
    }

    // ── Permission broker ─────────────────────────────────────────────────────

    /// One confirmation active on the UI at a time; the queue is FIFO.
    /// A child that went terminal while queued is skipped (its pending
    /// requests are void).
    async fn permission_broker(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<PendingConfirmation>,
    ) {
        while let Some(pending) = rx.recv().await {
            let still_active = {
                let children = self.children.lock().await;
                children
                    .get(&pending.child_id)
                    .is_some_and(|c| !c.status.is_terminal())
            };
            if !still_active {
                continue;
            }

            {
                let mut children = self.children.lock().await;
                if let Some(child) = children.get_mut(&pending.child_id) {
                    child.status = WorkerStatus::WaitingPermission;
                }
            }
            self.emit_update(&pending.child_id).await;

            let (reply_tx, reply_rx) = oneshot::channel();
            let sent = self.ui_tx.send(UiEvent::Confirmation(ConfirmationRequest {
                id: pending.request_id.clone(),
                worker_id: Some(pending.child_id.clone()),
                confirmation: pending.confirmation,
                reply: reply_tx,
            }));
            let decision = if sent.is_ok() {
                reply_rx.await.unwrap_or(ConfirmationDecision::Abort)
            } else {
                ConfirmationDecision::Abort
            };

            let outbound = {
                let children = self.children.lock().await;
                children
                    .get(&pending.child_id)
                    .filter(|c| !c.status.is_terminal())
                    .and_then(|c| c.outbound.clone())
            };
            if let Some(tx) = outbound {
                let _ = tx.send((
                    pending.request_id,
                    IpcPayload::PermissionResponse { decision },
                ));
            }
        }
    }
}
