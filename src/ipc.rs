/// IPC between the orchestrator and its child agents.
///
/// Transport: one UNIX-domain stream socket connection per child.
/// Framing: newline-delimited JSON, one envelope per line. Within a
/// connection, delivery is order-preserving; permission responses are
/// correlated to requests by envelope id.
#[cfg(not(unix))]
compile_error!("codi orchestration requires Unix domain sockets; Windows is not supported yet");

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{
    unix::{OwnedReadHalf, OwnedWriteHalf},
    UnixListener, UnixStream,
};

use crate::error::IpcError;
use crate::permissions::{ConfirmationDecision, ToolConfirmation};

// ── Shared protocol types ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Starting,
    Idle,
    Thinking,
    ToolCall,
    WaitingPermission,
    Complete,
    Failed,
    Cancelled,
}

impl WorkerStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerStatus::Complete | WorkerStatus::Failed | WorkerStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokensUsed {
    pub input: u64,
    pub output: u64,
}

/// Payload of `task_complete` — the child's view of what it produced.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub response: String,
    pub commits: Vec<String>,
    pub files_changed: Vec<String>,
    #[serde(default)]
    pub pr_url: Option<String>,
    pub tool_call_count: usize,
    pub tokens_used: TokensUsed,
}

// ── Message kinds ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcPayload {
    Handshake {
        child_id: String,
        #[serde(default)]
        worktree: Option<String>,
        #[serde(default)]
        branch: Option<String>,
        task: String,
    },
    HandshakeAck {
        accepted: bool,
        #[serde(default)]
        model_override: Option<String>,
        tools: Vec<String>,
        auto_approve: Vec<String>,
    },
    PermissionRequest {
        confirmation: ToolConfirmation,
    },
    PermissionResponse {
        #[serde(flatten)]
        decision: ConfirmationDecision,
    },
    StatusUpdate {
        status: WorkerStatus,
        #[serde(default)]
        current_tool: Option<String>,
        #[serde(default)]
        progress: Option<u8>,
        #[serde(default)]
        tokens_used: Option<TokensUsed>,
    },
    Log {
        level: String,
        content: String,
    },
    TaskComplete {
        result: TaskOutcome,
    },
    TaskError {
        message: String,
    },
    Cancel {
        reason: String,
    },
    Ping,
    Pong,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    pub timestamp: String,
    #[serde(flatten)]
    pub payload: IpcPayload,
}

impl Envelope {
    pub fn new(id: String, payload: IpcPayload) -> Self {
        Self { id, timestamp: chrono::Utc::now().to_rfc3339(), payload }
    }
}

pub fn encode(envelope: &Envelope) -> Result<String, IpcError> {
    let mut line = serde_json::to_string(envelope)
        .map_err(|e| IpcError::Protocol(format!("unencodable message: {e}")))?;
    line.push('\n');
    Ok(line)
}

pub fn decode(line: &str) -> Result<Envelope, IpcError> {
    serde_json::from_str(line.trim()).map_err(|e| IpcError::Parse(format!("{e}: {line}")))
}

/// Default socket path for an orchestrator process.
pub fn socket_path(pid: u32) -> PathBuf {
    if cfg!(windows) {
        PathBuf::from(format!(r"\\.\pipe\codi-{pid}"))
    } else {
        std::env::temp_dir().join(format!("codi-orchestrator-{pid}.sock"))
    }
}

// ── Connection (framed stream) ────────────────────────────────────────────────

pub struct IpcConnection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    id_prefix: String,
    next_id: u64,
}

impl IpcConnection {
    pub fn new(stream: UnixStream, id_prefix: &str) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            id_prefix: id_prefix.to_string(),
            next_id: 1,
        }
    }

    fn fresh_id(&mut self) -> String {
        let id = format!("{}-{}", self.id_prefix, self.next_id);
        self.next_id += 1;
        id
    }

    /// Send a payload under a fresh id; returns the id for correlation.
    pub async fn send(&mut self, payload: IpcPayload) -> Result<String, IpcError> {
        let id = self.fresh_id();
        self.send_with_id(&id, payload).await?;
        Ok(id)
    }

    /// Send under a caller-chosen id (responses echo the request id).
    pub async fn send_with_id(&mut self, id: &str, payload: IpcPayload) -> Result<(), IpcError> {
        let line = encode(&Envelope::new(id.to_string(), payload))?;
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Read the next envelope. EOF is a clean `Disconnect`.
    pub async fn recv(&mut self) -> Result<Envelope, IpcError> {
        let mut line = String::new();
        loop {
            line.clear();
            let n = self.reader.read_line(&mut line).await?;
            if n == 0 {
                return Err(IpcError::Disconnect);
            }
            if line.trim().is_empty() {
                continue;
            }
            return decode(&line);
        }
    }

    /// Split into independent read and write halves so a task can select
    /// over inbound messages and an outbound queue at the same time.
    pub fn split(self) -> (IpcReader, IpcWriter) {
        (
            IpcReader { reader: self.reader },
            IpcWriter { writer: self.writer, id_prefix: self.id_prefix, next_id: self.next_id },
        )
    }
}

pub struct IpcReader {
    reader: BufReader<OwnedReadHalf>,
}

impl IpcReader {
    pub async fn recv(&mut self) -> Result<Envelope, IpcError> {
        let mut line = String::new();
        loop {
            line.clear();
            let n = self.reader.read_line(&mut line).await?;
            if n == 0 {
                return Err(IpcError::Disconnect);
            }
            if line.trim().is_empty() {
                continue;
            }
            return decode(&line);
        }
    }
}

pub struct IpcWriter {
    writer: OwnedWriteHalf,
    id_prefix: String,
    next_id: u64,
}

impl IpcWriter {
    fn fresh_id(&mut self) -> String {
        let id = format!("{}-{}", self.id_prefix, self.next_id);
        self.next_id += 1;
        id
    }

    pub async fn send(&mut self, payload: IpcPayload) -> Result<String, IpcError> {
        let id = self.fresh_id();
        self.send_with_id(&id, payload).await?;
        Ok(id)
    }

    pub async fn send_with_id(&mut self, id: &str, payload: IpcPayload) -> Result<(), IpcError> {
        let line = encode(&Envelope::new(id.to_string(), payload))?;
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

// ── Server ────────────────────────────────────────────────────────────────────

pub struct IpcServer {
    listener: UnixListener,
    path: PathBuf,
}

impl IpcServer {
    /// Bind the socket, replacing any stale file. The socket and its
    /// parent directory get restrictive permissions.
    pub async fn bind(path: &Path) -> Result<Self, IpcError> {
        if let Some(parent) = path.parent() {
            let parent_existed = parent.exists();
            tokio::fs::create_dir_all(parent).await?;
            if !parent_existed {
                set_mode(parent, 0o700).await?;
            }
        }
        if path.exists() {
            tokio::fs::remove_file(path).await?;
        }
        let listener = UnixListener::bind(path)?;
        set_mode(path, 0o600).await?;
        Ok(Self { listener, path: path.to_path_buf() })
    }

    pub async fn accept(&self, id_prefix: &str) -> Result<IpcConnection, IpcError> {
        let (stream, _) = self.listener.accept().await?;
        Ok(IpcConnection::new(stream, id_prefix))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

pub async fn connect(path: &Path, id_prefix: &str) -> Result<IpcConnection, IpcError> {
    let stream = UnixStream::connect(path).await?;
    Ok(IpcConnection::new(stream, id_prefix))
}

async fn set_mode(path: &Path, mode: u32) -> Result<(), IpcError> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
    Ok(())
}
