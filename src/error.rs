/// Error kinds shared across subsystems.
///
/// Each subsystem exposes its own enum rather than one crate-wide error:
/// the agent loop, indexer, and orchestrator all react differently to the
/// same underlying failure (a transient HTTP error retries, a dimension
/// mismatch rebuilds the index, an IPC disconnect fails one worker).
/// Application-level glue uses `anyhow` and wraps these with context.
use thiserror::Error;

// ── Provider ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ProviderError {
    /// Retryable: timeouts, 429, 5xx, connection resets.
    #[error("provider error (transient): {0}")]
    Transient(String),
    /// Not retryable: bad auth, unknown model, malformed request.
    #[error("provider error: {0}")]
    Fatal(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

// ── Tools & permissions ───────────────────────────────────────────────────────

#[derive(Debug, Error)]
#[error("tool '{tool}' failed: {detail}")]
pub struct ToolError {
    pub tool: String,
    pub detail: String,
}

impl ToolError {
    pub fn new(tool: &str, detail: impl Into<String>) -> Self {
        Self {
            tool: tool.to_string(),
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Error)]
#[error("permission denied for '{tool}'{}", .reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default())]
pub struct PermissionDenied {
    pub tool: String,
    pub reason: Option<String>,
}

// ── Worktrees ─────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
#[error("git {op} failed: {detail}")]
pub struct WorktreeError {
    pub op: &'static str,
    pub detail: String,
}

// ── IPC ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum IpcError {
    /// Peer closed the connection (EOF or broken pipe).
    #[error("IPC disconnect")]
    Disconnect,
    #[error("IPC parse error: {0}")]
    Parse(String),
    /// Well-formed message that violates the expected sequence
    /// (e.g. a payload before the handshake completed).
    #[error("IPC protocol error: {0}")]
    Protocol(String),
    #[error("IPC i/o error: {0}")]
    Io(#[from] std::io::Error),
}

// ── Index ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("index corrupted: {0}")]
    Corruption(String),
    #[error("embedding dimension mismatch: store has {stored}, provider produces {current}")]
    DimMismatch { stored: usize, current: usize },
    #[error("index i/o error: {0}")]
    Io(#[from] std::io::Error),
}

// ── Compaction & config ───────────────────────────────────────────────────────

#[derive(Debug, Error)]
#[error("compaction failed: {0}")]
pub struct CompactionError(pub String);

#[derive(Debug, Error)]
#[error("config error: {0}")]
pub struct ConfigError(pub String);
