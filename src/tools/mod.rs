pub mod bash;
pub mod edit;
pub mod list;
pub mod read;
pub mod search;
pub mod write;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::ToolError;

// ── Definitions ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    pub parameters: Value,
    /// Read-only tools are the subset handed to reader agents.
    pub read_only: bool,
}

// ── Execution context ─────────────────────────────────────────────────────────

/// Ambient state a tool invocation runs under. Readers get a `scope`
/// prefix; every path argument must resolve inside it.
#[derive(Clone)]
pub struct ExecContext {
    pub scope: Option<PathBuf>,
    pub cancel: CancellationToken,
}

impl ExecContext {
    pub fn unrestricted() -> Self {
        Self { scope: None, cancel: CancellationToken::new() }
    }

    pub fn scoped(scope: PathBuf, cancel: CancellationToken) -> Self {
        Self { scope: Some(scope), cancel }
    }

    /// Enforce the scope prefix on a path argument. Paths are normalized
    /// lexically so `a/../../etc` cannot step outside the scope.
    pub fn check_scope(&self, tool: &str, path: &str) -> Result<(), ToolError> {
        let Some(scope) = &self.scope else { return Ok(()) };
        let resolved = normalize(path)
            .ok_or_else(|| ToolError::new(tool, format!("path escapes scope: {path}")))?;
        if resolved.starts_with(scope) {
            Ok(())
        } else {
            Err(ToolError::new(
                tool,
                format!("path outside allowed scope {}: {path}", scope.display()),
            ))
        }
    }
}

/// Lexical normalization: absolute paths stay as-is, relative paths are
/// anchored at the cwd. Returns None if `..` climbs above the anchor.
fn normalize(path: &str) -> Option<PathBuf> {
    let p = Path::new(path);
    let base = if p.is_absolute() {
        PathBuf::new()
    } else {
        std::env::current_dir().ok()?
    };
    let mut out = base;
    for comp in p.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            other => out.push(other),
        }
    }
    Some(out)
}

// ── Handler trait and registry ────────────────────────────────────────────────

#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn definition(&self) -> ToolDef;
    async fn execute(&self, args: &Value, ctx: &ExecContext) -> Result<String, ToolError>;
}

/// Immutable set of tools handed to an agent loop at construction.
/// Extension builds a new registry; nothing mutates a live one.
#[derive(Clone)]
pub struct ToolRegistry {
    entries: Arc<Vec<Arc<dyn ToolHandler>>>,
}

impl ToolRegistry {
    pub fn builder() -> ToolRegistryBuilder {
        ToolRegistryBuilder { entries: Vec::new() }
    }

    /// The standard tool set for a writer agent.
    pub fn standard() -> Self {
        Self::builder()
            .register(Arc::new(read::ReadFileTool))
            .register(Arc::new(write::WriteFileTool))
            .register(Arc::new(edit::EditFileTool))
            .register(Arc::new(list::ListFilesTool))
            .register(Arc::new(search::SearchTool))
            .register(Arc::new(bash::BashTool))
            .build()
    }

    pub fn definitions(&self) -> Vec<ToolDef> {
        self.entries.iter().map(|t| t.definition()).collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|t| t.definition().name).collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.entries
            .iter()
            .find(|t| t.definition().name == name)
            .cloned()
    }

    /// Registry containing only read-only tools (for reader agents).
    pub fn read_only(&self) -> Self {
        let entries = self
            .entries
            .iter()
            .filter(|t| t.definition().read_only)
            .cloned()
            .collect();
        Self { entries: Arc::new(entries) }
    }

    /// Registry restricted to the named tools (the handshake_ack list).
    pub fn retain(&self, names: &[String]) -> Self {
        let entries = self
            .entries
            .iter()
            .filter(|t| names.iter().any(|n| *n == t.definition().name))
            .cloned()
            .collect();
        Self { entries: Arc::new(entries) }
    }

    /// Builder seeded with this registry's tools. Plugins extend by
    /// producing a new registry; a live registry never mutates.
    pub fn to_builder(&self) -> ToolRegistryBuilder {
        ToolRegistryBuilder { entries: self.entries.iter().cloned().collect() }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub struct ToolRegistryBuilder {
    entries: Vec<Arc<dyn ToolHandler>>,
}

impl ToolRegistryBuilder {
    pub fn register(mut self, handler: Arc<dyn ToolHandler>) -> Self {
        self.entries.push(handler);
        self
    }

    pub fn build(self) -> ToolRegistry {
        ToolRegistry { entries: Arc::new(self.entries) }
    }
}

// ── Shared helpers ────────────────────────────────────────────────────────────

pub(crate) fn require_str<'a>(tool: &str, args: &'a Value, key: &str) -> Result<&'a str, ToolError> {
    args[key]
        .as_str()
        .ok_or_else(|| ToolError::new(tool, format!("missing '{key}'")))
}
