/// Session persistence.
///
/// One JSON file per session under `~/.local/share/codi/sessions/`.
/// The message history is stored verbatim (including compaction summary
/// messages with their legends); orphaned tool results are filtered on
/// load, never on save, so the on-disk file stays a faithful record.
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::messages::{filter_orphaned_tool_results, Message};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionFile {
    pub name: String,
    #[serde(default)]
    pub label: Option<String>,
    pub created: String,
    pub updated: String,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub summary: Option<String>,
}

impl SessionFile {
    pub fn new(name: &str, project: Option<String>) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            name: name.to_string(),
            label: None,
            created: now.clone(),
            updated: now,
            project,
            provider: None,
            model: None,
            messages: Vec::new(),
            summary: None,
        }
    }

    /// Load a session, dropping any tool_result whose tool_use was lost
    /// to an earlier compaction before the session was saved.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read session {}", path.display()))?;
        let mut session: SessionFile = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse session {}", path.display()))?;
        session.messages = filter_orphaned_tool_results(&session.messages);
        Ok(session)
    }

    pub fn save(&mut self, path: &Path) -> Result<()> {
        self.updated = chrono::Utc::now().to_rfc3339();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(path, raw)
            .with_context(|| format!("failed to write session {}", path.display()))
    }
}

// ── Directory helpers ─────────────────────────────────────────────────────────

pub fn sessions_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .ok()
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            PathBuf::from(std::env::var("HOME").unwrap_or_default()).join(".local/share")
        })
        .join("codi/sessions")
}

pub fn session_path(name: &str) -> PathBuf {
    sessions_dir().join(format!("{name}.json"))
}

/// Session names in a directory, most recently updated first.
pub fn list_sessions_in(dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else { return Vec::new() };
    let mut sessions: Vec<(String, String)> = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let path = e.path();
            if path.extension()?.to_str()? != "json" {
                return None;
            }
            let session = SessionFile::load(&path).ok()?;
            Some((session.name, session.updated))
        })
        .collect();
    sessions.sort_by(|a, b| b.1.cmp(&a.1));
    sessions.into_iter().map(|(name, _)| name).collect()
}

pub fn list_sessions() -> Vec<String> {
    list_sessions_in(&sessions_dir())
}

pub fn latest_session() -> Option<String> {
    list_sessions().into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::ContentBlock;

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alpha.json");

        let mut session = SessionFile::new("alpha", Some("myproject".into()));
        session.messages.push(Message::user("hello"));
        session.messages.push(Message::assistant("hi there"));
        session.save(&path).unwrap();

        let loaded = SessionFile::load(&path).unwrap();
        assert_eq!(loaded.name, "alpha");
        assert_eq!(loaded.project.as_deref(), Some("myproject"));
        assert_eq!(loaded.messages.len(), 2);
        assert_eq!(loaded.messages[1].text_content(), "hi there");
    }

    #[test]
    fn test_load_filters_orphaned_tool_results() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orphans.json");

        let mut session = SessionFile::new("orphans", None);
        session.messages.push(Message::assistant("summary of compacted work"));
        session.messages.push(Message::tool_results(vec![ContentBlock::ToolResult {
            tool_use_id: "lost-to-compaction".into(),
            content: "stale".into(),
            is_error: false,
        }]));
        session.save(&path).unwrap();

        let loaded = SessionFile::load(&path).unwrap();
        assert_eq!(loaded.messages.len(), 1, "orphaned tool_result filtered on load");
    }

    #[test]
    fn test_list_orders_by_updated() {
        let dir = tempfile::tempdir().unwrap();

        let mut old = SessionFile::new("old", None);
        old.save(&dir.path().join("old.json")).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let mut new = SessionFile::new("new", None);
        new.save(&dir.path().join("new.json")).unwrap();

        let names = list_sessions_in(dir.path());
        assert_eq!(names, vec!["new".to_string(), "old".to_string()]);
    }

    #[test]
    fn test_missing_file_errors() {
        assert!(SessionFile::load(Path::new("/no/such/session.json")).is_err());
    }
}
