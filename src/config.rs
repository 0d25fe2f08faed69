use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

// ── Profile ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    /// OpenAI-compatible endpoint URL
    pub endpoint: String,
    /// Model identifier
    pub model: String,
    /// Context window size in tokens. Drives the context budget manager.
    #[serde(default = "default_context_tokens")]
    pub context_tokens: u32,
    /// Optional API key (sent as Bearer token)
    pub api_key: Option<String>,
    /// Per-call timeout for provider requests, seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_context_tokens() -> u32 {
    32_768
}

fn default_request_timeout_secs() -> u64 {
    120
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:11434/v1/chat/completions".to_string(),
            model: "qwen3:14b".to_string(),
            context_tokens: default_context_tokens(),
            api_key: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

// ── User config file (~/.config/codi/config.toml) ─────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConfigFile {
    /// Which profile to use when none is specified
    #[serde(default = "default_profile_name")]
    pub default_profile: String,

    #[serde(default)]
    pub profiles: HashMap<String, Profile>,
}

fn default_profile_name() -> String {
    "default".to_string()
}

impl ConfigFile {
    /// Load from disk, or return a default config if the file doesn't exist yet.
    pub fn load() -> Result<Self> {
        let path = config_path();
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file at {}", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file at {}", path.display()))
    }

    /// Resolve the active profile given an optional override name.
    pub fn resolve_profile(&self, name: Option<&str>) -> Option<&Profile> {
        let key = name.unwrap_or(&self.default_profile);
        self.profiles.get(key)
    }
}

// ── Resolved runtime config (after merging file + CLI overrides) ──────────────

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub endpoint: String,
    pub model: String,
    pub context_tokens: u32,
    pub api_key: Option<String>,
    pub request_timeout_secs: u64,
    /// Profile name that was resolved (for display)
    pub profile_name: String,
}

impl ResolvedConfig {
    /// Merge config file profile with CLI overrides.
    /// Priority: CLI args > env vars (handled by clap) > config file profile > built-in defaults
    pub fn resolve(
        file: &ConfigFile,
        profile_override: Option<&str>,
        endpoint_override: Option<&str>,
        model_override: Option<&str>,
        api_key_override: Option<&str>,
    ) -> Self {
        let profile_name = profile_override
            .unwrap_or(&file.default_profile)
            .to_string();

        let base = file
            .resolve_profile(profile_override)
            .cloned()
            .unwrap_or_default();

        Self {
            endpoint: endpoint_override
                .map(str::to_string)
                .unwrap_or(base.endpoint),
            model: model_override
                .map(str::to_string)
                .unwrap_or(base.model),
            context_tokens: base.context_tokens,
            api_key: api_key_override
                .map(str::to_string)
                .or(base.api_key),
            request_timeout_secs: base.request_timeout_secs,
            profile_name,
        }
    }
}

// ── Project config (.codi.json at the project root) ───────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProviderKind {
    #[default]
    Auto,
    Openai,
    Ollama,
    Modelmap,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DangerousPattern {
    pub pattern: String,
    pub description: String,
    #[serde(default)]
    pub block: bool,
}

/// Per-project settings: the RAG pipeline, retrieval defaults, and the
/// permission pattern tables. All keys are optional; serde fills defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProjectConfig {
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub embedding_provider: EmbeddingProviderKind,
    pub openai_model: String,
    pub ollama_model: String,
    pub ollama_base_url: String,
    pub top_k: usize,
    pub min_score: f32,
    pub auto_index: bool,
    pub watch_files: bool,
    pub parallel_jobs: usize,
    pub approval_patterns: Vec<String>,
    pub dangerous_patterns: Vec<DangerousPattern>,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            include_patterns: vec![
                "**/*.rs".into(),
                "**/*.ts".into(),
                "**/*.tsx".into(),
                "**/*.js".into(),
                "**/*.py".into(),
                "**/*.go".into(),
            ],
            exclude_patterns: Vec::new(),
            embedding_provider: EmbeddingProviderKind::Auto,
            openai_model: "text-embedding-3-small".into(),
            ollama_model: "nomic-embed-text".into(),
            ollama_base_url: "http://localhost:11434".into(),
            top_k: 5,
            min_score: 0.25,
            auto_index: false,
            watch_files: false,
            parallel_jobs: 4,
            approval_patterns: Vec::new(),
            dangerous_patterns: Vec::new(),
        }
    }
}

impl ProjectConfig {
    /// Load `<root>/.codi.json`, falling back to defaults when absent.
    pub fn load(root: &Path) -> Result<Self, ConfigError> {
        let path = root.join(".codi.json");
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(&path)
            .map_err(|e| ConfigError(format!("failed to read {}: {e}", path.display())))?;
        serde_json::from_str(&raw)
            .map_err(|e| ConfigError(format!("failed to parse {}: {e}", path.display())))
    }

    /// Parallel jobs clamped to the supported range; out-of-range values
    /// are coerced silently.
    pub fn parallel_jobs_clamped(&self) -> usize {
        self.parallel_jobs.clamp(1, 16)
    }
}

// ── Paths ─────────────────────────────────────────────────────────────────────

pub fn config_path() -> PathBuf {
    dirs_config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("codi")
        .join("config.toml")
}

fn dirs_config_dir() -> Option<PathBuf> {
    // XDG_CONFIG_HOME or ~/.config on Linux/macOS, %APPDATA% on Windows
    std::env::var("XDG_CONFIG_HOME")
        .ok()
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join(".config"))
        })
}

/// `<project>/.codi/index/` — the on-disk vector index location.
pub fn index_dir(root: &Path) -> PathBuf {
    root.join(".codi").join("index")
}

/// Sidecar cache tracking (mtime, size) per indexed file.
pub fn index_cache_path(root: &Path) -> PathBuf {
    root.join(".codi").join("index-cache.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_prefers_overrides() {
        let mut file = ConfigFile::default();
        file.profiles.insert(
            "default".into(),
            Profile {
                endpoint: "http://profile".into(),
                model: "profile-model".into(),
                ..Profile::default()
            },
        );
        let resolved = ResolvedConfig::resolve(&file, None, Some("http://cli"), None, None);
        assert_eq!(resolved.endpoint, "http://cli");
        assert_eq!(resolved.model, "profile-model");
    }

    #[test]
    fn test_project_config_camel_case_keys() {
        let raw = r#"{
            "includePatterns": ["src/**/*.ts"],
            "embeddingProvider": "ollama",
            "ollamaBaseUrl": "http://box:11434",
            "topK": 8,
            "minScore": 0.5,
            "parallelJobs": 99,
            "approvalPatterns": ["read:*", "bash:npm test"],
            "dangerousPatterns": [
                {"pattern": "deploy --prod", "description": "production deploy", "block": true}
            ]
        }"#;
        let cfg: ProjectConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.include_patterns, vec!["src/**/*.ts"]);
        assert_eq!(cfg.embedding_provider, EmbeddingProviderKind::Ollama);
        assert_eq!(cfg.top_k, 8);
        assert_eq!(cfg.parallel_jobs_clamped(), 16);
        assert!(cfg.dangerous_patterns[0].block);
    }

    #[test]
    fn test_parallel_jobs_clamping() {
        let mut cfg = ProjectConfig::default();
        cfg.parallel_jobs = 0;
        assert_eq!(cfg.parallel_jobs_clamped(), 1);
        cfg.parallel_jobs = 16;
        assert_eq!(cfg.parallel_jobs_clamped(), 16);
        cfg.parallel_jobs = 4;
        assert_eq!(cfg.parallel_jobs_clamped(), 4);
    }

    #[test]
    fn test_missing_project_config_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ProjectConfig::load(dir.path()).unwrap();
        assert_eq!(cfg.top_k, 5);
        assert!(!cfg.auto_index);
    }
}
