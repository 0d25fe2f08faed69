/// Model map — a YAML registry of named model definitions plus task
/// aliases ("embeddings", "embeddings-fast", …) and optional fallback
/// chains. The RAG config selects `embeddingProvider: modelmap` to route
/// embedding calls through here.
///
/// Fallbacks are ordered: a chain advances only on a fatal provider error,
/// never on a transient failure or a bare non-2xx.
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::error::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDef {
    pub provider: String,
    pub model: String,
    #[serde(rename = "baseUrl", default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRef {
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMap {
    pub version: u32,
    #[serde(default)]
    pub models: HashMap<String, ModelDef>,
    #[serde(default)]
    pub tasks: HashMap<String, TaskRef>,
    #[serde(default)]
    pub fallbacks: HashMap<String, Vec<String>>,
}

impl ModelMap {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError(format!("failed to read {}: {e}", path.display())))?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let map: ModelMap = serde_yaml::from_str(raw)
            .map_err(|e| ConfigError(format!("invalid model map: {e}")))?;
        if map.version != 1 {
            return Err(ConfigError(format!(
                "unsupported model map version {}",
                map.version
            )));
        }
        Ok(map)
    }

    /// Resolve a task name ("embeddings" or "embeddings-<variant>") to its
    /// model definition. A task naming an undefined model is a config error.
    pub fn resolve_task(&self, task: &str) -> Result<&ModelDef, ConfigError> {
        let task_ref = self
            .tasks
            .get(task)
            .ok_or_else(|| ConfigError(format!("model map has no task '{task}'")))?;
        self.models.get(&task_ref.model).ok_or_else(|| {
            ConfigError(format!(
                "task '{task}' references undefined model '{}'",
                task_ref.model
            ))
        })
    }

    /// Ordered fallback chain for a model name: the model itself first,
    /// then each listed fallback that actually resolves.
    pub fn fallback_chain(&self, name: &str) -> Vec<&ModelDef> {
        let mut chain = Vec::new();
        if let Some(def) = self.models.get(name) {
            chain.push(def);
        }
        if let Some(names) = self.fallbacks.get(name) {
            for n in names {
                if let Some(def) = self.models.get(n) {
                    chain.push(def);
                }
            }
        }
        chain
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
version: 1
models:
  embed-large:
    provider: openai
    model: text-embedding-3-large
    description: high quality embeddings
  embed-local:
    provider: ollama
    model: nomic-embed-text
    baseUrl: http://localhost:11434
tasks:
  embeddings:
    model: embed-large
  embeddings-local:
    model: embed-local
fallbacks:
  embed-large:
    - embed-local
"#;

    #[test]
    fn test_parse_and_resolve_task() {
        let map = ModelMap::parse(SAMPLE).unwrap();
        let def = map.resolve_task("embeddings").unwrap();
        assert_eq!(def.provider, "openai");
        assert_eq!(def.model, "text-embedding-3-large");

        let local = map.resolve_task("embeddings-local").unwrap();
        assert_eq!(local.base_url.as_deref(), Some("http://localhost:11434"));
    }

    #[test]
    fn test_unknown_task_is_error() {
        let map = ModelMap::parse(SAMPLE).unwrap();
        assert!(map.resolve_task("embeddings-gpu").is_err());
    }

    #[test]
    fn test_dangling_task_reference_is_error() {
        let raw = r#"
version: 1
models: {}
tasks:
  embeddings:
    model: missing
"#;
        let map = ModelMap::parse(raw).unwrap();
        assert!(map.resolve_task("embeddings").is_err());
    }

    #[test]
    fn test_fallback_chain_is_ordered() {
        let map = ModelMap::parse(SAMPLE).unwrap();
        let chain = map.fallback_chain("embed-large");
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].provider, "openai");
        assert_eq!(chain[1].provider, "ollama");
    }

    #[test]
    fn test_wrong_version_rejected() {
        assert!(ModelMap::parse("version: 2\nmodels: {}\ntasks: {}").is_err());
    }
}
