/// Embedding providers — delegated over HTTP, never in-process.
///
/// The store records which provider/model built it; the retriever refuses
/// to query through a different one (scores across models are garbage).
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::{EmbeddingProviderKind, ProjectConfig};
use crate::error::ProviderError;
use crate::modelmap::ModelMap;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// "provider/model" — persisted in the index manifest.
    fn identity(&self) -> String;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError>;

    /// Batch embed. Providers with native batching override this.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let mut out = Vec::with_capacity(texts.len());
        for t in texts {
            out.push(self.embed(t).await?);
        }
        Ok(out)
    }
}

// ── OpenAI-compatible /embeddings ─────────────────────────────────────────────

pub struct OpenAiEmbedder {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiEmbedder {
    pub fn new(base_url: String, api_key: String, model: String) -> Self {
        Self { http: reqwest::Client::new(), base_url, api_key, model }
    }

    async fn request(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let url = format!("{}/embeddings", self.base_url.trim_end_matches('/'));
        let resp = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&json!({ "model": self.model, "input": inputs }))
            .send()
            .await
            .map_err(|e| ProviderError::Transient(format!("embeddings request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let detail = format!("embeddings error {status}: {text}");
            return if status.as_u16() == 429 || status.is_server_error() {
                Err(ProviderError::Transient(detail))
            } else {
                Err(ProviderError::Fatal(detail))
            };
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| ProviderError::Transient(format!("embeddings decode failed: {e}")))?;
        let data = body["data"]
            .as_array()
            .ok_or_else(|| ProviderError::Fatal("embeddings response missing 'data'".into()))?;

        let mut out = Vec::with_capacity(data.len());
        for item in data {
            let vec = item["embedding"]
                .as_array()
                .ok_or_else(|| ProviderError::Fatal("embedding item missing vector".into()))?
                .iter()
                .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                .collect();
            out.push(vec);
        }
        Ok(out)
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedder {
    fn identity(&self) -> String {
        format!("openai/{}", self.model)
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let mut vecs = self.request(&[text]).await?;
        vecs.pop()
            .ok_or_else(|| ProviderError::Fatal("empty embeddings response".into()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
        self.request(&refs).await
    }
}

// ── Ollama /api/embeddings ────────────────────────────────────────────────────

pub struct OllamaEmbedder {
    http: reqwest::Client,
    base_url: String,
    model: String,
}

impl OllamaEmbedder {
    pub fn new(base_url: String, model: String) -> Self {
        Self { http: reqwest::Client::new(), base_url, model }
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbedder {
    fn identity(&self) -> String {
        format!("ollama/{}", self.model)
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let url = format!("{}/api/embeddings", self.base_url.trim_end_matches('/'));
        let resp = self
            .http
            .post(&url)
            .json(&json!({ "model": self.model, "prompt": text }))
            .send()
            .await
            .map_err(|e| ProviderError::Transient(format!("ollama embeddings failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let detail = format!("ollama embeddings error {status}: {text}");
            return if status.is_server_error() {
                Err(ProviderError::Transient(detail))
            } else {
                Err(ProviderError::Fatal(detail))
            };
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| ProviderError::Transient(format!("ollama decode failed: {e}")))?;
        let vec = body["embedding"]
            .as_array()
            .ok_or_else(|| ProviderError::Fatal("ollama response missing 'embedding'".into()))?
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        Ok(vec)
    }
}

// ── Fallback chain ────────────────────────────────────────────────────────────

/// Ordered fallbacks from the model map. A fatal error on one provider
/// advances to the next; transient errors propagate so the caller's
/// retry-in-place still applies. The store manifest records the primary's
/// identity — if a fallback produces a different dimension, the store's
/// dim check rejects the write rather than silently mixing spaces.
pub struct FallbackEmbedder {
    chain: Vec<Box<dyn EmbeddingProvider>>,
}

impl FallbackEmbedder {
    pub fn new(chain: Vec<Box<dyn EmbeddingProvider>>) -> Self {
        assert!(!chain.is_empty(), "fallback chain needs at least one provider");
        Self { chain }
    }
}

#[async_trait]
impl EmbeddingProvider for FallbackEmbedder {
    fn identity(&self) -> String {
        self.chain[0].identity()
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let mut last = None;
        for provider in &self.chain {
            match provider.embed(text).await {
                Ok(v) => return Ok(v),
                Err(e @ ProviderError::Transient(_)) => return Err(e),
                Err(e) => {
                    tracing::warn!(provider = %provider.identity(), error = %e, "embedder failed, trying fallback");
                    last = Some(e);
                }
            }
        }
        Err(last.unwrap_or_else(|| ProviderError::Fatal("empty fallback chain".into())))
    }
}

// ── Selection ─────────────────────────────────────────────────────────────────

fn build_embedder(
    def: &crate::modelmap::ModelDef,
    config: &ProjectConfig,
    openai_key: Option<&str>,
) -> Result<Box<dyn EmbeddingProvider>> {
    match def.provider.as_str() {
        "openai" => {
            let key = openai_key.ok_or_else(|| anyhow!("OPENAI_API_KEY is not set"))?;
            let base = def
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string());
            Ok(Box::new(OpenAiEmbedder::new(base, key.to_string(), def.model.clone())))
        }
        "ollama" => {
            let base = def
                .base_url
                .clone()
                .unwrap_or_else(|| config.ollama_base_url.clone());
            Ok(Box::new(OllamaEmbedder::new(base, def.model.clone())))
        }
        other => Err(anyhow!("unsupported embedding provider '{other}' in model map")),
    }
}

/// Build the embedding provider the project config asks for.
/// `auto` picks OpenAI when an API key is present, Ollama otherwise.
/// `modelmap` resolves the "embeddings" task, wrapping any fallbacks.
pub fn from_config(config: &ProjectConfig, map: Option<&ModelMap>) -> Result<Box<dyn EmbeddingProvider>> {
    let openai_key = std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty());

    let kind = match config.embedding_provider {
        EmbeddingProviderKind::Auto => {
            if openai_key.is_some() {
                EmbeddingProviderKind::Openai
            } else {
                EmbeddingProviderKind::Ollama
            }
        }
        other => other,
    };

    match kind {
        EmbeddingProviderKind::Openai => {
            let key = openai_key.ok_or_else(|| anyhow!("OPENAI_API_KEY is not set"))?;
            Ok(Box::new(OpenAiEmbedder::new(
                "https://api.openai.com/v1".to_string(),
                key,
                config.openai_model.clone(),
            )))
        }
        EmbeddingProviderKind::Ollama => Ok(Box::new(OllamaEmbedder::new(
            config.ollama_base_url.clone(),
            config.ollama_model.clone(),
        ))),
        EmbeddingProviderKind::Modelmap => {
            let map = map.ok_or_else(|| {
                anyhow!("embeddingProvider is 'modelmap' but no model map was loaded")
            })?;
            // Validate the task reference, then expand its fallback chain.
            map.resolve_task("embeddings")?;
            let primary_name = &map.tasks["embeddings"].model;
            let chain: Vec<Box<dyn EmbeddingProvider>> = map
                .fallback_chain(primary_name)
                .into_iter()
                .map(|def| build_embedder(def, config, openai_key.as_deref()))
                .collect::<Result<_>>()?;
            if chain.len() == 1 {
                Ok(chain.into_iter().next().expect("chain has one entry"))
            } else {
                Ok(Box::new(FallbackEmbedder::new(chain)))
            }
        }
        EmbeddingProviderKind::Auto => unreachable!("auto resolved above"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identities() {
        let o = OpenAiEmbedder::new("https://api.openai.com/v1".into(), "sk-x".into(), "text-embedding-3-small".into());
        assert_eq!(o.identity(), "openai/text-embedding-3-small");
        let l = OllamaEmbedder::new("http://localhost:11434".into(), "nomic-embed-text".into());
        assert_eq!(l.identity(), "ollama/nomic-embed-text");
    }

    #[test]
    fn test_modelmap_selection_requires_map() {
        let mut cfg = ProjectConfig::default();
        cfg.embedding_provider = EmbeddingProviderKind::Modelmap;
        assert!(from_config(&cfg, None).is_err());
    }

    struct FlakyEmbedder {
        fatal: bool,
        label: &'static str,
    }

    #[async_trait]
    impl EmbeddingProvider for FlakyEmbedder {
        fn identity(&self) -> String {
            format!("fake/{}", self.label)
        }

        async fn embed(&self, _text: &str) -> Result<Vec<f32>, ProviderError> {
            if self.fatal {
                Err(ProviderError::Fatal("model not found".into()))
            } else {
                Ok(vec![1.0, 2.0])
            }
        }
    }

    #[tokio::test]
    async fn test_fallback_advances_on_fatal_only() {
        let chain = FallbackEmbedder::new(vec![
            Box::new(FlakyEmbedder { fatal: true, label: "primary" }),
            Box::new(FlakyEmbedder { fatal: false, label: "backup" }),
        ]);
        // Identity stays the primary's — the store manifest is keyed on it.
        assert_eq!(chain.identity(), "fake/primary");
        assert_eq!(chain.embed("x").await.unwrap(), vec![1.0, 2.0]);
    }

    struct TransientEmbedder;

    #[async_trait]
    impl EmbeddingProvider for TransientEmbedder {
        fn identity(&self) -> String {
            "fake/transient".into()
        }

        async fn embed(&self, _text: &str) -> Result<Vec<f32>, ProviderError> {
            Err(ProviderError::Transient("429".into()))
        }
    }

    #[tokio::test]
    async fn test_fallback_does_not_consume_on_transient() {
        let chain = FallbackEmbedder::new(vec![
            Box::new(TransientEmbedder),
            Box::new(FlakyEmbedder { fatal: false, label: "backup" }),
        ]);
        // Transient errors retry in place; they never advance the chain.
        assert!(chain.embed("x").await.unwrap_err().is_transient());
    }

    #[test]
    fn test_modelmap_expands_fallback_chain() {
        let raw = r#"
version: 1
models:
  remote:
    provider: ollama
    model: big-embed
    baseUrl: http://gpu:11434
  local:
    provider: ollama
    model: nomic-embed-text
tasks:
  embeddings:
    model: remote
fallbacks:
  remote:
    - local
"#;
        let map = ModelMap::parse(raw).unwrap();
        let mut cfg = ProjectConfig::default();
        cfg.embedding_provider = EmbeddingProviderKind::Modelmap;
        let provider = from_config(&cfg, Some(&map)).unwrap();
        // The wrapped chain reports the primary's identity.
        assert_eq!(provider.identity(), "ollama/big-embed");
    }

    #[test]
    fn test_modelmap_resolves_ollama_task() {
        let raw = r#"
version: 1
models:
  local:
    provider: ollama
    model: mxbai-embed-large
    baseUrl: http://gpu-box:11434
tasks:
  embeddings:
    model: local
"#;
        let map = ModelMap::parse(raw).unwrap();
        let mut cfg = ProjectConfig::default();
        cfg.embedding_provider = EmbeddingProviderKind::Modelmap;
        let provider = from_config(&cfg, Some(&map)).unwrap();
        assert_eq!(provider.identity(), "ollama/mxbai-embed-large");
    }
}
