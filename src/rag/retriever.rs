/// Retriever — embeds a query, asks the store, formats the hits.
///
/// The same provider that built the store must serve queries; mixing
/// embedding spaces produces meaningless scores, so a mismatch is a hard
/// error rather than a degraded search.
use anyhow::{bail, Result};
use std::sync::Arc;

use crate::rag::embed::EmbeddingProvider;
use crate::rag::store::{SearchResult, VectorStore};

const CONTEXT_TRUNCATE: usize = 2000;
const TOOL_OUTPUT_TRUNCATE: usize = 3000;

pub struct Retriever {
    store: Arc<VectorStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    top_k: usize,
    min_score: f32,
}

impl Retriever {
    pub fn new(
        store: Arc<VectorStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        top_k: usize,
        min_score: f32,
    ) -> Self {
        Self { store, embedder, top_k, min_score }
    }

    pub async fn search(
        &self,
        query: &str,
        top_k: Option<usize>,
        min_score: Option<f32>,
    ) -> Result<Vec<SearchResult>> {
        if self.store.identity() != self.embedder.identity() {
            bail!(
                "index was built with '{}' but the active embedder is '{}' — re-index first",
                self.store.identity(),
                self.embedder.identity()
            );
        }
        let embedding = self.embedder.embed(query).await?;
        Ok(self
            .store
            .query(
                &embedding,
                top_k.unwrap_or(self.top_k),
                min_score.unwrap_or(self.min_score),
            )
            .await)
    }

    /// Markdown block injected into the model's context before a turn.
    pub fn format_for_context(&self, results: &[SearchResult]) -> String {
        format_results(results, "## Relevant Code Context", CONTEXT_TRUNCATE)
    }

    /// Same shape, larger budget — returned from an explicit search tool.
    pub fn format_as_tool_output(&self, results: &[SearchResult]) -> String {
        if results.is_empty() {
            return "No matching code found in the index.".to_string();
        }
        format_results(results, "## Code Search Results", TOOL_OUTPUT_TRUNCATE)
    }
}

fn format_results(results: &[SearchResult], heading: &str, limit: usize) -> String {
    if results.is_empty() {
        return String::new();
    }
    let mut out = String::from(heading);
    out.push('\n');

    for r in results {
        let percent = (r.score.clamp(-1.0, 1.0) * 100.0).round() as i32;
        let kind = format!("{:?}", r.chunk.kind).to_lowercase();
        out.push_str(&format!(
            "\n### {}:{}-{} ({percent}% match)\n",
            r.chunk.relative_path, r.chunk.start_line, r.chunk.end_line
        ));
        match &r.chunk.name {
            Some(name) => out.push_str(&format!("{kind} `{name}`\n")),
            None => out.push_str(&format!("{kind}\n")),
        }
        out.push_str(&format!("```{}\n", r.chunk.language));
        out.push_str(&truncated(&r.chunk.content, limit));
        out.push_str("\n```\n");
    }
    out
}

// ── Search tool ───────────────────────────────────────────────────────────────

/// Registry extension exposing the index to the model as a tool.
/// Registered only when a retriever exists for the project.
pub struct CodeSearchTool {
    retriever: Arc<Retriever>,
}

impl CodeSearchTool {
    pub fn new(retriever: Arc<Retriever>) -> Self {
        Self { retriever }
    }
}

#[async_trait::async_trait]
impl crate::tools::ToolHandler for CodeSearchTool {
    fn definition(&self) -> crate::tools::ToolDef {
        crate::tools::ToolDef {
            name: "search_code".to_string(),
            description: "Semantic search over the indexed codebase. Returns the most relevant code chunks for a natural-language query.".to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string" },
                    "top_k": { "type": "integer", "description": "Max results (default from config)" }
                },
                "required": ["query"]
            }),
            read_only: true,
        }
    }

    async fn execute(
        &self,
        args: &serde_json::Value,
        _ctx: &crate::tools::ExecContext,
    ) -> Result<String, crate::error::ToolError> {
        let query = args["query"]
            .as_str()
            .ok_or_else(|| crate::error::ToolError::new("search_code", "missing 'query'"))?;
        let top_k = args["top_k"].as_u64().map(|k| k as usize);
        let results = self
            .retriever
            .search(query, top_k, None)
            .await
            .map_err(|e| crate::error::ToolError::new("search_code", e.to_string()))?;
        Ok(self.retriever.format_as_tool_output(&results))
    }
}

fn truncated(content: &str, limit: usize) -> String {
    if content.len() <= limit {
        return content.to_string();
    }
    let cut = floor_boundary(content, limit);
    format!("{}\n… [truncated {} of {} chars]", &content[..cut], content.len() - cut, content.len())
}

/// Largest char boundary ≤ idx.
fn floor_boundary(s: &str, mut idx: usize) -> usize {
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}
