/// Vector store — NDJSON records plus a manifest, cosine top-K queries.
///
/// Layout under `<project>/.codi/index/`:
///   records.jsonl — one JSON record per chunk `{chunk_id, embedding, chunk}`
///   manifest.json — `{dim, provider, model, created_at}`
///
/// All records share one embedding dimension; a store built by a different
/// provider/model or with a different dim must be rebuilt, not queried.
/// Writes are serialized behind an internal mutex; `batch_upsert` holds it
/// for one file's records (delete-by-file + insert, persisted once).
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use crate::error::IndexError;
use crate::rag::chunker::CodeChunk;

const RECORDS_FILE: &str = "records.jsonl";
const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorRecord {
    pub chunk_id: String,
    pub embedding: Vec<f32>,
    pub chunk: CodeChunk,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Manifest {
    dim: usize,
    provider: String,
    model: String,
    created_at: String,
}

#[derive(Debug, Clone)]
pub struct SearchResult {
    pub chunk: CodeChunk,
    pub score: f32,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct StoreStats {
    pub item_count: usize,
    pub size_bytes: u64,
}

#[derive(Debug)]
struct StoreInner {
    records: Vec<VectorRecord>,
    dim: Option<usize>,
}

#[derive(Debug)]
pub struct VectorStore {
    dir: PathBuf,
    /// "provider/model" of the embedder this store was built with.
    identity: String,
    inner: Mutex<StoreInner>,
}

impl VectorStore {
    /// Open an existing store, validating manifest and dimensions.
    /// An empty directory yields an empty store.
    pub fn open(dir: &Path, identity: &str) -> Result<Self, IndexError> {
        let records_path = dir.join(RECORDS_FILE);
        let manifest_path = dir.join(MANIFEST_FILE);

        if !records_path.exists() {
            return Ok(Self::empty(dir, identity));
        }
        if !manifest_path.exists() {
            return Err(IndexError::Corruption("records exist but manifest is missing".into()));
        }

        let manifest: Manifest = serde_json::from_str(
            &std::fs::read_to_string(&manifest_path)?,
        )
        .map_err(|e| IndexError::Corruption(format!("bad manifest: {e}")))?;

        let stored_identity = format!("{}/{}", manifest.provider, manifest.model);
        if stored_identity != identity {
            return Err(IndexError::Corruption(format!(
                "store was built with '{stored_identity}', current embedder is '{identity}'"
            )));
        }

        let mut records = Vec::new();
        for (line_no, line) in std::fs::read_to_string(&records_path)?.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record: VectorRecord = serde_json::from_str(line)
                .map_err(|e| IndexError::Corruption(format!("record {}: {e}", line_no + 1)))?;
            if record.embedding.len() != manifest.dim {
                return Err(IndexError::DimMismatch {
                    stored: manifest.dim,
                    current: record.embedding.len(),
                });
            }
            records.push(record);
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            identity: identity.to_string(),
            inner: Mutex::new(StoreInner { records, dim: Some(manifest.dim) }),
        })
    }

    /// Wipe the on-disk store and return a fresh empty one.
    pub fn rebuild(dir: &Path, identity: &str) -> Result<Self, IndexError> {
        if dir.exists() {
            std::fs::remove_dir_all(dir)?;
        }
        Ok(Self::empty(dir, identity))
    }

    fn empty(dir: &Path, identity: &str) -> Self {
        Self {
            dir: dir.to_path_buf(),
            identity: identity.to_string(),
            inner: Mutex::new(StoreInner { records: Vec::new(), dim: None }),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.records.is_empty()
    }

    /// Insert or replace one record by chunk id.
    pub async fn upsert(&self, chunk: CodeChunk, embedding: Vec<f32>) -> Result<(), IndexError> {
        let mut inner = self.inner.lock().await;
        Self::check_dim(&mut inner, embedding.len())?;
        let record = VectorRecord { chunk_id: chunk.id.clone(), embedding, chunk };
        if let Some(existing) = inner.records.iter_mut().find(|r| r.chunk_id == record.chunk_id) {
            *existing = record;
        } else {
            inner.records.push(record);
        }
        self.persist(&inner)
    }

    /// Atomic replacement of one file's records: every existing record for
    /// that file goes, the new batch comes in, one persist at the end.
    pub async fn batch_upsert(
        &self,
        absolute_path: &str,
        chunks: Vec<CodeChunk>,
        embeddings: Vec<Vec<f32>>,
    ) -> Result<(), IndexError> {
        if chunks.len() != embeddings.len() {
            return Err(IndexError::Corruption(format!(
                "batch mismatch: {} chunks, {} embeddings",
                chunks.len(),
                embeddings.len()
            )));
        }
        let mut inner = self.inner.lock().await;
        for e in &embeddings {
            Self::check_dim(&mut inner, e.len())?;
        }
        inner.records.retain(|r| r.chunk.absolute_path != absolute_path);
        for (chunk, embedding) in chunks.into_iter().zip(embeddings) {
            inner.records.push(VectorRecord { chunk_id: chunk.id.clone(), embedding, chunk });
        }
        self.persist(&inner)
    }

    pub async fn delete_by_file(&self, absolute_path: &str) -> Result<(), IndexError> {
        let mut inner = self.inner.lock().await;
        let before = inner.records.len();
        inner.records.retain(|r| r.chunk.absolute_path != absolute_path);
        if inner.records.len() != before {
            self.persist(&inner)?;
        }
        Ok(())
    }

    /// Cosine-similarity top-K. Scores land in [-1, 1]; results below
    /// `min_score` are filtered, the rest sorted descending and capped.
    pub async fn query(&self, embedding: &[f32], top_k: usize, min_score: f32) -> Vec<SearchResult> {
        if top_k == 0 {
            return Vec::new();
        }
        let inner = self.inner.lock().await;
        let mut scored: Vec<SearchResult> = inner
            .records
            .iter()
            .map(|r| SearchResult { chunk: r.chunk.clone(), score: cosine(&r.embedding, embedding) })
            .filter(|s| s.score >= min_score)
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        scored
    }

    pub async fn stats(&self) -> StoreStats {
        let inner = self.inner.lock().await;
        let size_bytes = std::fs::metadata(self.dir.join(RECORDS_FILE))
            .map(|m| m.len())
            .unwrap_or(0);
        StoreStats { item_count: inner.records.len(), size_bytes }
    }

    pub async fn chunk_ids(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        let mut ids: Vec<String> = inner.records.iter().map(|r| r.chunk_id.clone()).collect();
        ids.sort();
        ids
    }

    pub async fn indexed_files(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        let mut files: Vec<String> = inner
            .records
            .iter()
            .map(|r| r.chunk.absolute_path.clone())
            .collect();
        files.sort();
        files.dedup();
        files
    }

    fn check_dim(inner: &mut StoreInner, len: usize) -> Result<(), IndexError> {
        match inner.dim {
            Some(dim) if dim != len => Err(IndexError::DimMismatch { stored: dim, current: len }),
            Some(_) => Ok(()),
            None => {
                inner.dim = Some(len);
                Ok(())
            }
        }
    }

    /// Write records + manifest via temp-and-rename so a crash mid-write
    /// never leaves a half-written records file.
    fn persist(&self, inner: &StoreInner) -> Result<(), IndexError> {
        std::fs::create_dir_all(&self.dir)?;

        let mut lines = String::new();
        for r in &inner.records {
            lines.push_str(&serde_json::to_string(r).map_err(|e| {
                IndexError::Corruption(format!("record serialization failed: {e}"))
            })?);
            lines.push('\n');
        }
        let records_tmp = self.dir.join(format!("{RECORDS_FILE}.tmp"));
        std::fs::write(&records_tmp, lines)?;
        std::fs::rename(&records_tmp, self.dir.join(RECORDS_FILE))?;

        let (provider, model) = self
            .identity
            .split_once('/')
            .unwrap_or((self.identity.as_str(), ""));
        let manifest = Manifest {
            dim: inner.dim.unwrap_or(0),
            provider: provider.to_string(),
            model: model.to_string(),
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        let manifest_tmp = self.dir.join(format!("{MANIFEST_FILE}.tmp"));
        std::fs::write(
            &manifest_tmp,
            serde_json::to_string_pretty(&manifest)
                .map_err(|e| IndexError::Corruption(format!("manifest serialization: {e}")))?,
        )?;
        std::fs::rename(&manifest_tmp, self.dir.join(MANIFEST_FILE))?;
        Ok(())
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut na = 0.0f32;
    let mut nb = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rag::chunker::{chunk_id, ChunkKind};

    fn chunk(path: &str, start: usize) -> CodeChunk {
        CodeChunk {
            id: chunk_id(path, start),
            relative_path: path.trim_start_matches("/proj/").to_string(),
            absolute_path: path.to_string(),
            language: "rust".to_string(),
            start_line: start,
            end_line: start + 5,
            content: format!("fn body_at_{start}() {{}}"),
            kind: ChunkKind::Function,
            name: Some(format!("body_at_{start}")),
        }
    }

    #[tokio::test]
    async fn test_upsert_then_query_returns_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let store = VectorStore::open(dir.path(), "ollama/nomic-embed-text").unwrap();
        let c = chunk("/proj/a.rs", 1);
        store.upsert(c.clone(), vec![1.0, 0.0, 0.0]).await.unwrap();

        let hits = store.query(&[1.0, 0.0, 0.0], 1, -1.0).await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk.id, c.id);
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_upsert_replaces_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = VectorStore::open(dir.path(), "ollama/nomic-embed-text").unwrap();
        let c = chunk("/proj/a.rs", 1);
        store.upsert(c.clone(), vec![1.0, 0.0]).await.unwrap();
        let mut updated = c.clone();
        updated.content = "fn changed() {}".to_string();
        store.upsert(updated, vec![0.0, 1.0]).await.unwrap();

        let stats = store.stats().await;
        assert_eq!(stats.item_count, 1);
        let hits = store.query(&[0.0, 1.0], 1, 0.5).await;
        assert_eq!(hits[0].chunk.content, "fn changed() {}");
    }

    #[tokio::test]
    async fn test_query_sorted_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        let store = VectorStore::open(dir.path(), "ollama/nomic-embed-text").unwrap();
        store.upsert(chunk("/proj/a.rs", 1), vec![1.0, 0.0]).await.unwrap();
        store.upsert(chunk("/proj/b.rs", 1), vec![0.7, 0.7]).await.unwrap();
        store.upsert(chunk("/proj/c.rs", 1), vec![-1.0, 0.0]).await.unwrap();

        let hits = store.query(&[1.0, 0.0], 10, 0.0).await;
        assert_eq!(hits.len(), 2); // negative-score chunk filtered
        assert!(hits[0].score >= hits[1].score);
        assert_eq!(hits[0].chunk.absolute_path, "/proj/a.rs");

        // top_k = 0 and impossible min_score both yield empty results.
        assert!(store.query(&[1.0, 0.0], 0, -1.0).await.is_empty());
        assert!(store.query(&[1.0, 0.0], 10, 1.5).await.is_empty());
    }

    #[tokio::test]
    async fn test_delete_by_file_removes_all_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let store = VectorStore::open(dir.path(), "ollama/nomic-embed-text").unwrap();
        store.upsert(chunk("/proj/a.rs", 1), vec![1.0, 0.0]).await.unwrap();
        store.upsert(chunk("/proj/a.rs", 10), vec![0.9, 0.1]).await.unwrap();
        store.upsert(chunk("/proj/b.rs", 1), vec![0.0, 1.0]).await.unwrap();

        store.delete_by_file("/proj/a.rs").await.unwrap();
        let files = store.indexed_files().await;
        assert_eq!(files, vec!["/proj/b.rs".to_string()]);
        let hits = store.query(&[1.0, 0.0], 10, -1.0).await;
        assert!(hits.iter().all(|h| h.chunk.absolute_path != "/proj/a.rs"));
    }

    #[tokio::test]
    async fn test_batch_upsert_is_atomic_per_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = VectorStore::open(dir.path(), "ollama/nomic-embed-text").unwrap();
        store.upsert(chunk("/proj/a.rs", 1), vec![1.0, 0.0]).await.unwrap();
        store.upsert(chunk("/proj/a.rs", 20), vec![0.8, 0.2]).await.unwrap();

        // Re-index the file with a different chunking.
        store
            .batch_upsert(
                "/proj/a.rs",
                vec![chunk("/proj/a.rs", 5)],
                vec![vec![0.5, 0.5]],
            )
            .await
            .unwrap();
        let stats = store.stats().await;
        assert_eq!(stats.item_count, 1);
        assert_eq!(store.chunk_ids().await, vec![chunk_id("/proj/a.rs", 5)]);
    }

    #[tokio::test]
    async fn test_persistence_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = VectorStore::open(dir.path(), "ollama/nomic-embed-text").unwrap();
            store.upsert(chunk("/proj/a.rs", 1), vec![1.0, 0.0, 0.0]).await.unwrap();
        }
        let store = VectorStore::open(dir.path(), "ollama/nomic-embed-text").unwrap();
        let hits = store.query(&[1.0, 0.0, 0.0], 1, 0.9).await;
        assert_eq!(hits.len(), 1);
        assert!(store.stats().await.size_bytes > 0);
    }

    #[tokio::test]
    async fn test_identity_mismatch_requires_rebuild() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = VectorStore::open(dir.path(), "ollama/nomic-embed-text").unwrap();
            store.upsert(chunk("/proj/a.rs", 1), vec![1.0]).await.unwrap();
        }
        let err = VectorStore::open(dir.path(), "openai/text-embedding-3-small").unwrap_err();
        assert!(matches!(err, IndexError::Corruption(_)));

        let store = VectorStore::rebuild(dir.path(), "openai/text-embedding-3-small").unwrap();
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_dim_mismatch_on_upsert() {
        let dir = tempfile::tempdir().unwrap();
        let store = VectorStore::open(dir.path(), "ollama/nomic-embed-text").unwrap();
        store.upsert(chunk("/proj/a.rs", 1), vec![1.0, 0.0]).await.unwrap();
        let err = store.upsert(chunk("/proj/b.rs", 1), vec![1.0, 0.0, 0.0]).await.unwrap_err();
        assert!(matches!(err, IndexError::DimMismatch { stored: 2, current: 3 }));
    }

    #[tokio::test]
    async fn test_missing_manifest_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = VectorStore::open(dir.path(), "ollama/nomic-embed-text").unwrap();
            store.upsert(chunk("/proj/a.rs", 1), vec![1.0]).await.unwrap();
        }
        std::fs::remove_file(dir.path().join("manifest.json")).unwrap();
        let err = VectorStore::open(dir.path(), "ollama/nomic-embed-text").unwrap_err();
        assert!(matches!(err, IndexError::Corruption(_)));
    }
}
