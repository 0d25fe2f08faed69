/// Background indexer — keeps the vector store in sync with the tree.
///
/// Full scans enumerate candidates under the include/exclude rules, diff
/// them against the (mtime, size) cache, prepare changed files in parallel
/// batches (read → skip binaries → chunk → embed) and commit to the store
/// sequentially in batch order. Per-file failures hit the `on_error`
/// callback and the run continues.
use anyhow::{anyhow, Result};
use glob::Pattern;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::IndexError;
use crate::rag::chunker::{Chunker, ChunkerConfig, CodeChunk};
use crate::rag::embed::EmbeddingProvider;
use crate::rag::store::VectorStore;

/// Directories never indexed, regardless of include patterns.
pub const HARDCODED_EXCLUSIONS: &[&str] = &[
    "node_modules", ".git", "dist", "build", "target", "vendor",
    ".venv", "venv", ".bundle", "__pycache__", ".next",
];

const MAX_FILE_BYTES: u64 = 1_000_000;
const BINARY_SAMPLE_BYTES: usize = 1000;

// ── Cache ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStamp {
    pub mtime_ms: u64,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexCache {
    pub files: HashMap<String, FileStamp>,
    #[serde(default)]
    pub last_indexed: Option<String>,
}

impl IndexCache {
    pub fn load(path: &Path) -> Self {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    pub fn save(&self, path: &Path) -> Result<(), IndexError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(self)
            .map_err(|e| IndexError::Corruption(format!("cache serialization: {e}")))?;
        std::fs::write(path, raw)?;
        Ok(())
    }
}

fn stamp_of(path: &Path) -> Option<FileStamp> {
    let meta = std::fs::metadata(path).ok()?;
    let mtime_ms = meta
        .modified()
        .ok()?
        .duration_since(std::time::UNIX_EPOCH)
        .ok()?
        .as_millis() as u64;
    Some(FileStamp { mtime_ms, size_bytes: meta.len() })
}

// ── Config ────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct IndexerConfig {
    pub root: PathBuf,
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
    /// Clamped to [1, 16].
    pub parallel_jobs: usize,
    pub cache_path: PathBuf,
}

impl IndexerConfig {
    pub fn jobs(&self) -> usize {
        self.parallel_jobs.clamp(1, 16)
    }
}

struct FilterSet {
    include: Vec<Pattern>,
    exclude: Vec<Pattern>,
}

impl FilterSet {
    fn new(config: &IndexerConfig) -> Self {
        Self {
            include: compile_patterns(&config.include_patterns),
            exclude: compile_patterns(&config.exclude_patterns),
        }
    }

    fn accepts(&self, relative: &str) -> bool {
        if self.exclude.iter().any(|p| p.matches(relative)) {
            return false;
        }
        if self.include.is_empty() {
            return true;
        }
        self.include.iter().any(|p| p.matches(relative))
    }
}

/// Compile a pattern list. A `**/`-prefixed pattern also gets its bare
/// variant so `**/*.rs` matches top-level files too.
fn compile_patterns(patterns: &[String]) -> Vec<Pattern> {
    let mut out = Vec::new();
    for raw in patterns {
        if let Ok(p) = Pattern::new(raw) {
            out.push(p);
        }
        if let Some(bare) = raw.strip_prefix("**/") {
            if let Ok(p) = Pattern::new(bare) {
                out.push(p);
            }
        }
    }
    out
}

// ── Reports ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    pub candidates: usize,
    pub indexed: usize,
    pub removed: usize,
    pub skipped: usize,
    pub errors: usize,
}

pub type ErrorCallback = Box<dyn Fn(&Path, &anyhow::Error) + Send + Sync>;

// ── Indexer ───────────────────────────────────────────────────────────────────

pub struct Indexer {
    config: IndexerConfig,
    chunker: Chunker,
    store: Arc<VectorStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    on_error: Option<ErrorCallback>,
    /// Held for the duration of a full scan; watcher drains wait on it.
    scan_lock: tokio::sync::Mutex<()>,
}

struct Prepared {
    absolute: String,
    relative: String,
    stamp: FileStamp,
    chunks: Vec<CodeChunk>,
    embeddings: Vec<Vec<f32>>,
}

impl Indexer {
    pub fn new(
        config: IndexerConfig,
        store: Arc<VectorStore>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        Self {
            config,
            chunker: Chunker::new(ChunkerConfig::default()),
            store,
            embedder,
            on_error: None,
            scan_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_on_error(mut self, cb: ErrorCallback) -> Self {
        self.on_error = Some(cb);
        self
    }

    pub fn store(&self) -> Arc<VectorStore> {
        self.store.clone()
    }

    fn report_error(&self, path: &Path, err: &anyhow::Error) {
        tracing::warn!(path = %path.display(), error = %err, "indexing failed for file");
        if let Some(cb) = &self.on_error {
            cb(path, err);
        }
    }

    /// Walk the tree and bring the store up to date with changed files.
    pub async fn full_scan(&self) -> Result<ScanReport, IndexError> {
        let _guard = self.scan_lock.lock().await;
        let filters = FilterSet::new(&self.config);
        let mut report = ScanReport::default();

        let mut cache = IndexCache::load(&self.config.cache_path);
        // A cache describing a store that no longer exists is stale.
        if self.store.is_empty().await && !cache.files.is_empty() {
            tracing::info!("vector store is empty but cache is not — discarding cache");
            cache = IndexCache::default();
        }

        // 1. Enumerate candidates.
        let candidates = self.enumerate(&filters);
        report.candidates = candidates.len();
        let candidate_set: HashSet<&String> = candidates.iter().map(|(abs, _)| abs).collect();

        // 2. Remove store + cache entries for files no longer present.
        let mut stale: Vec<String> = cache
            .files
            .keys()
            .filter(|k| !candidate_set.contains(*k))
            .cloned()
            .collect();
        for file in self.store.indexed_files().await {
            if !candidate_set.contains(&file) && !stale.contains(&file) {
                stale.push(file);
            }
        }
        for path in stale {
            self.store.delete_by_file(&path).await?;
            cache.files.remove(&path);
            report.removed += 1;
        }

        // 3. Filter to changed/new files.
        let changed: Vec<(String, String)> = candidates
            .into_iter()
            .filter(|(abs, _)| {
                let stamp = stamp_of(Path::new(abs));
                match (stamp, cache.files.get(abs)) {
                    (Some(current), Some(cached)) => current != *cached,
                    _ => true,
                }
            })
            .collect();

        // 4. Prepare in parallel batches; commit sequentially in batch order.
        for batch in changed.chunks(self.config.jobs()) {
            let prepared = futures_util::future::join_all(
                batch.iter().map(|(abs, rel)| self.prepare(abs, rel)),
            )
            .await;

            for (result, (abs, _)) in prepared.into_iter().zip(batch) {
                match result {
                    Ok(Some(p)) => {
                        self.store
                            .batch_upsert(&p.absolute, p.chunks, p.embeddings)
                            .await?;
                        cache.files.insert(p.absolute, p.stamp);
                        report.indexed += 1;
                    }
                    Ok(None) => {
                        // Binary or oversized: keep it out of the store but
                        // remember the stamp so it isn't re-read every scan.
                        self.store.delete_by_file(abs).await?;
                        if let Some(stamp) = stamp_of(Path::new(abs)) {
                            cache.files.insert(abs.clone(), stamp);
                        }
                        report.skipped += 1;
                    }
                    Err(e) => {
                        self.report_error(Path::new(abs), &e);
                        report.errors += 1;
                    }
                }
            }
        }

        // 5. Persist the cache.
        cache.last_indexed = Some(chrono::Utc::now().to_rfc3339());
        cache.save(&self.config.cache_path)?;

        Ok(report)
    }

    /// Drain a batch of watcher events. Runs only between full scans
    /// (the scan lock serializes them); files are handled sequentially.
    pub async fn process_events(&self, paths: &[PathBuf]) -> Result<ScanReport, IndexError> {
        let _guard = self.scan_lock.lock().await;
        let filters = FilterSet::new(&self.config);
        let mut cache = IndexCache::load(&self.config.cache_path);
        let mut report = ScanReport::default();

        for path in paths {
            let abs = path.to_string_lossy().to_string();
            let Some(rel) = self.relative_of(path) else { continue };

            if !path.exists() {
                self.store.delete_by_file(&abs).await?;
                cache.files.remove(&abs);
                report.removed += 1;
                continue;
            }
            if !filters.accepts(&rel) || under_hardcoded_exclusion(&rel) {
                continue;
            }
            match self.prepare(&abs, &rel).await {
                Ok(Some(p)) => {
                    self.store
                        .batch_upsert(&p.absolute, p.chunks, p.embeddings)
                        .await?;
                    cache.files.insert(p.absolute, p.stamp);
                    report.indexed += 1;
                }
                Ok(None) => report.skipped += 1,
                Err(e) => {
                    self.report_error(path, &e);
                    report.errors += 1;
                }
            }
        }

        cache.save(&self.config.cache_path)?;
        Ok(report)
    }

    /// Read, sniff, chunk, and embed one file. `None` means deliberately
    /// skipped (binary or oversized).
    async fn prepare(&self, absolute: &str, relative: &str) -> Result<Option<Prepared>> {
        let path = Path::new(absolute);
        let stamp = stamp_of(path).ok_or_else(|| anyhow!("cannot stat {absolute}"))?;
        if stamp.size_bytes > MAX_FILE_BYTES {
            return Ok(None);
        }

        let bytes = tokio::fs::read(path).await?;
        if is_binary(&bytes) {
            return Ok(None);
        }
        let content = String::from_utf8_lossy(&bytes).into_owned();

        let chunks = self.chunker.chunk_file(absolute, relative, &content);
        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let embeddings = if texts.is_empty() {
            Vec::new()
        } else {
            self.embedder.embed_batch(&texts).await?
        };

        Ok(Some(Prepared {
            absolute: absolute.to_string(),
            relative: relative.to_string(),
            stamp,
            chunks,
            embeddings,
        }))
    }

    fn relative_of(&self, path: &Path) -> Option<String> {
        path.strip_prefix(&self.config.root)
            .ok()
            .map(|p| p.to_string_lossy().to_string())
    }

    /// Candidate files as (absolute, relative) pairs, filtered and sorted.
    fn enumerate(&self, filters: &FilterSet) -> Vec<(String, String)> {
        let mut out = Vec::new();
        walk(&self.config.root, &mut |path| {
            let Ok(rel) = path.strip_prefix(&self.config.root) else { return };
            let rel = rel.to_string_lossy().to_string();
            if filters.accepts(&rel) {
                out.push((path.to_string_lossy().to_string(), rel));
            }
        });
        out.sort();
        out
    }
}

fn walk(dir: &Path, visit: &mut dyn FnMut(&Path)) {
    let Ok(entries) = std::fs::read_dir(dir) else { return };
    let mut entries: Vec<_> = entries.filter_map(|e| e.ok()).collect();
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let name = entry.file_name();
        let name_str = name.to_string_lossy();
        if name_str.starts_with('.') {
            continue;
        }
        let path = entry.path();
        if path.is_dir() {
            if HARDCODED_EXCLUSIONS.contains(&name_str.as_ref()) {
                continue;
            }
            walk(&path, visit);
        } else {
            visit(&path);
        }
    }
}

fn under_hardcoded_exclusion(relative: &str) -> bool {
    relative
        .split('/')
        .any(|seg| HARDCODED_EXCLUSIONS.contains(&seg))
}

/// Sample the head of the file: any NUL byte, or more than 10%
/// non-printable (excluding TAB/LF/CR), means binary.
pub fn is_binary(bytes: &[u8]) -> bool {
    let sample = &bytes[..bytes.len().min(BINARY_SAMPLE_BYTES)];
    if sample.is_empty() {
        return false;
    }
    let mut non_printable = 0usize;
    for &b in sample {
        if b == 0 {
            return true;
        }
        if b < 0x20 && b != b'\t' && b != b'\n' && b != b'\r' {
            non_printable += 1;
        }
    }
    non_printable * 10 > sample.len()
}

/// Open the store, rebuilding from scratch (and wiping the cache) when the
/// on-disk state is corrupt or was built by a different embedder.
pub fn open_store_or_rebuild(
    dir: &Path,
    cache_path: &Path,
    identity: &str,
) -> Result<(VectorStore, bool), IndexError> {
    match VectorStore::open(dir, identity) {
        Ok(store) => Ok((store, false)),
        Err(e) => {
            tracing::warn!(error = %e, "index unusable — rebuilding");
            let store = VectorStore::rebuild(dir, identity)?;
            let _ = std::fs::remove_file(cache_path);
            Ok((store, true))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Deterministic embedder: vector derived from content bytes, plus a
    /// counter so tests can assert what actually got re-embedded.
    struct FakeEmbedder {
        calls: AtomicUsize,
    }

    impl FakeEmbedder {
        fn new() -> Arc<Self> {
            Arc::new(Self { calls: AtomicUsize::new(0) })
        }
    }

    #[async_trait]
    impl EmbeddingProvider for FakeEmbedder {
        fn identity(&self) -> String {
            "fake/embedder".to_string()
        }

        async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if text.contains("poison") {
                return Err(ProviderError::Fatal("poisoned input".into()));
            }
            let sum: u32 = text.bytes().map(|b| b as u32).sum();
            Ok(vec![(sum % 97) as f32, (sum % 89) as f32, text.len() as f32])
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        indexer: Indexer,
        embedder: Arc<FakeEmbedder>,
    }

    fn write_source(root: &Path, rel: &str, body: &str) {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, body).unwrap();
    }

    fn rust_fn(name: &str) -> String {
        format!("pub fn {name}() -> u32 {{\n    let value = compute_{name}();\n    value + 1\n}}\n")
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let store_dir = root.join(".codi/index");
        let cache_path = root.join(".codi/index-cache.json");

        let embedder = FakeEmbedder::new();
        let store = Arc::new(VectorStore::open(&store_dir, "fake/embedder").unwrap());
        let config = IndexerConfig {
            root: root.clone(),
            include_patterns: vec!["**/*.rs".to_string()],
            exclude_patterns: Vec::new(),
            parallel_jobs: 4,
            cache_path,
        };
        let indexer = Indexer::new(config, store, embedder.clone());
        Fixture { _dir: dir, root, indexer, embedder }
    }

    #[tokio::test]
    async fn test_full_scan_indexes_matching_files() {
        let f = fixture();
        write_source(&f.root, "src/a.rs", &rust_fn("alpha"));
        write_source(&f.root, "src/b.rs", &rust_fn("beta"));
        write_source(&f.root, "README.md", "# not included\nplain text here\n");

        let report = f.indexer.full_scan().await.unwrap();
        assert_eq!(report.candidates, 2);
        assert_eq!(report.indexed, 2);
        let files = f.indexer.store().indexed_files().await;
        assert!(files.iter().all(|p| p.ends_with(".rs")));
    }

    #[tokio::test]
    async fn test_incremental_reindexes_only_changed_file() {
        let f = fixture();
        write_source(&f.root, "one.rs", &rust_fn("one"));
        write_source(&f.root, "two.rs", &rust_fn("two"));
        write_source(&f.root, "three.rs", &rust_fn("three"));

        f.indexer.full_scan().await.unwrap();
        let ids_before = f.indexer.store().chunk_ids().await;
        let calls_before = f.embedder.calls.load(Ordering::SeqCst);

        // Touch only file two — content change implies new mtime + size.
        write_source(&f.root, "two.rs", &format!("{}\n// changed\n", rust_fn("two")));
        let report = f.indexer.full_scan().await.unwrap();

        assert_eq!(report.indexed, 1, "only the changed file re-indexes");
        let calls_after = f.embedder.calls.load(Ordering::SeqCst);
        assert_eq!(calls_after - calls_before, 1, "only file two re-embedded");

        // Chunk ids for unchanged files are stable.
        let ids_after = f.indexer.store().chunk_ids().await;
        let stable: Vec<_> = ids_before
            .iter()
            .filter(|id| ids_after.contains(id))
            .collect();
        assert!(stable.len() >= 2);
    }

    #[tokio::test]
    async fn test_mtime_bump_alone_triggers_reindex() {
        let f = fixture();
        write_source(&f.root, "same.rs", &rust_fn("same"));
        f.indexer.full_scan().await.unwrap();

        // Same content and size; only the mtime moves.
        let path = f.root.join("same.rs");
        let bumped = filetime::FileTime::from_unix_time(
            filetime::FileTime::from_last_modification_time(&std::fs::metadata(&path).unwrap())
                .unix_seconds()
                + 5,
            0,
        );
        filetime::set_file_mtime(&path, bumped).unwrap();

        let report = f.indexer.full_scan().await.unwrap();
        assert_eq!(report.indexed, 1, "stamp mismatch must re-index");
    }

    #[tokio::test]
    async fn test_unchanged_rescan_is_identical() {
        let f = fixture();
        write_source(&f.root, "src/a.rs", &rust_fn("alpha"));
        write_source(&f.root, "src/b.rs", &rust_fn("beta"));

        f.indexer.full_scan().await.unwrap();
        let stats1 = f.indexer.store().stats().await;
        let ids1 = f.indexer.store().chunk_ids().await;

        let report = f.indexer.full_scan().await.unwrap();
        assert_eq!(report.indexed, 0);
        let stats2 = f.indexer.store().stats().await;
        assert_eq!(stats1.item_count, stats2.item_count);
        assert_eq!(ids1, f.indexer.store().chunk_ids().await);
    }

    #[tokio::test]
    async fn test_deleted_file_removed_from_store_and_cache() {
        let f = fixture();
        write_source(&f.root, "gone.rs", &rust_fn("gone"));
        write_source(&f.root, "kept.rs", &rust_fn("kept"));
        f.indexer.full_scan().await.unwrap();

        std::fs::remove_file(f.root.join("gone.rs")).unwrap();
        let report = f.indexer.full_scan().await.unwrap();
        assert_eq!(report.removed, 1);

        let files = f.indexer.store().indexed_files().await;
        assert_eq!(files.len(), 1);
        assert!(files[0].ends_with("kept.rs"));
        let cache = IndexCache::load(&f.indexer.config.cache_path);
        assert_eq!(cache.files.len(), 1);
    }

    #[tokio::test]
    async fn test_hardcoded_exclusions_never_indexed() {
        let f = fixture();
        write_source(&f.root, "src/real.rs", &rust_fn("real"));
        write_source(&f.root, "node_modules/dep.rs", &rust_fn("dep"));
        write_source(&f.root, "target/debug/gen.rs", &rust_fn("generated"));
        write_source(&f.root, "vendor/lib.rs", &rust_fn("vendored"));

        let report = f.indexer.full_scan().await.unwrap();
        assert_eq!(report.candidates, 1);
        let files = f.indexer.store().indexed_files().await;
        assert_eq!(files.len(), 1);
        assert!(files[0].ends_with("src/real.rs"));
    }

    #[tokio::test]
    async fn test_binary_and_oversized_files_skipped() {
        let f = fixture();
        let mut binary = rust_fn("bin").into_bytes();
        binary[5] = 0;
        std::fs::write(f.root.join("binary.rs"), &binary).unwrap();
        std::fs::write(f.root.join("huge.rs"), "x".repeat(1_100_000)).unwrap();
        write_source(&f.root, "fine.rs", &rust_fn("fine"));

        let report = f.indexer.full_scan().await.unwrap();
        assert_eq!(report.skipped, 2);
        assert_eq!(report.indexed, 1);
    }

    #[tokio::test]
    async fn test_stale_cache_discarded_when_store_empty() {
        let f = fixture();
        write_source(&f.root, "a.rs", &rust_fn("alpha"));

        // Fabricate a cache claiming the file is up to date, with no store.
        let mut cache = IndexCache::default();
        cache.files.insert(
            f.root.join("a.rs").to_string_lossy().to_string(),
            stamp_of(&f.root.join("a.rs")).unwrap(),
        );
        cache.save(&f.indexer.config.cache_path).unwrap();

        let report = f.indexer.full_scan().await.unwrap();
        assert_eq!(report.indexed, 1, "stale cache must not suppress indexing");
    }

    #[tokio::test]
    async fn test_per_file_errors_do_not_abort_run() {
        let f = fixture();
        write_source(&f.root, "good.rs", &rust_fn("good"));
        write_source(&f.root, "bad.rs", &rust_fn("poison"));

        let errors = Arc::new(AtomicUsize::new(0));
        let seen = errors.clone();
        let config = f.indexer.config.clone();
        let indexer = Indexer::new(config, f.indexer.store(), f.embedder.clone())
            .with_on_error(Box::new(move |_, _| {
                seen.fetch_add(1, Ordering::SeqCst);
            }));

        let report = indexer.full_scan().await.unwrap();
        assert_eq!(report.indexed, 1, "the good file still lands");
        assert_eq!(report.errors, 1);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_process_events_handles_create_and_delete() {
        let f = fixture();
        write_source(&f.root, "a.rs", &rust_fn("alpha"));
        f.indexer.full_scan().await.unwrap();

        write_source(&f.root, "b.rs", &rust_fn("beta"));
        let report = f
            .indexer
            .process_events(&[f.root.join("b.rs")])
            .await
            .unwrap();
        assert_eq!(report.indexed, 1);

        std::fs::remove_file(f.root.join("a.rs")).unwrap();
        let report = f
            .indexer
            .process_events(&[f.root.join("a.rs")])
            .await
            .unwrap();
        assert_eq!(report.removed, 1);
        let files = f.indexer.store().indexed_files().await;
        assert_eq!(files.len(), 1);
        assert!(files[0].ends_with("b.rs"));
    }

    #[test]
    fn test_binary_detection() {
        assert!(is_binary(b"ELF\x00\x01\x02"));
        assert!(!is_binary(b"plain text with\ttabs\nand newlines\r\n"));
        // >10% control characters
        assert!(is_binary(&[0x01, 0x02, 0x03, b'a', b'b']));
        assert!(!is_binary(b""));
    }

    #[test]
    fn test_jobs_clamped() {
        let mut cfg = IndexerConfig {
            root: PathBuf::from("."),
            include_patterns: vec![],
            exclude_patterns: vec![],
            parallel_jobs: 64,
            cache_path: PathBuf::from("cache.json"),
        };
        assert_eq!(cfg.jobs(), 16);
        cfg.parallel_jobs = 0;
        assert_eq!(cfg.jobs(), 1);
    }
}
