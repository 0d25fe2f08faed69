/// Filesystem watcher feeding the indexer.
///
/// notify delivers raw events from its own thread; they funnel into a
/// coalescing queue that flushes after 500 ms of inactivity. Batches are
/// drained by the index service between scans — never during one.
/// If the platform watcher cannot start, watching is logged and disabled;
/// indexing still works through explicit scans.
use notify::{RecursiveMode, Watcher};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;

pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);

pub struct FileWatcher {
    // Dropping the watcher stops event delivery.
    _watcher: notify::RecommendedWatcher,
}

impl FileWatcher {
    /// Start watching `root` recursively. Returns the watcher handle and a
    /// receiver of debounced path batches, or None when the platform
    /// watcher is unavailable.
    pub fn start(root: &Path) -> Option<(Self, mpsc::UnboundedReceiver<Vec<PathBuf>>)> {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel::<PathBuf>();

        let mut watcher = match notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                for path in event.paths {
                    let _ = raw_tx.send(path);
                }
            }
        }) {
            Ok(w) => w,
            Err(e) => {
                tracing::warn!(error = %e, "file watching unavailable — disabled");
                return None;
            }
        };

        if let Err(e) = watcher.watch(root, RecursiveMode::Recursive) {
            tracing::warn!(root = %root.display(), error = %e, "file watching unavailable — disabled");
            return None;
        }

        let (batch_tx, batch_rx) = mpsc::unbounded_channel();
        tokio::spawn(coalesce(raw_rx, batch_tx, DEBOUNCE_WINDOW));

        Some((Self { _watcher: watcher }, batch_rx))
    }
}

/// Collect incoming paths and emit a deduplicated batch once `window`
/// passes with no new events. A final batch flushes when the input closes.
pub async fn coalesce(
    mut rx: mpsc::UnboundedReceiver<PathBuf>,
    tx: mpsc::UnboundedSender<Vec<PathBuf>>,
    window: Duration,
) {
    let mut pending: HashSet<PathBuf> = HashSet::new();

    loop {
        if pending.is_empty() {
            match rx.recv().await {
                Some(path) => {
                    pending.insert(path);
                }
                None => break,
            }
            continue;
        }

        tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(path) => {
                    pending.insert(path);
                }
                None => break,
            },
            _ = tokio::time::sleep(window) => {
                flush(&mut pending, &tx);
            }
        }
    }

    flush(&mut pending, &tx);
}

fn flush(pending: &mut HashSet<PathBuf>, tx: &mpsc::UnboundedSender<Vec<PathBuf>>) {
    if pending.is_empty() {
        return;
    }
    let mut batch: Vec<PathBuf> = pending.drain().collect();
    batch.sort();
    let _ = tx.send(batch);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_coalesce_dedupes_and_batches() {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (batch_tx, mut batch_rx) = mpsc::unbounded_channel();
        tokio::spawn(coalesce(raw_rx, batch_tx, Duration::from_millis(50)));

        raw_tx.send(PathBuf::from("/p/a.rs")).unwrap();
        raw_tx.send(PathBuf::from("/p/b.rs")).unwrap();
        raw_tx.send(PathBuf::from("/p/a.rs")).unwrap(); // duplicate

        let batch = tokio::time::timeout(Duration::from_secs(2), batch_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch, vec![PathBuf::from("/p/a.rs"), PathBuf::from("/p/b.rs")]);
    }

    #[tokio::test]
    async fn test_coalesce_separates_quiet_periods() {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (batch_tx, mut batch_rx) = mpsc::unbounded_channel();
        tokio::spawn(coalesce(raw_rx, batch_tx, Duration::from_millis(30)));

        raw_tx.send(PathBuf::from("/p/first.rs")).unwrap();
        let first = tokio::time::timeout(Duration::from_secs(2), batch_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.len(), 1);

        raw_tx.send(PathBuf::from("/p/second.rs")).unwrap();
        let second = tokio::time::timeout(Duration::from_secs(2), batch_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second, vec![PathBuf::from("/p/second.rs")]);
    }

    #[tokio::test]
    async fn test_coalesce_flushes_on_close() {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (batch_tx, mut batch_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(coalesce(raw_rx, batch_tx, Duration::from_secs(60)));

        raw_tx.send(PathBuf::from("/p/tail.rs")).unwrap();
        drop(raw_tx);
        handle.await.unwrap();

        let batch = batch_rx.recv().await.unwrap();
        assert_eq!(batch, vec![PathBuf::from("/p/tail.rs")]);
    }

    #[tokio::test]
    async fn test_watcher_starts_on_real_directory() {
        let dir = tempfile::tempdir().unwrap();
        // Platform watchers can be unavailable in constrained environments;
        // None is the documented degraded mode, not a failure.
        if let Some((_watcher, _rx)) = FileWatcher::start(dir.path()) {
            // started and will be dropped cleanly
        }
    }
}
