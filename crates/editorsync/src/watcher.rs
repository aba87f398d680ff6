//! Watches the mirror directory for local script edits.
//!
//! notify callbacks run on their own thread and only forward raw paths into
//! a channel; a tokio task owns the debounce state and is the sole place
//! events are read, suppressed, or emitted. Per-path suppression tokens are
//! armed by the reconciler immediately before it writes a file that came
//! from the editor, and each token swallows exactly one debounced event.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use notify::{recommended_watcher, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::time::Instant;

use datamodel::codec;

use crate::error::{Result, SyncError};

/// A debounced local edit: the file settled and was read.
#[derive(Debug, Clone)]
pub struct WatchedChange {
    pub path: PathBuf,
    pub source: String,
}

type SuppressionMap = Arc<Mutex<HashMap<PathBuf, u32>>>;

pub struct ScriptWatcher {
    // Dropping the notify watcher stops the OS-level watch.
    _watcher: RecommendedWatcher,
    suppressions: SuppressionMap,
}

impl ScriptWatcher {
    /// Starts watching `root` recursively. Debounced, suppression-filtered
    /// changes are delivered through `change_tx`.
    pub fn spawn(
        root: &Path,
        debounce: Duration,
        change_tx: mpsc::UnboundedSender<WatchedChange>,
    ) -> Result<Self> {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel::<PathBuf>();

        let mut watcher = recommended_watcher(move |event_result: notify::Result<notify::Event>| {
            match event_result {
                Ok(event) => {
                    if matches!(event.kind, EventKind::Access(_)) {
                        return;
                    }
                    for path in event.paths {
                        if codec::is_script_file(&path) {
                            let _ = raw_tx.send(path);
                        }
                    }
                }
                Err(error) => {
                    tracing::warn!(%error, "file watcher error");
                }
            }
        })
        .map_err(|error| SyncError::Watcher(format!("failed to create watcher: {error}")))?;

        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(|error| {
                SyncError::Watcher(format!("failed to watch {}: {error}", root.display()))
            })?;

        let suppressions: SuppressionMap = Arc::new(Mutex::new(HashMap::new()));
        tokio::spawn(debounce_loop(
            raw_rx,
            change_tx,
            suppressions.clone(),
            debounce,
        ));

        Ok(Self {
            _watcher: watcher,
            suppressions,
        })
    }

    /// Arms a one-shot suppression for `path`: the next debounced change
    /// for it is consumed instead of emitted.
    pub fn suppress_next_change(&self, path: &Path) {
        if let Ok(mut map) = self.suppressions.lock() {
            *map.entry(path.to_path_buf()).or_insert(0) += 1;
        }
    }
}

/// Owns the per-path deadlines; a second raw event within the stability
/// window pushes that path's deadline out again.
async fn debounce_loop(
    mut raw_rx: mpsc::UnboundedReceiver<PathBuf>,
    change_tx: mpsc::UnboundedSender<WatchedChange>,
    suppressions: SuppressionMap,
    window: Duration,
) {
    let mut pending: HashMap<PathBuf, Instant> = HashMap::new();
    loop {
        let next_deadline = pending.values().min().copied();
        tokio::select! {
            received = raw_rx.recv() => {
                match received {
                    Some(path) => {
                        pending.insert(path, Instant::now() + window);
                    }
                    None => return,
                }
            }
            _ = wait_until(next_deadline) => {
                let now = Instant::now();
                let due: Vec<PathBuf> = pending
                    .iter()
                    .filter(|(_, deadline)| **deadline <= now)
                    .map(|(path, _)| path.clone())
                    .collect();
                for path in due {
                    pending.remove(&path);
                    if consume_suppression(&suppressions, &path) {
                        tracing::debug!(path = %path.display(), "suppressed editor-originated change");
                        continue;
                    }
                    match tokio::fs::read_to_string(&path).await {
                        Ok(source) => {
                            if change_tx.send(WatchedChange { path, source }).is_err() {
                                return;
                            }
                        }
                        Err(error) => {
                            tracing::debug!(path = %path.display(), %error, "changed file vanished before read");
                        }
                    }
                }
            }
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Consumes one suppression token for `path`, if any is armed.
fn consume_suppression(suppressions: &SuppressionMap, path: &Path) -> bool {
    let Ok(mut map) = suppressions.lock() else {
        return false;
    };
    match map.get_mut(path) {
        Some(count) => {
            *count -= 1;
            if *count == 0 {
                map.remove(path);
            }
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn suppression_tokens_are_consumed_exactly_once() {
        let suppressions: SuppressionMap = Arc::new(Mutex::new(HashMap::new()));
        let path = Path::new("/sync/S/Foo.luau");

        assert!(!consume_suppression(&suppressions, path));

        if let Ok(mut map) = suppressions.lock() {
            *map.entry(path.to_path_buf()).or_insert(0) += 1;
        }
        assert!(consume_suppression(&suppressions, path));
        assert!(!consume_suppression(&suppressions, path));
    }

    #[test]
    fn stacked_tokens_swallow_that_many_events() {
        let suppressions: SuppressionMap = Arc::new(Mutex::new(HashMap::new()));
        let path = Path::new("/sync/S/Foo.luau");
        if let Ok(mut map) = suppressions.lock() {
            map.insert(path.to_path_buf(), 2);
        }
        assert!(consume_suppression(&suppressions, path));
        assert!(consume_suppression(&suppressions, path));
        assert!(!consume_suppression(&suppressions, path));
    }

    #[tokio::test]
    async fn emits_debounced_change_with_file_body() {
        let dir = tempdir().expect("tempdir");
        let root = dir.path().to_path_buf();
        let (change_tx, mut change_rx) = mpsc::unbounded_channel();
        let watcher =
            ScriptWatcher::spawn(&root, Duration::from_millis(50), change_tx).expect("watcher");

        tokio::time::sleep(Duration::from_millis(100)).await;
        tokio::fs::write(root.join("Foo.luau"), "return 2\n")
            .await
            .expect("write");

        let change = tokio::time::timeout(Duration::from_secs(5), change_rx.recv())
            .await
            .expect("watcher did not fire")
            .expect("channel open");
        assert!(change.path.ends_with("Foo.luau"));
        assert_eq!(change.source, "return 2\n");
        drop(watcher);
    }

    #[tokio::test]
    async fn suppressed_write_produces_no_event() {
        let dir = tempdir().expect("tempdir");
        let root = dir.path().to_path_buf();
        let (change_tx, mut change_rx) = mpsc::unbounded_channel();
        let watcher =
            ScriptWatcher::spawn(&root, Duration::from_millis(50), change_tx).expect("watcher");
        tokio::time::sleep(Duration::from_millis(100)).await;

        let target = root.join("Bar.luau");
        watcher.suppress_next_change(&target);
        tokio::fs::write(&target, "-- from editor").await.expect("write");

        let outcome = tokio::time::timeout(Duration::from_millis(500), change_rx.recv()).await;
        assert!(outcome.is_err(), "suppressed change leaked: {outcome:?}");

        // A later unsuppressed edit still comes through.
        tokio::fs::write(&target, "-- from user").await.expect("write");
        let change = tokio::time::timeout(Duration::from_secs(5), change_rx.recv())
            .await
            .expect("watcher did not fire")
            .expect("channel open");
        assert_eq!(change.source, "-- from user");
    }
}
