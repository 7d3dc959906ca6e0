//! Folder watch
//!
//! Recursively watches folders and turns raw change notifications into
//! debounced [`WatchEvent`]s. Each root gets a `notify` watcher feeding a
//! reconciler task; every raw notification for a path re-arms that path's
//! debounce timer, and the path is only inspected once the timer fires
//! uninterrupted.

pub mod reconcile;

pub use reconcile::{decide, Observation, Reconciliation, WatchEvent, WatchState};

use crate::config::WatchConfig;
use crate::scan::{is_video_file, walk_videos};
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::{AbortHandle, JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// Watch events buffered before slow subscribers lag
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Error type for folder watching
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("Not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("Cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Filesystem watcher error: {0}")]
    Notify(#[from] notify::Error),

    #[error("Baseline scan of {0} was aborted")]
    Baseline(PathBuf),
}

/// One watched root; dropping it stops the watcher and its reconciler
struct RootWatch {
    _watcher: RecommendedWatcher,
    reconciler: JoinHandle<()>,
}

impl Drop for RootWatch {
    fn drop(&mut self) {
        self.reconciler.abort();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Watches any number of independent roots and broadcasts their events
pub struct FolderWatcher {
    debounce: Duration,
    events: broadcast::Sender<WatchEvent>,
    roots: Mutex<HashMap<PathBuf, RootWatch>>,
}

impl FolderWatcher {
    pub fn new(debounce: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            debounce,
            events,
            roots: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(cfg: &WatchConfig) -> Self {
        Self::new(Duration::from_millis(cfg.debounce_ms))
    }

    /// Receive events for every watched root
    pub fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }

    pub fn watched_roots(&self) -> Vec<PathBuf> {
        let mut roots: Vec<PathBuf> = lock(&self.roots).keys().cloned().collect();
        roots.sort();
        roots
    }

    /// Start watching `root`; false when it is already watched
    ///
    /// The files present at start form the baseline and are never reported.
    pub async fn watch(&self, root: &Path) -> Result<bool, WatchError> {
        let root = canonical_dir(root).await?;
        if lock(&self.roots).contains_key(&root) {
            return Ok(false);
        }

        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let mut watcher = RecommendedWatcher::new(
            move |result: notify::Result<Event>| {
                // Receiver gone means the root is being unwatched
                let _ = raw_tx.send(result);
            },
            Config::default(),
        )?;
        watcher.watch(&root, RecursiveMode::Recursive)?;

        // Baseline after the watcher is live so nothing slips between the two
        let baseline_root = root.clone();
        let state = tokio::task::spawn_blocking(move || WatchState::baseline(baseline_root))
            .await
            .map_err(|_| WatchError::Baseline(root.clone()))?;
        let known = state.known_count();

        let watch = RootWatch {
            _watcher: watcher,
            reconciler: tokio::spawn(reconcile_loop(
                state,
                raw_rx,
                self.debounce,
                self.events.clone(),
            )),
        };

        let mut roots = lock(&self.roots);
        if roots.contains_key(&root) {
            // Lost a race with a concurrent watch of the same root; dropping stops ours
            return Ok(false);
        }
        info!(root = %root.display(), known, "Watching folder");
        roots.insert(root, watch);
        Ok(true)
    }

    /// Stop watching `root`; pending timers are dropped without emitting events
    pub async fn unwatch(&self, root: &Path) -> bool {
        let key = tokio::fs::canonicalize(root)
            .await
            .unwrap_or_else(|_| root.to_path_buf());
        let removed = lock(&self.roots).remove(&key);
        match removed {
            Some(watch) => {
                drop(watch);
                info!(root = %key.display(), "Stopped watching folder");
                true
            }
            None => false,
        }
    }
}

async fn canonical_dir(root: &Path) -> Result<PathBuf, WatchError> {
    let canonical = tokio::fs::canonicalize(root)
        .await
        .map_err(|source| WatchError::Io {
            path: root.to_path_buf(),
            source,
        })?;
    let metadata = tokio::fs::metadata(&canonical)
        .await
        .map_err(|source| WatchError::Io {
            path: canonical.clone(),
            source,
        })?;
    if !metadata.is_dir() {
        return Err(WatchError::NotADirectory(root.to_path_buf()));
    }
    Ok(canonical)
}

/// Per-path debounce timers; dropping this aborts every pending timer
struct Debouncer {
    window: Duration,
    generation: u64,
    pending: HashMap<PathBuf, (u64, AbortHandle)>,
    timers: JoinSet<(PathBuf, u64)>,
}

impl Debouncer {
    fn new(window: Duration) -> Self {
        Self {
            window,
            generation: 0,
            pending: HashMap::new(),
            timers: JoinSet::new(),
        }
    }

    /// Start or restart the timer for `path`
    fn arm(&mut self, path: PathBuf) {
        self.generation += 1;
        let generation = self.generation;
        let window = self.window;
        let timer_path = path.clone();
        let handle = self.timers.spawn(async move {
            tokio::time::sleep(window).await;
            (timer_path, generation)
        });
        if let Some((_, previous)) = self.pending.insert(path, (generation, handle)) {
            previous.abort();
        }
    }

    /// Next path whose window elapsed uninterrupted
    async fn next_settled(&mut self) -> Option<PathBuf> {
        while let Some(joined) = self.timers.join_next().await {
            let Ok((path, generation)) = joined else {
                continue;
            };
            if self.pending.get(&path).map(|(g, _)| *g) == Some(generation) {
                self.pending.remove(&path);
                return Some(path);
            }
        }
        None
    }

    fn is_idle(&self) -> bool {
        self.timers.is_empty()
    }
}

async fn reconcile_loop(
    mut state: WatchState,
    mut raw: mpsc::UnboundedReceiver<notify::Result<Event>>,
    debounce: Duration,
    events: broadcast::Sender<WatchEvent>,
) {
    let mut debouncer = Debouncer::new(debounce);

    loop {
        tokio::select! {
            received = raw.recv() => match received {
                Some(Ok(event)) => {
                    for path in event.paths {
                        for target in expand(&state, path).await {
                            debouncer.arm(target);
                        }
                    }
                }
                Some(Err(e)) => warn!(root = %state.root().display(), error = %e, "Watcher error"),
                None => break,
            },
            Some(path) = debouncer.next_settled(), if !debouncer.is_idle() => {
                settle(&mut state, &path, &events).await;
            }
        }
    }

    debug!(root = %state.root().display(), "Reconciler stopped");
}

/// Video paths affected by a raw notification for `path`
///
/// Directory notifications stand for their contents: known files below a
/// vanished directory, or video files inside a directory that appeared.
async fn expand(state: &WatchState, path: PathBuf) -> Vec<PathBuf> {
    if in_hidden_dir(state.root(), &path) {
        return Vec::new();
    }
    if is_video_file(&path) {
        return vec![path];
    }

    let mut targets = state.known_under(&path);
    let is_dir = tokio::fs::metadata(&path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false);
    if is_dir {
        let found = tokio::task::spawn_blocking(move || {
            walk_videos(&path)
                .map(|entry| entry.into_path())
                .collect::<Vec<_>>()
        })
        .await
        .unwrap_or_default();
        targets.extend(found);
    }
    targets
}

/// True when a directory between `root` and `path` is hidden, matching the scanner
fn in_hidden_dir(root: &Path, path: &Path) -> bool {
    let Ok(relative) = path.strip_prefix(root) else {
        return false;
    };
    let mut dirs = relative.components();
    dirs.next_back();
    dirs.any(|c| c.as_os_str().to_string_lossy().starts_with('.'))
}

async fn settle(state: &mut WatchState, path: &Path, events: &broadcast::Sender<WatchEvent>) {
    let observation = match tokio::fs::metadata(path).await {
        Ok(metadata) if metadata.is_file() => Observation::Present {
            size: metadata.len(),
        },
        Ok(_) => Observation::Missing,
        Err(e) if e.kind() == io::ErrorKind::NotFound => Observation::Missing,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Cannot inspect changed file");
            return;
        }
    };

    match state.reconcile(path, observation) {
        Some(event) => {
            info!(?event, "Folder change");
            // No subscribers is fine
            let _ = events.send(event);
        }
        None => debug!(path = %path.display(), ?observation, "No net change"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;
    use tempfile::TempDir;

    async fn next_event(rx: &mut broadcast::Receiver<WatchEvent>, within: Duration) -> Option<WatchEvent> {
        tokio::time::timeout(within, rx.recv()).await.ok()?.ok()
    }

    async fn watched(debounce_ms: u64) -> (TempDir, PathBuf, FolderWatcher) {
        let dir = TempDir::new().unwrap();
        let root = fs::canonicalize(dir.path()).unwrap();
        let watcher = FolderWatcher::new(Duration::from_millis(debounce_ms));
        assert!(watcher.watch(&root).await.unwrap());
        (dir, root, watcher)
    }

    #[tokio::test]
    async fn test_burst_of_writes_yields_one_added_event() {
        let (_dir, root, watcher) = watched(500).await;
        let mut events = watcher.subscribe();
        let clip = root.join("clip.mp4");

        let mut file = fs::File::create(&clip).unwrap();
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            file.write_all(b"frame data").unwrap();
            file.flush().unwrap();
        }
        drop(file);

        let event = next_event(&mut events, Duration::from_secs(5))
            .await
            .expect("expected an added event");
        assert_eq!(
            event,
            WatchEvent::Added {
                root: root.clone(),
                file_path: clip.clone(),
            }
        );
        assert_eq!(next_event(&mut events, Duration::from_millis(1200)).await, None);
    }

    #[tokio::test]
    async fn test_empty_file_is_not_reported_until_written() {
        let (_dir, root, watcher) = watched(150).await;
        let mut events = watcher.subscribe();
        let clip = root.join("growing.mov");

        fs::File::create(&clip).unwrap();
        assert_eq!(next_event(&mut events, Duration::from_millis(600)).await, None);

        fs::write(&clip, b"now readable").unwrap();
        let event = next_event(&mut events, Duration::from_secs(5)).await.unwrap();
        assert_eq!(event.file_path(), clip.as_path());
        assert!(matches!(event, WatchEvent::Added { .. }));
    }

    #[tokio::test]
    async fn test_baseline_is_silent_and_removal_is_reported() {
        let dir = TempDir::new().unwrap();
        let root = fs::canonicalize(dir.path()).unwrap();
        let existing = root.join("existing.mkv");
        fs::write(&existing, b"already here").unwrap();

        let watcher = FolderWatcher::new(Duration::from_millis(150));
        let mut events = watcher.subscribe();
        watcher.watch(&root).await.unwrap();
        assert_eq!(next_event(&mut events, Duration::from_millis(400)).await, None);

        fs::remove_file(&existing).unwrap();
        let event = next_event(&mut events, Duration::from_secs(5)).await.unwrap();
        assert_eq!(
            event,
            WatchEvent::Removed {
                root: root.clone(),
                file_path: existing,
            }
        );
    }

    #[tokio::test]
    async fn test_non_video_files_are_ignored() {
        let (_dir, root, watcher) = watched(100).await;
        let mut events = watcher.subscribe();

        fs::write(root.join("notes.txt"), b"hello").unwrap();
        assert_eq!(next_event(&mut events, Duration::from_millis(500)).await, None);
    }

    #[tokio::test]
    async fn test_unwatch_discards_pending_changes() {
        let (_dir, root, watcher) = watched(300).await;
        let mut events = watcher.subscribe();

        fs::write(root.join("late.mp4"), b"data").unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(watcher.unwatch(&root).await);
        assert!(watcher.watched_roots().is_empty());

        assert_eq!(next_event(&mut events, Duration::from_millis(800)).await, None);
        assert!(!watcher.unwatch(&root).await);
    }

    #[test]
    fn test_hidden_directories_are_skipped() {
        let root = Path::new("/clips");
        assert!(in_hidden_dir(root, Path::new("/clips/.trash/a.mp4")));
        assert!(!in_hidden_dir(root, Path::new("/clips/trips/a.mp4")));
        assert!(!in_hidden_dir(root, Path::new("/clips/.a.mp4")));
    }

    #[tokio::test]
    async fn test_watch_same_root_twice_is_noop() {
        let (_dir, root, watcher) = watched(100).await;
        assert!(!watcher.watch(&root).await.unwrap());
        assert_eq!(watcher.watched_roots(), vec![root]);
    }

    #[tokio::test]
    async fn test_watch_rejects_files() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("clip.mp4");
        fs::write(&file, b"x").unwrap();

        let watcher = FolderWatcher::new(Duration::from_millis(100));
        assert!(matches!(
            watcher.watch(&file).await,
            Err(WatchError::NotADirectory(_))
        ));
    }
}
