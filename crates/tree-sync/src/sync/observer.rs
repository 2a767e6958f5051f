//! Change observers feeding the sync manager.
//!
//! Both observers push batches of [`ChangeRecord`]s into an unbounded channel; the manager
//! debounces and evaluates them. The native observer watches the provider's local root with
//! `notify`. The polling observer asks the provider for the mtime of every watched path on a
//! fixed interval, and is what we fall back to when there's nothing native to watch.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use notify::event::ModifyKind;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::ignore_poison::IgnorePoison;
use crate::provider::DirectoryProvider;
use crate::tree::normalize_path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Appeared,
    Modified,
    Disappeared,
}

/// One raw change notification, path relative to the provider root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    pub kind: ChangeKind,
    pub path: String,
}

impl ChangeRecord {
    pub fn new(kind: ChangeKind, path: &str) -> Self {
        Self {
            kind,
            path: normalize_path(path),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ObserverMode {
    /// OS notifications on the provider's local root.
    Native,
    /// Periodic mtime checks through the provider.
    Polling,
    /// No observer; changes arrive through `FileSyncManager::notify_changes`.
    Manual,
}

#[derive(Debug, thiserror::Error)]
pub enum ObserverError {
    #[error("Provider has no local root to watch")]
    NoLocalRoot,
    #[error("Couldn't start file watcher: {0}")]
    Notify(#[from] notify::Error),
}

pub(crate) type RecordSender = mpsc::UnboundedSender<Vec<ChangeRecord>>;

// ── Native ───────────────────────────────────────────────────────────

pub(crate) struct NativeObserver {
    _watcher: RecommendedWatcher,
}

impl NativeObserver {
    pub(crate) fn start(root: &Path, tx: RecordSender) -> Result<Self, ObserverError> {
        // Events come back with resolved paths (e.g. /private/var on macOS)
        let roots: Vec<PathBuf> = match root.canonicalize() {
            Ok(canonical) if canonical != root => vec![canonical, root.to_path_buf()],
            _ => vec![root.to_path_buf()],
        };

        let mut watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
            let event = match result {
                Ok(event) => event,
                Err(e) => {
                    log::warn!("File watcher error: {e}");
                    return;
                }
            };
            let records = records_for_event(&event, &roots);
            if !records.is_empty() {
                // Receiver gone means the manager stopped observing
                let _ = tx.send(records);
            }
        })?;
        watcher.watch(root, RecursiveMode::Recursive)?;
        log::info!("Watching {} for changes", root.display());
        Ok(Self { _watcher: watcher })
    }
}

fn records_for_event(event: &notify::Event, roots: &[PathBuf]) -> Vec<ChangeRecord> {
    event
        .paths
        .iter()
        .filter_map(|abs| {
            let kind = match event.kind {
                EventKind::Access(_) => return None,
                EventKind::Create(_) => ChangeKind::Appeared,
                EventKind::Remove(_) => ChangeKind::Disappeared,
                // Renames report both ends; which one this is depends on what's there now
                EventKind::Modify(ModifyKind::Name(_)) => {
                    if abs.exists() {
                        ChangeKind::Appeared
                    } else {
                        ChangeKind::Disappeared
                    }
                }
                _ => ChangeKind::Modified,
            };
            let path = roots.iter().find_map(|root| relative_path(root, abs))?;
            Some(ChangeRecord { kind, path })
        })
        .collect()
}

/// `abs` as a normalized path under `root`, or `None` if it's elsewhere.
fn relative_path(root: &Path, abs: &Path) -> Option<String> {
    let rel = abs.strip_prefix(root).ok()?;
    let mut out = String::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => {
                out.push('/');
                out.push_str(&part.to_string_lossy());
            }
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(out)
}

// ── Polling ──────────────────────────────────────────────────────────

pub(crate) struct PollingObserver {
    /// Last seen mtime per watched path, `None` while the path doesn't exist.
    baseline: Arc<Mutex<HashMap<String, Option<i64>>>>,
    task: JoinHandle<()>,
}

impl PollingObserver {
    pub(crate) fn start(provider: Arc<dyn DirectoryProvider>, interval: Duration, tx: RecordSender) -> Self {
        let baseline: Arc<Mutex<HashMap<String, Option<i64>>>> = Arc::new(Mutex::new(HashMap::new()));
        let task = tokio::spawn(poll_loop(provider, interval, Arc::clone(&baseline), tx));
        log::info!("Polling for changes every {} ms", interval.as_millis());
        Self { baseline, task }
    }

    fn watch(&self, path: &str, mtime: Option<i64>) {
        self.baseline.lock_ignore_poison().insert(path.to_string(), mtime);
    }

    fn unwatch(&self, path: &str) {
        self.baseline.lock_ignore_poison().remove(path);
    }
}

impl Drop for PollingObserver {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn poll_loop(
    provider: Arc<dyn DirectoryProvider>,
    interval: Duration,
    baseline: Arc<Mutex<HashMap<String, Option<i64>>>>,
    tx: RecordSender,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;

        let paths: Vec<String> = baseline.lock_ignore_poison().keys().cloned().collect();
        if paths.is_empty() {
            continue;
        }

        let provider = Arc::clone(&provider);
        let observed = tokio::task::spawn_blocking(move || {
            paths
                .into_iter()
                .map(|path| {
                    let mtime = match provider.last_modified(&path) {
                        Ok(mtime) => Ok(Some(mtime)),
                        Err(e) if e.is_not_found() => Ok(None),
                        Err(e) => Err(e),
                    };
                    (path, mtime)
                })
                .collect::<Vec<_>>()
        })
        .await;
        let Ok(observed) = observed else {
            continue;
        };

        let mut records = Vec::new();
        {
            let mut baseline = baseline.lock_ignore_poison();
            for (path, mtime) in observed {
                let now = match mtime {
                    Ok(now) => now,
                    Err(e) => {
                        log::debug!("Polling '{path}' failed: {e}");
                        continue;
                    }
                };
                // Untracked while we were polling
                let Some(previous) = baseline.get_mut(&path) else {
                    continue;
                };
                let kind = match (*previous, now) {
                    (Some(before), Some(after)) if before != after => Some(ChangeKind::Modified),
                    (Some(_), None) => Some(ChangeKind::Disappeared),
                    (None, Some(_)) => Some(ChangeKind::Appeared),
                    _ => None,
                };
                *previous = now;
                if let Some(kind) = kind {
                    records.push(ChangeRecord { kind, path });
                }
            }
        }

        if !records.is_empty() && tx.send(records).is_err() {
            break;
        }
    }
}

// ── Active observer ──────────────────────────────────────────────────

pub(crate) enum ActiveObserver {
    Native(NativeObserver),
    Polling(PollingObserver),
    Manual,
}

impl ActiveObserver {
    /// Starts the requested observer. A native observer that can't start falls back to
    /// polling.
    pub(crate) fn start(
        requested: ObserverMode,
        provider: &Arc<dyn DirectoryProvider>,
        poll_interval: Duration,
        tx: RecordSender,
    ) -> Self {
        match requested {
            ObserverMode::Manual => Self::Manual,
            ObserverMode::Polling => Self::Polling(PollingObserver::start(Arc::clone(provider), poll_interval, tx)),
            ObserverMode::Native => {
                let native = provider
                    .local_root()
                    .ok_or(ObserverError::NoLocalRoot)
                    .and_then(|root| NativeObserver::start(&root, tx.clone()));
                match native {
                    Ok(observer) => Self::Native(observer),
                    Err(e) => {
                        log::warn!("Native change observer unavailable ({e}), falling back to polling");
                        Self::Polling(PollingObserver::start(Arc::clone(provider), poll_interval, tx))
                    }
                }
            }
        }
    }

    pub(crate) fn mode(&self) -> ObserverMode {
        match self {
            Self::Native(_) => ObserverMode::Native,
            Self::Polling(_) => ObserverMode::Polling,
            Self::Manual => ObserverMode::Manual,
        }
    }

    /// Starts watching `path`. Only the polling observer keeps per-path state.
    pub(crate) fn watch_path(&self, path: &str, mtime: Option<i64>) {
        if let Self::Polling(polling) = self {
            polling.watch(path, mtime);
        }
    }

    pub(crate) fn unwatch_path(&self, path: &str) {
        if let Self::Polling(polling) = self {
            polling.unwatch(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{HandleCache, HandleDirectoryProvider, MemoryFileSystem};

    #[test]
    fn relative_paths_stay_inside_root() {
        let root = Path::new("/data/project");
        assert_eq!(
            relative_path(root, Path::new("/data/project/src/a.txt")).as_deref(),
            Some("/src/a.txt")
        );
        assert_eq!(relative_path(root, Path::new("/data/project")).as_deref(), Some(""));
        assert_eq!(relative_path(root, Path::new("/data/other/a.txt")), None);
    }

    #[test]
    fn notify_events_map_to_records() {
        let roots = vec![PathBuf::from("/data/project")];
        let event = notify::Event::new(EventKind::Create(notify::event::CreateKind::File))
            .add_path(PathBuf::from("/data/project/new.txt"))
            .add_path(PathBuf::from("/elsewhere/x.txt"));
        assert_eq!(
            records_for_event(&event, &roots),
            vec![ChangeRecord::new(ChangeKind::Appeared, "/new.txt")]
        );

        let event = notify::Event::new(EventKind::Remove(notify::event::RemoveKind::File))
            .add_path(PathBuf::from("/data/project/old.txt"));
        assert_eq!(records_for_event(&event, &roots)[0].kind, ChangeKind::Disappeared);

        let event = notify::Event::new(EventKind::Access(notify::event::AccessKind::Any))
            .add_path(PathBuf::from("/data/project/read.txt"));
        assert!(records_for_event(&event, &roots).is_empty());
    }

    #[tokio::test]
    async fn native_without_local_root_falls_back_to_polling() {
        let provider: Arc<dyn DirectoryProvider> = Arc::new(HandleDirectoryProvider::new(
            MemoryFileSystem::new(),
            Arc::new(HandleCache::new(8)),
        ));
        let (tx, _rx) = mpsc::unbounded_channel();
        let observer = ActiveObserver::start(ObserverMode::Native, &provider, Duration::from_millis(50), tx);
        assert_eq!(observer.mode(), ObserverMode::Polling);
    }

    #[tokio::test]
    async fn polling_reports_modified_and_disappeared() {
        let fs = MemoryFileSystem::new();
        let mtime = fs.put_file("/a.txt", "one");
        let provider = Arc::new(HandleDirectoryProvider::new(fs, Arc::new(HandleCache::new(8))));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let observer = PollingObserver::start(provider.clone(), Duration::from_millis(10), tx);
        observer.watch("/a.txt", Some(mtime));

        provider.file_system().put_file("/a.txt", "two");
        let batch = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(batch, vec![ChangeRecord::new(ChangeKind::Modified, "/a.txt")]);

        provider.file_system().remove("/a.txt");
        let batch = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(batch, vec![ChangeRecord::new(ChangeKind::Disappeared, "/a.txt")]);
    }
}
