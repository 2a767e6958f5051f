//! File synchronization: keeping open files consistent with what's on disk.
//!
//! [`FileSyncManager`] tracks a set of files. Raw change notifications (from the native or
//! polling observer, or injected through [`FileSyncManager::notify_changes`]) are debounced
//! per path; when a path's timer fires its content is re-read and the outcome goes out as a
//! [`SyncEvent`]:
//!
//! - our own write (a fresh write token matches) → `Synced`
//! - reactive file → `Reloaded`, plus `LocalChangesDiscarded` if edits were dropped
//! - tracked file → `ExternalChange`, or `Conflict` when local edits are pending
//! - gone → `Deleted`
//!
//! Writes go through [`FileSyncManager::save`], or call [`FileSyncManager::begin_write`]
//! before writing some other way, so the echo of the write isn't mistaken for an external
//! edit.

mod observer;
mod state;
mod tokens;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

pub use observer::{ChangeKind, ChangeRecord, ObserverError, ObserverMode};
pub use state::{DiskUpdate, FileStateTracker, SyncMode, SyncState};
pub use tokens::{WriteToken, WriteTokenManager};

use crate::config::SyncConfig;
use crate::ignore_poison::IgnorePoison;
use crate::provider::{DirectoryProvider, ProviderError};
use crate::tree::normalize_path;
use observer::ActiveObserver;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncEvent {
    #[serde(rename_all = "camelCase")]
    ExternalChange { path: String, new_mtime: i64 },
    #[serde(rename_all = "camelCase")]
    Conflict {
        path: String,
        base_content: String,
        local_content: String,
        disk_content: String,
    },
    #[serde(rename_all = "camelCase")]
    Reloaded { path: String, new_content: String },
    LocalChangesDiscarded { path: String },
    Deleted { path: String },
    Synced { path: String },
}

impl SyncEvent {
    pub fn path(&self) -> &str {
        match self {
            Self::ExternalChange { path, .. }
            | Self::Conflict { path, .. }
            | Self::Reloaded { path, .. }
            | Self::LocalChangesDiscarded { path }
            | Self::Deleted { path }
            | Self::Synced { path } => path,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("Not tracked: {0}")]
    NotTracked(String),
    #[error("Background task failed: {0}")]
    Task(String),
}

/// Content and mtime the caller already has, so `track` doesn't need to read the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialState {
    pub content: String,
    pub mtime: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackOptions {
    pub mode: SyncMode,
    pub initial: Option<InitialState>,
}

struct PendingChange {
    generation: u64,
    handle: JoinHandle<()>,
}

struct RunningObserver {
    observer: ActiveObserver,
    dispatcher: Option<JoinHandle<()>>,
}

impl Drop for RunningObserver {
    fn drop(&mut self) {
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.abort();
        }
    }
}

struct SyncInner {
    provider: Arc<dyn DirectoryProvider>,
    config: SyncConfig,
    requested_mode: ObserverMode,
    tokens: WriteTokenManager,
    trackers: Mutex<HashMap<String, Arc<Mutex<FileStateTracker>>>>,
    pending: Mutex<HashMap<String, PendingChange>>,
    next_generation: Mutex<u64>,
    observer: Mutex<Option<RunningObserver>>,
    events: broadcast::Sender<SyncEvent>,
}

/// Clone-friendly via internal `Arc`. Needs a tokio runtime: timers and observers are tasks.
#[derive(Clone)]
pub struct FileSyncManager {
    inner: Arc<SyncInner>,
}

impl FileSyncManager {
    /// # Arguments
    /// * `provider` - Where tracked files are read from and written to
    /// * `config` - Debounce, token expiry and polling settings
    /// * `observer_mode` - Observer to start with the first tracked file. `Native` falls back
    ///   to `Polling` when it can't start.
    pub fn new(provider: Arc<dyn DirectoryProvider>, config: SyncConfig, observer_mode: ObserverMode) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            inner: Arc::new(SyncInner {
                tokens: WriteTokenManager::new(config.token_expiry(), config.require_exact_mtime),
                provider,
                config,
                requested_mode: observer_mode,
                trackers: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                next_generation: Mutex::new(0),
                observer: Mutex::new(None),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    /// Starts tracking `path`. Tracking an already tracked path does nothing.
    pub async fn track(&self, path: &str, options: TrackOptions) -> Result<(), SyncError> {
        let path = normalize_path(path);
        if self.is_tracked(&path) {
            return Ok(());
        }

        let InitialState { content, mtime } = match options.initial {
            Some(initial) => initial,
            None => self.inner.read_disk(&path).await?,
        };

        {
            let mut trackers = self.inner.trackers.lock_ignore_poison();
            if trackers.contains_key(&path) {
                return Ok(());
            }
            let tracker = FileStateTracker::new(&path, options.mode, content, mtime);
            trackers.insert(path.clone(), Arc::new(Mutex::new(tracker)));
        }
        log::debug!("Tracking '{path}' ({:?})", options.mode);

        let mut observer = self.inner.observer.lock_ignore_poison();
        let running = observer.get_or_insert_with(|| self.inner.start_observer());
        running.observer.watch_path(&path, Some(mtime));
        Ok(())
    }

    /// Stops tracking `path`, dropping its write token and pending change. The observer stops
    /// with the last tracked path.
    pub fn untrack(&self, path: &str) {
        let path = normalize_path(path);
        let remaining = {
            let mut trackers = self.inner.trackers.lock_ignore_poison();
            if trackers.remove(&path).is_none() {
                return;
            }
            trackers.len()
        };
        if let Some(pending) = self.inner.pending.lock_ignore_poison().remove(&path) {
            pending.handle.abort();
        }
        self.inner.tokens.clear(&path);

        let mut observer = self.inner.observer.lock_ignore_poison();
        if let Some(running) = observer.as_ref() {
            running.observer.unwatch_path(&path);
        }
        if remaining == 0 && observer.take().is_some() {
            log::debug!("No tracked files left, stopping change observer");
        }
        log::debug!("Stopped tracking '{path}'");
    }

    /// Issues a write token for `path`. Call right before writing it.
    pub fn begin_write(&self, path: &str) -> WriteToken {
        self.inner.tokens.generate_token(&normalize_path(path))
    }

    /// Writes `content` to `path` as our own change and marks the tracker synced.
    /// Returns the new mtime.
    pub async fn save(&self, path: &str, content: &str) -> Result<i64, SyncError> {
        let path = normalize_path(path);
        let tracker = self.tracker(&path).ok_or_else(|| SyncError::NotTracked(path.clone()))?;

        self.inner.tokens.generate_token(&path);
        let provider = Arc::clone(&self.inner.provider);
        let write_path = path.clone();
        let bytes = content.as_bytes().to_vec();
        let written = tokio::task::spawn_blocking(move || provider.write_file(&write_path, &bytes))
            .await
            .map_err(|e| SyncError::Task(e.to_string()))?;
        let mtime = match written {
            Ok(mtime) => mtime,
            Err(e) => {
                self.inner.tokens.clear(&path);
                return Err(e.into());
            }
        };

        self.inner.tokens.record_write_mtime(&path, mtime);
        tracker.lock_ignore_poison().mark_synced(content.to_string(), mtime);
        Ok(mtime)
    }

    /// Replaces the tracker's state with what's on disk now, dropping local edits.
    pub async fn reload(&self, path: &str) -> Result<String, SyncError> {
        let path = normalize_path(path);
        let tracker = self.tracker(&path).ok_or_else(|| SyncError::NotTracked(path.clone()))?;
        let InitialState { content, mtime } = self.inner.read_disk(&path).await?;
        tracker.lock_ignore_poison().mark_synced(content.clone(), mtime);
        Ok(content)
    }

    /// Records a local edit. Returns the resulting state.
    pub fn set_local_content(&self, path: &str, content: &str) -> Result<SyncState, SyncError> {
        let path = normalize_path(path);
        let tracker = self.tracker(&path).ok_or(SyncError::NotTracked(path))?;
        let mut tracker = tracker.lock_ignore_poison();
        tracker.set_local_content(content.to_string());
        Ok(tracker.sync_state())
    }

    pub fn tracker(&self, path: &str) -> Option<Arc<Mutex<FileStateTracker>>> {
        self.inner.tracker(&normalize_path(path))
    }

    pub fn is_tracked(&self, path: &str) -> bool {
        self.inner
            .trackers
            .lock_ignore_poison()
            .contains_key(&normalize_path(path))
    }

    pub fn tracked_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.inner.trackers.lock_ignore_poison().keys().cloned().collect();
        paths.sort();
        paths
    }

    /// The observer currently running, if any path is tracked.
    pub fn observer_mode(&self) -> Option<ObserverMode> {
        self.inner
            .observer
            .lock_ignore_poison()
            .as_ref()
            .map(|running| running.observer.mode())
    }

    pub fn tokens(&self) -> &WriteTokenManager {
        &self.inner.tokens
    }

    /// Feeds raw change records in, as if an observer had reported them.
    pub fn notify_changes(&self, records: Vec<ChangeRecord>) {
        self.inner.handle_records(records);
    }

    /// Untracks everything and stops the observer.
    pub fn shutdown(&self) {
        for (_, pending) in self.inner.pending.lock_ignore_poison().drain() {
            pending.handle.abort();
        }
        self.inner.trackers.lock_ignore_poison().clear();
        self.inner.observer.lock_ignore_poison().take();
        log::debug!("File sync manager shut down");
    }
}

impl SyncInner {
    fn tracker(&self, path: &str) -> Option<Arc<Mutex<FileStateTracker>>> {
        self.trackers.lock_ignore_poison().get(path).cloned()
    }

    fn emit(&self, event: SyncEvent) {
        log::debug!("Sync event: {event:?}");
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    async fn read_disk(&self, path: &str) -> Result<InitialState, SyncError> {
        let provider = Arc::clone(&self.provider);
        let path = path.to_string();
        let read = tokio::task::spawn_blocking(move || -> Result<InitialState, ProviderError> {
            let bytes = provider.read_file(&path)?;
            let mtime = provider.last_modified(&path)?;
            Ok(InitialState {
                content: String::from_utf8_lossy(&bytes).into_owned(),
                mtime,
            })
        })
        .await
        .map_err(|e| SyncError::Task(e.to_string()))?;
        Ok(read?)
    }

    fn start_observer(self: &Arc<Self>) -> RunningObserver {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<ChangeRecord>>();
        let observer = ActiveObserver::start(self.requested_mode, &self.provider, self.config.poll_interval(), tx);

        let dispatcher = (observer.mode() != ObserverMode::Manual).then(|| {
            let weak: Weak<SyncInner> = Arc::downgrade(self);
            tokio::spawn(async move {
                while let Some(records) = rx.recv().await {
                    let Some(inner) = weak.upgrade() else { break };
                    inner.handle_records(records);
                }
            })
        });
        RunningObserver { observer, dispatcher }
    }

    /// Restarts the debounce timer of every tracked path in `records`.
    fn handle_records(self: &Arc<Self>, records: Vec<ChangeRecord>) {
        for record in records {
            let path = normalize_path(&record.path);
            if self.tracker(&path).is_none() {
                continue;
            }
            self.schedule(path, record.kind);
        }
    }

    fn schedule(self: &Arc<Self>, path: String, kind: ChangeKind) {
        let generation = {
            let mut next = self.next_generation.lock_ignore_poison();
            *next += 1;
            *next
        };
        let inner = Arc::clone(self);
        let debounce = self.config.debounce();
        let task_path = path.clone();

        let mut pending = self.pending.lock_ignore_poison();
        if let Some(previous) = pending.remove(&path) {
            previous.handle.abort();
        }
        let handle = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            {
                let mut pending = inner.pending.lock_ignore_poison();
                if !pending.get(&task_path).is_some_and(|p| p.generation == generation) {
                    // Superseded by a newer record
                    return;
                }
                pending.remove(&task_path);
            }
            inner.evaluate(&task_path, kind).await;
        });
        pending.insert(path, PendingChange { generation, handle });
    }

    async fn evaluate(&self, path: &str, kind: ChangeKind) {
        let Some(tracker) = self.tracker(path) else {
            return;
        };
        log::debug!("Evaluating {kind:?} for '{path}'");

        if kind == ChangeKind::Disappeared {
            self.tokens.clear(path);
            self.emit(SyncEvent::Deleted { path: path.to_string() });
            return;
        }

        let InitialState { content, mtime } = match self.read_disk(path).await {
            Ok(state) => state,
            Err(SyncError::Provider(e)) if e.is_not_found() => {
                self.tokens.clear(path);
                self.emit(SyncEvent::Deleted { path: path.to_string() });
                return;
            }
            Err(e) => {
                log::warn!("Couldn't read '{path}' after a change: {e}");
                return;
            }
        };

        // Untracked (or untracked and tracked again) while reading
        match self.tracker(path) {
            Some(current) if Arc::ptr_eq(&current, &tracker) => {}
            _ => return,
        }

        if self.tokens.match_token(path, mtime).is_some() {
            log::debug!("Change to '{path}' is our own write");
            tracker.lock_ignore_poison().mark_synced(content, mtime);
            self.emit(SyncEvent::Synced { path: path.to_string() });
            return;
        }

        let (update, event_data) = {
            let mut tracker = tracker.lock_ignore_poison();
            let update = tracker.update_disk_state(content.clone(), mtime);
            let conflict = (update == DiskUpdate::Conflict).then(|| {
                (
                    tracker.base_content().to_string(),
                    tracker.local_content().to_string(),
                    tracker.disk_content().to_string(),
                )
            });
            (update, conflict)
        };

        let path = path.to_string();
        match update {
            DiskUpdate::Unchanged => log::debug!("'{path}' changed on disk but its content didn't"),
            DiskUpdate::ExternalChange => self.emit(SyncEvent::ExternalChange { path, new_mtime: mtime }),
            DiskUpdate::Converged => self.emit(SyncEvent::Synced { path }),
            DiskUpdate::Conflict => {
                if let Some((base_content, local_content, disk_content)) = event_data {
                    self.emit(SyncEvent::Conflict {
                        path,
                        base_content,
                        local_content,
                        disk_content,
                    });
                }
            }
            DiskUpdate::Reloaded {
                discarded_local_changes,
            } => {
                self.emit(SyncEvent::Reloaded {
                    path: path.clone(),
                    new_content: content,
                });
                if discarded_local_changes {
                    self.emit(SyncEvent::LocalChangesDiscarded { path });
                }
            }
        }
    }
}
