//! Background directory prefetching.
//!
//! Walks a directory tree breadth-first with up to `concurrency` tokio worker tasks. Targets
//! come in through [`PrefetchQueue::ingest`] (every unloaded sub-directory of a loaded subtree
//! becomes a target) or [`PrefetchQueue::enqueue`].
//!
//! Two queues: primary and deferred. Anything under a "load later" segment (`node_modules`,
//! `.git`, ...) is deferred, and deferred work only starts once the primary queue is empty
//! and no primary load is in flight. Primary results go out as
//! [`PrefetchEvent::DirectoryLoaded`], deferred ones as a one-level
//! [`PrefetchEvent::DeferredMetadata`] summary.
//!
//! A session counter makes cancellation cooperative: [`PrefetchQueue::reset_for_source`]
//! bumps it, and every worker compares its captured session after each await and exits on a
//! mismatch, dropping whatever it had in hand.

pub mod cached;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::Serialize;
use tokio::sync::{Mutex, Notify, mpsc};

pub use cached::CachedPrefetchQueue;

use crate::config::PrefetchConfig;
use crate::provider::{DirectoryProvider, ProviderError};
use crate::tree::{PrefetchTarget, TreeNode, segments};

// ── Types ────────────────────────────────────────────────────────────

/// Loads one directory. The returned node must be a loaded directory at `target.path`;
/// sub-directories it doesn't descend into come back as placeholders.
pub type DirectoryLoader = Arc<dyn Fn(PrefetchTarget) -> BoxFuture<'static, Result<TreeNode, ProviderError>> + Send + Sync>;

/// A finished load plus whether it's worth telling listeners about.
pub(crate) struct LoadedDirectory {
    pub node: TreeNode,
    pub emit: bool,
}

pub(crate) type InnerLoader =
    Arc<dyn Fn(PrefetchTarget) -> BoxFuture<'static, Result<LoadedDirectory, ProviderError>> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrefetchStatus {
    pub running: bool,
    pub pending: usize,
    pub deferred: usize,
    pub indexed_file_count: u64,
    pub processed_count: u64,
    pub last_duration_ms: u64,
    pub average_duration_ms: u64,
    pub primary_complete: bool,
    pub budget_exhausted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrefetchEvent {
    DirectoryLoaded { path: String, node: TreeNode },
    /// A deferred directory, reduced to one level.
    DeferredMetadata { path: String, summary: TreeNode },
    Status(PrefetchStatus),
    Error { path: String, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Primary,
    Deferred,
}

struct QueueInner {
    config: PrefetchConfig,
    loader: InnerLoader,
    events: mpsc::UnboundedSender<PrefetchEvent>,
    session: u64,
    source: Option<String>,
    primary: VecDeque<PrefetchTarget>,
    deferred: VecDeque<PrefetchTarget>,
    /// Paths in either queue.
    queued: HashSet<String>,
    in_flight: HashSet<String>,
    loaded: HashSet<String>,
    /// Direct file count per loaded directory, so reloads replace rather than add.
    file_counts: HashMap<String, u64>,
    primary_in_flight: usize,
    primary_complete: bool,
    budget_exhausted: bool,
    active_workers: usize,
    processed_count: u64,
    indexed_file_count: u64,
    last_duration_ms: u64,
    total_duration_ms: u64,
}

// ── PrefetchQueue ────────────────────────────────────────────────────

/// Clone-friendly via internal `Arc`. All public methods acquire an async mutex.
#[derive(Clone)]
pub struct PrefetchQueue {
    inner: Arc<Mutex<QueueInner>>,
    idle: Arc<Notify>,
}

impl PrefetchQueue {
    pub fn new(config: PrefetchConfig, loader: DirectoryLoader, events: mpsc::UnboundedSender<PrefetchEvent>) -> Self {
        let inner_loader: InnerLoader = Arc::new(move |target| {
            let load = loader(target);
            async move { load.await.map(|node| LoadedDirectory { node, emit: true }) }.boxed()
        });
        Self::with_loader(config, inner_loader, events)
    }

    pub(crate) fn with_loader(
        config: PrefetchConfig,
        loader: InnerLoader,
        events: mpsc::UnboundedSender<PrefetchEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(QueueInner {
                config,
                loader,
                events,
                session: 0,
                source: None,
                primary: VecDeque::new(),
                deferred: VecDeque::new(),
                queued: HashSet::new(),
                in_flight: HashSet::new(),
                loaded: HashSet::new(),
                file_counts: HashMap::new(),
                primary_in_flight: 0,
                primary_complete: false,
                budget_exhausted: false,
                active_workers: 0,
                processed_count: 0,
                indexed_file_count: 0,
                last_duration_ms: 0,
                total_duration_ms: 0,
            })),
            idle: Arc::new(Notify::new()),
        }
    }

    /// Queues a directory. Silently dropped if too deep, already loaded, already queued or
    /// in flight, or if the session budget is spent.
    pub async fn enqueue(&self, target: PrefetchTarget) {
        let mut inner = self.inner.lock().await;
        inner.push_target(target);
        self.ensure_workers(&mut inner);
    }

    /// Like [`Self::enqueue`], but loads the directory again even if it was loaded before.
    pub async fn refresh(&self, target: PrefetchTarget) {
        let mut inner = self.inner.lock().await;
        inner.loaded.remove(&target.path);
        inner.push_target(target);
        self.ensure_workers(&mut inner);
    }

    /// Records a subtree the caller already has. Its loaded directories won't be fetched
    /// again; its unloaded sub-directories are queued.
    pub async fn ingest(&self, node: &TreeNode) {
        let mut inner = self.inner.lock().await;
        inner.ingest_node(node);
        self.ensure_workers(&mut inner);
    }

    /// Starts a new session for `source`. Queues, counters and the budget are reset; workers
    /// of the previous session drop their results and exit.
    pub async fn reset_for_source(&self, source: &str) {
        let mut inner = self.inner.lock().await;
        inner.session += 1;
        inner.source = Some(source.to_string());
        inner.primary.clear();
        inner.deferred.clear();
        inner.queued.clear();
        inner.in_flight.clear();
        inner.loaded.clear();
        inner.file_counts.clear();
        inner.primary_in_flight = 0;
        inner.primary_complete = false;
        inner.budget_exhausted = false;
        inner.active_workers = 0;
        inner.processed_count = 0;
        inner.indexed_file_count = 0;
        inner.last_duration_ms = 0;
        inner.total_duration_ms = 0;
        log::info!("Prefetch: new session {} for '{source}'", inner.session);
        drop(inner);
        self.idle.notify_waiters();
    }

    pub async fn status(&self) -> PrefetchStatus {
        self.inner.lock().await.status()
    }

    pub async fn is_budget_exhausted(&self) -> bool {
        self.inner.lock().await.budget_exhausted
    }

    /// The source passed to the last [`Self::reset_for_source`].
    pub async fn source(&self) -> Option<String> {
        self.inner.lock().await.source.clone()
    }

    /// Resolves once no worker of the current session is running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.inner.lock().await.active_workers == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Spawns workers while there's runnable work and free slots.
    fn ensure_workers(&self, inner: &mut QueueInner) {
        let runnable = inner.primary.len() + if inner.primary_in_flight == 0 { inner.deferred.len() } else { 0 };
        let wanted = runnable.min(inner.config.concurrency.max(1));
        while inner.active_workers < wanted {
            inner.active_workers += 1;
            tokio::spawn(run_worker(self.clone(), inner.session));
        }
    }
}

// ── Worker ───────────────────────────────────────────────────────────

async fn run_worker(queue: PrefetchQueue, session: u64) {
    let mut completed: u64 = 0;
    loop {
        // Pick the next job, or retire
        let (target, phase, loader) = {
            let mut inner = queue.inner.lock().await;
            if inner.session != session {
                return;
            }
            let next = inner.next_job();
            match next {
                Some((target, phase)) => (target, phase, inner.loader.clone()),
                None => {
                    inner.active_workers -= 1;
                    let idle = inner.active_workers == 0;
                    drop(inner);
                    if idle {
                        queue.idle.notify_waiters();
                    }
                    return;
                }
            }
        };

        let started = Instant::now();
        let result = loader(target.clone()).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let yield_delay = {
            let mut inner = queue.inner.lock().await;
            if inner.session != session {
                log::debug!("Prefetch: dropping result for '{}' from an old session", target.path);
                return;
            }
            inner.finish_job(&target, phase, result, elapsed_ms);
            queue.ensure_workers(&mut inner);

            completed += 1;
            let every = inner.config.yield_every;
            (every > 0 && completed.is_multiple_of(every)).then(|| inner.config.yield_delay())
        };

        if let Some(delay) = yield_delay {
            tokio::time::sleep(delay).await;
        }
    }
}

impl QueueInner {
    fn is_deferred_path(&self, path: &str) -> bool {
        segments(path).any(|segment| self.config.load_later.iter().any(|l| l == segment))
    }

    fn push_target(&mut self, target: PrefetchTarget) -> bool {
        if self.budget_exhausted
            || target.depth > self.config.max_depth
            || self.loaded.contains(&target.path)
            || self.queued.contains(&target.path)
            || self.in_flight.contains(&target.path)
        {
            return false;
        }
        self.queued.insert(target.path.clone());
        if self.is_deferred_path(&target.path) {
            self.deferred.push_back(target);
        } else {
            self.primary_complete = false;
            self.primary.push_back(target);
        }
        true
    }

    fn ingest_node(&mut self, node: &TreeNode) {
        let mut discovered = Vec::new();
        for dir in node.loaded_directories() {
            self.loaded.insert(dir.path.clone());
            let files = dir.children().iter().filter(|c| !c.is_dir()).count() as u64;
            let previous = self.file_counts.insert(dir.path.clone(), files).unwrap_or(0);
            self.indexed_file_count = self.indexed_file_count.saturating_sub(previous) + files;
            if self.queued.remove(&dir.path) {
                self.primary.retain(|t| t.path != dir.path);
                self.deferred.retain(|t| t.path != dir.path);
            }
            discovered.extend(
                dir.children()
                    .iter()
                    .filter(|child| child.is_dir() && !child.is_loaded())
                    .map(PrefetchTarget::from_node),
            );
        }
        for target in discovered {
            self.push_target(target);
        }
    }

    fn next_job(&mut self) -> Option<(PrefetchTarget, Phase)> {
        if let Some(target) = self.primary.pop_front() {
            self.queued.remove(&target.path);
            self.in_flight.insert(target.path.clone());
            self.primary_in_flight += 1;
            return Some((target, Phase::Primary));
        }
        if self.primary_in_flight > 0 {
            return None;
        }
        if !self.primary_complete {
            self.primary_complete = true;
            log::debug!(
                "Prefetch: primary phase complete ({} processed, {} deferred)",
                self.processed_count,
                self.deferred.len()
            );
        }
        let target = self.deferred.pop_front()?;
        self.queued.remove(&target.path);
        self.in_flight.insert(target.path.clone());
        Some((target, Phase::Deferred))
    }

    fn finish_job(
        &mut self,
        target: &PrefetchTarget,
        phase: Phase,
        result: Result<LoadedDirectory, ProviderError>,
        elapsed_ms: u64,
    ) {
        self.in_flight.remove(&target.path);
        if phase == Phase::Primary {
            self.primary_in_flight = self.primary_in_flight.saturating_sub(1);
        }
        self.processed_count += 1;
        self.last_duration_ms = elapsed_ms;
        self.total_duration_ms += elapsed_ms;

        match result {
            Ok(LoadedDirectory { node, emit }) => {
                self.ingest_node(&node);
                if emit {
                    let event = match phase {
                        Phase::Primary => PrefetchEvent::DirectoryLoaded {
                            path: target.path.clone(),
                            node,
                        },
                        Phase::Deferred => PrefetchEvent::DeferredMetadata {
                            path: target.path.clone(),
                            summary: node.shallow(),
                        },
                    };
                    let _ = self.events.send(event);
                }
            }
            Err(e) => {
                log::debug!("Prefetch: loading '{}' failed: {e}", target.path);
                let _ = self.events.send(PrefetchEvent::Error {
                    path: target.path.clone(),
                    message: e.to_string(),
                });
            }
        }

        if !self.budget_exhausted && self.processed_count >= self.config.max_directories {
            self.budget_exhausted = true;
            self.primary.clear();
            self.deferred.clear();
            self.queued.clear();
            log::info!(
                "Prefetch: budget of {} directories reached, stopping",
                self.config.max_directories
            );
        }

        let _ = self.events.send(PrefetchEvent::Status(self.status()));
    }

    fn status(&self) -> PrefetchStatus {
        PrefetchStatus {
            running: self.active_workers > 0,
            pending: self.primary.len(),
            deferred: self.deferred.len(),
            indexed_file_count: self.indexed_file_count,
            processed_count: self.processed_count,
            last_duration_ms: self.last_duration_ms,
            average_duration_ms: self.total_duration_ms.checked_div(self.processed_count).unwrap_or(0),
            primary_complete: self.primary_complete,
            budget_exhausted: self.budget_exhausted,
        }
    }
}

// ── Loaders ──────────────────────────────────────────────────────────

/// A loader that lists one directory through `provider` on the blocking pool.
pub fn provider_loader(provider: Arc<dyn DirectoryProvider>) -> DirectoryLoader {
    Arc::new(move |target: PrefetchTarget| {
        let provider = Arc::clone(&provider);
        async move {
            let path = target.path;
            let list_path = path.clone();
            let children = tokio::task::spawn_blocking(move || provider.list_children(&list_path))
                .await
                .map_err(|e| ProviderError::Io(format!("Listing task failed: {e}")))??;
            Ok(TreeNode::loaded_dir(&path, children))
        }
        .boxed()
    })
}
