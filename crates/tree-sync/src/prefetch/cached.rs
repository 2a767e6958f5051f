//! Cache-first prefetching: answer from the tree cache right away, then validate in the
//! background.

use std::sync::Arc;

use futures_util::FutureExt;
use tokio::sync::mpsc;

use super::{DirectoryLoader, InnerLoader, LoadedDirectory, PrefetchEvent, PrefetchQueue, PrefetchStatus};
use crate::cache::TreeCacheController;
use crate::config::PrefetchConfig;
use crate::provider::ProviderError;
use crate::tree::{PrefetchTarget, TreeNode};

/// A [`PrefetchQueue`] whose loads are checked against and written to a
/// [`TreeCacheController`]. A fresh load that matches the cached copy isn't emitted again.
#[derive(Clone)]
pub struct CachedPrefetchQueue {
    queue: PrefetchQueue,
    cache: Arc<TreeCacheController>,
}

impl CachedPrefetchQueue {
    pub fn new(
        config: PrefetchConfig,
        loader: DirectoryLoader,
        cache: Arc<TreeCacheController>,
        events: mpsc::UnboundedSender<PrefetchEvent>,
    ) -> Self {
        let validating_cache = Arc::clone(&cache);
        let validating_loader: InnerLoader = Arc::new(move |target: PrefetchTarget| {
            let load = loader(target.clone());
            let cache = Arc::clone(&validating_cache);
            async move {
                let node = load.await?;
                tokio::task::spawn_blocking(move || persist_if_changed(&cache, &target.path, node))
                    .await
                    .map_err(|e| ProviderError::Io(format!("Cache validation task failed: {e}")))
            }
            .boxed()
        });
        Self {
            queue: PrefetchQueue::with_loader(config, validating_loader, events),
            cache,
        }
    }

    /// Returns the cached tree at `target.path`, if any, and queues a real load either way.
    ///
    /// The real load is emitted as [`PrefetchEvent::DirectoryLoaded`] (or deferred metadata)
    /// only if it differs from what was cached.
    pub async fn load(&self, target: PrefetchTarget) -> Option<TreeNode> {
        let cache = Arc::clone(&self.cache);
        let path = target.path.clone();
        let cached = match tokio::task::spawn_blocking(move || cache.get_cached_tree(&path)).await {
            Ok(Ok(cached)) => cached,
            Ok(Err(e)) => {
                log::warn!("Tree cache read failed for '{}': {e}", target.path);
                None
            }
            Err(e) => {
                log::warn!("Tree cache read task for '{}' failed: {e}", target.path);
                None
            }
        };
        self.queue.refresh(target).await;
        cached
    }

    pub async fn ingest(&self, node: &TreeNode) {
        self.queue.ingest(node).await;
    }

    pub async fn reset_for_source(&self, source: &str) {
        self.queue.reset_for_source(source).await;
    }

    pub async fn status(&self) -> PrefetchStatus {
        self.queue.status().await
    }

    pub async fn wait_idle(&self) {
        self.queue.wait_idle().await;
    }

    pub fn queue(&self) -> &PrefetchQueue {
        &self.queue
    }

    pub fn cache(&self) -> &Arc<TreeCacheController> {
        &self.cache
    }
}

/// Compares a fresh load with the cached copy (one level deep) and persists it if they
/// differ. A failing store doesn't fail the load.
fn persist_if_changed(cache: &TreeCacheController, path: &str, node: TreeNode) -> LoadedDirectory {
    let cached = match cache.get_cached_directory(path) {
        Ok(cached) => cached,
        Err(e) => {
            log::warn!("Tree cache read failed for '{path}': {e}");
            None
        }
    };
    let unchanged = cached.is_some_and(|cached| cached.shallow() == node.shallow());
    if unchanged {
        log::trace!("Prefetch: '{path}' matches the cache");
        return LoadedDirectory { node, emit: false };
    }
    if let Err(e) = cache.set_cached_tree(&node) {
        log::warn!("Couldn't persist '{path}' to the tree cache: {e}");
    }
    LoadedDirectory { node, emit: true }
}
