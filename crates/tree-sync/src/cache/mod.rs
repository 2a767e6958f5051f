//! Persistent tree cache.
//!
//! Stores directory subtrees in a [`KeyValueStore`], one entry per path, wrapped in a versioned
//! envelope. Anything that can't be read back (other schema version, malformed JSON, an entry
//! under the wrong key) is a miss, never an error; only store failures surface as
//! [`CacheError`].
//!
//! Layout written by [`TreeCacheController::set_cached_tree`]: the root of the written tree
//! gets its full subtree, every loaded descendant directory gets a shallow entry of its own.
//! That way any directory can be served on its own, and [`TreeCacheController::get_cached_tree`]
//! can stitch deeper levels back together from placeholders.

mod entry;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

pub use entry::{CACHE_SCHEMA_VERSION, CacheEntry};
use entry::{DecodeError, EntryKind, decode_entry, encode_entry, entry_key, parse_key};

use crate::config::CacheConfig;
use crate::provider::now_millis;
use crate::store::{KeyValueStore, StoreError};
use crate::tree::{NodeKind, TreeNode, is_same_or_descendant, normalize_path};

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Cache store error: {0}")]
    Store(#[from] StoreError),
    #[error("Couldn't serialize cache entry: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Result of [`TreeCacheController::validate_and_cleanup_stale_entries`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub checked: usize,
    /// Entries whose path is no longer in the live set.
    pub removed_missing: usize,
    /// Entries older than the maximum entry age.
    pub removed_expired: usize,
}

impl CleanupReport {
    pub fn removed(&self) -> usize {
        self.removed_missing + self.removed_expired
    }
}

/// Result of [`TreeCacheController::validate_cache_integrity`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntegrityReport {
    pub total: usize,
    pub valid: usize,
    pub corrupted: usize,
    pub repaired: usize,
    pub removed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub directories: usize,
    pub files: usize,
    /// Entries written by another schema version, still taking up space.
    pub other_versions: usize,
}

pub struct TreeCacheController {
    store: Arc<dyn KeyValueStore>,
    max_entry_age: Duration,
}

impl TreeCacheController {
    pub fn new(store: Arc<dyn KeyValueStore>, config: &CacheConfig) -> Self {
        Self {
            store,
            max_entry_age: config.max_entry_age(),
        }
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    // ── Reads ────────────────────────────────────────────────────────

    fn read_entry(&self, kind: EntryKind, path: &str) -> Result<Option<CacheEntry>, CacheError> {
        let Some(raw) = self.store.get_item(&entry_key(kind, path))? else {
            return Ok(None);
        };
        match decode_entry(&raw, path) {
            Ok(entry) => Ok(Some(entry)),
            Err(DecodeError::VersionMismatch(v)) => {
                log::debug!("Tree cache: ignoring '{path}' written by schema version {v}");
                Ok(None)
            }
            Err(e) => {
                log::warn!("Tree cache: unreadable entry for '{path}': {e}");
                Ok(None)
            }
        }
    }

    /// The cached directory at `path`, as stored. Placeholders read as a miss.
    pub fn get_cached_directory(&self, path: &str) -> Result<Option<TreeNode>, CacheError> {
        let path = normalize_path(path);
        Ok(self
            .read_entry(EntryKind::Dir, &path)?
            .map(|entry| entry.node)
            .filter(TreeNode::is_loaded))
    }

    /// The cached directory at `path` with every placeholder child that has its own entry
    /// filled in, recursively.
    pub fn get_cached_tree(&self, path: &str) -> Result<Option<TreeNode>, CacheError> {
        match self.get_cached_directory(path)? {
            Some(node) => Ok(Some(self.hydrate(node)?)),
            None => Ok(None),
        }
    }

    fn hydrate(&self, node: TreeNode) -> Result<TreeNode, CacheError> {
        let TreeNode {
            name,
            path,
            depth,
            parent_path,
            kind,
        } = node;
        let kind = match kind {
            NodeKind::Dir {
                children,
                is_loaded: true,
            } => {
                let mut hydrated = Vec::with_capacity(children.len());
                for child in children {
                    // Children must sit strictly below their parent, or a bad entry could loop
                    let below = child.path != path && is_same_or_descendant(&child.path, &path);
                    let child = if below && child.is_dir() {
                        let child_path = child.path.clone();
                        let loaded = if child.is_loaded() {
                            Some(child)
                        } else {
                            self.get_cached_directory(&child_path)?
                        };
                        match loaded {
                            Some(loaded) => self.hydrate(loaded)?,
                            None => TreeNode::placeholder_dir(&child_path),
                        }
                    } else {
                        child
                    };
                    hydrated.push(child);
                }
                NodeKind::Dir {
                    children: hydrated,
                    is_loaded: true,
                }
            }
            other => other,
        };
        Ok(TreeNode {
            name,
            path,
            depth,
            parent_path,
            kind,
        })
    }

    // ── Writes ───────────────────────────────────────────────────────

    fn encode(&self, path: &str, node: TreeNode, observed_mtime: Option<i64>) -> Result<String, CacheError> {
        Ok(encode_entry(&CacheEntry {
            path: path.to_string(),
            node,
            cached_at: now_millis(),
            observed_mtime,
        })?)
    }

    pub fn set_cached_directory(&self, path: &str, node: &TreeNode) -> Result<(), CacheError> {
        let path = normalize_path(path);
        let node = retarget(node, &path);
        let value = self.encode(&path, node, None)?;
        self.store.set_item(&entry_key(EntryKind::Dir, &path), &value)?;
        Ok(())
    }

    /// Persists `node` in full under its own path, plus a shallow entry for every loaded
    /// directory below it. One batch.
    pub fn set_cached_tree(&self, node: &TreeNode) -> Result<(), CacheError> {
        let mut items = Vec::new();
        let root = node.clone().normalized();
        for dir in root.loaded_directories().into_iter().skip(1) {
            items.push((entry_key(EntryKind::Dir, &dir.path), self.encode(&dir.path, dir.shallow(), None)?));
        }
        let kind = EntryKind::for_node(&root);
        let path = root.path.clone();
        items.insert(0, (entry_key(kind, &path), self.encode(&path, root, None)?));
        self.store.set_items(&items)?;
        Ok(())
    }

    /// Writes many directory entries in one store operation.
    pub fn batch_set_directories(&self, directories: &BTreeMap<String, TreeNode>) -> Result<(), CacheError> {
        let mut items = Vec::with_capacity(directories.len());
        for (path, node) in directories {
            let path = normalize_path(path);
            let value = self.encode(&path, retarget(node, &path), None)?;
            items.push((entry_key(EntryKind::Dir, &path), value));
        }
        self.store.set_items(&items)?;
        Ok(())
    }

    /// Persists a freshly observed node and the modification time it was observed at.
    pub fn perform_incremental_update(&self, path: &str, node: &TreeNode, mtime: i64) -> Result<(), CacheError> {
        let path = normalize_path(path);
        let node = retarget(node, &path);
        let key = entry_key(EntryKind::for_node(&node), &path);
        let value = self.encode(&path, node, Some(mtime))?;
        self.store.set_item(&key, &value)?;
        Ok(())
    }

    /// Removes the entries for `path` and everything below it.
    pub fn invalidate(&self, path: &str) -> Result<usize, CacheError> {
        let path = normalize_path(path);
        let doomed: Vec<String> = self
            .store
            .keys()?
            .into_iter()
            .filter(|key| {
                parse_key(key)
                    .is_some_and(|k| k.version == CACHE_SCHEMA_VERSION && is_same_or_descendant(k.path, &path))
            })
            .collect();
        self.store.remove_items(&doomed)?;
        Ok(doomed.len())
    }

    /// Drops every tree entry written by a schema version other than the current one.
    pub fn purge_other_versions(&self) -> Result<usize, CacheError> {
        let doomed: Vec<String> = self
            .store
            .keys()?
            .into_iter()
            .filter(|key| parse_key(key).is_some_and(|k| k.version != CACHE_SCHEMA_VERSION))
            .collect();
        if !doomed.is_empty() {
            log::info!("Tree cache: purging {} entries from other schema versions", doomed.len());
        }
        self.store.remove_items(&doomed)?;
        Ok(doomed.len())
    }

    // ── Validation ───────────────────────────────────────────────────

    /// Paths from `live_mtimes` whose cached copy is missing or out of date. Sorted.
    ///
    /// An entry with a recorded mtime is stale when that mtime differs from the live one;
    /// without one, it's stale when the live mtime is newer than the entry itself.
    pub fn get_directories_needing_update(&self, live_mtimes: &HashMap<String, i64>) -> Result<Vec<String>, CacheError> {
        let mut stale = Vec::new();
        for (path, &live) in live_mtimes {
            let path = normalize_path(path);
            let needs_update = match self.read_entry(EntryKind::Dir, &path)? {
                None => true,
                Some(entry) => match entry.observed_mtime {
                    Some(observed) => observed != live,
                    None => live > entry.cached_at,
                },
            };
            if needs_update {
                stale.push(path);
            }
        }
        stale.sort();
        Ok(stale)
    }

    /// Removes entries whose path no longer exists or that are older than the maximum entry
    /// age. Unreadable entries are left to [`Self::validate_cache_integrity`].
    pub fn validate_and_cleanup_stale_entries(
        &self,
        live_mtimes: &HashMap<String, i64>,
    ) -> Result<CleanupReport, CacheError> {
        self.cleanup_at(live_mtimes, now_millis())
    }

    fn cleanup_at(&self, live_mtimes: &HashMap<String, i64>, now: i64) -> Result<CleanupReport, CacheError> {
        let live: HashMap<String, i64> = live_mtimes.iter().map(|(p, m)| (normalize_path(p), *m)).collect();
        let max_age = i64::try_from(self.max_entry_age.as_millis()).unwrap_or(i64::MAX);
        let mut report = CleanupReport::default();
        let mut doomed = Vec::new();

        for key in self.store.keys()? {
            let Some(parsed) = parse_key(&key) else { continue };
            if parsed.version != CACHE_SCHEMA_VERSION {
                continue;
            }
            report.checked += 1;
            if !live.contains_key(parsed.path) {
                report.removed_missing += 1;
                doomed.push(key.clone());
                continue;
            }
            let Some(raw) = self.store.get_item(&key)? else { continue };
            if let Ok(entry) = decode_entry(&raw, parsed.path)
                && now.saturating_sub(entry.cached_at) > max_age
            {
                report.removed_expired += 1;
                doomed.push(key.clone());
            }
        }

        self.store.remove_items(&doomed)?;
        log::debug!(
            "Tree cache cleanup: checked {}, removed {} missing and {} expired",
            report.checked,
            report.removed_missing,
            report.removed_expired
        );
        Ok(report)
    }

    /// Reads back every current-version entry. Corrupted entries that are still JSON are
    /// rewritten as placeholders (which read as misses); the rest are removed.
    pub fn validate_cache_integrity(&self) -> Result<IntegrityReport, CacheError> {
        let mut report = IntegrityReport::default();
        let mut repairs = Vec::new();
        let mut removals = Vec::new();

        for key in self.store.keys()? {
            let Some(parsed) = parse_key(&key) else { continue };
            if parsed.version != CACHE_SCHEMA_VERSION {
                continue;
            }
            let Some(raw) = self.store.get_item(&key)? else { continue };
            report.total += 1;

            let err = match decode_entry(&raw, parsed.path) {
                Ok(_) => {
                    report.valid += 1;
                    continue;
                }
                Err(e) => e,
            };
            report.corrupted += 1;
            if err.is_repairable() {
                log::warn!("Tree cache: repairing corrupted entry '{key}': {err}");
                let path = normalize_path(parsed.path);
                let value = self.encode(&path, TreeNode::placeholder_dir(&path), None)?;
                repairs.push((key.clone(), value));
                report.repaired += 1;
            } else {
                log::warn!("Tree cache: removing unreadable entry '{key}': {err}");
                removals.push(key.clone());
                report.removed += 1;
            }
        }

        self.store.set_items(&repairs)?;
        self.store.remove_items(&removals)?;
        Ok(report)
    }

    pub fn stats(&self) -> Result<CacheStats, CacheError> {
        let mut stats = CacheStats::default();
        for key in self.store.keys()? {
            match parse_key(&key) {
                Some(k) if k.version != CACHE_SCHEMA_VERSION => stats.other_versions += 1,
                Some(k) if k.kind == EntryKind::Dir => stats.directories += 1,
                Some(_) => stats.files += 1,
                None => {}
            }
        }
        Ok(stats)
    }
}

/// A normalized copy of `node` whose identity fields match `path`.
fn retarget(node: &TreeNode, path: &str) -> TreeNode {
    let node = node.clone().normalized();
    if node.path == path {
        return node;
    }
    log::debug!("Tree cache: storing node '{}' under '{path}'", node.path);
    match node.kind {
        NodeKind::Dir {
            children,
            is_loaded: true,
        } => TreeNode::loaded_dir(path, children),
        NodeKind::Dir { .. } => TreeNode::placeholder_dir(path),
        NodeKind::File { size, last_modified } => TreeNode::file(path, size, last_modified),
    }
}

#[cfg(test)]
mod cache_test;
