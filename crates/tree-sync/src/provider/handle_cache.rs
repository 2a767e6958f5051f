//! Bounded LRU of path -> directory handle.
//!
//! Resolving a directory handle on a handle-based API means walking from the root one
//! segment at a time. The cache keeps recently resolved handles so that walk usually starts
//! at the requested directory or a close ancestor.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;

use crate::ignore_poison::IgnorePoison;
use crate::tree::is_same_or_descendant;

pub struct HandleCache<H> {
    entries: Mutex<LruCache<String, H>>,
}

impl<H: Clone> HandleCache<H> {
    /// Creates a cache holding at most `capacity` handles (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Returns the handle for `key` and marks it most recently used.
    pub fn get(&self, key: &str) -> Option<H> {
        self.entries.lock_ignore_poison().get(key).cloned()
    }

    /// Inserts or replaces `key`. Evicts the least recently used entry when full.
    pub fn set(&self, key: &str, handle: H) {
        let mut entries = self.entries.lock_ignore_poison();
        if let Some((evicted, _)) = entries.push(key.to_string(), handle)
            && evicted != key
        {
            log::trace!("Handle cache evicted {evicted}");
        }
    }

    /// Removes `prefix` and everything underneath it. The empty prefix clears the cache.
    pub fn invalidate_prefix(&self, prefix: &str) {
        let mut entries = self.entries.lock_ignore_poison();
        let doomed: Vec<String> = entries
            .iter()
            .filter(|(key, _)| is_same_or_descendant(key, prefix))
            .map(|(key, _)| key.clone())
            .collect();
        for key in doomed {
            entries.pop(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock_ignore_poison().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.entries.lock_ignore_poison().cap().get()
    }
}
