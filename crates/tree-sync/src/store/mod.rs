//! Persistent key-value stores backing the tree cache.
//!
//! The tree cache only ever talks to a [`KeyValueStore`]; it owns the key scheme and the
//! value format. Implementations must serialize conflicting writes to the same key (last
//! write wins) and never expose a partially written value to a reader.

mod sqlite;

use std::collections::BTreeMap;
use std::sync::RwLock;

pub use sqlite::SqliteStore;

use crate::ignore_poison::IgnorePoisonRw;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

pub trait KeyValueStore: Send + Sync {
    fn get_item(&self, key: &str) -> Result<Option<String>, StoreError>;

    fn set_item(&self, key: &str, value: &str) -> Result<(), StoreError>;

    fn remove_item(&self, key: &str) -> Result<(), StoreError>;

    fn keys(&self) -> Result<Vec<String>, StoreError>;

    /// Writes many items as one logical operation.
    fn set_items(&self, items: &[(String, String)]) -> Result<(), StoreError> {
        for (key, value) in items {
            self.set_item(key, value)?;
        }
        Ok(())
    }

    /// Removes many items as one logical operation.
    fn remove_items(&self, keys: &[String]) -> Result<(), StoreError> {
        for key in keys {
            self.remove_item(key)?;
        }
        Ok(())
    }
}

/// Process-local store. Nothing survives a restart; useful for tests and for running
/// without a durable cache.
#[derive(Default)]
pub struct MemoryStore {
    items: RwLock<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.read_ignore_poison().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyValueStore for MemoryStore {
    fn get_item(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.items.read_ignore_poison().get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.items.write_ignore_poison().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), StoreError> {
        self.items.write_ignore_poison().remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.items.read_ignore_poison().keys().cloned().collect())
    }

    fn set_items(&self, items: &[(String, String)]) -> Result<(), StoreError> {
        let mut guard = self.items.write_ignore_poison();
        for (key, value) in items {
            guard.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    fn remove_items(&self, keys: &[String]) -> Result<(), StoreError> {
        let mut guard = self.items.write_ignore_poison();
        for key in keys {
            guard.remove(key);
        }
        Ok(())
    }
}
