//! Configuration for the prefetch queue, the tree cache and the sync manager.
//!
//! Read from a JSON file with camelCase keys. Every field has a default, so a partial file
//! (or no file at all) is fine.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TreeSyncConfig {
    pub prefetch: PrefetchConfig,
    pub cache: CacheConfig,
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PrefetchConfig {
    /// Maximum number of directory loads in flight at once.
    pub concurrency: usize,
    /// Targets deeper than this are dropped.
    pub max_depth: u32,
    /// Session budget: loads processed before the queue stops scheduling.
    pub max_directories: u64,
    /// Path segments that send a directory (and everything under it) to the deferred queue.
    pub load_later: Vec<String>,
    pub yield_every: u64,
    pub yield_delay_ms: u64,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_depth: 12,
            max_directories: 5000,
            load_later: ["node_modules", ".git", "target", "dist", "build", ".cache", "vendor"]
                .into_iter()
                .map(String::from)
                .collect(),
            yield_every: 25,
            yield_delay_ms: 5,
        }
    }
}

impl PrefetchConfig {
    pub fn yield_delay(&self) -> Duration {
        Duration::from_millis(self.yield_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheConfig {
    pub max_entry_age_secs: u64,
    pub handle_cache_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entry_age_secs: 7 * 24 * 60 * 60,
            handle_cache_capacity: 512,
        }
    }
}

impl CacheConfig {
    pub fn max_entry_age(&self) -> Duration {
        Duration::from_secs(self.max_entry_age_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    pub debounce_ms: u64,
    pub token_expiry_ms: u64,
    pub poll_interval_ms: u64,
    /// Only trust a write token when the observed mtime equals the one the write reported.
    /// Needs a backend whose writes report exact modification times.
    pub require_exact_mtime: bool,
    /// Buffer size of the sync event broadcast channel.
    pub event_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 100,
            token_expiry_ms: 5000,
            poll_interval_ms: 1000,
            require_exact_mtime: false,
            event_capacity: 256,
        }
    }
}

impl SyncConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn token_expiry(&self) -> Duration {
        Duration::from_millis(self.token_expiry_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// Loads the config from a JSON file.
/// Returns defaults if the file doesn't exist or can't be parsed.
pub fn load_config(path: &Path) -> TreeSyncConfig {
    let Ok(contents) = fs::read_to_string(path) else {
        return TreeSyncConfig::default();
    };

    match serde_json::from_str(&contents) {
        Ok(config) => config,
        Err(e) => {
            log::warn!("Couldn't parse config at {}: {e}, using defaults", path.display());
            TreeSyncConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let config = load_config(Path::new("/definitely/not/here/tree-sync.json"));
        assert_eq!(config, TreeSyncConfig::default());
        assert_eq!(config.prefetch.concurrency, 4);
        assert_eq!(config.sync.debounce(), Duration::from_millis(100));
        assert!(config.prefetch.load_later.iter().any(|s| s == "node_modules"));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "sync": { "debounceMs": 20, "requireExactMtime": true } }"#).unwrap();

        let config = load_config(&path);
        assert_eq!(config.sync.debounce_ms, 20);
        assert!(config.sync.require_exact_mtime);
        assert_eq!(config.sync.token_expiry_ms, 5000);
        assert_eq!(config.prefetch, PrefetchConfig::default());
    }

    #[test]
    fn garbage_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();
        assert_eq!(load_config(&path), TreeSyncConfig::default());
    }
}
