//! Locally cached, incrementally refreshed directory trees over slow, handle-based file
//! access, kept consistent with edits made outside the app.
//!
//! - [`prefetch`]: a bounded-concurrency background walker that loads directories ahead of
//!   the user, with a cache-first variant on top of [`cache`].
//! - [`cache`]: persistent, versioned per-directory tree cache over a [`store::KeyValueStore`].
//! - [`sync`]: per-file edit state, write tokens, and external change detection.
//! - [`provider`]: the file access abstraction everything above reads through, including the
//!   handle cache that makes path resolution cheap.
//!
//! Nothing here is global. Build the pieces once and share them with `Arc`.

// Warn on unused dependencies to catch platform-specific cfg mismatches
#![warn(unused_crate_dependencies)]
// Warn on redundant path prefixes (e.g., std::path::Path when Path is imported)
#![warn(unused_qualifications)]
// Use log::* macros instead of println!/eprintln! for proper log level control
#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod cache;
pub mod config;
mod ignore_poison;
pub mod prefetch;
pub mod provider;
pub mod store;
pub mod sync;
pub mod tree;

pub use cache::{CACHE_SCHEMA_VERSION, TreeCacheController};
pub use config::{TreeSyncConfig, load_config};
pub use prefetch::{CachedPrefetchQueue, PrefetchEvent, PrefetchQueue, provider_loader};
pub use provider::{DirectoryProvider, HandleCache, ProviderError};
pub use store::{KeyValueStore, MemoryStore, SqliteStore};
pub use sync::{FileSyncManager, SyncEvent};
pub use tree::{PrefetchTarget, TreeNode};

/// Turns on `RUST_LOG`-controlled logging in tests. Safe to call from every test.
#[cfg(test)]
pub(crate) fn init_test_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .is_test(true)
        .try_init();
}
