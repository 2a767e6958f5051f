//! Directory-handle providers.
//!
//! [`DirectoryProvider`] is the path-based interface the rest of the crate consumes: list a
//! directory, read and write files, stat a path. Storage backends that hand out opaque
//! directory handles implement the lower-level [`HandleFileSystem`] instead, and get wrapped
//! in [`HandleDirectoryProvider`], which turns paths into handles through a [`HandleCache`].
//!
//! All paths are relative to the provider's root, slash-joined, with the root being `""`.

mod handle_cache;
mod in_memory;
mod local;

use std::path::PathBuf;
use std::sync::Arc;

pub use handle_cache::HandleCache;
pub use in_memory::MemoryFileSystem;
pub use local::LocalFileSystem;

use crate::config::CacheConfig;
use crate::tree::{TreeNode, join_path, name_of, normalize_path, parent_of, segments};

/// Error type for provider operations. `NotFound` is kept distinct so callers can tell a
/// deleted path from a failing backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("Path not found: {0}")]
    NotFound(String),
    #[error("Not a directory: {0}")]
    NotADirectory(String),
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Operation not supported")]
    NotSupported,
    #[error("I/O error: {0}")]
    Io(String),
}

impl ProviderError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<std::io::Error> for ProviderError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(err.to_string()),
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied(err.to_string()),
            std::io::ErrorKind::NotADirectory => Self::NotADirectory(err.to_string()),
            _ => Self::Io(err.to_string()),
        }
    }
}

/// Path-based file access used by the prefetch and sync layers.
///
/// Calls may be slow; async callers run them on the blocking pool.
pub trait DirectoryProvider: Send + Sync {
    /// Lists the direct children of the directory at `path`.
    ///
    /// Files come back as file nodes, sub-directories as unloaded placeholders.
    /// Directories first, then files, both by name.
    fn list_children(&self, path: &str) -> Result<Vec<TreeNode>, ProviderError>;

    fn read_file(&self, path: &str) -> Result<Vec<u8>, ProviderError>;

    /// Writes the file and returns its new modification time (Unix millis).
    fn write_file(&self, path: &str, bytes: &[u8]) -> Result<i64, ProviderError>;

    /// Modification time of the file or directory at `path` (Unix millis).
    fn last_modified(&self, path: &str) -> Result<i64, ProviderError>;

    fn exists(&self, path: &str) -> bool;

    /// The local directory backing this provider, if any. Native change observers need it.
    fn local_root(&self) -> Option<PathBuf> {
        None
    }
}

/// Metadata for one directory entry as reported by a handle-based backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    pub name: String,
    pub is_directory: bool,
    pub size: u64,
    /// Unix timestamp in milliseconds.
    pub modified_at: i64,
}

/// A storage backend that addresses directories through opaque handles.
///
/// Only the root handle is known up front; every other directory handle has to be opened
/// from its parent, which is what makes path resolution expensive.
pub trait HandleFileSystem: Send + Sync {
    type Handle: Clone + Send + Sync;

    fn root_handle(&self) -> Self::Handle;

    /// Opens the sub-directory `name` of `parent`.
    fn open_directory(&self, parent: &Self::Handle, name: &str) -> Result<Self::Handle, ProviderError>;

    fn list(&self, dir: &Self::Handle) -> Result<Vec<EntryInfo>, ProviderError>;

    fn stat(&self, dir: &Self::Handle, name: &str) -> Result<EntryInfo, ProviderError>;

    /// Stat of the directory behind `dir` itself.
    fn stat_directory(&self, dir: &Self::Handle) -> Result<EntryInfo, ProviderError>;

    fn read(&self, dir: &Self::Handle, name: &str) -> Result<Vec<u8>, ProviderError>;

    /// Writes `bytes` to `name` in `dir` and returns the new modification time.
    fn write(&self, dir: &Self::Handle, name: &str, bytes: &[u8]) -> Result<i64, ProviderError>;

    fn local_root(&self) -> Option<PathBuf> {
        None
    }
}

/// [`DirectoryProvider`] over a [`HandleFileSystem`], resolving paths through a shared
/// [`HandleCache`].
pub struct HandleDirectoryProvider<F: HandleFileSystem> {
    fs: F,
    handles: Arc<HandleCache<F::Handle>>,
}

impl<F: HandleFileSystem> HandleDirectoryProvider<F> {
    pub fn new(fs: F, handles: Arc<HandleCache<F::Handle>>) -> Self {
        Self { fs, handles }
    }

    /// A provider with its own handle cache sized from `config`.
    pub fn from_config(fs: F, config: &CacheConfig) -> Self {
        Self::new(fs, Arc::new(HandleCache::new(config.handle_cache_capacity)))
    }

    pub fn file_system(&self) -> &F {
        &self.fs
    }

    pub fn handles(&self) -> &Arc<HandleCache<F::Handle>> {
        &self.handles
    }

    /// Drops cached handles for `path` and its descendants (after a delete or replace).
    pub fn forget(&self, path: &str) {
        self.handles.invalidate_prefix(&normalize_path(path));
    }

    /// Resolves `path` to a directory handle, starting from the deepest cached ancestor.
    ///
    /// Returns the handle and whether it came straight from the cache.
    fn resolve_directory(&self, path: &str) -> Result<(F::Handle, bool), ProviderError> {
        let path = normalize_path(path);
        if path.is_empty() {
            return Ok((self.fs.root_handle(), false));
        }
        if let Some(handle) = self.handles.get(&path) {
            return Ok((handle, true));
        }

        let parts: Vec<&str> = segments(&path).collect();
        let mut prefixes = Vec::with_capacity(parts.len());
        let mut current = String::new();
        for part in &parts {
            current = join_path(&current, part);
            prefixes.push(current.clone());
        }

        // Deepest cached ancestor, or the root
        let (mut handle, start) = prefixes[..parts.len() - 1]
            .iter()
            .enumerate()
            .rev()
            .find_map(|(i, prefix)| self.handles.get(prefix).map(|h| (h, i + 1)))
            .unwrap_or_else(|| (self.fs.root_handle(), 0));

        for (part, prefix) in parts[start..].iter().zip(&prefixes[start..]) {
            handle = match self.fs.open_directory(&handle, part) {
                Ok(h) => h,
                Err(e) => {
                    if e.is_not_found() {
                        self.handles.invalidate_prefix(prefix);
                    }
                    return Err(e);
                }
            };
            self.handles.set(prefix, handle.clone());
        }
        Ok((handle, false))
    }

    /// Runs `op` against the directory handle for `dir_path`. A cached handle that turns out
    /// to be stale (`NotFound`) is dropped and the path is resolved again once.
    fn with_directory<T>(
        &self,
        dir_path: &str,
        op: impl Fn(&F::Handle) -> Result<T, ProviderError>,
    ) -> Result<T, ProviderError> {
        let (handle, cached) = self.resolve_directory(dir_path)?;
        match op(&handle) {
            Err(e) if e.is_not_found() && cached => {
                log::debug!("Stale directory handle for '{dir_path}', resolving again");
                self.handles.invalidate_prefix(&normalize_path(dir_path));
                let (handle, _) = self.resolve_directory(dir_path)?;
                op(&handle)
            }
            other => other,
        }
    }
}

impl<F: HandleFileSystem> DirectoryProvider for HandleDirectoryProvider<F> {
    fn list_children(&self, path: &str) -> Result<Vec<TreeNode>, ProviderError> {
        let path = normalize_path(path);
        let mut entries = self.with_directory(&path, |dir| self.fs.list(dir))?;
        entries.sort_by(|a, b| b.is_directory.cmp(&a.is_directory).then_with(|| a.name.cmp(&b.name)));

        Ok(entries
            .into_iter()
            .map(|entry| {
                let child_path = join_path(&path, &entry.name);
                if entry.is_directory {
                    TreeNode::placeholder_dir(&child_path)
                } else {
                    TreeNode::file(&child_path, entry.size, entry.modified_at)
                }
            })
            .collect())
    }

    fn read_file(&self, path: &str) -> Result<Vec<u8>, ProviderError> {
        let path = normalize_path(path);
        let name = name_of(&path);
        self.with_directory(&parent_of(&path), |dir| self.fs.read(dir, name))
    }

    fn write_file(&self, path: &str, bytes: &[u8]) -> Result<i64, ProviderError> {
        let path = normalize_path(path);
        let name = name_of(&path);
        self.with_directory(&parent_of(&path), |dir| self.fs.write(dir, name, bytes))
    }

    fn last_modified(&self, path: &str) -> Result<i64, ProviderError> {
        let path = normalize_path(path);
        if path.is_empty() {
            return Ok(self.fs.stat_directory(&self.fs.root_handle())?.modified_at);
        }
        let name = name_of(&path);
        let info = self.with_directory(&parent_of(&path), |dir| self.fs.stat(dir, name))?;
        Ok(info.modified_at)
    }

    fn exists(&self, path: &str) -> bool {
        self.last_modified(path).is_ok()
    }

    fn local_root(&self) -> Option<PathBuf> {
        self.fs.local_root()
    }
}

/// Current time as Unix milliseconds.
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
