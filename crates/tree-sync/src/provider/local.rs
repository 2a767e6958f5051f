//! Local file system backend.
//!
//! Handles are absolute paths; opening a directory is a `metadata` call, which is exactly
//! the kind of per-segment round trip the handle cache saves on slower backends.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use super::{EntryInfo, HandleFileSystem, ProviderError};

/// A handle file system rooted at a local directory.
pub struct LocalFileSystem {
    root: PathBuf,
}

impl LocalFileSystem {
    /// # Arguments
    /// * `root` - Absolute path of the directory that maps to the tree root `""`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn modified_millis(metadata: &fs::Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn entry_info(name: String, metadata: &fs::Metadata) -> EntryInfo {
    EntryInfo {
        name,
        is_directory: metadata.is_dir(),
        size: if metadata.is_dir() { 0 } else { metadata.len() },
        modified_at: modified_millis(metadata),
    }
}

impl HandleFileSystem for LocalFileSystem {
    type Handle = PathBuf;

    fn root_handle(&self) -> PathBuf {
        self.root.clone()
    }

    fn open_directory(&self, parent: &PathBuf, name: &str) -> Result<PathBuf, ProviderError> {
        let path = parent.join(name);
        let metadata = fs::metadata(&path)?;
        if !metadata.is_dir() {
            return Err(ProviderError::NotADirectory(path.display().to_string()));
        }
        Ok(path)
    }

    fn list(&self, dir: &PathBuf) -> Result<Vec<EntryInfo>, ProviderError> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            // Entries can vanish between readdir and stat; skip them
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            entries.push(entry_info(entry.file_name().to_string_lossy().to_string(), &metadata));
        }
        Ok(entries)
    }

    fn stat(&self, dir: &PathBuf, name: &str) -> Result<EntryInfo, ProviderError> {
        let metadata = fs::metadata(dir.join(name))?;
        Ok(entry_info(name.to_string(), &metadata))
    }

    fn stat_directory(&self, dir: &PathBuf) -> Result<EntryInfo, ProviderError> {
        let metadata = fs::metadata(dir)?;
        let name = dir.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
        Ok(entry_info(name, &metadata))
    }

    fn read(&self, dir: &PathBuf, name: &str) -> Result<Vec<u8>, ProviderError> {
        Ok(fs::read(dir.join(name))?)
    }

    fn write(&self, dir: &PathBuf, name: &str, bytes: &[u8]) -> Result<i64, ProviderError> {
        let path = dir.join(name);
        fs::write(&path, bytes)?;
        let metadata = fs::metadata(&path)?;
        Ok(modified_millis(&metadata))
    }

    fn local_root(&self) -> Option<PathBuf> {
        Some(self.root.clone())
    }
}
