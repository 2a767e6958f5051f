//! In-memory handle file system, for embedding and tests.
//!
//! Handles are normalized directory paths. Every write bumps a logical clock, so two writes
//! never share a modification time even when they land in the same millisecond.

use std::collections::BTreeMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

use super::{EntryInfo, HandleFileSystem, ProviderError, now_millis};
use crate::ignore_poison::IgnorePoisonRw;
use crate::tree::{is_same_or_descendant, join_path, name_of, normalize_path, parent_of};

#[derive(Debug, Clone)]
enum MemNode {
    Dir { modified_at: i64 },
    File { bytes: Vec<u8>, modified_at: i64 },
}

pub struct MemoryFileSystem {
    nodes: RwLock<BTreeMap<String, MemNode>>,
    clock: AtomicI64,
    opens: AtomicUsize,
}

impl Default for MemoryFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFileSystem {
    pub fn new() -> Self {
        let clock = now_millis();
        let mut nodes = BTreeMap::new();
        nodes.insert(String::new(), MemNode::Dir { modified_at: clock });
        Self {
            nodes: RwLock::new(nodes),
            clock: AtomicI64::new(clock),
            opens: AtomicUsize::new(0),
        }
    }

    fn tick(&self) -> i64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Creates `path` and any missing parents.
    pub fn create_dir_all(&self, path: &str) {
        let path = normalize_path(path);
        let now = self.tick();
        let mut nodes = self.nodes.write_ignore_poison();
        let mut current = path.as_str();
        loop {
            nodes
                .entry(current.to_string())
                .or_insert(MemNode::Dir { modified_at: now });
            if current.is_empty() {
                break;
            }
            current = current.rsplit_once('/').map(|(parent, _)| parent).unwrap_or("");
        }
    }

    /// Writes a file directly, creating parents. Simulates an edit made outside the app.
    pub fn put_file(&self, path: &str, bytes: impl Into<Vec<u8>>) -> i64 {
        let path = normalize_path(path);
        self.create_dir_all(&parent_of(&path));
        let now = self.tick();
        let mut nodes = self.nodes.write_ignore_poison();
        nodes.insert(
            path.clone(),
            MemNode::File {
                bytes: bytes.into(),
                modified_at: now,
            },
        );
        touch_parent(&mut nodes, &path, now);
        now
    }

    /// Removes `path` and everything under it. Returns false if nothing was there.
    pub fn remove(&self, path: &str) -> bool {
        let path = normalize_path(path);
        if path.is_empty() {
            return false;
        }
        let now = self.tick();
        let mut nodes = self.nodes.write_ignore_poison();
        let before = nodes.len();
        nodes.retain(|key, _| !is_same_or_descendant(key, &path));
        let removed = nodes.len() != before;
        if removed {
            touch_parent(&mut nodes, &path, now);
        }
        removed
    }

    /// How many times a directory handle was opened from its parent.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::Relaxed)
    }

    fn info_for(path: &str, node: &MemNode) -> EntryInfo {
        match node {
            MemNode::Dir { modified_at } => EntryInfo {
                name: name_of(path).to_string(),
                is_directory: true,
                size: 0,
                modified_at: *modified_at,
            },
            MemNode::File { bytes, modified_at } => EntryInfo {
                name: name_of(path).to_string(),
                is_directory: false,
                size: bytes.len() as u64,
                modified_at: *modified_at,
            },
        }
    }

    fn require_dir(nodes: &BTreeMap<String, MemNode>, dir: &str) -> Result<(), ProviderError> {
        match nodes.get(dir) {
            Some(MemNode::Dir { .. }) => Ok(()),
            Some(MemNode::File { .. }) => Err(ProviderError::NotADirectory(dir.to_string())),
            None => Err(ProviderError::NotFound(dir.to_string())),
        }
    }
}

fn touch_parent(nodes: &mut BTreeMap<String, MemNode>, path: &str, now: i64) {
    if let Some(MemNode::Dir { modified_at }) = nodes.get_mut(&parent_of(path)) {
        *modified_at = now;
    }
}

impl HandleFileSystem for MemoryFileSystem {
    type Handle = String;

    fn root_handle(&self) -> String {
        String::new()
    }

    fn open_directory(&self, parent: &String, name: &str) -> Result<String, ProviderError> {
        self.opens.fetch_add(1, Ordering::Relaxed);
        let path = join_path(parent, name);
        let nodes = self.nodes.read_ignore_poison();
        Self::require_dir(&nodes, &path)?;
        Ok(path)
    }

    fn list(&self, dir: &String) -> Result<Vec<EntryInfo>, ProviderError> {
        let nodes = self.nodes.read_ignore_poison();
        Self::require_dir(&nodes, dir)?;
        Ok(nodes
            .iter()
            .filter(|(path, _)| !path.is_empty() && parent_of(path) == *dir)
            .map(|(path, node)| Self::info_for(path, node))
            .collect())
    }

    fn stat(&self, dir: &String, name: &str) -> Result<EntryInfo, ProviderError> {
        let path = join_path(dir, name);
        let nodes = self.nodes.read_ignore_poison();
        nodes
            .get(&path)
            .map(|node| Self::info_for(&path, node))
            .ok_or(ProviderError::NotFound(path))
    }

    fn stat_directory(&self, dir: &String) -> Result<EntryInfo, ProviderError> {
        let nodes = self.nodes.read_ignore_poison();
        Self::require_dir(&nodes, dir)?;
        nodes
            .get(dir)
            .map(|node| Self::info_for(dir, node))
            .ok_or_else(|| ProviderError::NotFound(dir.clone()))
    }

    fn read(&self, dir: &String, name: &str) -> Result<Vec<u8>, ProviderError> {
        let path = join_path(dir, name);
        let nodes = self.nodes.read_ignore_poison();
        match nodes.get(&path) {
            Some(MemNode::File { bytes, .. }) => Ok(bytes.clone()),
            Some(MemNode::Dir { .. }) => Err(ProviderError::Io(format!("Is a directory: {path}"))),
            None => Err(ProviderError::NotFound(path)),
        }
    }

    fn write(&self, dir: &String, name: &str, bytes: &[u8]) -> Result<i64, ProviderError> {
        let path = join_path(dir, name);
        let now = self.tick();
        let mut nodes = self.nodes.write_ignore_poison();
        Self::require_dir(&nodes, dir)?;
        if let Some(MemNode::Dir { .. }) = nodes.get(&path) {
            return Err(ProviderError::Io(format!("Is a directory: {path}")));
        }
        nodes.insert(
            path.clone(),
            MemNode::File {
                bytes: bytes.to_vec(),
                modified_at: now,
            },
        );
        touch_parent(&mut nodes, &path, now);
        Ok(now)
    }
}
