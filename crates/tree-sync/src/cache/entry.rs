//! On-disk format of tree cache entries: the key scheme and the versioned envelope.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tree::TreeNode;

/// Bump when the persisted shape of [`CacheEntry`] or [`TreeNode`] changes. Entries written
/// by any other version read as misses.
pub const CACHE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryKind {
    Dir,
    File,
}

impl EntryKind {
    pub(crate) fn for_node(node: &TreeNode) -> Self {
        if node.is_dir() { Self::Dir } else { Self::File }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Dir => "dir",
            Self::File => "file",
        }
    }
}

/// A parsed store key of the form `v{version}:tree:{dir|file}:{path}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct EntryKey<'a> {
    pub version: u32,
    pub kind: EntryKind,
    pub path: &'a str,
}

pub(crate) fn entry_key(kind: EntryKind, path: &str) -> String {
    format!("v{CACHE_SCHEMA_VERSION}:tree:{}:{path}", kind.as_str())
}

/// Parses a store key. Keys that don't belong to the tree cache return `None`.
pub(crate) fn parse_key(key: &str) -> Option<EntryKey<'_>> {
    let rest = key.strip_prefix('v')?;
    let (version, rest) = rest.split_once(':')?;
    let version = version.parse().ok()?;
    let rest = rest.strip_prefix("tree:")?;
    let (kind, path) = rest.split_once(':')?;
    let kind = match kind {
        "dir" => EntryKind::Dir,
        "file" => EntryKind::File,
        _ => return None,
    };
    Some(EntryKey { version, kind, path })
}

/// What's persisted for one path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub path: String,
    pub node: TreeNode,
    /// Unix timestamp in milliseconds.
    pub cached_at: i64,
    /// Modification time of the directory as seen when the entry was written, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_mtime: Option<i64>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope<T> {
    schema_version: u32,
    payload: T,
}

#[derive(Debug, Error)]
pub(crate) enum DecodeError {
    /// Well-formed envelope written by another schema version.
    #[error("schema version {0}, expected {CACHE_SCHEMA_VERSION}")]
    VersionMismatch(u32),
    /// Not JSON at all.
    #[error("not JSON: {0}")]
    NotJson(#[source] serde_json::Error),
    /// JSON, but not a valid entry.
    #[error("malformed entry: {0}")]
    Malformed(String),
}

impl DecodeError {
    /// Corrupted values that are still JSON can be rewritten in place; anything else is
    /// dropped.
    pub(crate) fn is_repairable(&self) -> bool {
        !matches!(self, Self::NotJson(_))
    }
}

pub(crate) fn encode_entry(entry: &CacheEntry) -> Result<String, serde_json::Error> {
    serde_json::to_string(&Envelope {
        schema_version: CACHE_SCHEMA_VERSION,
        payload: entry,
    })
}

/// Decodes a raw stored value. `expected_path` is the path from the key; an entry claiming a
/// different path is malformed.
pub(crate) fn decode_entry(raw: &str, expected_path: &str) -> Result<CacheEntry, DecodeError> {
    let value: serde_json::Value = serde_json::from_str(raw).map_err(DecodeError::NotJson)?;
    let envelope: Envelope<serde_json::Value> =
        serde_json::from_value(value).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    if envelope.schema_version != CACHE_SCHEMA_VERSION {
        return Err(DecodeError::VersionMismatch(envelope.schema_version));
    }
    let mut entry: CacheEntry =
        serde_json::from_value(envelope.payload).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    if entry.path != expected_path || entry.node.path != expected_path {
        return Err(DecodeError::Malformed(format!(
            "entry for '{}' stored under '{expected_path}'",
            entry.path
        )));
    }
    entry.node = entry.node.normalized();
    Ok(entry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_round_trip() {
        let key = entry_key(EntryKind::Dir, "/src/lib");
        assert_eq!(key, "v1:tree:dir:/src/lib");
        let parsed = parse_key(&key).unwrap();
        assert_eq!(parsed.version, CACHE_SCHEMA_VERSION);
        assert_eq!(parsed.kind, EntryKind::Dir);
        assert_eq!(parsed.path, "/src/lib");

        // Root path is empty
        assert_eq!(parse_key("v1:tree:dir:").unwrap().path, "");
        assert_eq!(parse_key("v7:tree:file:/a:b").unwrap().path, "/a:b");
    }

    #[test]
    fn foreign_keys_are_ignored() {
        assert!(parse_key("settings").is_none());
        assert!(parse_key("vx:tree:dir:/a").is_none());
        assert!(parse_key("v1:blob:dir:/a").is_none());
        assert!(parse_key("v1:tree:link:/a").is_none());
    }

    #[test]
    fn decode_rejects_other_versions_and_garbage() {
        let raw = r#"{"schemaVersion":99,"payload":{}}"#;
        assert!(matches!(decode_entry(raw, "/a"), Err(DecodeError::VersionMismatch(99))));

        assert_eq!(
            decode_entry(raw, "/a").unwrap_err().to_string(),
            "schema version 99, expected 1"
        );

        let err = decode_entry("not json", "/a").unwrap_err();
        assert!(!err.is_repairable());
        assert!(err.to_string().starts_with("not JSON: "));
        assert!(std::error::Error::source(&err).is_some());

        let err = decode_entry(r#"{"schemaVersion":1,"payload":{"path":"/a"}}"#, "/a").unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));
        assert!(err.is_repairable());
    }

    #[test]
    fn decode_rejects_entry_under_wrong_key() {
        let entry = CacheEntry {
            path: "/a".to_string(),
            node: TreeNode::loaded_dir("/a", vec![]),
            cached_at: 1,
            observed_mtime: None,
        };
        let raw = encode_entry(&entry).unwrap();
        assert_eq!(decode_entry(&raw, "/a").unwrap(), entry);
        assert!(matches!(decode_entry(&raw, "/b"), Err(DecodeError::Malformed(_))));
    }
}
