//! Tree model shared by the prefetch queue, the tree cache and callers.
//!
//! Paths are slash-joined and rooted at the empty string: the root directory is `""`, its
//! children are `"/src"`, `"/docs"`, and so on. A path is the sole identity of a node.
//!
//! Nodes are values. Refreshing a subtree builds a new tree via [`TreeNode::replace_subtree`]
//! and leaves the old one untouched, so anyone still holding the old tree can keep reading it.

use serde::{Deserialize, Serialize};

/// A directory or file in the cached tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeNode {
    pub name: String,
    pub path: String,
    pub depth: u32,
    pub parent_path: String,
    #[serde(flatten)]
    pub kind: NodeKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum NodeKind {
    #[serde(rename_all = "camelCase")]
    Dir {
        #[serde(default)]
        children: Vec<TreeNode>,
        is_loaded: bool,
    },
    #[serde(rename_all = "camelCase")]
    File {
        size: u64,
        /// Unix timestamp in milliseconds.
        last_modified: i64,
    },
}

impl TreeNode {
    /// An unloaded directory. Placeholders never carry children.
    pub fn placeholder_dir(path: &str) -> Self {
        Self::with_kind(
            path,
            NodeKind::Dir {
                children: Vec::new(),
                is_loaded: false,
            },
        )
    }

    /// A loaded directory with the given children.
    pub fn loaded_dir(path: &str, children: Vec<TreeNode>) -> Self {
        Self::with_kind(path, NodeKind::Dir { children, is_loaded: true })
    }

    pub fn file(path: &str, size: u64, last_modified: i64) -> Self {
        Self::with_kind(path, NodeKind::File { size, last_modified })
    }

    fn with_kind(path: &str, kind: NodeKind) -> Self {
        let path = normalize_path(path);
        Self {
            name: name_of(&path).to_string(),
            depth: depth_of(&path),
            parent_path: parent_of(&path),
            path,
            kind,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::Dir { .. })
    }

    /// True for loaded directories. Files are never "loaded".
    pub fn is_loaded(&self) -> bool {
        matches!(self.kind, NodeKind::Dir { is_loaded: true, .. })
    }

    pub fn children(&self) -> &[TreeNode] {
        match &self.kind {
            NodeKind::Dir { children, .. } => children,
            NodeKind::File { .. } => &[],
        }
    }

    /// Finds the node at `path` inside this subtree.
    pub fn find(&self, path: &str) -> Option<&TreeNode> {
        let path = normalize_path(path);
        if self.path == path {
            return Some(self);
        }
        if !is_same_or_descendant(&path, &self.path) {
            return None;
        }
        self.children()
            .iter()
            .find(|child| is_same_or_descendant(&path, &child.path))
            .and_then(|child| child.find(&path))
    }

    /// Returns a new tree in which the node at `replacement.path` is swapped for `replacement`.
    ///
    /// Returns `None` if no node with that path exists (or its parent is not loaded).
    pub fn replace_subtree(&self, replacement: TreeNode) -> Option<TreeNode> {
        if self.path == replacement.path {
            return Some(replacement);
        }
        if !is_same_or_descendant(&replacement.path, &self.path) {
            return None;
        }
        let NodeKind::Dir {
            children,
            is_loaded: true,
        } = &self.kind
        else {
            return None;
        };
        let index = children
            .iter()
            .position(|child| is_same_or_descendant(&replacement.path, &child.path))?;
        let replaced = children[index].replace_subtree(replacement)?;

        let mut new_children = children.clone();
        new_children[index] = replaced;
        Some(Self {
            kind: NodeKind::Dir {
                children: new_children,
                is_loaded: true,
            },
            ..self.clone()
        })
    }

    /// Number of files anywhere in this subtree.
    pub fn file_count(&self) -> u64 {
        match &self.kind {
            NodeKind::File { .. } => 1,
            NodeKind::Dir { children, .. } => children.iter().map(TreeNode::file_count).sum(),
        }
    }

    /// All loaded directories in this subtree, this node included, parents before children.
    pub fn loaded_directories(&self) -> Vec<&TreeNode> {
        let mut out = Vec::new();
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            if node.is_loaded() {
                out.push(node);
                stack.extend(node.children().iter().rev());
            }
        }
        out
    }

    /// One-level view: this directory with its direct children, sub-directories reduced to
    /// placeholders. Files and placeholders are returned unchanged.
    pub fn shallow(&self) -> TreeNode {
        match &self.kind {
            NodeKind::Dir {
                children,
                is_loaded: true,
            } => {
                let children = children
                    .iter()
                    .map(|child| {
                        if child.is_dir() {
                            TreeNode::placeholder_dir(&child.path)
                        } else {
                            child.clone()
                        }
                    })
                    .collect();
                Self {
                    kind: NodeKind::Dir {
                        children,
                        is_loaded: true,
                    },
                    ..self.clone()
                }
            }
            _ => self.clone(),
        }
    }

    /// Enforces the placeholder invariant on data that came from outside (e.g. a cache).
    pub fn normalized(mut self) -> TreeNode {
        self.path = normalize_path(&self.path);
        if let NodeKind::Dir { children, is_loaded } = &mut self.kind {
            if *is_loaded {
                let owned = std::mem::take(children);
                *children = owned.into_iter().map(TreeNode::normalized).collect();
            } else {
                children.clear();
            }
        }
        self
    }
}

/// A directory waiting to be loaded by the prefetch queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrefetchTarget {
    pub path: String,
    pub name: String,
    pub depth: u32,
    pub parent_path: String,
}

impl PrefetchTarget {
    pub fn for_path(path: &str) -> Self {
        let path = normalize_path(path);
        Self {
            name: name_of(&path).to_string(),
            depth: depth_of(&path),
            parent_path: parent_of(&path),
            path,
        }
    }

    pub fn from_node(node: &TreeNode) -> Self {
        Self {
            path: node.path.clone(),
            name: node.name.clone(),
            depth: node.depth,
            parent_path: node.parent_path.clone(),
        }
    }
}

// ── Path helpers ─────────────────────────────────────────────────────

/// Canonical form: leading slash, no trailing slash, no empty segments, root is `""`.
pub fn normalize_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 1);
    for segment in path.split('/').filter(|s| !s.is_empty() && *s != ".") {
        out.push('/');
        out.push_str(segment);
    }
    out
}

pub fn join_path(parent: &str, name: &str) -> String {
    format!("{}/{}", normalize_path(parent), name.trim_matches('/'))
}

/// Parent of a normalized path. The root's parent is the root.
pub fn parent_of(path: &str) -> String {
    path.rsplit_once('/').map(|(parent, _)| parent.to_string()).unwrap_or_default()
}

pub fn name_of(path: &str) -> &str {
    path.rsplit_once('/').map(|(_, name)| name).unwrap_or(path)
}

pub fn depth_of(path: &str) -> u32 {
    segments(path).count() as u32
}

pub fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// True if `path` equals `prefix` or lies underneath it. Every path is under the root `""`.
pub fn is_same_or_descendant(path: &str, prefix: &str) -> bool {
    prefix.is_empty()
        || path == prefix
        || (path.starts_with(prefix) && path.as_bytes().get(prefix.len()) == Some(&b'/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> TreeNode {
        TreeNode::loaded_dir(
            "",
            vec![
                TreeNode::loaded_dir(
                    "/src",
                    vec![
                        TreeNode::file("/src/main.rs", 120, 1_700_000_000_000),
                        TreeNode::placeholder_dir("/src/bin"),
                    ],
                ),
                TreeNode::placeholder_dir("/docs"),
                TreeNode::file("/README.md", 10, 1_700_000_000_000),
            ],
        )
    }

    #[test]
    fn normalize_path_handles_slashes_and_root() {
        assert_eq!(normalize_path(""), "");
        assert_eq!(normalize_path("/"), "");
        assert_eq!(normalize_path("src"), "/src");
        assert_eq!(normalize_path("/src/"), "/src");
        assert_eq!(normalize_path("//src//lib/./x"), "/src/lib/x");
    }

    #[test]
    fn path_parts() {
        assert_eq!(parent_of("/src/lib"), "/src");
        assert_eq!(parent_of("/src"), "");
        assert_eq!(name_of("/src/lib"), "lib");
        assert_eq!(depth_of(""), 0);
        assert_eq!(depth_of("/src/lib"), 2);
        assert_eq!(join_path("", "src"), "/src");
        assert_eq!(join_path("/src", "lib"), "/src/lib");
    }

    #[test]
    fn descendant_check_respects_segment_boundaries() {
        assert!(is_same_or_descendant("/src", "/src"));
        assert!(is_same_or_descendant("/src/lib", "/src"));
        assert!(!is_same_or_descendant("/srcs", "/src"));
        assert!(is_same_or_descendant("/anything", ""));
    }

    #[test]
    fn constructors_fill_in_identity_fields() {
        let node = TreeNode::placeholder_dir("src/bin/");
        assert_eq!(node.path, "/src/bin");
        assert_eq!(node.name, "bin");
        assert_eq!(node.parent_path, "/src");
        assert_eq!(node.depth, 2);
        assert!(!node.is_loaded());
        assert!(node.children().is_empty());
    }

    #[test]
    fn find_walks_down_by_path() {
        let tree = sample_tree();
        assert_eq!(tree.find("/src/main.rs").map(|n| n.name.as_str()), Some("main.rs"));
        assert!(tree.find("/src/bin").is_some());
        assert!(tree.find("/nope").is_none());
        assert_eq!(tree.find("").map(|n| n.path.as_str()), Some(""));
    }

    #[test]
    fn replace_subtree_leaves_original_untouched() {
        let tree = sample_tree();
        let loaded_bin = TreeNode::loaded_dir("/src/bin", vec![TreeNode::file("/src/bin/tool.rs", 5, 1)]);

        let updated = tree.replace_subtree(loaded_bin.clone()).unwrap();

        assert_eq!(updated.find("/src/bin"), Some(&loaded_bin));
        assert!(!tree.find("/src/bin").unwrap().is_loaded());
        assert_eq!(updated.find("/docs"), tree.find("/docs"));
    }

    #[test]
    fn replace_subtree_under_placeholder_fails() {
        let tree = sample_tree();
        let deep = TreeNode::loaded_dir("/docs/guide", vec![]);
        assert!(tree.replace_subtree(deep).is_none());
    }

    #[test]
    fn counts_and_loaded_directories() {
        let tree = sample_tree();
        assert_eq!(tree.file_count(), 2);
        let loaded: Vec<&str> = tree.loaded_directories().iter().map(|n| n.path.as_str()).collect();
        assert_eq!(loaded, vec!["", "/src"]);
    }

    #[test]
    fn shallow_reduces_subdirectories_to_placeholders() {
        let tree = sample_tree();
        let shallow = tree.shallow();
        let src = shallow.find("/src").unwrap();
        assert!(!src.is_loaded());
        assert!(src.children().is_empty());
        assert!(shallow.find("/README.md").is_some());
    }

    #[test]
    fn normalized_drops_children_of_placeholders() {
        let mut node = TreeNode::placeholder_dir("/x");
        node.kind = NodeKind::Dir {
            children: vec![TreeNode::file("/x/a", 1, 1)],
            is_loaded: false,
        };
        let node = node.normalized();
        assert!(node.children().is_empty());
    }

    #[test]
    fn serializes_with_type_tag() {
        let json = serde_json::to_value(TreeNode::file("/a.txt", 3, 42)).unwrap();
        assert_eq!(json["type"], "file");
        assert_eq!(json["parentPath"], "");
        assert_eq!(json["lastModified"], 42);

        let json = serde_json::to_value(TreeNode::placeholder_dir("/d")).unwrap();
        assert_eq!(json["type"], "dir");
        assert_eq!(json["isLoaded"], false);
    }
}
