//! Tests for TreeCacheController over MemoryStore and SqliteStore.

use super::*;
use crate::store::{MemoryStore, SqliteStore};

fn controller() -> (TreeCacheController, Arc<MemoryStore>) {
    crate::init_test_logging();
    let store = Arc::new(MemoryStore::new());
    let controller = TreeCacheController::new(store.clone(), &CacheConfig::default());
    (controller, store)
}

fn project_tree() -> TreeNode {
    TreeNode::loaded_dir(
        "",
        vec![
            TreeNode::loaded_dir(
                "/src",
                vec![
                    TreeNode::loaded_dir("/src/bin", vec![TreeNode::file("/src/bin/cli.rs", 40, 10)]),
                    TreeNode::file("/src/lib.rs", 200, 11),
                ],
            ),
            TreeNode::placeholder_dir("/docs"),
            TreeNode::file("/Cargo.toml", 30, 12),
        ],
    )
}

#[test]
fn test_directory_round_trip() {
    let (cache, _) = controller();
    let src = TreeNode::loaded_dir("/src", vec![TreeNode::file("/src/lib.rs", 200, 11)]);

    cache.set_cached_directory("/src", &src).unwrap();

    assert_eq!(cache.get_cached_directory("/src").unwrap(), Some(src.clone()));
    assert_eq!(cache.get_cached_directory("src/").unwrap(), Some(src));
    assert_eq!(cache.get_cached_directory("/docs").unwrap(), None);
}

#[test]
fn test_set_cached_tree_writes_one_entry_per_loaded_directory() {
    let (cache, store) = controller();
    cache.set_cached_tree(&project_tree()).unwrap();

    let keys = store.keys().unwrap();
    assert_eq!(keys, vec!["v1:tree:dir:", "v1:tree:dir:/src", "v1:tree:dir:/src/bin"]);

    // Descendants are stored shallow
    let src = cache.get_cached_directory("/src").unwrap().unwrap();
    assert!(!src.find("/src/bin").unwrap().is_loaded());

    // The root keeps its full subtree
    let root = cache.get_cached_directory("").unwrap().unwrap();
    assert!(root.find("/src/bin/cli.rs").is_some());
}

#[test]
fn test_get_cached_tree_hydrates_placeholders() {
    let (cache, _) = controller();
    cache.set_cached_tree(&project_tree()).unwrap();
    let docs = TreeNode::loaded_dir("/docs", vec![TreeNode::file("/docs/guide.md", 5, 13)]);
    cache.set_cached_directory("/docs", &docs).unwrap();

    let tree = cache.get_cached_tree("").unwrap().unwrap();
    assert_eq!(tree.find("/docs"), Some(&docs));
    assert!(tree.find("/src/bin/cli.rs").is_some());

    let src = cache.get_cached_tree("/src").unwrap().unwrap();
    assert!(src.find("/src/bin").unwrap().is_loaded());
    assert_eq!(src.file_count(), 2);
}

#[test]
fn test_get_cached_tree_without_child_entries() {
    let (cache, _) = controller();
    let a = TreeNode::loaded_dir(
        "/a",
        vec![
            TreeNode::loaded_dir("/a/b", vec![TreeNode::file("/a/b/x.txt", 1, 1)]),
            TreeNode::placeholder_dir("/a/c"),
        ],
    );
    cache.set_cached_directory("/a", &a).unwrap();

    let tree = cache.get_cached_tree("/a").unwrap().unwrap();
    assert!(tree.find("/a/b/x.txt").is_some());
    let c = tree.find("/a/c").unwrap();
    assert!(c.is_dir());
    assert!(!c.is_loaded());
}

#[test]
fn test_placeholder_entry_is_a_miss() {
    let (cache, _) = controller();
    cache
        .set_cached_directory("/docs", &TreeNode::placeholder_dir("/docs"))
        .unwrap();
    assert_eq!(cache.get_cached_directory("/docs").unwrap(), None);
}

#[test]
fn test_other_schema_version_is_a_miss() {
    let (cache, store) = controller();
    let payload = r#"{"schemaVersion":99,"payload":{"path":"/src","node":{"name":"src","path":"/src","depth":1,"parentPath":"","type":"dir","children":[],"isLoaded":true},"cachedAt":1}}"#;
    store.set_item("v1:tree:dir:/src", payload).unwrap();
    store.set_item("v0:tree:dir:/src", "{}").unwrap();

    assert_eq!(cache.get_cached_directory("/src").unwrap(), None);
    assert_eq!(cache.get_cached_tree("/src").unwrap(), None);
}

#[test]
fn test_malformed_entry_is_a_miss() {
    let (cache, store) = controller();
    store.set_item("v1:tree:dir:/src", "{{{").unwrap();
    assert_eq!(cache.get_cached_directory("/src").unwrap(), None);
}

#[test]
fn test_integrity_check_repairs_and_removes() {
    let (cache, store) = controller();
    cache
        .set_cached_directory("/ok", &TreeNode::loaded_dir("/ok", vec![]))
        .unwrap();
    store
        .set_item("v1:tree:dir:/half", r#"{"schemaVersion":1,"payload":{"path":"/half"}}"#)
        .unwrap();
    store.set_item("v1:tree:dir:/junk", "\u{0}garbage").unwrap();
    store.set_item("unrelated", "whatever").unwrap();

    let report = cache.validate_cache_integrity().unwrap();
    assert_eq!(
        report,
        IntegrityReport {
            total: 3,
            valid: 1,
            corrupted: 2,
            repaired: 1,
            removed: 1,
        }
    );

    assert!(store.get_item("v1:tree:dir:/junk").unwrap().is_none());
    assert!(store.get_item("v1:tree:dir:/half").unwrap().is_some());
    assert_eq!(cache.get_cached_directory("/half").unwrap(), None);
    assert_eq!(store.get_item("unrelated").unwrap().as_deref(), Some("whatever"));

    let again = cache.validate_cache_integrity().unwrap();
    assert_eq!(again.valid, 2);
    assert_eq!(again.corrupted, 0);
}

#[test]
fn test_directories_needing_update() {
    let (cache, _) = controller();
    let src = TreeNode::loaded_dir("/src", vec![]);
    let docs = TreeNode::loaded_dir("/docs", vec![]);
    cache.perform_incremental_update("/src", &src, 1_000).unwrap();
    cache.perform_incremental_update("/docs", &docs, 2_000).unwrap();
    cache
        .set_cached_directory("/old", &TreeNode::loaded_dir("/old", vec![]))
        .unwrap();

    let live = HashMap::from([
        ("/src".to_string(), 1_000),
        ("/docs".to_string(), 2_500),
        ("/new".to_string(), 1),
        // Written just now without a recorded mtime; a live mtime from the past isn't newer
        ("/old".to_string(), 1),
    ]);

    assert_eq!(cache.get_directories_needing_update(&live).unwrap(), vec!["/docs", "/new"]);
}

#[test]
fn test_entry_without_mtime_is_stale_when_live_is_newer() {
    let (cache, _) = controller();
    cache
        .set_cached_directory("/old", &TreeNode::loaded_dir("/old", vec![]))
        .unwrap();
    let live = HashMap::from([("/old".to_string(), i64::MAX)]);
    assert_eq!(cache.get_directories_needing_update(&live).unwrap(), vec!["/old"]);
}

#[test]
fn test_incremental_update_uses_file_key_for_files() {
    let (cache, store) = controller();
    cache
        .perform_incremental_update("/a.txt", &TreeNode::file("/a.txt", 3, 77), 77)
        .unwrap();
    assert!(store.get_item("v1:tree:file:/a.txt").unwrap().is_some());
    assert_eq!(cache.stats().unwrap().files, 1);
}

#[test]
fn test_cleanup_removes_missing_and_expired() {
    let (cache, store) = controller();
    cache.set_cached_tree(&project_tree()).unwrap();

    let live = HashMap::from([("".to_string(), 1), ("/src".to_string(), 1)]);
    let report = cache.validate_and_cleanup_stale_entries(&live).unwrap();
    assert_eq!(report.checked, 3);
    assert_eq!(report.removed_missing, 1);
    assert_eq!(report.removed_expired, 0);
    assert!(store.get_item("v1:tree:dir:/src/bin").unwrap().is_none());

    let eight_days_later = now_millis() + 8 * 24 * 60 * 60 * 1000;
    let report = cache.cleanup_at(&live, eight_days_later).unwrap();
    assert_eq!(report.removed_expired, 2);
    assert_eq!(report.removed(), 2);
    assert!(store.is_empty());
}

#[test]
fn test_invalidate_removes_subtree_only() {
    let (cache, store) = controller();
    cache.set_cached_tree(&project_tree()).unwrap();
    cache
        .set_cached_directory("/srcs", &TreeNode::loaded_dir("/srcs", vec![]))
        .unwrap();

    assert_eq!(cache.invalidate("/src").unwrap(), 2);
    assert_eq!(store.keys().unwrap(), vec!["v1:tree:dir:", "v1:tree:dir:/srcs"]);
}

#[test]
fn test_purge_other_versions_and_stats() {
    let (cache, store) = controller();
    cache.set_cached_tree(&project_tree()).unwrap();
    store.set_item("v0:tree:dir:/src", "{}").unwrap();
    store.set_item("v0:tree:file:/a", "{}").unwrap();

    let stats = cache.stats().unwrap();
    assert_eq!(
        stats,
        CacheStats {
            directories: 3,
            files: 0,
            other_versions: 2,
        }
    );

    assert_eq!(cache.purge_other_versions().unwrap(), 2);
    assert_eq!(cache.stats().unwrap().other_versions, 0);
}

#[test]
fn test_batch_set_on_sqlite_store() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let cache = TreeCacheController::new(store, &CacheConfig::default());

    let batch = BTreeMap::from([
        ("/a".to_string(), TreeNode::loaded_dir("/a", vec![TreeNode::file("/a/x", 1, 1)])),
        ("/b".to_string(), TreeNode::loaded_dir("/b", vec![])),
    ]);
    cache.batch_set_directories(&batch).unwrap();

    assert_eq!(cache.get_cached_directory("/a").unwrap().unwrap().file_count(), 1);
    assert!(cache.get_cached_directory("/b").unwrap().is_some());
    assert_eq!(cache.stats().unwrap().directories, 2);
}
