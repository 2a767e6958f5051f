//! SQLite-backed key-value store.
//!
//! One DB file per cache. Uses WAL mode; a single connection behind a mutex serializes
//! writes, and each statement (or batch transaction) is atomic for readers.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, params};

use super::{KeyValueStore, StoreError};
use crate::ignore_poison::IgnorePoison;

const STORE_FORMAT_VERSION: &str = "1";

const CREATE_TABLES_SQL: &str = "
    CREATE TABLE IF NOT EXISTS items (
        key   TEXT PRIMARY KEY,
        value TEXT NOT NULL
    ) WITHOUT ROWID;

    CREATE TABLE IF NOT EXISTS meta (
        key   TEXT PRIMARY KEY,
        value TEXT NOT NULL
    ) WITHOUT ROWID;
";

fn apply_pragmas(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(())
}

fn stamp_version(conn: &Connection) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
        params!["format_version", STORE_FORMAT_VERSION],
    )?;
    Ok(())
}

pub struct SqliteStore {
    db_path: PathBuf,
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the store at `db_path`.
    ///
    /// On a format mismatch or an unreadable file the DB is deleted and recreated; the tree
    /// cache is rebuildable, so losing it is preferable to failing startup.
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        match Self::try_open(db_path) {
            Ok(store) => Ok(store),
            Err(e) => {
                log::warn!("Tree cache DB open failed ({e}), deleting and recreating");
                Self::delete_and_recreate(db_path)
            }
        }
    }

    /// In-memory database, mostly for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(CREATE_TABLES_SQL)?;
        stamp_version(&conn)?;
        Ok(Self {
            db_path: PathBuf::from(":memory:"),
            conn: Mutex::new(conn),
        })
    }

    fn try_open(db_path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(db_path)?;
        apply_pragmas(&conn)?;
        conn.execute_batch(CREATE_TABLES_SQL)?;

        let version: Option<String> = conn
            .query_row("SELECT value FROM meta WHERE key = 'format_version'", [], |row| row.get(0))
            .optional()?;
        match version {
            Some(v) if v == STORE_FORMAT_VERSION => {}
            Some(v) => {
                log::warn!("Tree cache format mismatch (expected {STORE_FORMAT_VERSION}, found {v}), clearing");
                conn.execute("DELETE FROM items", [])?;
                stamp_version(&conn)?;
            }
            None => stamp_version(&conn)?,
        }

        Ok(Self {
            db_path: db_path.to_path_buf(),
            conn: Mutex::new(conn),
        })
    }

    fn delete_and_recreate(db_path: &Path) -> Result<Self, StoreError> {
        if db_path.exists() {
            std::fs::remove_file(db_path)?;
        }
        // WAL and SHM sidecars can be stale even if the base DB is already gone
        for sidecar in ["db-wal", "db-shm"] {
            let path = db_path.with_extension(sidecar);
            if path.exists() {
                let _ = std::fs::remove_file(&path);
            }
        }

        let conn = Connection::open(db_path)?;
        apply_pragmas(&conn)?;
        conn.execute_batch(CREATE_TABLES_SQL)?;
        stamp_version(&conn)?;
        Ok(Self {
            db_path: db_path.to_path_buf(),
            conn: Mutex::new(conn),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }
}

impl KeyValueStore for SqliteStore {
    fn get_item(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.conn.lock_ignore_poison();
        let mut stmt = conn.prepare_cached("SELECT value FROM items WHERE key = ?1")?;
        Ok(stmt.query_row(params![key], |row| row.get(0)).optional()?)
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock_ignore_poison();
        let mut stmt = conn.prepare_cached("INSERT OR REPLACE INTO items (key, value) VALUES (?1, ?2)")?;
        stmt.execute(params![key, value])?;
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock_ignore_poison();
        let mut stmt = conn.prepare_cached("DELETE FROM items WHERE key = ?1")?;
        stmt.execute(params![key])?;
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock_ignore_poison();
        let mut stmt = conn.prepare_cached("SELECT key FROM items ORDER BY key")?;
        let keys = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    fn set_items(&self, items: &[(String, String)]) -> Result<(), StoreError> {
        let mut conn = self.conn.lock_ignore_poison();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached("INSERT OR REPLACE INTO items (key, value) VALUES (?1, ?2)")?;
            for (key, value) in items {
                stmt.execute(params![key, value])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn remove_items(&self, keys: &[String]) -> Result<(), StoreError> {
        let mut conn = self.conn.lock_ignore_poison();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached("DELETE FROM items WHERE key = ?1")?;
            for key in keys {
                stmt.execute(params![key])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_survive_reopen() {
        let dir = tempfile::tempdir().expect("temp dir");
        let db_path = dir.path().join("tree-cache.db");

        {
            let store = SqliteStore::open(&db_path).expect("open store");
            store.set_item("v1:tree:dir:/src", "{}").unwrap();
            store
                .set_items(&[
                    ("a".to_string(), "1".to_string()),
                    ("b".to_string(), "2".to_string()),
                ])
                .unwrap();
        }

        let store = SqliteStore::open(&db_path).expect("reopen store");
        assert_eq!(store.get_item("v1:tree:dir:/src").unwrap().as_deref(), Some("{}"));
        assert_eq!(store.keys().unwrap(), vec!["a", "b", "v1:tree:dir:/src"]);
    }

    #[test]
    fn remove_and_overwrite() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.set_item("k", "old").unwrap();
        store.set_item("k", "new").unwrap();
        assert_eq!(store.get_item("k").unwrap().as_deref(), Some("new"));

        store.remove_item("k").unwrap();
        assert_eq!(store.get_item("k").unwrap(), None);

        store.set_item("x", "1").unwrap();
        store.set_item("y", "2").unwrap();
        store.remove_items(&["x".to_string()]).unwrap();
        assert_eq!(store.keys().unwrap(), vec!["y"]);
    }

    #[test]
    fn garbage_file_is_recreated() {
        let dir = tempfile::tempdir().expect("temp dir");
        let db_path = dir.path().join("broken.db");
        std::fs::write(&db_path, b"this is not a sqlite database, not even close").unwrap();

        let store = SqliteStore::open(&db_path).expect("recreated store");
        assert!(store.keys().unwrap().is_empty());
        store.set_item("k", "v").unwrap();
        assert_eq!(store.get_item("k").unwrap().as_deref(), Some("v"));
    }

    #[test]
    fn format_mismatch_clears_items() {
        let dir = tempfile::tempdir().expect("temp dir");
        let db_path = dir.path().join("old.db");
        {
            let store = SqliteStore::open(&db_path).unwrap();
            store.set_item("k", "v").unwrap();
            let conn = store.conn.lock_ignore_poison();
            conn.execute("UPDATE meta SET value = '0' WHERE key = 'format_version'", [])
                .unwrap();
        }

        let store = SqliteStore::open(&db_path).unwrap();
        assert_eq!(store.get_item("k").unwrap(), None);
    }
}
