//! Key-value backends for the persistence store.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;

use crate::error::PersistError;

/// Async key-value storage of JSON documents.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, PersistError>;
    async fn set(&self, key: &str, value: Value) -> Result<(), PersistError>;
}

/// Process-local store. Survives orchestrator restarts only while the
/// value itself is kept alive (tests share one `Arc<MemoryStore>`).
#[derive(Debug, Default)]
pub struct MemoryStore {
    map: Mutex<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, PersistError> {
        Ok(self.map.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), PersistError> {
        self.map.lock().insert(key.to_string(), value);
        Ok(())
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv (
    key        TEXT PRIMARY KEY,
    value      TEXT NOT NULL,
    updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);
"#;

/// SQLite-backed store, one row per key.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Open or create the state database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PersistError> {
        Self::init(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self, PersistError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, PersistError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

#[async_trait]
impl KeyValueStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, PersistError> {
        let text: Option<String> = self
            .conn
            .lock()
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?;
        match text {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), PersistError> {
        let text = serde_json::to_string(&value)?;
        self.conn.lock().execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value,
                                            updated_at = strftime('%s', 'now')",
            params![key, text],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn sqlite_overwrites_by_key() {
        let store = SqliteStore::in_memory().unwrap();
        assert_eq!(store.get("volumes").await.unwrap(), None);

        store.set("volumes", json!({"a": 1})).await.unwrap();
        store.set("volumes", json!({"b": 2})).await.unwrap();
        assert_eq!(store.get("volumes").await.unwrap(), Some(json!({"b": 2})));
    }

    #[tokio::test]
    async fn sqlite_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.set("volumes", json!({"x": {"source_token": "/a.zip"}})).await.unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(
            store.get("volumes").await.unwrap(),
            Some(json!({"x": {"source_token": "/a.zip"}}))
        );
    }

    #[tokio::test]
    async fn memory_store_get_set() {
        let store = MemoryStore::new();
        store.set("k", json!([1, 2])).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(json!([1, 2])));
        assert_eq!(store.get("missing").await.unwrap(), None);
    }
}
