//! SQLite storage backend

use crate::{RecordMeta, Storage, StorageError, StorageStats};
use async_trait::async_trait;
use parking_lot::Mutex;
use replica_core::StorageKey;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

/// SQLite storage backend
///
/// Embedded persistence for `db://` keys and single-node daemons.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    /// Create a new SQLite storage with the given path
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let storage = Self {
            conn: Mutex::new(conn),
        };

        storage.init_schema()?;
        Ok(storage)
    }

    /// Create an in-memory SQLite database (for testing)
    pub fn in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let storage = Self {
            conn: Mutex::new(conn),
        };

        storage.init_schema()?;
        Ok(storage)
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                key TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                meta BLOB NOT NULL,
                data BLOB NOT NULL,
                created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now') * 1000),
                updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now') * 1000)
            );

            CREATE INDEX IF NOT EXISTS idx_records_updated_at ON records(updated_at);
            "#,
        )
        .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(())
    }
}

/// Translates a glob into a LIKE pattern, escaping LIKE's own wildcards.
fn like_pattern(glob: &str) -> String {
    let escape = |s: &str| s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_");
    if glob == "*" {
        "%".to_string()
    } else if let Some(prefix) = glob.strip_suffix('*') {
        format!("{}%", escape(prefix))
    } else if let Some(suffix) = glob.strip_prefix('*') {
        format!("%{}", escape(suffix))
    } else {
        escape(glob)
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn store(
        &self,
        key: &StorageKey,
        meta: &RecordMeta,
        data: &[u8],
    ) -> Result<(), StorageError> {
        let meta_bytes = serde_json::to_vec(meta)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        let conn = self.conn.lock();

        conn.execute(
            r#"
            INSERT INTO records (key, kind, meta, data, updated_at)
            VALUES (?1, ?2, ?3, ?4, strftime('%s', 'now') * 1000)
            ON CONFLICT(key) DO UPDATE SET
                kind = excluded.kind,
                meta = excluded.meta,
                data = excluded.data,
                updated_at = excluded.updated_at
            "#,
            params![key.to_string(), meta.kind.to_string(), meta_bytes, data],
        )
        .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(())
    }

    async fn load(
        &self,
        key: &StorageKey,
    ) -> Result<Option<(RecordMeta, Vec<u8>)>, StorageError> {
        let conn = self.conn.lock();

        let result: Option<(Vec<u8>, Vec<u8>)> = conn
            .query_row(
                "SELECT meta, data FROM records WHERE key = ?1",
                params![key.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(|e| StorageError::Database(e.to_string()))?;

        match result {
            Some((meta_bytes, data)) => {
                let meta: RecordMeta = serde_json::from_slice(&meta_bytes)
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;
                Ok(Some((meta, data)))
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &StorageKey) -> Result<bool, StorageError> {
        let conn = self.conn.lock();

        let affected = conn
            .execute("DELETE FROM records WHERE key = ?1", params![key.to_string()])
            .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(affected > 0)
    }

    async fn list(&self, pattern: Option<&str>) -> Result<Vec<StorageKey>, StorageError> {
        let conn = self.conn.lock();

        let like = like_pattern(pattern.unwrap_or("*"));
        let mut stmt = conn
            .prepare("SELECT key FROM records WHERE key LIKE ?1 ESCAPE '\\' ORDER BY updated_at DESC")
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let keys: Vec<StorageKey> = stmt
            .query_map(params![like], |row| row.get::<_, String>(0))
            .map_err(|e| StorageError::Database(e.to_string()))?
            .filter_map(|r| r.ok())
            .filter_map(|text| StorageKey::parse(&text).ok())
            .collect();

        Ok(keys)
    }

    async fn exists(&self, key: &StorageKey) -> Result<bool, StorageError> {
        let conn = self.conn.lock();

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM records WHERE key = ?1",
                params![key.to_string()],
                |row| row.get(0),
            )
            .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(count > 0)
    }

    async fn stats(&self) -> Result<StorageStats, StorageError> {
        let conn = self.conn.lock();

        let record_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let total_size: i64 = conn
            .query_row(
                "SELECT COALESCE(SUM(LENGTH(meta) + LENGTH(data)), 0) FROM records",
                [],
                |row| row.get(0),
            )
            .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(StorageStats {
            record_count: record_count as usize,
            total_size_bytes: total_size as usize,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use replica_core::{CrdtKind, VersionMap};

    fn meta(kind: CrdtKind) -> RecordMeta {
        RecordMeta::new(kind, VersionMap::from_entries([("a", 2)]))
    }

    #[tokio::test]
    async fn test_sqlite_crud() {
        let storage = SqliteStorage::in_memory().unwrap();
        let key = StorageKey::database("main", "people");

        storage.store(&key, &meta(CrdtKind::Set), b"hello sqlite").await.unwrap();

        let (loaded_meta, loaded_data) = storage.load(&key).await.unwrap().unwrap();
        assert_eq!(loaded_meta, meta(CrdtKind::Set));
        assert_eq!(loaded_data, b"hello sqlite");

        assert!(storage.exists(&key).await.unwrap());
        assert!(storage.delete(&key).await.unwrap());
        assert!(!storage.exists(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_sqlite_list_pattern_escapes_wildcards() {
        let storage = SqliteStorage::in_memory().unwrap();

        for i in 0..5 {
            let key = StorageKey::database("main", format!("user_{}", i));
            storage.store(&key, &meta(CrdtKind::Entity), b"data").await.unwrap();
        }
        for i in 0..3 {
            let key = StorageKey::database("main", format!("userx{}", i));
            storage.store(&key, &meta(CrdtKind::Entity), b"data").await.unwrap();
        }

        // `_` must not match the `x`.
        let users = storage.list(Some("db://main/user_*")).await.unwrap();
        assert_eq!(users.len(), 5);
        assert_eq!(storage.list(None).await.unwrap().len(), 8);
    }

    #[tokio::test]
    async fn test_sqlite_upsert_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replica.db");
        let key = StorageKey::database("main", "upsert");

        {
            let storage = SqliteStorage::new(&path).unwrap();
            storage.store(&key, &meta(CrdtKind::Count), b"version1").await.unwrap();
            storage.store(&key, &meta(CrdtKind::Count), b"version2").await.unwrap();
            assert_eq!(storage.stats().await.unwrap().record_count, 1);
        }

        let storage = SqliteStorage::new(&path).unwrap();
        let (_, data) = storage.load(&key).await.unwrap().unwrap();
        assert_eq!(data, b"version2");
    }
}
