//! SQLite-backed key-value store

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use super::KeyValueStore;
use crate::error::{Error, Result};

/// Default maximum connections in the pool
const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// SQL to create the key-value table
pub const CREATE_KV_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS kv_entries (
    key TEXT PRIMARY KEY NOT NULL,
    value BLOB NOT NULL,
    updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
);
"#;

/// Durable store on a single SQLite table
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Create a store from an existing connection pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to (and create if missing) a database file, then initialise
    pub async fn connect(database_path: &Path) -> Result<Self> {
        if let Some(parent) = database_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let url = format!("sqlite:{}?mode=rwc", database_path.display());
        let options = SqliteConnectOptions::from_str(&url)?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(DEFAULT_MAX_CONNECTIONS)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init().await?;
        info!(path = %database_path.display(), "SQLite key-value store ready");
        Ok(store)
    }

    /// In-memory database (single connection, for testing)
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    /// Initialize the schema
    pub async fn init(&self) -> Result<()> {
        sqlx::query(CREATE_KV_TABLE_SQL).execute(&self.pool).await?;
        debug!("Key-value table initialized");
        Ok(())
    }

    /// Get the underlying pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Escape LIKE wildcards so a prefix scan matches literally
fn like_prefix(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for ch in prefix.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(ch);
    }
    pattern.push('%');
    pattern
}

fn unavailable(err: sqlx::Error) -> Error {
    Error::persistence(err.to_string())
}

#[async_trait]
impl KeyValueStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let row = sqlx::query("SELECT value FROM kv_entries WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?;

        Ok(row.map(|r| r.get::<Vec<u8>, _>("value")))
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO kv_entries (key, value, updated_at)
            VALUES (?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM kv_entries WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;

        Ok(result.rows_affected() > 0)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let rows = sqlx::query(
            "SELECT key, value FROM kv_entries WHERE key LIKE ? ESCAPE '\\' ORDER BY key",
        )
        .bind(like_prefix(prefix))
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;

        Ok(rows
            .into_iter()
            .map(|r| (r.get::<String, _>("key"), r.get::<Vec<u8>, _>("value")))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sqlite_store_roundtrip() {
        let store = SqliteStore::in_memory().await.unwrap();

        store.set("ledger/acme/t/a", b"{}".to_vec()).await.unwrap();
        assert_eq!(
            store.get("ledger/acme/t/a").await.unwrap(),
            Some(b"{}".to_vec())
        );

        store.set("ledger/acme/t/a", b"[]".to_vec()).await.unwrap();
        assert_eq!(
            store.get("ledger/acme/t/a").await.unwrap(),
            Some(b"[]".to_vec())
        );

        assert!(store.delete("ledger/acme/t/a").await.unwrap());
        assert_eq!(store.get("ledger/acme/t/a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_sqlite_scan_prefix_is_literal() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.set("cache/a_1", vec![1]).await.unwrap();
        store.set("cache/ab1", vec![2]).await.unwrap();
        store.set("ledger/x", vec![3]).await.unwrap();

        let all_cache = store.scan_prefix("cache/").await.unwrap();
        assert_eq!(all_cache.len(), 2);

        // `_` must not act as a wildcard
        let literal = store.scan_prefix("cache/a_").await.unwrap();
        assert_eq!(literal.len(), 1);
        assert_eq!(literal[0].0, "cache/a_1");
    }

    #[tokio::test]
    async fn test_sqlite_store_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("stagewise.db");

        {
            let store = SqliteStore::connect(&path).await.unwrap();
            store.set("k", vec![7]).await.unwrap();
        }

        let reopened = SqliteStore::connect(&path).await.unwrap();
        assert_eq!(reopened.get("k").await.unwrap(), Some(vec![7]));
    }

    #[test]
    fn test_like_prefix_escaping() {
        assert_eq!(like_prefix("a%b_c"), "a\\%b\\_c%");
    }
}
