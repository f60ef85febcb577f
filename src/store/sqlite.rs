//! SQLite-backed store.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::{debug, info};

use super::Store;
use crate::Result;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS records (
    key   TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL
)
"#;

/// Store persisting records in a single SQLite table.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the database at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening store at {:?}", path);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Open an in-memory database.
    ///
    /// The pool is pinned to one connection that never expires, since every
    /// SQLite memory connection is its own database.
    pub async fn open_in_memory() -> Result<Self> {
        debug!("Opening in-memory store");
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    /// Close the pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM records WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn set_all(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for (key, value) in entries {
            sqlx::query(
                "INSERT INTO records (key, value) VALUES (?, ?) \
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            )
            .bind(key)
            .bind(value)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete_all(&self, keys: &[String]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for key in keys {
            sqlx::query("DELETE FROM records WHERE key = ?")
                .bind(key)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<BTreeMap<String, String>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT key, value FROM records WHERE substr(key, 1, ?) = ? ORDER BY key",
        )
        .bind(prefix.chars().count() as i64)
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_upsert_and_get() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        store.set_all(&entries(&[("k", "v1")])).await.unwrap();
        store.set_all(&entries(&[("k", "v2")])).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v2".to_string()));
        assert_eq!(store.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_scan_prefix_and_delete() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        store
            .set_all(&entries(&[
                ("rss:a", "true"),
                ("rss:a:1", "true"),
                ("rss:ab", "true"),
                ("user:1", "{}"),
            ]))
            .await
            .unwrap();

        let edges = store.scan_prefix("rss:a:").await.unwrap();
        assert_eq!(edges.keys().collect::<Vec<_>>(), vec!["rss:a:1"]);
        assert_eq!(store.scan_prefix("rss:").await.unwrap().len(), 3);

        store
            .delete_all(&["rss:a".to_string(), "rss:a:1".to_string()])
            .await
            .unwrap();
        assert_eq!(
            store
                .scan_prefix("rss:")
                .await
                .unwrap()
                .keys()
                .collect::<Vec<_>>(),
            vec!["rss:ab"]
        );
    }

    #[tokio::test]
    async fn test_open_file_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("relay.db");

        let store = SqliteStore::open(&path).await.unwrap();
        store.set_all(&entries(&[("last:x", "42")])).await.unwrap();
        store.close().await;

        let reopened = SqliteStore::open(&path).await.unwrap();
        assert_eq!(
            reopened.get("last:x").await.unwrap(),
            Some("42".to_string())
        );
    }
}
