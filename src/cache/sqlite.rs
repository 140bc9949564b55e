use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use super::{CacheBackend, CacheError};
use crate::store::TaskStore;

/// Cache table living in the task database, so entries survive restarts.
pub struct SqliteCache {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCache {
    pub fn new(store: &TaskStore) -> Self {
        Self {
            conn: store.connection(),
        }
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, CacheError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| CacheError::Backend("connection poisoned".into()))?;
            f(&guard).map_err(|e| CacheError::Backend(e.to_string()))
        })
        .await
        .map_err(|e| CacheError::Backend(e.to_string()))?
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[async_trait]
impl CacheBackend for SqliteCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT value FROM cache_entries WHERE key = ?1 AND expires_at > ?2",
                params![key, now_millis()],
                |row| row.get(0),
            )
            .optional()
        })
        .await
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let now = now_millis();
            conn.execute("DELETE FROM cache_entries WHERE expires_at <= ?1", params![now])?;
            conn.execute(
                "INSERT INTO cache_entries (key, value, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
                params![key, value, now + ttl.as_millis() as i64],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM cache_entries WHERE key = ?1", params![key])?;
            Ok(())
        })
        .await
    }

    async fn clear_prefix(&self, prefix: &str) -> Result<u64, CacheError> {
        let prefix = prefix.to_string();
        self.with_conn(move |conn| {
            let removed = conn.execute(
                "DELETE FROM cache_entries WHERE substr(key, 1, length(?1)) = ?1",
                params![prefix],
            )?;
            Ok(removed as u64)
        })
        .await
    }

    async fn ping(&self) -> Result<(), CacheError> {
        self.with_conn(|conn| conn.query_row("SELECT COUNT(*) FROM cache_entries", [], |_| Ok(())))
            .await
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}
