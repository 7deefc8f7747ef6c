use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::store::{CacheError, CacheStore, CachedResource, Result};

/// Payload cache backed by SQLite
///
/// SQLite was chosen because:
/// - Zero-config embedded database
/// - Single-statement upserts are atomic, so readers never see half a page
/// - Survives restarts, which is the whole point of offline mode
/// - Doesn't require a separate process
///
/// rusqlite is blocking, so every call hops onto tokio's blocking pool.
#[derive(Clone)]
pub struct SqliteCache {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCache {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path)?;
        Self::init_schema(&conn)?;
        debug!("Opened payload cache at {}", db_path.display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Throwaway cache, mostly for tests
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS entries (
                key TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                saved_at INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS entries_saved_at ON entries (saved_at)",
            [],
        )?;

        Ok(())
    }

    async fn with_conn<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().map_err(|_| CacheError::Poisoned)?;
            f(&*guard)
        })
        .await?
    }

    /// Drop entries saved before `now - max_age`
    pub async fn prune_older_than(&self, max_age: chrono::Duration) -> Result<usize> {
        let cutoff = (Utc::now() - max_age).timestamp_millis();
        let removed = self
            .with_conn(move |conn| {
                Ok(conn.execute("DELETE FROM entries WHERE saved_at < ?1", params![cutoff])?)
            })
            .await?;

        if removed > 0 {
            info!("Pruned {} cache entries older than {}h", removed, max_age.num_hours());
        }
        Ok(removed)
    }

    pub async fn len(&self) -> Result<usize> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM entries", [], |row| row.get(0))?;
            Ok(count as usize)
        })
        .await
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}

#[async_trait]
impl CacheStore for SqliteCache {
    async fn get(&self, key: &str) -> Result<Option<CachedResource>> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let row: Option<(String, i64)> = conn
                .query_row(
                    "SELECT payload, saved_at FROM entries WHERE key = ?1",
                    params![key],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            let Some((payload, saved_at)) = row else {
                return Ok(None);
            };

            let payload = serde_json::from_str(&payload).map_err(|e| CacheError::Corrupt {
                key: key.clone(),
                reason: e.to_string(),
            })?;
            let saved_at = DateTime::from_timestamp_millis(saved_at).ok_or_else(|| CacheError::Corrupt {
                key: key.clone(),
                reason: format!("bad timestamp {}", saved_at),
            })?;

            Ok(Some(CachedResource {
                key,
                payload,
                saved_at,
            }))
        })
        .await
    }

    async fn put(&self, key: &str, payload: &serde_json::Value) -> Result<()> {
        // Serialize up front so the blocking closure owns plain strings
        let key = key.to_string();
        let payload = serde_json::to_string(payload)?;
        let saved_at = Utc::now().timestamp_millis();

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO entries (key, payload, saved_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET payload = excluded.payload, saved_at = excluded.saved_at",
                params![key, payload, saved_at],
            )?;
            Ok(())
        })
        .await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM entries WHERE key = ?1", params![key])?;
            Ok(())
        })
        .await
    }

    async fn clear(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM entries", [])?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_missing_key_is_none() {
        let cache = SqliteCache::in_memory().unwrap();
        assert_eq!(cache.get("feed:page1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_put_overwrites_whole_entry() {
        let cache = SqliteCache::in_memory().unwrap();

        cache.put("feed:page1", &json!({"page": 1, "total": 5, "items": [1, 2]})).await.unwrap();
        cache.put("feed:page1", &json!({"page": 1, "total": 6})).await.unwrap();

        let entry = cache.get("feed:page1").await.unwrap().unwrap();
        assert_eq!(entry.key, "feed:page1");
        // Replaced, not merged
        assert_eq!(entry.payload, json!({"page": 1, "total": 6}));
        assert_eq!(cache.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_remove_and_clear() {
        let cache = SqliteCache::in_memory().unwrap();

        cache.put("feed:page1", &json!({"page": 1})).await.unwrap();
        cache.put("feed:page2", &json!({"page": 2})).await.unwrap();
        cache.put("article:a1", &json!({"id": "a1"})).await.unwrap();

        cache.remove("feed:page2").await.unwrap();
        assert_eq!(cache.get("feed:page2").await.unwrap(), None);
        assert_eq!(cache.len().await.unwrap(), 2);

        // Removing something that isn't there is fine
        cache.remove("feed:page9").await.unwrap();

        cache.clear().await.unwrap();
        assert!(cache.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cache.db");

        {
            let cache = SqliteCache::open(&path).unwrap();
            cache.put("article:a1", &json!({"id": "a1"})).await.unwrap();
        }

        let cache = SqliteCache::open(&path).unwrap();
        let entry = cache.get("article:a1").await.unwrap().unwrap();
        assert_eq!(entry.payload, json!({"id": "a1"}));
    }

    #[tokio::test]
    async fn test_corrupt_payload_is_reported() {
        let cache = SqliteCache::in_memory().unwrap();
        cache
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO entries (key, payload, saved_at) VALUES ('feed:page1', '{not json', 0)",
                    [],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        assert!(matches!(
            cache.get("feed:page1").await,
            Err(CacheError::Corrupt { .. })
        ));
    }

    #[tokio::test]
    async fn test_prune_drops_old_entries() {
        let cache = SqliteCache::in_memory().unwrap();
        cache.put("feed:page1", &json!({"page": 1})).await.unwrap();

        let old = (Utc::now() - chrono::Duration::days(30)).timestamp_millis();
        cache
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO entries (key, payload, saved_at) VALUES ('feed:page7', '{}', ?1)",
                    params![old],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let removed = cache.prune_older_than(chrono::Duration::days(7)).await.unwrap();
        assert_eq!(removed, 1);
        assert!(cache.get("feed:page1").await.unwrap().is_some());
        assert!(cache.get("feed:page7").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_readers_see_whole_values() {
        let cache = SqliteCache::in_memory().unwrap();
        let small_items = vec![0; 10];
        let large_items = vec![1; 5000];
        let small = json!({"version": "a", "items": small_items});
        let large = json!({"version": "b", "items": large_items});
        cache.put("feed:page1", &small).await.unwrap();

        let writer = {
            let cache = cache.clone();
            let (small, large) = (small.clone(), large.clone());
            tokio::spawn(async move {
                for i in 0..50 {
                    let value = if i % 2 == 0 { &large } else { &small };
                    cache.put("feed:page1", value).await.unwrap();
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                let (small, large) = (small.clone(), large.clone());
                tokio::spawn(async move {
                    for _ in 0..50 {
                        let entry = cache.get("feed:page1").await.unwrap().unwrap();
                        assert!(entry.payload == small || entry.payload == large);
                    }
                })
            })
            .collect();

        writer.await.unwrap();
        for reader in futures::future::join_all(readers).await {
            reader.unwrap();
        }
    }
}
