use crate::app::ports::CacheStorePort;
use crate::error::{EnricherError, Result};
use crate::types::CacheEntry;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use tracing::warn;

/// Cover cache backed by a local SQLite table, one row per cache key.
pub struct SqliteCacheStore {
    conn: Mutex<Connection>,
}

impl SqliteCacheStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            CREATE TABLE IF NOT EXISTS cover_cache (
                cache_key  TEXT PRIMARY KEY,
                url        TEXT,
                failed_at  TEXT
            );
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| EnricherError::Storage("sqlite connection poisoned".to_string()))?;
        f(&conn)
    }
}

fn to_entry(url: Option<String>, failed_at: Option<String>) -> Option<CacheEntry> {
    let failed_at = match failed_at {
        Some(ts) => Some(DateTime::parse_from_rfc3339(&ts).ok()?.with_timezone(&Utc)),
        None => None,
    };
    Some(CacheEntry { url, failed_at })
}

#[async_trait]
impl CacheStorePort for SqliteCacheStore {
    async fn load_all(&self) -> HashMap<String, CacheEntry> {
        let loaded = self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT cache_key, url, failed_at FROM cover_cache")?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            })?;
            let mut entries = HashMap::new();
            for row in rows {
                match row {
                    Ok((key, url, failed_at)) => match to_entry(url, failed_at) {
                        Some(entry) => {
                            entries.insert(key, entry);
                        }
                        None => warn!("Skipping cover cache row with bad timestamp: {}", key),
                    },
                    Err(e) => warn!("Skipping unreadable cover cache row: {}", e),
                }
            }
            Ok(entries)
        });
        loaded.unwrap_or_else(|e| {
            warn!("Cover cache table unreadable, starting empty: {}", e);
            HashMap::new()
        })
    }

    async fn get(&self, key: &str) -> Option<CacheEntry> {
        let row = self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT url, failed_at FROM cover_cache WHERE cache_key = ?1",
                    params![key],
                    |row| Ok((row.get::<_, Option<String>>(0)?, row.get::<_, Option<String>>(1)?)),
                )
                .optional()?;
            Ok(row)
        });
        match row {
            Ok(Some((url, failed_at))) => to_entry(url, failed_at),
            Ok(None) => None,
            Err(e) => {
                warn!("Cover cache read failed for {}: {}", key, e);
                None
            }
        }
    }

    async fn set(&self, key: &str, entry: &CacheEntry) -> Result<()> {
        let failed_at = entry.failed_at.map(|ts| ts.to_rfc3339());
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO cover_cache (cache_key, url, failed_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(cache_key) DO UPDATE SET url=excluded.url, failed_at=excluded.failed_at",
                params![key, entry.url, failed_at],
            )?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_upsert_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.db");
        let now = Utc::now();

        {
            let store = SqliteCacheStore::open(&path).unwrap();
            store.set("k1", &CacheEntry::missed(now)).await.unwrap();
            store.set("k1", &CacheEntry::found("https://c/k1.jpg")).await.unwrap();
            store.set("k2", &CacheEntry::missed(now)).await.unwrap();
        }

        let store = SqliteCacheStore::open(&path).unwrap();
        let all = store.load_all().await;
        assert_eq!(all.len(), 2);
        assert_eq!(all["k1"], CacheEntry::found("https://c/k1.jpg"));
        let k2 = store.get("k2").await.unwrap();
        assert!(k2.url.is_none());
        assert_eq!(k2.failed_at.map(|t| t.timestamp()), Some(now.timestamp()));
        assert!(store.get("missing").await.is_none());
    }

    #[tokio::test]
    async fn test_bad_timestamp_rows_are_skipped() {
        let store = SqliteCacheStore::open_in_memory().unwrap();
        store
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO cover_cache (cache_key, url, failed_at) VALUES ('bad', NULL, 'yesterday')",
                    [],
                )?;
                Ok(())
            })
            .unwrap();
        store.set("good", &CacheEntry::found("https://g")).await.unwrap();

        let all = store.load_all().await;
        assert_eq!(all.len(), 1);
        assert!(all.contains_key("good"));
    }
}
