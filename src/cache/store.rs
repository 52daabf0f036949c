//! Durable backing store for the fingerprint cache, backed by SQLite.
//!
//! The in-memory cache is authoritative. The store is a write-through
//! mirror used to warm the cache after a restart; every failure here is
//! reported to the cache, which then drops to memory-only operation.

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// A cache entry as persisted: the value is pre-serialized JSON so the
/// store stays independent of the cached value type.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEntry {
    pub key: String,
    pub value_json: String,
    pub content_digest: String,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
}

/// Persistence seam for the fingerprint cache.
pub trait CacheStore: Send + Sync {
    /// Load at most `limit` entries, least recently accessed first. Rows
    /// beyond the limit are discarded.
    fn load(&self, limit: usize) -> Result<Vec<StoredEntry>>;

    fn upsert(&self, entry: &StoredEntry) -> Result<()>;

    fn touch(&self, key: &str, at: DateTime<Utc>) -> Result<()>;

    fn remove(&self, key: &str) -> Result<()>;

    fn clear(&self) -> Result<()>;
}

/// SQLite implementation of [`CacheStore`].
pub struct SqliteCacheStore {
    db: Mutex<Connection>,
}

impl SqliteCacheStore {
    /// Open (or create) the cache database at the given path.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let db = Connection::open(db_path).context("Failed to open cache database")?;
        // WAL mode for concurrent reads
        db.pragma_update(None, "journal_mode", "WAL")?;
        Self::init(db)
    }

    /// In-memory database, mostly useful for tests.
    pub fn open_in_memory() -> Result<Self> {
        let db = Connection::open_in_memory().context("Failed to open in-memory cache database")?;
        Self::init(db)
    }

    fn init(db: Connection) -> Result<Self> {
        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS cache_entries (
                key TEXT PRIMARY KEY,
                value_json TEXT NOT NULL,
                content_digest TEXT NOT NULL,
                created_at TEXT NOT NULL,
                last_accessed_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_cache_entries_access ON cache_entries(last_accessed_at);
            ",
        )?;
        Ok(Self { db: Mutex::new(db) })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of persisted rows.
    pub fn len(&self) -> Result<usize> {
        let db = self.conn();
        let n: i64 = db.query_row("SELECT COUNT(*) FROM cache_entries", [], |row| row.get(0))?;
        Ok(n as usize)
    }
}

impl CacheStore for SqliteCacheStore {
    fn load(&self, limit: usize) -> Result<Vec<StoredEntry>> {
        let db = self.conn();
        let limit = limit as i64;

        db.execute(
            "DELETE FROM cache_entries WHERE key NOT IN (
                SELECT key FROM cache_entries ORDER BY last_accessed_at DESC LIMIT ?1
            )",
            params![limit],
        )?;

        let mut stmt = db.prepare(
            "SELECT key, value_json, content_digest, created_at, last_accessed_at
             FROM cache_entries ORDER BY last_accessed_at ASC",
        )?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(key, value_json, content_digest, created, accessed)| {
                Ok(StoredEntry {
                    created_at: parse_timestamp(&created)
                        .with_context(|| format!("Bad created_at for cache key '{}'", key))?,
                    last_accessed_at: parse_timestamp(&accessed)
                        .with_context(|| format!("Bad last_accessed_at for cache key '{}'", key))?,
                    key,
                    value_json,
                    content_digest,
                })
            })
            .collect()
    }

    fn upsert(&self, entry: &StoredEntry) -> Result<()> {
        let db = self.conn();
        db.execute(
            "INSERT INTO cache_entries (key, value_json, content_digest, created_at, last_accessed_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(key) DO UPDATE SET
                value_json = excluded.value_json,
                content_digest = excluded.content_digest,
                created_at = excluded.created_at,
                last_accessed_at = excluded.last_accessed_at",
            params![
                entry.key,
                entry.value_json,
                entry.content_digest,
                format_timestamp(entry.created_at),
                format_timestamp(entry.last_accessed_at),
            ],
        )?;
        Ok(())
    }

    fn touch(&self, key: &str, at: DateTime<Utc>) -> Result<()> {
        let db = self.conn();
        db.execute(
            "UPDATE cache_entries SET last_accessed_at = ?1 WHERE key = ?2",
            params![format_timestamp(at), key],
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let db = self.conn();
        db.execute("DELETE FROM cache_entries WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let db = self.conn();
        db.execute("DELETE FROM cache_entries", [])?;
        Ok(())
    }
}

/// Fixed-width RFC 3339 so lexical order in SQLite matches time order.
fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn entry(key: &str, accessed_offset_secs: i64) -> StoredEntry {
        let base = Utc::now();
        StoredEntry {
            key: key.into(),
            value_json: format!("\"value-{}\"", key),
            content_digest: format!("digest {}", key),
            created_at: base,
            last_accessed_at: base + Duration::seconds(accessed_offset_secs),
        }
    }

    #[test]
    fn test_upsert_and_load_orders_by_access() {
        let store = SqliteCacheStore::open_in_memory().unwrap();
        store.upsert(&entry("b", 20)).unwrap();
        store.upsert(&entry("a", 10)).unwrap();
        store.upsert(&entry("c", 30)).unwrap();

        let loaded = store.load(10).unwrap();
        let keys: Vec<_> = loaded.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
        assert_eq!(loaded[0].value_json, "\"value-a\"");
    }

    #[test]
    fn test_load_discards_rows_beyond_limit() {
        let store = SqliteCacheStore::open_in_memory().unwrap();
        for (i, key) in ["old", "mid", "new"].iter().enumerate() {
            store.upsert(&entry(key, i as i64)).unwrap();
        }
        let loaded = store.load(2).unwrap();
        let keys: Vec<_> = loaded.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["mid", "new"]);
        assert_eq!(store.len().unwrap(), 2);
    }

    #[test]
    fn test_touch_remove_clear() {
        let store = SqliteCacheStore::open_in_memory().unwrap();
        store.upsert(&entry("a", 0)).unwrap();
        store.upsert(&entry("b", 5)).unwrap();

        store.touch("a", Utc::now() + Duration::seconds(60)).unwrap();
        let keys: Vec<_> = store.load(10).unwrap().into_iter().map(|e| e.key).collect();
        assert_eq!(keys, vec!["b".to_string(), "a".to_string()]);

        store.remove("a").unwrap();
        assert_eq!(store.len().unwrap(), 1);

        store.clear().unwrap();
        assert_eq!(store.len().unwrap(), 0);
    }

    #[test]
    fn test_file_backed_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cache.db");
        {
            let store = SqliteCacheStore::open(&path).unwrap();
            store.upsert(&entry("persisted", 0)).unwrap();
        }
        let reopened = SqliteCacheStore::open(&path).unwrap();
        let loaded = reopened.load(10).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].key, "persisted");
    }
}
