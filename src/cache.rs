//! Key/value cache with per-entry expiry.
//!
//! Entries are invisible once `now >= expires_at`; physical removal only
//! happens in [`CacheStore::purge_expired`] (or lazily on a memory-cache
//! read).

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, params};
use parking_lot::RwLock;

use crate::{clock::Clock, error::MirrorResult};

#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Value stored under `key`, or `None` when absent or expired.
    async fn get(&self, key: &str) -> MirrorResult<Option<String>>;

    /// Stores `value` for `ttl`, replacing any previous entry.
    async fn set(&self, key: &str, value: String, ttl: Duration) -> MirrorResult<()>;

    /// Drops expired entries and returns how many were removed.
    async fn purge_expired(&self) -> MirrorResult<u64>;
}

#[async_trait]
impl<T: CacheStore + ?Sized> CacheStore for Arc<T> {
    async fn get(&self, key: &str) -> MirrorResult<Option<String>> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> MirrorResult<()> {
        (**self).set(key, value, ttl).await
    }

    async fn purge_expired(&self) -> MirrorResult<u64> {
        (**self).purge_expired().await
    }
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Lowercases, trims and collapses runs of whitespace.
pub fn normalize_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Cache key for a search: equivalent spellings of one query share a key,
/// different result caps do not.
pub fn search_cache_key(query: &str, max_results: u32) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(normalize_query(query).as_bytes());
    hasher.update(&[0x1f]);
    hasher.update(max_results.to_string().as_bytes());
    format!("search:{}", hasher.finalize().to_hex())
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    expires_at: DateTime<Utc>,
}

/// Process-local cache.
pub struct MemoryCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    clock: Arc<dyn Clock>,
}

impl MemoryCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> MirrorResult<Option<String>> {
        let now = self.clock.now();
        {
            let entries = self.entries.read();
            match entries.get(key) {
                Some(entry) if now < entry.expires_at => return Ok(Some(entry.value.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }

        // Expired: evict unless a writer refreshed it in the meantime.
        let mut entries = self.entries.write();
        if entries.get(key).is_some_and(|entry| now >= entry.expires_at) {
            entries.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> MirrorResult<()> {
        let expires_at = expiry(self.clock.now(), ttl);
        self.entries
            .write()
            .insert(key.to_owned(), CacheEntry { value, expires_at });
        Ok(())
    }

    async fn purge_expired(&self) -> MirrorResult<u64> {
        let now = self.clock.now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| now < entry.expires_at);
        Ok((before - entries.len()) as u64)
    }
}

/// Cache persisted in the `cache_entries` table of the mirror database, so
/// it survives restarts and is shared by every process using that file.
#[derive(Clone)]
pub struct SqlCache {
    conn: Connection,
    clock: Arc<dyn Clock>,
}

impl SqlCache {
    /// `conn` must point at a database initialised by
    /// [`crate::metadata::MetadataStore::open`].
    pub fn new(conn: Connection, clock: Arc<dyn Clock>) -> Self {
        Self { conn, clock }
    }
}

#[async_trait]
impl CacheStore for SqlCache {
    async fn get(&self, key: &str) -> MirrorResult<Option<String>> {
        let now = self.clock.now().timestamp_millis();
        let mut rows = self
            .conn
            .query(
                "SELECT value FROM cache_entries WHERE key = ?1 AND expires_at > ?2",
                params![key, now],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row.get::<String>(0)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> MirrorResult<()> {
        let expires_at = expiry(self.clock.now(), ttl).timestamp_millis();
        self.conn
            .execute(
                r#"
                INSERT INTO cache_entries (key, value, expires_at)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    expires_at = excluded.expires_at
                "#,
                params![key, value, expires_at],
            )
            .await?;
        Ok(())
    }

    async fn purge_expired(&self) -> MirrorResult<u64> {
        let now = self.clock.now().timestamp_millis();
        let removed = self
            .conn
            .execute(
                "DELETE FROM cache_entries WHERE expires_at <= ?1",
                params![now],
            )
            .await?;
        if removed > 0 {
            tracing::debug!(removed, "purged expired cache entries");
        }
        Ok(removed)
    }
}
