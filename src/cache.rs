use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, trace};

use crate::address::CacheKey;
use crate::coordinates::Coordinates;
use crate::errors::{AppError, AppResult};

/// 90 days.
pub const CACHE_TTL_SECONDS: u64 = 7_776_000;

/// Key-value store with per-entry expiry. Expired entries behave as absent.
///
/// No atomicity is promised across a `has`/`get`/`set` sequence; two callers
/// racing on one key simply both write, last writer wins.
pub trait CacheStore: Send + Sync {
    fn has(&self, key: &CacheKey) -> AppResult<bool>;

    fn get(&self, key: &CacheKey) -> AppResult<Option<Coordinates>>;

    fn set(
        &self,
        key: &CacheKey,
        value: &Coordinates,
        tags: &[String],
        ttl_seconds: u64,
    ) -> AppResult<()>;
}

fn expiry_from(now: DateTime<Utc>, ttl_seconds: u64) -> DateTime<Utc> {
    i64::try_from(ttl_seconds)
        .ok()
        .and_then(Duration::try_seconds)
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: Coordinates,
    tags: Vec<String>,
    expires_at: DateTime<Utc>,
}

#[derive(Clone, Default)]
pub struct MemoryCacheStore {
    entries: Arc<Mutex<HashMap<String, MemoryEntry>>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        let now = Utc::now();
        self.entries
            .lock()
            .values()
            .filter(|entry| entry.expires_at > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every expired entry, not only the ones looked up again.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        let removed = before - entries.len();
        debug!(target: "geocode_cache", removed, "purged expired memory cache entries");
        removed
    }

    pub fn flush_tag(&self, tag: &str) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| !entry.tags.iter().any(|t| t == tag));
        before - entries.len()
    }

    fn live_entry(&self, key: &CacheKey) -> Option<MemoryEntry> {
        let mut entries = self.entries.lock();
        match entries.get(key.as_str()) {
            Some(entry) if entry.expires_at > Utc::now() => Some(entry.clone()),
            Some(_) => {
                entries.remove(key.as_str());
                None
            }
            None => None,
        }
    }
}

impl CacheStore for MemoryCacheStore {
    fn has(&self, key: &CacheKey) -> AppResult<bool> {
        Ok(self.live_entry(key).is_some())
    }

    fn get(&self, key: &CacheKey) -> AppResult<Option<Coordinates>> {
        Ok(self.live_entry(key).map(|entry| entry.value))
    }

    fn set(
        &self,
        key: &CacheKey,
        value: &Coordinates,
        tags: &[String],
        ttl_seconds: u64,
    ) -> AppResult<()> {
        let entry = MemoryEntry {
            value: value.clone(),
            tags: tags.to_vec(),
            expires_at: expiry_from(Utc::now(), ttl_seconds),
        };
        self.entries.lock().insert(key.as_str().to_string(), entry);
        trace!(key = %key, ttl_seconds, "memory cache entry stored");
        Ok(())
    }
}

/// Durable store on the `geocode_cache` table created by [`crate::db::bootstrap`].
#[derive(Clone)]
pub struct SqliteCacheStore {
    db: Arc<Mutex<Connection>>,
}

impl SqliteCacheStore {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }

    pub fn in_memory() -> AppResult<Self> {
        let connection = crate::db::open_in_memory()?;
        Ok(Self::new(Arc::new(Mutex::new(connection))))
    }

    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.db)
    }

    pub fn purge_expired(&self) -> AppResult<usize> {
        let conn = self.db.lock();
        let removed = conn.execute(
            "DELETE FROM geocode_cache WHERE expires_at <= ?1",
            [Utc::now().timestamp()],
        )?;
        debug!(target: "geocode_cache", removed, "purged expired cache entries");
        Ok(removed)
    }

    pub fn flush_tag(&self, tag: &str) -> AppResult<usize> {
        let conn = self.db.lock();
        let removed = conn.execute(
            "DELETE FROM geocode_cache
            WHERE EXISTS (SELECT 1 FROM json_each(geocode_cache.tags) WHERE json_each.value = ?1)",
            [tag],
        )?;
        Ok(removed)
    }

    fn load_payload(&self, key: &CacheKey) -> AppResult<Option<String>> {
        let conn = self.db.lock();
        conn.query_row(
            "SELECT payload FROM geocode_cache WHERE cache_key = ?1 AND expires_at > ?2",
            params![key.as_str(), Utc::now().timestamp()],
            |row| row.get(0),
        )
        .optional()
        .map_err(AppError::from)
    }
}

impl CacheStore for SqliteCacheStore {
    fn has(&self, key: &CacheKey) -> AppResult<bool> {
        Ok(self.load_payload(key)?.is_some())
    }

    fn get(&self, key: &CacheKey) -> AppResult<Option<Coordinates>> {
        self.load_payload(key)?
            .map(|payload| serde_json::from_str::<Coordinates>(&payload))
            .transpose()
            .map_err(AppError::from)
    }

    fn set(
        &self,
        key: &CacheKey,
        value: &Coordinates,
        tags: &[String],
        ttl_seconds: u64,
    ) -> AppResult<()> {
        let payload = serde_json::to_string(value)?;
        let tags = serde_json::to_string(tags)?;
        let expires_at = expiry_from(Utc::now(), ttl_seconds).timestamp();

        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO geocode_cache (cache_key, payload, tags, created_at, expires_at)
            VALUES (?1, ?2, ?3, DATETIME('now'), ?4)
            ON CONFLICT(cache_key) DO UPDATE SET
                payload = excluded.payload,
                tags = excluded.tags,
                created_at = DATETIME('now'),
                expires_at = excluded.expires_at",
            params![key.as_str(), payload, tags, expires_at],
        )?;
        trace!(key = %key, ttl_seconds, "sqlite cache entry stored");
        Ok(())
    }
}
