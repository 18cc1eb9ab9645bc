use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{ControlError, Result};

/// Keys longer than this are stored under their SHA-256 hex
const MAX_RAW_KEY_LEN: usize = 250;

/// Cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub db_path: PathBuf,
    pub max_size_bytes: u64,
    pub cleanup_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("cache/cache.db"),
            max_size_bytes: 100 * 1024 * 1024,
            cleanup_interval: Duration::from_secs(300),
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub total_entries: u64,
    pub total_size_bytes: u64,
    pub hit_count: u64,
    pub miss_count: u64,
    pub eviction_count: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hit_count + self.miss_count;
        if total == 0 {
            return 0.0;
        }
        self.hit_count as f64 / total as f64 * 100.0
    }
}

struct CacheState {
    conn: Connection,
    stats: CacheStats,
}

struct CacheInner {
    state: Mutex<CacheState>,
    max_size_bytes: u64,
}

/// Durable key-value cache over a single SQLite file.
///
/// TTL expiry, tag grouping and LRU eviction under a byte budget. The file
/// is single-writer; every access goes through the internal mutex and the
/// held section never awaits.
pub struct CacheStore {
    inner: Arc<CacheInner>,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
}

impl CacheStore {
    pub fn open(config: CacheConfig) -> Result<Self> {
        if let Some(parent) = config.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&config.db_path)?;
        init_schema(&conn)?;
        let stats = load_stats(&conn)?;

        let inner = Arc::new(CacheInner {
            state: Mutex::new(CacheState { conn, stats }),
            max_size_bytes: config.max_size_bytes,
        });

        let cleanup_inner = Arc::clone(&inner);
        let interval = config.cleanup_interval;
        let cleanup_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately
            loop {
                ticker.tick().await;
                match cleanup_expired_inner(&cleanup_inner) {
                    Ok(removed) if removed > 0 => {
                        debug!(removed = removed, "Cache cleanup removed expired entries")
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Cache cleanup failed"),
                }
                if let Err(e) = save_stats_inner(&cleanup_inner) {
                    warn!(error = %e, "Failed to persist cache stats");
                }
            }
        });

        info!(db = %config.db_path.display(), "Cache store opened");
        Ok(Self {
            inner,
            cleanup_task: Mutex::new(Some(cleanup_task)),
        })
    }

    /// Fetch a value; expired entries are removed and count as misses
    pub async fn get(&self, key: &str) -> Option<serde_json::Value> {
        let key_hash = hash_key(key);
        let mut state = self.lock_state();

        let row: Option<(String, Option<f64>, u64)> = state
            .conn
            .query_row(
                "SELECT value, expires_at, access_count FROM cache_entries WHERE key = ?1",
                params![key_hash],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .map_err(|e| error!(key = key, error = %e, "Cache read failed"))
            .ok()
            .flatten();

        let (value_str, expires_at, access_count) = match row {
            Some(row) => row,
            None => {
                state.stats.miss_count += 1;
                counter!("control_cache_misses_total", 1);
                return None;
            }
        };

        if let Some(expires_at) = expires_at {
            if now_secs() > expires_at {
                if let Err(e) = delete_locked(&mut state, &key_hash) {
                    error!(key = key, error = %e, "Failed to drop expired entry");
                }
                state.stats.miss_count += 1;
                counter!("control_cache_misses_total", 1);
                debug!(key = key, "Cache entry expired");
                return None;
            }
        }

        if let Err(e) = state.conn.execute(
            "UPDATE cache_entries SET access_count = ?1, last_accessed = ?2 WHERE key = ?3",
            params![access_count + 1, now_secs(), key_hash],
        ) {
            warn!(key = key, error = %e, "Failed to update access stats");
        }

        state.stats.hit_count += 1;
        counter!("control_cache_hits_total", 1);

        serde_json::from_str(&value_str).ok()
    }

    /// Insert or replace a value, evicting LRU entries to fit the budget
    pub async fn set(
        &self,
        key: &str,
        value: &serde_json::Value,
        ttl: Option<Duration>,
        tags: &[&str],
    ) -> Result<()> {
        let key_hash = hash_key(key);
        let value_str = serde_json::to_string(value)?;
        let size_bytes = value_str.len() as u64;

        if size_bytes > self.inner.max_size_bytes {
            return Err(ControlError::Storage(format!(
                "value of {} bytes exceeds cache budget",
                size_bytes
            )));
        }

        let mut state = self.lock_state();

        let old_size: Option<u64> = state
            .conn
            .query_row(
                "SELECT size_bytes FROM cache_entries WHERE key = ?1",
                params![key_hash],
                |row| row.get(0),
            )
            .optional()?;

        let projected =
            state.stats.total_size_bytes.saturating_sub(old_size.unwrap_or(0)) + size_bytes;
        if projected > self.inner.max_size_bytes {
            let needed = projected - self.inner.max_size_bytes;
            evict_locked(&mut state, &key_hash, needed)?;
        }

        let created_at = now_secs();
        let expires_at = ttl.map(|t| created_at + t.as_secs_f64());
        let tags_str = if tags.is_empty() {
            None
        } else {
            Some(serde_json::to_string(tags)?)
        };

        if old_size.is_some() {
            state.conn.execute(
                "UPDATE cache_entries
                 SET value = ?1, created_at = ?2, expires_at = ?3,
                     access_count = 0, last_accessed = ?2, tags = ?4, size_bytes = ?5
                 WHERE key = ?6",
                params![value_str, created_at, expires_at, tags_str, size_bytes, key_hash],
            )?;
            state.stats.total_size_bytes = state
                .stats
                .total_size_bytes
                .saturating_sub(old_size.unwrap_or(0))
                + size_bytes;
        } else {
            state.conn.execute(
                "INSERT INTO cache_entries
                 (key, value, created_at, expires_at, last_accessed, tags, size_bytes)
                 VALUES (?1, ?2, ?3, ?4, ?3, ?5, ?6)",
                params![key_hash, value_str, created_at, expires_at, tags_str, size_bytes],
            )?;
            state.stats.total_entries += 1;
            state.stats.total_size_bytes += size_bytes;
        }

        debug!(key = key, size_bytes = size_bytes, "Cache set");
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> bool {
        let key_hash = hash_key(key);
        let mut state = self.lock_state();
        delete_locked(&mut state, &key_hash).unwrap_or(false)
    }

    /// Remove entries, optionally restricted to the given tags
    pub async fn clear(&self, tags: Option<&[&str]>) -> Result<u64> {
        let mut state = self.lock_state();

        let removed = match tags {
            Some(tags) => {
                let mut removed = 0u64;
                for tag in tags {
                    let pattern = format!("%\"{}\"%", tag);
                    let rows: Vec<(String, u64)> = {
                        let mut stmt = state.conn.prepare(
                            "SELECT key, size_bytes FROM cache_entries WHERE tags LIKE ?1",
                        )?;
                        let mapped = stmt.query_map(params![pattern], |row| {
                            Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
                        })?;
                        mapped.collect::<std::result::Result<_, _>>()?
                    };

                    for (key, size) in rows {
                        state
                            .conn
                            .execute("DELETE FROM cache_entries WHERE key = ?1", params![key])?;
                        state.stats.total_entries = state.stats.total_entries.saturating_sub(1);
                        state.stats.total_size_bytes =
                            state.stats.total_size_bytes.saturating_sub(size);
                        removed += 1;
                    }
                }
                removed
            }
            None => {
                let removed = state.stats.total_entries;
                state.conn.execute("DELETE FROM cache_entries", [])?;
                state.stats.total_entries = 0;
                state.stats.total_size_bytes = 0;
                removed
            }
        };

        info!(removed = removed, "Cache cleared");
        Ok(removed)
    }

    pub async fn exists(&self, key: &str) -> bool {
        let key_hash = hash_key(key);
        let mut state = self.lock_state();

        let expires_at: Option<Option<f64>> = state
            .conn
            .query_row(
                "SELECT expires_at FROM cache_entries WHERE key = ?1",
                params![key_hash],
                |row| row.get(0),
            )
            .optional()
            .unwrap_or(None);

        match expires_at {
            None => false,
            Some(Some(expires_at)) if now_secs() > expires_at => {
                let _ = delete_locked(&mut state, &key_hash);
                false
            }
            Some(_) => true,
        }
    }

    /// Remove all expired entries now
    pub async fn cleanup_expired(&self) -> Result<u64> {
        cleanup_expired_inner(&self.inner)
    }

    pub fn stats(&self) -> CacheStats {
        self.lock_state().stats.clone()
    }

    /// Row count straight from the table, for stats verification
    pub fn entry_count(&self) -> Result<u64> {
        let state = self.lock_state();
        Ok(state
            .conn
            .query_row("SELECT COUNT(*) FROM cache_entries", [], |row| row.get(0))?)
    }

    /// Stop the cleanup task and persist statistics
    pub async fn close(&self) {
        let task = self.cleanup_task.lock().expect("task mutex poisoned").take();
        if let Some(task) = task {
            task.abort();
        }

        if let Err(e) = save_stats_inner(&self.inner) {
            warn!(error = %e, "Failed to persist cache stats on close");
        }
        info!("Cache store closed");
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, CacheState> {
        self.inner.state.lock().expect("cache mutex poisoned")
    }
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS cache_entries (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            created_at REAL NOT NULL,
            expires_at REAL,
            access_count INTEGER DEFAULT 0,
            last_accessed REAL,
            tags TEXT,
            size_bytes INTEGER DEFAULT 0
        );
        CREATE TABLE IF NOT EXISTS cache_stats (
            id INTEGER PRIMARY KEY,
            total_entries INTEGER DEFAULT 0,
            total_size_bytes INTEGER DEFAULT 0,
            hit_count INTEGER DEFAULT 0,
            miss_count INTEGER DEFAULT 0,
            eviction_count INTEGER DEFAULT 0,
            updated_at REAL NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_expires_at ON cache_entries(expires_at);
        CREATE INDEX IF NOT EXISTS idx_last_accessed ON cache_entries(last_accessed);
        CREATE INDEX IF NOT EXISTS idx_tags ON cache_entries(tags);",
    )?;
    Ok(())
}

fn load_stats(conn: &Connection) -> Result<CacheStats> {
    let stats = conn
        .query_row(
            "SELECT total_entries, total_size_bytes, hit_count, miss_count, eviction_count
             FROM cache_stats ORDER BY updated_at DESC LIMIT 1",
            [],
            |row| {
                Ok(CacheStats {
                    total_entries: row.get(0)?,
                    total_size_bytes: row.get(1)?,
                    hit_count: row.get(2)?,
                    miss_count: row.get(3)?,
                    eviction_count: row.get(4)?,
                })
            },
        )
        .optional()?
        .unwrap_or_default();

    // Entry counters come from the table itself, not the stats snapshot
    let (entries, size): (u64, Option<u64>) = conn.query_row(
        "SELECT COUNT(*), SUM(size_bytes) FROM cache_entries",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    Ok(CacheStats {
        total_entries: entries,
        total_size_bytes: size.unwrap_or(0),
        ..stats
    })
}

fn save_stats_inner(inner: &CacheInner) -> Result<()> {
    let state = inner.state.lock().expect("cache mutex poisoned");
    state.conn.execute(
        "INSERT INTO cache_stats
         (total_entries, total_size_bytes, hit_count, miss_count, eviction_count, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            state.stats.total_entries,
            state.stats.total_size_bytes,
            state.stats.hit_count,
            state.stats.miss_count,
            state.stats.eviction_count,
            now_secs()
        ],
    )?;
    Ok(())
}

fn cleanup_expired_inner(inner: &CacheInner) -> Result<u64> {
    let mut state = inner.state.lock().expect("cache mutex poisoned");
    let now = now_secs();

    let (count, size): (u64, Option<u64>) = state.conn.query_row(
        "SELECT COUNT(*), SUM(size_bytes) FROM cache_entries
         WHERE expires_at IS NOT NULL AND expires_at < ?1",
        params![now],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    if count > 0 {
        state.conn.execute(
            "DELETE FROM cache_entries WHERE expires_at IS NOT NULL AND expires_at < ?1",
            params![now],
        )?;
        state.stats.total_entries = state.stats.total_entries.saturating_sub(count);
        state.stats.total_size_bytes = state
            .stats
            .total_size_bytes
            .saturating_sub(size.unwrap_or(0));
    }

    Ok(count)
}

fn delete_locked(state: &mut CacheState, key_hash: &str) -> Result<bool> {
    let size: Option<u64> = state
        .conn
        .query_row(
            "SELECT size_bytes FROM cache_entries WHERE key = ?1",
            params![key_hash],
            |row| row.get(0),
        )
        .optional()?;

    match size {
        Some(size) => {
            state
                .conn
                .execute("DELETE FROM cache_entries WHERE key = ?1", params![key_hash])?;
            state.stats.total_entries = state.stats.total_entries.saturating_sub(1);
            state.stats.total_size_bytes = state.stats.total_size_bytes.saturating_sub(size);
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Evict least-recently-used entries until at least `needed` bytes are freed
fn evict_locked(state: &mut CacheState, exclude_key: &str, needed: u64) -> Result<()> {
    let victims: Vec<(String, u64)> = {
        let mut stmt = state.conn.prepare(
            "SELECT key, size_bytes FROM cache_entries WHERE key != ?1
             ORDER BY last_accessed ASC",
        )?;
        let mapped = stmt.query_map(params![exclude_key], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
        })?;
        mapped.collect::<std::result::Result<_, _>>()?
    };

    let mut freed = 0u64;
    let mut evicted = 0u64;

    for (key, size) in victims {
        if freed >= needed {
            break;
        }
        state
            .conn
            .execute("DELETE FROM cache_entries WHERE key = ?1", params![key])?;
        freed += size;
        evicted += 1;
    }

    state.stats.total_entries = state.stats.total_entries.saturating_sub(evicted);
    state.stats.total_size_bytes = state.stats.total_size_bytes.saturating_sub(freed);
    state.stats.eviction_count += evicted;
    counter!("control_cache_evictions_total", evicted);

    info!(evicted = evicted, freed_bytes = freed, "Cache eviction");
    Ok(())
}

fn hash_key(key: &str) -> String {
    if key.len() <= MAX_RAW_KEY_LEN {
        return key.to_string();
    }
    let digest = Sha256::digest(key.as_bytes());
    format!("{:x}", digest)
}

fn now_secs() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}
