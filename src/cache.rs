//! Two-tier candle cache: an in-memory index over the sqlite mirror.
//!
//! Rules implemented:
//! - TTL is chosen per timeframe; an entry older than its TTL is a miss and is
//!   purged from memory and disk on the spot
//! - writes go to disk first and only then to memory, so a failed disk write
//!   leaves both tiers unchanged
//! - callers for the same key can serialize through `lock_key`

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info};

use crate::candle::{CacheKey, Candle};
use crate::store::{SqliteCacheStore, StoreError};
use crate::timeframe::Timeframe;

pub const DEFAULT_CACHE_DIRECTORY: &str = "./historical-data-cache";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    pub enable_cache: bool,
    pub cache_directory: PathBuf,
    /// Minutes; replaces the timeframe's default TTL class.
    pub ttl_overrides: BTreeMap<Timeframe, u64>,
    pub sweep_interval_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enable_cache: true,
            cache_directory: PathBuf::from(DEFAULT_CACHE_DIRECTORY),
            ttl_overrides: BTreeMap::new(),
            sweep_interval_ms: 60_000,
        }
    }
}

impl CacheConfig {
    pub fn ttl_ms(&self, timeframe: Timeframe) -> i64 {
        let minutes = self
            .ttl_overrides
            .get(&timeframe)
            .copied()
            .unwrap_or_else(|| timeframe.default_ttl_minutes());
        i64::try_from(minutes.saturating_mul(60_000)).unwrap_or(i64::MAX)
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to open cache store in {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: StoreError,
    },
    #[error("cache store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
struct CacheEntry {
    candles: Arc<[Candle]>,
    stored_at_ms: i64,
    ttl_ms: i64,
    size_bytes: u64,
}

impl CacheEntry {
    fn is_expired(&self, now_ms: i64) -> bool {
        now_ms.saturating_sub(self.stored_at_ms) > self.ttl_ms
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub removed: u64,
    pub freed_bytes: u64,
    pub remaining: u64,
}

type KeyLocks = Arc<Mutex<HashMap<CacheKey, Arc<tokio::sync::Mutex<()>>>>>;

pub struct CacheManager {
    cfg: CacheConfig,
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
    store: Option<Mutex<SqliteCacheStore>>,
    size_bytes: AtomicU64,
    key_locks: KeyLocks,
}

impl CacheManager {
    /// Opens the durable mirror and warms memory from it, dropping expired records.
    /// With `enable_cache = false` this is the same as [`CacheManager::disabled`].
    pub fn open(cfg: CacheConfig, now_ms: i64) -> Result<Self, CacheError> {
        if !cfg.enable_cache {
            return Ok(Self::disabled(cfg));
        }

        let mut store =
            SqliteCacheStore::open(&cfg.cache_directory).map_err(|source| CacheError::Open {
                path: cfg.cache_directory.display().to_string(),
                source,
            })?;
        let warm = store.load_all()?;

        let mut entries = HashMap::with_capacity(warm.entries.len());
        let mut size_bytes = 0u64;
        let mut expired = 0u64;
        for stored in warm.entries {
            let entry = CacheEntry {
                ttl_ms: cfg.ttl_ms(stored.key.timeframe),
                candles: stored.candles.into(),
                stored_at_ms: stored.stored_at_ms,
                size_bytes: stored.payload_bytes,
            };
            if entry.is_expired(now_ms) {
                store.delete(&stored.key.as_string())?;
                expired += 1;
                continue;
            }
            size_bytes += entry.size_bytes;
            entries.insert(stored.key, entry);
        }

        info!(
            component = "cache",
            event = "cache.warm_start",
            directory = %cfg.cache_directory.display(),
            entries = entries.len(),
            expired_dropped = expired,
            corrupt_dropped = warm.discarded.len(),
            size_bytes
        );

        Ok(Self {
            cfg,
            entries: RwLock::new(entries),
            store: Some(Mutex::new(store)),
            size_bytes: AtomicU64::new(size_bytes),
            key_locks: KeyLocks::default(),
        })
    }

    /// A cache that never stores anything; every lookup is a miss.
    pub fn disabled(cfg: CacheConfig) -> Self {
        Self {
            cfg: CacheConfig {
                enable_cache: false,
                ..cfg
            },
            entries: RwLock::new(HashMap::new()),
            store: None,
            size_bytes: AtomicU64::new(0),
            key_locks: KeyLocks::default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.cfg.enable_cache
    }

    pub fn config(&self) -> &CacheConfig {
        &self.cfg
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .expect("cache index lock should not be poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: &CacheKey, now_ms: i64) -> Result<Option<Arc<[Candle]>>, CacheError> {
        if !self.is_enabled() {
            return Ok(None);
        }

        let expired_at = {
            let entries = self
                .entries
                .read()
                .expect("cache index lock should not be poisoned");
            match entries.get(key) {
                None => return Ok(None),
                Some(entry) if !entry.is_expired(now_ms) => {
                    return Ok(Some(Arc::clone(&entry.candles)))
                }
                Some(entry) => entry.stored_at_ms,
            }
        };

        debug!(
            component = "cache",
            event = "cache.entry.expired",
            key = %key,
            stored_at_ms = expired_at,
            age_ms = now_ms.saturating_sub(expired_at)
        );
        self.remove(key, Some(expired_at))?;
        Ok(None)
    }

    /// Persists then indexes `candles` under `key`. On error neither tier changes.
    pub fn put(&self, key: &CacheKey, candles: Arc<[Candle]>, now_ms: i64) -> Result<(), CacheError> {
        if !self.is_enabled() {
            return Ok(());
        }

        let size_bytes = match &self.store {
            Some(store) => store
                .lock()
                .expect("cache store lock should not be poisoned")
                .upsert(key, &candles, now_ms)?,
            None => 0,
        };

        let entry = CacheEntry {
            candles,
            stored_at_ms: now_ms,
            ttl_ms: self.cfg.ttl_ms(key.timeframe),
            size_bytes,
        };

        let replaced = self
            .entries
            .write()
            .expect("cache index lock should not be poisoned")
            .insert(key.clone(), entry);
        self.size_bytes.fetch_add(size_bytes, Ordering::Relaxed);
        if let Some(old) = replaced {
            self.size_bytes.fetch_sub(old.size_bytes, Ordering::Relaxed);
        }

        debug!(
            component = "cache",
            event = "cache.entry.stored",
            key = %key,
            size_bytes
        );
        Ok(())
    }

    /// Removes one entry from both tiers. Returns whether anything was removed.
    pub fn invalidate(&self, key: &CacheKey) -> Result<bool, CacheError> {
        if !self.is_enabled() {
            return Ok(false);
        }
        let removed = self.remove(key, None)?;
        if removed {
            info!(
                component = "cache",
                event = "cache.entry.invalidated",
                key = %key
            );
        }
        Ok(removed)
    }

    /// Drops every entry whose age exceeds its TTL from memory and disk.
    pub fn sweep_expired(&self, now_ms: i64) -> Result<SweepReport, CacheError> {
        if !self.is_enabled() {
            return Ok(SweepReport::default());
        }

        let (expired, remaining) = {
            let mut entries = self
                .entries
                .write()
                .expect("cache index lock should not be poisoned");
            let expired_keys: Vec<CacheKey> = entries
                .iter()
                .filter(|(_, entry)| entry.is_expired(now_ms))
                .map(|(key, _)| key.clone())
                .collect();
            let expired: Vec<(CacheKey, CacheEntry)> = expired_keys
                .into_iter()
                .filter_map(|key| entries.remove(&key).map(|entry| (key, entry)))
                .collect();
            (expired, entries.len() as u64)
        };

        let mut report = SweepReport {
            remaining,
            ..SweepReport::default()
        };
        for (key, entry) in &expired {
            self.size_bytes.fetch_sub(entry.size_bytes, Ordering::Relaxed);
            report.removed += 1;
            report.freed_bytes += entry.size_bytes;
            // A put may have landed for this key since it left memory; only
            // the record this entry was read from is removed.
            if let Some(store) = &self.store {
                store
                    .lock()
                    .expect("cache store lock should not be poisoned")
                    .delete_if_stored_at(&key.as_string(), entry.stored_at_ms)?;
            }
        }

        if report.removed > 0 {
            info!(
                component = "cache",
                event = "cache.sweep",
                removed = report.removed,
                freed_bytes = report.freed_bytes,
                remaining = report.remaining
            );
        } else {
            debug!(
                component = "cache",
                event = "cache.sweep",
                removed = 0u64,
                remaining = report.remaining
            );
        }
        Ok(report)
    }

    /// Waits for exclusive use of `key`; the lease releases on drop.
    pub async fn lock_key(&self, key: &CacheKey) -> KeyLease {
        let mutex = {
            let mut locks = self
                .key_locks
                .lock()
                .expect("cache key lock table should not be poisoned");
            Arc::clone(locks.entry(key.clone()).or_default())
        };
        let guard = mutex.lock_owned().await;

        KeyLease {
            key: key.clone(),
            locks: Arc::clone(&self.key_locks),
            guard: Some(guard),
        }
    }

    /// Keys with a live or pending lease.
    pub fn leased_keys(&self) -> usize {
        self.key_locks
            .lock()
            .expect("cache key lock table should not be poisoned")
            .len()
    }

    /// `only_if_stored_at` guards against removing an entry that was replaced
    /// between the expiry check and the removal.
    fn remove(&self, key: &CacheKey, only_if_stored_at: Option<i64>) -> Result<bool, CacheError> {
        let removed = {
            let mut entries = self
                .entries
                .write()
                .expect("cache index lock should not be poisoned");
            let replaced_since = only_if_stored_at.is_some_and(|stored_at| {
                entries
                    .get(key)
                    .is_some_and(|entry| entry.stored_at_ms != stored_at)
            });
            if replaced_since {
                return Ok(false);
            }
            entries.remove(key)
        };

        if let Some(entry) = &removed {
            self.size_bytes.fetch_sub(entry.size_bytes, Ordering::Relaxed);
        }
        let on_disk = match &self.store {
            Some(store) => {
                let mut store = store
                    .lock()
                    .expect("cache store lock should not be poisoned");
                match only_if_stored_at {
                    Some(stored_at) => store.delete_if_stored_at(&key.as_string(), stored_at)?,
                    None => store.delete(&key.as_string())?,
                }
            }
            None => false,
        };

        Ok(removed.is_some() || on_disk)
    }
}

/// Exclusive hold on one cache key, from [`CacheManager::lock_key`].
pub struct KeyLease {
    key: CacheKey,
    locks: KeyLocks,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyLease {
    fn drop(&mut self) {
        let mut locks = self
            .locks
            .lock()
            .expect("cache key lock table should not be poisoned");
        self.guard.take();
        // Waiters clone the mutex under this same table lock, so a lone
        // reference here means nobody is queued.
        if locks
            .get(&self.key)
            .is_some_and(|mutex| Arc::strong_count(mutex) == 1)
        {
            locks.remove(&self.key);
        }
    }
}
