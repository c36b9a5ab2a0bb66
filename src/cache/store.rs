//! In-memory cache table.
//!
//! The store only holds values; it never fetches and never decides freshness.
//! Callers read the entry metadata and apply their own staleness policy.

use std::any::{Any, type_name};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use lru::LruCache;
use metrics::counter;
use tokio::time::Instant;
use tracing::debug;

use super::config::CacheConfig;
use super::keys::{CacheKey, Invalidation};
use super::lock::mutex_lock;
use super::priority::Priority;

const SOURCE: &str = "cache::store";
const METRIC_CACHE_EVICT_TOTAL: &str = "marketsync_cache_evict_total";

/// Type-erased cached payload.
pub type ErasedValue = Arc<dyn Any + Send + Sync>;

/// Session generation; bumped by [`CacheStore::clear`].
pub type Generation = u64;

/// One cached value with its write metadata.
#[derive(Clone)]
pub struct CacheEntry {
    pub value: ErasedValue,
    /// Rust type name of `value`, for diagnostics.
    pub type_name: &'static str,
    pub written_at: Instant,
    pub ttl: Duration,
    /// Priority of the fetch that produced the value. Diagnostic only.
    pub priority: Priority,
}

impl CacheEntry {
    pub fn age(&self) -> Duration {
        self.written_at.elapsed()
    }

    pub fn is_fresh(&self) -> bool {
        self.age() < self.ttl
    }

    /// Downcast the payload, returning `None` on a type mismatch.
    pub fn downcast<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.value).downcast::<T>().ok()
    }
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("type_name", &self.type_name)
            .field("written_at", &self.written_at)
            .field("ttl", &self.ttl)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

/// Keyed table of cached values, bounded by LRU eviction.
pub struct CacheStore {
    entries: Mutex<LruCache<CacheKey, CacheEntry>>,
    default_ttl: Duration,
    generation: AtomicU64,
}

impl CacheStore {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(config.max_entries_non_zero())),
            default_ttl: config.default_ttl(),
            generation: AtomicU64::new(0),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Current session generation.
    pub fn generation(&self) -> Generation {
        self.generation.load(Ordering::SeqCst)
    }

    /// Entry for `key` regardless of age.
    pub fn get_entry(&self, key: &CacheKey) -> Option<CacheEntry> {
        mutex_lock(&self.entries, SOURCE, "get_entry")
            .get(key)
            .cloned()
    }

    /// Typed value for `key` regardless of age.
    ///
    /// Returns `None` when absent or when the stored value is another type.
    pub fn get<T: Send + Sync + 'static>(&self, key: &CacheKey) -> Option<Arc<T>> {
        self.get_entry(key)?.downcast::<T>()
    }

    /// Insert or overwrite `key`, stamping the current time.
    pub fn set<T: Send + Sync + 'static>(
        &self,
        key: CacheKey,
        value: T,
        ttl: Option<Duration>,
        priority: Priority,
    ) {
        self.set_erased(key, Arc::new(value), type_name::<T>(), ttl, priority);
    }

    pub(crate) fn set_erased(
        &self,
        key: CacheKey,
        value: ErasedValue,
        type_name: &'static str,
        ttl: Option<Duration>,
        priority: Priority,
    ) {
        let entry = CacheEntry {
            value,
            type_name,
            written_at: Instant::now(),
            ttl: ttl.unwrap_or(self.default_ttl),
            priority,
        };

        let evicted = mutex_lock(&self.entries, SOURCE, "set").push(key.clone(), entry);
        if let Some((evicted_key, _)) = evicted
            && evicted_key != key
        {
            debug!(key = %evicted_key, "Cache entry evicted for capacity");
            counter!(METRIC_CACHE_EVICT_TOTAL).increment(1);
        }
    }

    /// Write only if no `clear()` happened since `generation` was observed.
    ///
    /// Returns whether the value was stored.
    pub(crate) fn set_if_generation(
        &self,
        generation: Generation,
        key: CacheKey,
        value: ErasedValue,
        type_name: &'static str,
        ttl: Option<Duration>,
        priority: Priority,
    ) -> bool {
        if self.generation() != generation {
            return false;
        }
        self.set_erased(key, value, type_name, ttl, priority);
        true
    }

    /// Remove the matching key or keys. Returns how many entries were removed.
    pub fn invalidate(&self, target: &Invalidation) -> usize {
        let mut entries = mutex_lock(&self.entries, SOURCE, "invalidate");
        match target {
            Invalidation::Exact(key) => usize::from(entries.pop(key).is_some()),
            Invalidation::Pattern(_) | Invalidation::Pages(_) => {
                let matching: Vec<CacheKey> = entries
                    .iter()
                    .filter(|(key, _)| target.matches(key))
                    .map(|(key, _)| key.clone())
                    .collect();
                for key in &matching {
                    entries.pop(key);
                }
                matching.len()
            }
        }
    }

    /// Remove every entry and start a new session generation.
    pub fn clear(&self) {
        let mut entries = mutex_lock(&self.entries, SOURCE, "clear");
        self.generation.fetch_add(1, Ordering::SeqCst);
        entries.clear();
    }

    /// Snapshot of the currently cached keys, most recently used first.
    pub fn keys(&self) -> Vec<CacheKey> {
        mutex_lock(&self.entries, SOURCE, "keys")
            .iter()
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new(&CacheConfig::default())
    }
}
