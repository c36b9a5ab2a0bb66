//! Request coordinator.
//!
//! Serves fresh entries from the [`CacheStore`] and otherwise runs exactly one
//! fetch per key at a time. Concurrent callers for the same key join the
//! in-flight fetch and all observe its single result.

use std::any::type_name;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use metrics::{counter, histogram};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use super::error::FetchError;
use super::keys::CacheKey;
use super::prefetch::{BackgroundTurn, PrefetchTask};
use super::priority::{Priority, PriorityScheduler};
use super::store::{CacheStore, ErasedValue, Generation};

const METRIC_CACHE_HIT_TOTAL: &str = "marketsync_cache_hit_total";
const METRIC_CACHE_MISS_TOTAL: &str = "marketsync_cache_miss_total";
const METRIC_CACHE_DEDUP_JOIN_TOTAL: &str = "marketsync_cache_dedup_join_total";
const METRIC_FETCH_ERROR_TOTAL: &str = "marketsync_fetch_error_total";
const METRIC_FETCH_MS: &str = "marketsync_fetch_ms";

/// Type-erased fetch future as stored in the pending table.
pub type ErasedFetch = BoxFuture<'static, Result<ErasedValue, FetchError>>;

type SharedFetch = Shared<ErasedFetch>;

/// Per-call fetch options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchOptions {
    /// Freshness window for the value this fetch writes; store default if `None`.
    pub ttl: Option<Duration>,
    pub priority: Priority,
    /// Ignore any cached entry and go to the network (still deduplicated).
    pub skip_cache: bool,
    /// On a stale hit, return the stale value and refresh in the background.
    pub revalidate_stale: bool,
}

impl FetchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn skip_cache(mut self, skip_cache: bool) -> Self {
        self.skip_cache = skip_cache;
        self
    }

    pub fn revalidate_stale(mut self, revalidate_stale: bool) -> Self {
        self.revalidate_stale = revalidate_stale;
        self
    }
}

/// An in-flight fetch registered under its key.
struct PendingRequest {
    episode: u64,
    future: SharedFetch,
}

type Settle = oneshot::Sender<Result<ErasedValue, FetchError>>;

/// Everything a spawned episode needs besides the fetch itself.
struct Episode {
    id: u64,
    generation: Generation,
    type_name: &'static str,
    options: FetchOptions,
    settle: Settle,
    turn: Option<BackgroundTurn>,
}

/// Deduplicating front door to the data service.
pub struct RequestCoordinator {
    store: Arc<CacheStore>,
    pending: Arc<DashMap<CacheKey, PendingRequest>>,
    scheduler: PriorityScheduler,
    episodes: AtomicU64,
}

impl RequestCoordinator {
    pub fn new(store: Arc<CacheStore>, scheduler: PriorityScheduler) -> Self {
        Self {
            store,
            pending: Arc::new(DashMap::new()),
            scheduler,
            episodes: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn scheduler(&self) -> &PriorityScheduler {
        &self.scheduler
    }

    /// Fetch `key`, reusing a fresh cached value or an in-flight request.
    ///
    /// `fetch_fn` is only invoked when this call starts a new miss episode.
    pub async fn fetch<T, F, Fut>(
        &self,
        key: &CacheKey,
        fetch_fn: F,
        options: FetchOptions,
    ) -> Result<Arc<T>, FetchError>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        let value = self
            .fetch_erased(key, move || erase(fetch_fn()), type_name::<T>(), options)
            .await?;
        downcast(key, value)
    }

    /// Untyped core of [`fetch`](Self::fetch).
    #[instrument(skip_all, fields(key = %key, priority = %options.priority))]
    pub(crate) async fn fetch_erased<M>(
        &self,
        key: &CacheKey,
        make: M,
        type_name: &'static str,
        options: FetchOptions,
    ) -> Result<ErasedValue, FetchError>
    where
        M: FnOnce() -> ErasedFetch,
    {
        if !options.skip_cache
            && let Some(entry) = self.store.get_entry(key)
        {
            if entry.is_fresh() {
                debug!("Cache hit");
                counter!(METRIC_CACHE_HIT_TOTAL).increment(1);
                return Ok(entry.value);
            }
            if options.revalidate_stale {
                debug!(age_ms = entry.age().as_millis() as u64, "Serving stale entry; revalidating");
                counter!(METRIC_CACHE_HIT_TOTAL).increment(1);
                self.revalidate(key, make, type_name, options);
                return Ok(entry.value);
            }
        }

        if let Some(in_flight) = self.join_in_flight(key) {
            return in_flight.await;
        }

        let turn = self.scheduler.admit(options.priority).await?;
        self.fetch_admitted(key, make, type_name, options, turn).await
    }

    /// Miss path for a request that is allowed to start.
    ///
    /// `turn` is the background slot a LOW caller was granted; it is held
    /// until the episode settles.
    pub(crate) async fn fetch_admitted<M>(
        &self,
        key: &CacheKey,
        make: M,
        type_name: &'static str,
        options: FetchOptions,
        turn: Option<BackgroundTurn>,
    ) -> Result<ErasedValue, FetchError>
    where
        M: FnOnce() -> ErasedFetch,
    {
        // Admission may have suspended; another caller could have filled the gap.
        if !options.skip_cache
            && let Some(entry) = self.store.get_entry(key)
            && entry.is_fresh()
        {
            counter!(METRIC_CACHE_HIT_TOTAL).increment(1);
            return Ok(entry.value);
        }

        self.join_or_start(key, make, type_name, options, turn).await
    }

    /// Start a background refresh of a stale entry.
    fn revalidate<M>(&self, key: &CacheKey, make: M, type_name: &'static str, options: FetchOptions)
    where
        M: FnOnce() -> ErasedFetch,
    {
        if options.priority == Priority::Low {
            let task = PrefetchTask::erased(key.clone(), make(), type_name, options.ttl);
            self.scheduler.background().push_task(task);
            return;
        }
        // The spawned fetch settles on its own; nobody needs to await it here.
        drop(self.join_or_start(key, make, type_name, options, None));
    }

    fn join_in_flight(&self, key: &CacheKey) -> Option<SharedFetch> {
        let pending = self.pending.get(key)?;
        debug!(episode = pending.episode, "Joining in-flight fetch");
        counter!(METRIC_CACHE_DEDUP_JOIN_TOTAL).increment(1);
        Some(pending.future.clone())
    }

    /// Join the in-flight fetch for `key` or start a new miss episode.
    ///
    /// The episode is registered before `make` runs, and `make` runs with no
    /// shard of the pending table locked.
    fn join_or_start<M>(
        &self,
        key: &CacheKey,
        make: M,
        type_name: &'static str,
        options: FetchOptions,
        turn: Option<BackgroundTurn>,
    ) -> SharedFetch
    where
        M: FnOnce() -> ErasedFetch,
    {
        let (episode, generation, settle, future) = match self.pending.entry(key.clone()) {
            Entry::Occupied(occupied) => {
                debug!(episode = occupied.get().episode, "Joining in-flight fetch");
                counter!(METRIC_CACHE_DEDUP_JOIN_TOTAL).increment(1);
                return occupied.get().future.clone();
            }
            Entry::Vacant(vacant) => {
                let episode = self.episodes.fetch_add(1, Ordering::SeqCst);
                let generation = self.store.generation();
                let (settle, future) = self.settlement(key.clone(), episode);
                vacant.insert(PendingRequest {
                    episode,
                    future: future.clone(),
                });
                (episode, generation, settle, future)
            }
        };

        debug!(episode, "Cache miss; starting fetch");
        counter!(METRIC_CACHE_MISS_TOTAL).increment(1);
        self.spawn_episode(
            key.clone(),
            Episode {
                id: episode,
                generation,
                type_name,
                options,
                settle,
                turn,
            },
            make(),
        );
        future
    }

    /// The shared future every awaiter of one episode polls.
    fn settlement(&self, key: CacheKey, episode: u64) -> (Settle, SharedFetch) {
        let (settle, settled) = oneshot::channel();
        let pending = Arc::clone(&self.pending);
        let future = async move {
            settled.await.unwrap_or_else(|_| {
                pending.remove_if(&key, |_, request| request.episode == episode);
                Err(FetchError::Aborted("fetch task ended without a result".into()))
            })
        }
        .boxed()
        .shared();
        (settle, future)
    }

    /// Drive `fetch` on its own task so it settles even if every caller goes away.
    ///
    /// The store write and the pending-table removal both happen before the
    /// result reaches any awaiter.
    fn spawn_episode(&self, key: CacheKey, episode: Episode, fetch: ErasedFetch) {
        let store = Arc::clone(&self.store);
        let pending = Arc::clone(&self.pending);

        tokio::spawn(async move {
            let Episode {
                id,
                generation,
                type_name,
                options,
                settle,
                turn,
            } = episode;

            let started_at = Instant::now();
            let result = fetch.await;
            histogram!(METRIC_FETCH_MS, "priority" => options.priority.as_str())
                .record(started_at.elapsed().as_secs_f64() * 1000.0);

            let result = match result {
                Ok(value) => {
                    let stored = store.set_if_generation(
                        generation,
                        key.clone(),
                        Arc::clone(&value),
                        type_name,
                        options.ttl,
                        options.priority,
                    );
                    if stored {
                        Ok(value)
                    } else {
                        debug!(key = %key, episode = id, "Session cleared during fetch; result dropped");
                        Err(FetchError::SessionCleared)
                    }
                }
                Err(error) => {
                    warn!(key = %key, episode = id, error = %error, "Fetch failed");
                    counter!(METRIC_FETCH_ERROR_TOTAL, "kind" => error.kind()).increment(1);
                    Err(error)
                }
            };

            pending.remove_if(&key, |_, request| request.episode == id);
            // Every awaiter may be gone already.
            let _ = settle.send(result);
            drop(turn);
        });
    }

    /// Number of keys with a fetch in flight.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, key: &CacheKey) -> bool {
        self.pending.contains_key(key)
    }

    /// Session teardown: wipe the store and forget every in-flight fetch.
    ///
    /// Fetches already running still settle, but their results are not cached.
    pub fn clear(&self) {
        self.store.clear();
        self.pending.clear();
    }
}

/// Box a typed fetch future into the erased form kept in the pending table.
pub(crate) fn erase<T, Fut>(future: Fut) -> ErasedFetch
where
    T: Send + Sync + 'static,
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
{
    async move { future.await.map(|value| Arc::new(value) as ErasedValue) }.boxed()
}

pub(crate) fn downcast<T: Send + Sync + 'static>(
    key: &CacheKey,
    value: ErasedValue,
) -> Result<Arc<T>, FetchError> {
    value.downcast::<T>().map_err(|_| FetchError::TypeMismatch {
        key: key.to_string(),
        expected: type_name::<T>(),
    })
}
