//! Session-scoped cache facade.
//!
//! One [`CacheClient`] is built per signed-in session and handed to every
//! screen. Logging out calls [`CacheClient::clear`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::info;

use super::config::CacheConfig;
use super::coordinator::{FetchOptions, RequestCoordinator};
use super::error::FetchError;
use super::events::{InvalidationBus, InvalidationEvent, InvalidationSource, Mutation};
use super::keys::{CacheKey, Domain, Invalidation};
use super::live::{
    ChangeNotification, LiveUpdateBridge, PushChannel, PushChannelError, Subscription, Topic,
};
use super::paged::PagedQuery;
use super::prefetch::{BackgroundPrefetcher, PrefetchTask};
use super::priority::{Priority, PriorityScheduler, StartupGate};
use super::query::Query;
use super::store::CacheStore;

/// Point-in-time counters for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub max_entries: usize,
    pub pending_fetches: usize,
    pub queued_prefetches: usize,
    pub prefetch_running: bool,
    pub active_subscriptions: usize,
    pub startup_gate_open: bool,
    pub generation: u64,
    pub recent_invalidations: usize,
}

pub struct CacheClient {
    config: CacheConfig,
    coordinator: Arc<RequestCoordinator>,
    prefetcher: BackgroundPrefetcher,
    bus: Arc<InvalidationBus>,
    bridge: LiveUpdateBridge,
}

impl CacheClient {
    pub fn new(config: CacheConfig, channel: Arc<dyn PushChannel>) -> Self {
        let store = Arc::new(CacheStore::new(&config));
        let scheduler = PriorityScheduler::new(StartupGate::new());
        let coordinator = Arc::new(RequestCoordinator::new(Arc::clone(&store), scheduler));
        let prefetcher = BackgroundPrefetcher::new(Arc::clone(&coordinator), config.prefetch_delay());
        let bus = Arc::new(InvalidationBus::new(store, config.invalidation_log_capacity));
        let bridge = LiveUpdateBridge::new(channel, Arc::clone(&bus));

        Self {
            config,
            coordinator,
            prefetcher,
            bus,
            bridge,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &Arc<RequestCoordinator> {
        &self.coordinator
    }

    /// Fresh cached value, or the single shared result of `fetch_fn`.
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
        self.coordinator.fetch(key, fetch_fn, options).await
    }

    /// Write a value directly, e.g. an optimistic update after a mutation.
    pub fn set_cache<T: Send + Sync + 'static>(&self, key: CacheKey, value: T, ttl: Option<Duration>) {
        self.coordinator
            .store()
            .set(key, value, ttl, Priority::High);
    }

    /// Cached value regardless of age. `None` when absent or of another type.
    pub fn get_cache<T: Send + Sync + 'static>(&self, key: &CacheKey) -> Option<Arc<T>> {
        self.coordinator.store().get::<T>(key)
    }

    /// Remove one key or every key matching a pattern. Returns how many were removed.
    pub fn invalidate_cache(&self, target: impl Into<Invalidation>) -> usize {
        self.bus.invalidate(target, InvalidationSource::Manual)
    }

    /// Invalidate everything a successful write made stale.
    pub fn apply_mutation(&self, mutation: &Mutation) -> usize {
        self.bus.apply(mutation)
    }

    pub fn recent_invalidations(&self) -> Vec<InvalidationEvent> {
        self.bus.recent()
    }

    /// Queue a low-priority background fetch. Returns `false` if `key` is already queued.
    pub fn prefetch<T, F, Fut>(&self, key: CacheKey, fetch_fn: F, ttl: Option<Duration>) -> bool
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        self.prefetcher.add_task(PrefetchTask::new(key, fetch_fn, ttl))
    }

    /// Release low-priority work once the critical startup data has resolved.
    pub fn mark_critical_loaded(&self) {
        self.coordinator.scheduler().gate().open();
    }

    /// Start draining the prefetch queue. Tasks wait for [`mark_critical_loaded`](Self::mark_critical_loaded).
    pub fn start_background(&self) {
        self.prefetcher.start();
    }

    /// Stop the prefetch worker and drop its queue.
    pub fn stop_background(&self) {
        self.prefetcher.stop();
    }

    /// Listen for changes to a domain, or to one entity when `entity_id` is set.
    ///
    /// Matching cache entries are invalidated before `callback` runs. Keep the
    /// returned handle for as long as the callback should fire.
    pub fn subscribe_to_domain_change<C>(
        &self,
        domain: Domain,
        entity_id: Option<String>,
        callback: C,
    ) -> Result<Subscription, PushChannelError>
    where
        C: Fn(&ChangeNotification) + Send + Sync + 'static,
    {
        let topic = match entity_id {
            Some(entity_id) => Topic::entity(domain, entity_id),
            None => Topic::domain(domain),
        };
        self.bridge.subscribe(topic, callback)
    }

    /// Mount a single-fetch query.
    pub fn query<T, F, Fut>(
        &self,
        key: CacheKey,
        fetch_fn: F,
        options: FetchOptions,
        enabled: bool,
    ) -> Query<T>
    where
        T: Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        Query::mount(Arc::clone(&self.coordinator), key, fetch_fn, options, enabled)
    }

    /// Mount a paginated query and load its first page.
    pub fn paged<T, F, Fut>(
        &self,
        base_key: CacheKey,
        fetch_fn: F,
        limit: usize,
        options: FetchOptions,
    ) -> PagedQuery<T>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(usize, usize) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<T>, FetchError>> + Send + 'static,
    {
        PagedQuery::mount(
            Arc::clone(&self.coordinator),
            Arc::clone(&self.bus),
            base_key,
            fetch_fn,
            limit,
            options,
        )
    }

    /// Session teardown. Wipes every entry, forgets in-flight fetches and
    /// drops queued prefetches. Subscriptions stay with their owners.
    pub fn clear(&self) {
        self.prefetcher.stop();
        self.coordinator.clear();
        info!("Cache session cleared");
    }

    pub fn stats(&self) -> CacheStats {
        let store = self.coordinator.store();
        CacheStats {
            entries: store.len(),
            max_entries: self.config.max_entries_non_zero().get(),
            pending_fetches: self.coordinator.pending_count(),
            queued_prefetches: self.prefetcher.len(),
            prefetch_running: self.prefetcher.is_running(),
            active_subscriptions: self.bridge.active_subscriptions(),
            startup_gate_open: self.coordinator.scheduler().gate().is_open(),
            generation: store.generation(),
            recent_invalidations: self.bus.recent().len(),
        }
    }
}
