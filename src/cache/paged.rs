//! Paginated query handle for infinite-scroll lists.
//!
//! Each page is cached under the list's base key plus `offset=`/`limit=`
//! qualifiers, so pages share deduplication and freshness with every other
//! reader of the same page.

use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::coordinator::{FetchOptions, RequestCoordinator};
use super::error::FetchError;
use super::events::{InvalidationBus, InvalidationSource};
use super::keys::{CacheKey, Invalidation};
use super::lock::mutex_lock;

const SOURCE: &str = "cache::paged";

type PageFn<T> =
    Arc<dyn Fn(usize, usize) -> BoxFuture<'static, Result<Vec<T>, FetchError>> + Send + Sync>;

/// Render-ready snapshot of a paginated list.
#[derive(Debug, Clone)]
pub struct PagedState<T> {
    /// Every item loaded so far, in page order.
    pub items: Vec<T>,
    /// False once a page came back shorter than the page size.
    pub has_more: bool,
    pub loading: bool,
    pub error: Option<FetchError>,
    /// Offset of the next page `load_more` will request.
    pub next_offset: usize,
    epoch: u64,
}

impl<T> PagedState<T> {
    fn empty() -> Self {
        Self {
            items: Vec::new(),
            has_more: true,
            loading: false,
            error: None,
            next_offset: 0,
            epoch: 0,
        }
    }
}

struct PagedInner<T> {
    coordinator: Arc<RequestCoordinator>,
    bus: Arc<InvalidationBus>,
    base_key: CacheKey,
    fetch: PageFn<T>,
    limit: usize,
    options: FetchOptions,
    state: watch::Sender<PagedState<T>>,
}

impl<T: Clone + Send + Sync + 'static> PagedInner<T> {
    fn page_key(&self, offset: usize) -> Result<CacheKey, FetchError> {
        self.base_key
            .page(offset, self.limit)
            .map_err(|error| FetchError::Aborted(error.to_string().into()))
    }

    async fn load_page(self: Arc<Self>, epoch: u64, offset: usize, skip_cache: bool) {
        let result = match self.page_key(offset) {
            Ok(key) => {
                let fetch = Arc::clone(&self.fetch);
                let limit = self.limit;
                self.coordinator
                    .fetch(
                        &key,
                        move || fetch(offset, limit),
                        self.options.skip_cache(skip_cache),
                    )
                    .await
            }
            Err(error) => Err(error),
        };

        self.state.send_if_modified(|state| {
            if state.epoch != epoch {
                return false;
            }
            state.loading = false;
            match result {
                Ok(page) => {
                    debug!(
                        key = %self.base_key,
                        offset,
                        received = page.len(),
                        "Page loaded"
                    );
                    state.has_more = page.len() >= self.limit;
                    state.items.extend(page.iter().cloned());
                    state.next_offset = offset + self.limit;
                    state.error = None;
                }
                Err(error) => {
                    warn!(key = %self.base_key, offset, error = %error, "Page load failed");
                    state.error = Some(error);
                }
            }
            true
        });
    }
}

/// Observed paginated fetch.
pub struct PagedQuery<T> {
    inner: Arc<PagedInner<T>>,
    rx: watch::Receiver<PagedState<T>>,
    observer: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Clone + Send + Sync + 'static> PagedQuery<T> {
    /// Mount the list and start loading page zero.
    ///
    /// `fetch_fn` receives `(offset, limit)`. A `limit` of zero is treated as one.
    /// Must be called from within a tokio runtime.
    pub fn mount<F, Fut>(
        coordinator: Arc<RequestCoordinator>,
        bus: Arc<InvalidationBus>,
        base_key: CacheKey,
        fetch_fn: F,
        limit: usize,
        options: FetchOptions,
    ) -> Self
    where
        F: Fn(usize, usize) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<T>, FetchError>> + Send + 'static,
    {
        let (state, rx) = watch::channel(PagedState::empty());
        let fetch: PageFn<T> = Arc::new(move |offset, limit| fetch_fn(offset, limit).boxed());

        let query = Self {
            inner: Arc::new(PagedInner {
                coordinator,
                bus,
                base_key,
                fetch,
                limit: limit.max(1),
                options,
                state,
            }),
            rx,
            observer: Mutex::new(None),
        };
        query.load_more();
        query
    }

    /// Request the next page.
    ///
    /// Returns `false` without doing anything while a page is in flight or
    /// once the list is exhausted.
    pub fn load_more(&self) -> bool {
        let mut next = None;
        self.inner.state.send_if_modified(|state| {
            if state.loading || !state.has_more {
                return false;
            }
            state.loading = true;
            next = Some((state.epoch, state.next_offset));
            true
        });

        let Some((epoch, offset)) = next else {
            debug!(key = %self.inner.base_key, "load_more skipped");
            return false;
        };
        self.spawn(epoch, offset, self.inner.options.skip_cache);
        true
    }

    /// Discard every loaded item and refetch page zero from the network.
    ///
    /// This list's cached pages are dropped too, at any page size, so
    /// scrolling after a refresh never splices old pages onto new ones. Other
    /// keys under the same base are left alone.
    pub fn refresh(&self) {
        let mut epoch = 0;
        self.inner.state.send_modify(|state| {
            *state = PagedState {
                epoch: state.epoch + 1,
                loading: true,
                ..PagedState::empty()
            };
            epoch = state.epoch;
        });

        let dropped = self.inner.bus.invalidate(
            Invalidation::Pages(self.inner.base_key.clone()),
            InvalidationSource::Refresh,
        );
        debug!(key = %self.inner.base_key, dropped, "Paged query refreshed");

        self.spawn(epoch, 0, true);
    }

    fn spawn(&self, epoch: u64, offset: usize, skip_cache: bool) {
        let task = tokio::spawn(Arc::clone(&self.inner).load_page(epoch, offset, skip_cache));
        if let Some(previous) = mutex_lock(&self.observer, SOURCE, "spawn").replace(task) {
            previous.abort();
        }
    }

    pub fn base_key(&self) -> &CacheKey {
        &self.inner.base_key
    }

    pub fn limit(&self) -> usize {
        self.inner.limit
    }

    pub fn state(&self) -> PagedState<T> {
        self.rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PagedState<T>> {
        self.rx.clone()
    }

    /// Wait until no page is in flight and return that snapshot.
    pub async fn settled(&self) -> PagedState<T> {
        let mut rx = self.rx.clone();
        let settled = match rx.wait_for(|state| !state.loading).await {
            Ok(state) => state.clone(),
            Err(_) => self.state(),
        };
        settled
    }
}

impl<T> Drop for PagedQuery<T> {
    fn drop(&mut self) {
        if let Some(observer) = mutex_lock(&self.observer, SOURCE, "drop").take() {
            observer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::Notify;

    use super::*;
    use crate::cache::config::CacheConfig;
    use crate::cache::priority::{Priority, PriorityScheduler};
    use crate::cache::store::CacheStore;

    fn coordinator() -> Arc<RequestCoordinator> {
        let store = Arc::new(CacheStore::new(&CacheConfig::default()));
        Arc::new(RequestCoordinator::new(store, PriorityScheduler::default()))
    }

    fn bus_for(coordinator: &Arc<RequestCoordinator>) -> Arc<InvalidationBus> {
        Arc::new(InvalidationBus::new(Arc::clone(coordinator.store()), 16))
    }

    fn mount<T, F, Fut>(
        coordinator: Arc<RequestCoordinator>,
        base_key: CacheKey,
        fetch_fn: F,
        limit: usize,
    ) -> PagedQuery<T>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(usize, usize) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<T>, FetchError>> + Send + 'static,
    {
        let bus = bus_for(&coordinator);
        PagedQuery::mount(coordinator, bus, base_key, fetch_fn, limit, FetchOptions::new())
    }

    fn key(raw: &str) -> CacheKey {
        raw.parse().expect("valid key")
    }

    /// A backend holding `total` sequential items.
    fn backend(
        total: usize,
        calls: Arc<AtomicUsize>,
    ) -> impl Fn(usize, usize) -> BoxFuture<'static, Result<Vec<usize>, FetchError>>
    + Send
    + Sync
    + 'static {
        move |offset, limit| {
            calls.fetch_add(1, Ordering::SeqCst);
            let end = (offset + limit).min(total);
            async move { Ok((offset..end).collect()) }.boxed()
        }
    }

    #[tokio::test]
    async fn pages_accumulate_until_short_page() {
        let calls = Arc::new(AtomicUsize::new(0));
        let list = mount(
            coordinator(),
            key("explore:listings:all"),
            backend(5, Arc::clone(&calls)),
            2,
        );

        assert_eq!(list.settled().await.items, vec![0, 1]);
        assert!(list.load_more());
        assert_eq!(list.settled().await.items, vec![0, 1, 2, 3]);
        assert!(list.load_more());

        let state = list.settled().await;
        assert_eq!(state.items, vec![0, 1, 2, 3, 4]);
        assert!(!state.has_more);
        assert!(!list.load_more());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exactly_full_page_keeps_has_more() {
        let list = mount(
            coordinator(),
            key("explore:events:all"),
            backend(4, Arc::new(AtomicUsize::new(0))),
            2,
        );
        list.settled().await;
        list.load_more();
        assert!(list.settled().await.has_more);

        list.load_more();
        let state = list.settled().await;
        assert!(state.items.len() == 4 && !state.has_more);
    }

    #[tokio::test]
    async fn load_more_is_ignored_while_in_flight() {
        let release = Arc::new(Notify::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let list = {
            let release = Arc::clone(&release);
            let calls = Arc::clone(&calls);
            mount(
                coordinator(),
                key("explore:forum_posts:hot"),
                move |offset: usize, limit: usize| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let release = Arc::clone(&release);
                    async move {
                        release.notified().await;
                        Ok((offset..offset + limit).collect::<Vec<usize>>())
                    }
                },
                3,
            )
        };

        assert!(!list.load_more());
        assert!(!list.load_more());
        release.notify_one();

        assert_eq!(list.settled().await.items, vec![0, 1, 2]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refresh_discards_items_and_refetches_first_page() {
        let coordinator = coordinator();
        let calls = Arc::new(AtomicUsize::new(0));
        let list = mount(
            Arc::clone(&coordinator),
            key("owned:listings"),
            backend(10, Arc::clone(&calls)),
            4,
        );
        list.settled().await;
        list.load_more();
        assert_eq!(list.settled().await.items.len(), 8);

        list.refresh();
        let refreshing = list.state();
        assert!(refreshing.items.is_empty());
        assert!(refreshing.loading);

        let state = list.settled().await;
        assert_eq!(state.items, vec![0, 1, 2, 3]);
        assert_eq!(state.next_offset, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(
            coordinator
                .store()
                .get_entry(&key("owned:listings:offset=4:limit=4"))
                .is_none()
        );
    }

    #[tokio::test]
    async fn failed_page_keeps_items_and_can_retry() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let list = {
            let attempts = Arc::clone(&attempts);
            mount(
                coordinator(),
                key("home:events:upcoming"),
                move |offset: usize, limit: usize| {
                    let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if attempt == 1 {
                            Err(FetchError::network("timeout"))
                        } else {
                            Ok((offset..offset + limit).collect::<Vec<usize>>())
                        }
                    }
                },
                2,
            )
        };
        list.settled().await;

        list.load_more();
        let failed = list.settled().await;
        assert_eq!(failed.items, vec![0, 1]);
        assert_eq!(failed.error, Some(FetchError::network("timeout")));

        assert!(list.load_more());
        let recovered = list.settled().await;
        assert_eq!(recovered.items, vec![0, 1, 2, 3]);
        assert!(recovered.error.is_none());
    }

    #[tokio::test]
    async fn refresh_keeps_sibling_keys_and_is_recorded() {
        let coordinator = coordinator();
        let bus = bus_for(&coordinator);
        let store = Arc::clone(coordinator.store());
        let siblings = [
            key("explore:listings:make=mazda"),
            key("explore:listings:featured"),
            key("explore:listings:featured:offset=0:limit=3"),
        ];
        for sibling in &siblings {
            store.set(sibling.clone(), 1_u8, None, Priority::High);
        }

        let list = PagedQuery::mount(
            Arc::clone(&coordinator),
            Arc::clone(&bus),
            key("explore:listings"),
            backend(10, Arc::new(AtomicUsize::new(0))),
            3,
            FetchOptions::new(),
        );
        list.settled().await;
        list.refresh();
        list.settled().await;

        for sibling in &siblings {
            assert!(store.get_entry(sibling).is_some(), "{sibling} was dropped");
        }
        let recorded = bus.recent();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].source, InvalidationSource::Refresh);
        assert_eq!(recorded[0].removed, 1);
        assert_eq!(
            recorded[0].target,
            Invalidation::Pages(key("explore:listings"))
        );
    }
}
