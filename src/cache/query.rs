//! Single-fetch query handle.
//!
//! A [`Query`] is what a screen holds for one keyed resource. It publishes
//! render-ready state through a `watch` channel and stops observing when
//! dropped. The underlying fetch is owned by the coordinator and keeps
//! running for any other observer.

use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use super::coordinator::{FetchOptions, RequestCoordinator};
use super::error::FetchError;
use super::keys::CacheKey;
use super::lock::mutex_lock;

const SOURCE: &str = "cache::query";

type QueryFn<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T, FetchError>> + Send + Sync>;

/// Render-ready snapshot of a query.
#[derive(Debug)]
pub struct QueryState<T> {
    /// Last successfully loaded value. Survives failed refreshes.
    pub data: Option<Arc<T>>,
    pub loading: bool,
    /// Error from the most recent load, cleared by the next success.
    pub error: Option<FetchError>,
    epoch: u64,
}

impl<T> QueryState<T> {
    fn idle(data: Option<Arc<T>>) -> Self {
        Self {
            data,
            loading: false,
            error: None,
            epoch: 0,
        }
    }
}

impl<T> Clone for QueryState<T> {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            loading: self.loading,
            error: self.error.clone(),
            epoch: self.epoch,
        }
    }
}

struct QueryInner<T> {
    coordinator: Arc<RequestCoordinator>,
    key: CacheKey,
    fetch: QueryFn<T>,
    options: FetchOptions,
    state: watch::Sender<QueryState<T>>,
}

impl<T: Send + Sync + 'static> QueryInner<T> {
    async fn load(self: Arc<Self>, epoch: u64, skip_cache: bool) {
        let fetch = Arc::clone(&self.fetch);
        let result = self
            .coordinator
            .fetch(
                &self.key,
                move || fetch(),
                self.options.skip_cache(skip_cache),
            )
            .await;

        self.state.send_if_modified(|state| {
            if state.epoch != epoch {
                return false;
            }
            state.loading = false;
            match result {
                Ok(data) => {
                    state.data = Some(data);
                    state.error = None;
                }
                Err(error) => {
                    debug!(key = %self.key, error = %error, "Query load failed; keeping previous data");
                    state.error = Some(error);
                }
            }
            true
        });
    }
}

/// Observed single-key fetch.
pub struct Query<T> {
    inner: Arc<QueryInner<T>>,
    rx: watch::Receiver<QueryState<T>>,
    enabled: bool,
    observer: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + Sync + 'static> Query<T> {
    /// Mount the query. When `enabled`, the first load starts immediately and
    /// any cached value for `key` is shown while it runs.
    ///
    /// Must be called from within a tokio runtime.
    pub fn mount<F, Fut>(
        coordinator: Arc<RequestCoordinator>,
        key: CacheKey,
        fetch_fn: F,
        options: FetchOptions,
        enabled: bool,
    ) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        let cached = if enabled {
            coordinator.store().get::<T>(&key)
        } else {
            None
        };
        let (state, rx) = watch::channel(QueryState::idle(cached));
        let fetch: QueryFn<T> = Arc::new(move || fetch_fn().boxed());

        let query = Self {
            inner: Arc::new(QueryInner {
                coordinator,
                key,
                fetch,
                options,
                state,
            }),
            rx,
            enabled,
            observer: Mutex::new(None),
        };
        if enabled {
            query.start(options.skip_cache);
        }
        query
    }

    /// Refetch bypassing the cache. No-op when the query is disabled.
    pub fn refresh(&self) {
        if self.enabled {
            self.start(true);
        }
    }

    fn start(&self, skip_cache: bool) {
        let mut epoch = 0;
        self.inner.state.send_modify(|state| {
            state.epoch += 1;
            state.loading = true;
            epoch = state.epoch;
        });

        let task = tokio::spawn(Arc::clone(&self.inner).load(epoch, skip_cache));
        if let Some(previous) = mutex_lock(&self.observer, SOURCE, "start").replace(task) {
            previous.abort();
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.inner.key
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Current snapshot.
    pub fn state(&self) -> QueryState<T> {
        self.rx.borrow().clone()
    }

    /// Receiver that wakes on every state change.
    pub fn subscribe(&self) -> watch::Receiver<QueryState<T>> {
        self.rx.clone()
    }

    /// Wait until no load is in flight and return that snapshot.
    pub async fn settled(&self) -> QueryState<T> {
        let mut rx = self.rx.clone();
        let settled = match rx.wait_for(|state| !state.loading).await {
            Ok(state) => state.clone(),
            Err(_) => self.state(),
        };
        settled
    }
}

impl<T> Drop for Query<T> {
    fn drop(&mut self) {
        if let Some(observer) = mutex_lock(&self.observer, SOURCE, "drop").take() {
            observer.abort();
        }
    }
}
