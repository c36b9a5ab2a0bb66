//! Background prefetch queue.
//!
//! Everything that runs at low priority goes through one queue drained by a
//! single worker: queued prefetch tasks and LOW fetches waiting for their
//! turn. Jobs run one at a time with a fixed pause between them, and only
//! after the startup gate has opened.

use std::any::type_name;
use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use metrics::counter;
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::coordinator::{ErasedFetch, FetchOptions, RequestCoordinator, erase};
use super::error::FetchError;
use super::keys::CacheKey;
use super::lock::mutex_lock;
use super::priority::Priority;

const SOURCE: &str = "cache::prefetch";
const METRIC_PREFETCH_TOTAL: &str = "marketsync_prefetch_total";

/// A queued background fetch. Consumed exactly once.
pub struct PrefetchTask {
    pub key: CacheKey,
    pub ttl: Option<Duration>,
    type_name: &'static str,
    fetch: Box<dyn FnOnce() -> ErasedFetch + Send>,
}

impl PrefetchTask {
    pub fn new<T, F, Fut>(key: CacheKey, fetch_fn: F, ttl: Option<Duration>) -> Self
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        Self {
            key,
            ttl,
            type_name: type_name::<T>(),
            fetch: Box::new(move || erase(fetch_fn())),
        }
    }

    /// Wrap a fetch future that has already been built.
    pub(crate) fn erased(
        key: CacheKey,
        fetch: ErasedFetch,
        type_name: &'static str,
        ttl: Option<Duration>,
    ) -> Self {
        Self {
            key,
            ttl,
            type_name,
            fetch: Box::new(move || fetch),
        }
    }
}

impl std::fmt::Debug for PrefetchTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrefetchTask")
            .field("key", &self.key)
            .field("ttl", &self.ttl)
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

/// Exclusive use of the background slot, granted to one LOW fetch.
///
/// The worker moves on once the turn is dropped.
#[derive(Debug)]
pub(crate) struct BackgroundTurn {
    _release: oneshot::Sender<()>,
}

enum BackgroundJob {
    Prefetch(PrefetchTask),
    Turn(oneshot::Sender<BackgroundTurn>),
}

#[derive(Default)]
struct JobQueue {
    jobs: VecDeque<BackgroundJob>,
    queued: HashSet<CacheKey>,
}

/// Jobs waiting for the background worker, in arrival order.
#[derive(Default)]
pub(crate) struct BackgroundQueue {
    jobs: Mutex<JobQueue>,
    wake: Notify,
}

impl BackgroundQueue {
    /// Queue a prefetch unless one for the same key is already waiting.
    pub(crate) fn push_task(&self, task: PrefetchTask) -> bool {
        {
            let mut queue = mutex_lock(&self.jobs, SOURCE, "push_task");
            if !queue.queued.insert(task.key.clone()) {
                debug!(key = %task.key, "Prefetch already queued; skipped");
                return false;
            }
            queue.jobs.push_back(BackgroundJob::Prefetch(task));
        }
        self.wake.notify_one();
        true
    }

    /// Wait until the worker hands this caller the background slot.
    pub(crate) async fn request_turn(&self) -> Result<BackgroundTurn, FetchError> {
        let (waiter, turn) = oneshot::channel();
        mutex_lock(&self.jobs, SOURCE, "request_turn")
            .jobs
            .push_back(BackgroundJob::Turn(waiter));
        self.wake.notify_one();
        debug!("Low-priority fetch queued for the background worker");

        turn.await
            .map_err(|_| FetchError::Aborted("background queue was cleared".into()))
    }

    fn pop(&self) -> Option<BackgroundJob> {
        let mut queue = mutex_lock(&self.jobs, SOURCE, "pop");
        let job = queue.jobs.pop_front()?;
        if let BackgroundJob::Prefetch(task) = &job {
            queue.queued.remove(&task.key);
        }
        Some(job)
    }

    pub(crate) fn len(&self) -> usize {
        mutex_lock(&self.jobs, SOURCE, "len").jobs.len()
    }

    fn is_queued(&self, key: &CacheKey) -> bool {
        mutex_lock(&self.jobs, SOURCE, "is_queued").queued.contains(key)
    }

    /// Drop every waiting job. LOW fetches still waiting fail with `Aborted`.
    fn clear(&self) {
        let mut queue = mutex_lock(&self.jobs, SOURCE, "clear");
        queue.jobs.clear();
        queue.queued.clear();
    }
}

impl std::fmt::Debug for BackgroundQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundQueue")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

struct PrefetchState {
    coordinator: Arc<RequestCoordinator>,
    queue: Arc<BackgroundQueue>,
    delay: Duration,
}

impl PrefetchState {
    #[instrument(skip_all, fields(key = %task.key))]
    async fn run(&self, task: PrefetchTask) {
        let options = FetchOptions::new().priority(Priority::Low);
        let options = match task.ttl {
            Some(ttl) => options.ttl(ttl),
            None => options,
        };

        // The worker already owns the background slot.
        match self
            .coordinator
            .fetch_admitted(&task.key, task.fetch, task.type_name, options, None)
            .await
        {
            Ok(_) => {
                debug!("Prefetched");
                counter!(METRIC_PREFETCH_TOTAL, "outcome" => "ok").increment(1);
            }
            Err(error) => {
                warn!(error = %error, "Prefetch failed; continuing with next task");
                counter!(METRIC_PREFETCH_TOTAL, "outcome" => "error").increment(1);
            }
        }
    }

    /// Hand the slot to a waiting LOW fetch and block until it is returned.
    async fn grant(&self, waiter: oneshot::Sender<BackgroundTurn>) -> bool {
        let (release, released) = oneshot::channel();
        if waiter.send(BackgroundTurn { _release: release }).is_err() {
            debug!("Low-priority caller left before its turn");
            return false;
        }
        let _ = released.await;
        counter!(METRIC_PREFETCH_TOTAL, "outcome" => "low_fetch").increment(1);
        true
    }

    async fn drain(self: Arc<Self>) {
        self.coordinator.scheduler().gate().wait().await;
        info!(queued = self.queue.len(), "Background prefetch started");

        loop {
            let Some(job) = self.queue.pop() else {
                self.queue.wake.notified().await;
                continue;
            };
            match job {
                BackgroundJob::Prefetch(task) => self.run(task).await,
                BackgroundJob::Turn(waiter) => {
                    if !self.grant(waiter).await {
                        continue;
                    }
                }
            }
            tokio::time::sleep(self.delay).await;
        }
    }
}

/// Single worker draining the [`BackgroundQueue`] shared with the scheduler.
pub struct BackgroundPrefetcher {
    state: Arc<PrefetchState>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BackgroundPrefetcher {
    pub fn new(coordinator: Arc<RequestCoordinator>, delay: Duration) -> Self {
        let queue = Arc::clone(coordinator.scheduler().background());
        Self {
            state: Arc::new(PrefetchState {
                coordinator,
                queue,
                delay,
            }),
            worker: Mutex::new(None),
        }
    }

    /// Queue a task. Returns `false` if a task for the same key is already waiting.
    pub fn add_task(&self, task: PrefetchTask) -> bool {
        self.state.queue.push_task(task)
    }

    /// Spawn the worker. It idles until the startup gate opens.
    pub fn start(&self) {
        let mut worker = mutex_lock(&self.worker, SOURCE, "start");
        if worker.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        *worker = Some(tokio::spawn(Arc::clone(&self.state).drain()));
    }

    /// Abort the worker and drop everything still queued.
    pub fn stop(&self) {
        if let Some(handle) = mutex_lock(&self.worker, SOURCE, "stop").take() {
            handle.abort();
            info!("Background prefetch stopped");
        }
        self.clear();
    }

    pub fn clear(&self) {
        self.state.queue.clear();
    }

    pub fn is_running(&self) -> bool {
        mutex_lock(&self.worker, SOURCE, "is_running")
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn is_queued(&self, key: &CacheKey) -> bool {
        self.state.queue.is_queued(key)
    }

    /// Jobs waiting for the worker, including LOW fetches waiting for a turn.
    pub fn len(&self) -> usize {
        self.state.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for BackgroundPrefetcher {
    fn drop(&mut self) {
        if let Some(handle) = mutex_lock(&self.worker, SOURCE, "drop").take() {
            handle.abort();
        }
    }
}
