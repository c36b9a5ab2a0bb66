//! Live update bridge.
//!
//! Forwards push notifications from the data service into the invalidation
//! bus and on to screen-level callbacks. Each subscription owns one forwarding
//! task that lives exactly as long as its [`Subscription`] handle.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use futures::StreamExt;
use futures::future;
use futures::stream::{self, BoxStream};
use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::events::{InvalidationBus, InvalidationSource};
use super::keys::{Domain, KeyPattern};

/// What happened to the changed row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// One change notification delivered by the push channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotification {
    pub id: Uuid,
    pub domain: Domain,
    pub entity_id: Option<String>,
    pub kind: ChangeKind,
    pub received_at: OffsetDateTime,
}

impl ChangeNotification {
    pub fn new(domain: Domain, kind: ChangeKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            domain,
            entity_id: None,
            kind,
            received_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn for_entity(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }
}

/// What a subscription listens to: a whole domain or one entity within it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic {
    pub domain: Domain,
    pub entity_id: Option<String>,
}

impl Topic {
    pub fn domain(domain: Domain) -> Self {
        Self {
            domain,
            entity_id: None,
        }
    }

    pub fn entity(domain: Domain, entity_id: impl Into<String>) -> Self {
        Self {
            domain,
            entity_id: Some(entity_id.into()),
        }
    }

    /// Domain-wide notifications reach entity topics too.
    pub fn matches(&self, notification: &ChangeNotification) -> bool {
        if notification.domain != self.domain {
            return false;
        }
        match (&self.entity_id, &notification.entity_id) {
            (Some(wanted), Some(changed)) => wanted == changed,
            _ => true,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.entity_id {
            Some(entity_id) => write!(f, "{}:{entity_id}", self.domain),
            None => write!(f, "{}", self.domain),
        }
    }
}

#[derive(Debug, Error)]
pub enum PushChannelError {
    #[error("push channel is closed")]
    Closed,
    #[error("push channel rejected subscription to `{topic}`: {reason}")]
    Rejected { topic: String, reason: String },
}

/// Source of change notifications. Implemented by the data-service adapter.
pub trait PushChannel: Send + Sync {
    /// Open a stream of notifications matching `topic`.
    ///
    /// Notifications published before this call are not replayed.
    fn open(&self, topic: &Topic)
    -> Result<BoxStream<'static, ChangeNotification>, PushChannelError>;
}

/// In-process push channel backed by a broadcast channel.
///
/// Used by the simulation and tests; also usable as a fan-out point when the
/// real transport delivers into a single callback.
#[derive(Debug, Clone)]
pub struct LocalPushChannel {
    tx: broadcast::Sender<ChangeNotification>,
}

impl LocalPushChannel {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Deliver a notification to every open stream. Returns how many received it.
    pub fn publish(&self, notification: ChangeNotification) -> usize {
        self.tx.send(notification).unwrap_or(0)
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for LocalPushChannel {
    fn default() -> Self {
        Self::new(64)
    }
}

impl PushChannel for LocalPushChannel {
    fn open(
        &self,
        topic: &Topic,
    ) -> Result<BoxStream<'static, ChangeNotification>, PushChannelError> {
        let rx = self.tx.subscribe();
        let topic = topic.clone();

        let notifications = stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(notification) => return Some((notification, rx)),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Push subscriber lagged; notifications dropped");
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        });

        Ok(notifications
            .filter(move |notification| future::ready(topic.matches(notification)))
            .boxed())
    }
}

/// Connects push notifications to cache invalidation.
pub struct LiveUpdateBridge {
    channel: Arc<dyn PushChannel>,
    bus: Arc<InvalidationBus>,
    active: Arc<AtomicUsize>,
}

impl LiveUpdateBridge {
    pub fn new(channel: Arc<dyn PushChannel>, bus: Arc<InvalidationBus>) -> Self {
        Self {
            channel,
            bus,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Subscribe to `topic`.
    ///
    /// Every delivered notification first invalidates the whole domain, then
    /// runs `callback`. Once [`Subscription::unsubscribe`] returns, no new
    /// callback starts; one already running on another thread may finish.
    /// Must be called from within a tokio runtime.
    pub fn subscribe<C>(&self, topic: Topic, callback: C) -> Result<Subscription, PushChannelError>
    where
        C: Fn(&ChangeNotification) + Send + Sync + 'static,
    {
        let mut notifications = self.channel.open(&topic)?;
        let bus = Arc::clone(&self.bus);
        let task_topic = topic.clone();
        let open = Arc::new(AtomicBool::new(true));
        let task_open = Arc::clone(&open);

        let worker = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                // Ready notifications are yielded without a suspension point,
                // so abort alone does not stop them.
                if !task_open.load(Ordering::SeqCst) {
                    break;
                }
                debug!(
                    topic = %task_topic,
                    notification_id = %notification.id,
                    kind = ?notification.kind,
                    "Change notification received"
                );
                bus.invalidate(
                    KeyPattern::domain(notification.domain),
                    InvalidationSource::LiveUpdate,
                );
                if !task_open.load(Ordering::SeqCst) {
                    break;
                }
                callback(&notification);
            }
            debug!(topic = %task_topic, "Push stream ended");
        });

        self.active.fetch_add(1, Ordering::SeqCst);
        info!(topic = %topic, "Subscribed to live updates");
        Ok(Subscription {
            topic,
            worker: Some(worker),
            open,
            active: Arc::clone(&self.active),
        })
    }

    /// Number of subscriptions whose handle is still alive.
    pub fn active_subscriptions(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

/// Live-update subscription. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    topic: Topic,
    worker: Option<JoinHandle<()>>,
    open: Arc<AtomicBool>,
    active: Arc<AtomicUsize>,
}

impl Subscription {
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Stop forwarding notifications. Idempotent.
    pub fn unsubscribe(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.open.store(false, Ordering::SeqCst);
            worker.abort();
            self.active.fetch_sub(1, Ordering::SeqCst);
            info!(topic = %self.topic, "Unsubscribed from live updates");
        }
    }

    pub fn is_active(&self) -> bool {
        self.worker.is_some()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Barrier, Mutex, mpsc};
    use std::time::Duration;

    use super::*;
    use crate::cache::config::CacheConfig;
    use crate::cache::keys::CacheKey;
    use crate::cache::priority::Priority;
    use crate::cache::store::CacheStore;

    struct Harness {
        channel: LocalPushChannel,
        bridge: LiveUpdateBridge,
        store: Arc<CacheStore>,
    }

    fn harness() -> Harness {
        let store = Arc::new(CacheStore::new(&CacheConfig::default()));
        let bus = Arc::new(InvalidationBus::new(Arc::clone(&store), 16));
        let channel = LocalPushChannel::default();
        let bridge = LiveUpdateBridge::new(Arc::new(channel.clone()), bus);
        Harness {
            channel,
            bridge,
            store,
        }
    }

    fn key(raw: &str) -> CacheKey {
        raw.parse().expect("valid key")
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[test]
    fn entity_topic_filters_other_entities() {
        let topic = Topic::entity(Domain::Rsvps, "ev-1");

        let same = ChangeNotification::new(Domain::Rsvps, ChangeKind::Insert).for_entity("ev-1");
        let other = ChangeNotification::new(Domain::Rsvps, ChangeKind::Insert).for_entity("ev-2");
        let domain_wide = ChangeNotification::new(Domain::Rsvps, ChangeKind::Delete);
        let elsewhere = ChangeNotification::new(Domain::Events, ChangeKind::Update);

        assert!(topic.matches(&same));
        assert!(!topic.matches(&other));
        assert!(topic.matches(&domain_wide));
        assert!(!topic.matches(&elsewhere));
        assert_eq!(topic.to_string(), "rsvps:ev-1");
    }

    #[tokio::test]
    async fn notification_invalidates_domain_and_runs_callback() {
        let harness = harness();
        harness
            .store
            .set(key("home:listings:recent"), 1_u8, None, Priority::High);
        harness
            .store
            .set(key("home:events:upcoming:5"), 2_u8, None, Priority::High);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let _subscription = {
            let seen = Arc::clone(&seen);
            harness
                .bridge
                .subscribe(Topic::domain(Domain::Listings), move |notification| {
                    seen.lock().expect("seen lock").push(notification.kind);
                })
                .expect("subscribe")
        };

        harness.channel.publish(
            ChangeNotification::new(Domain::Listings, ChangeKind::Update).for_entity("42"),
        );
        settle().await;

        assert_eq!(*seen.lock().expect("seen lock"), vec![ChangeKind::Update]);
        assert!(harness.store.get_entry(&key("home:listings:recent")).is_none());
        assert!(harness.store.get_entry(&key("home:events:upcoming:5")).is_some());
    }

    #[tokio::test]
    async fn each_subscriber_tears_down_independently() {
        let harness = harness();
        let hits = Arc::new(AtomicUsize::new(0));

        let subscribe = || {
            let hits = Arc::clone(&hits);
            harness
                .bridge
                .subscribe(Topic::domain(Domain::Events), move |_| {
                    hits.fetch_add(1, Ordering::SeqCst);
                })
                .expect("subscribe")
        };
        let mut first = subscribe();
        let _second = subscribe();
        assert_eq!(harness.bridge.active_subscriptions(), 2);

        harness
            .channel
            .publish(ChangeNotification::new(Domain::Events, ChangeKind::Insert));
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        first.unsubscribe();
        first.unsubscribe();
        assert_eq!(harness.bridge.active_subscriptions(), 1);

        harness
            .channel
            .publish(ChangeNotification::new(Domain::Events, ChangeKind::Insert));
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn dropped_subscription_releases_channel() {
        let harness = harness();
        let subscription = harness
            .bridge
            .subscribe(Topic::domain(Domain::ForumPosts), |_| {})
            .expect("subscribe");
        assert_eq!(harness.channel.receiver_count(), 1);

        drop(subscription);
        settle().await;

        assert_eq!(harness.bridge.active_subscriptions(), 0);
        assert_eq!(harness.channel.receiver_count(), 0);
    }

    #[tokio::test]
    async fn notifications_while_unsubscribed_are_not_replayed() {
        let harness = harness();
        harness
            .channel
            .publish(ChangeNotification::new(Domain::Favorites, ChangeKind::Insert));

        let hits = Arc::new(AtomicUsize::new(0));
        let _subscription = {
            let hits = Arc::clone(&hits);
            harness
                .bridge
                .subscribe(Topic::domain(Domain::Favorites), move |_| {
                    hits.fetch_add(1, Ordering::SeqCst);
                })
                .expect("subscribe")
        };
        settle().await;

        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn queued_notifications_are_dropped_after_unsubscribe() {
        let harness = harness();
        let calls = Arc::new(AtomicUsize::new(0));
        let release = Arc::new(Barrier::new(2));
        let (entered_tx, entered_rx) = mpsc::channel();

        let mut subscription = {
            let calls = Arc::clone(&calls);
            let release = Arc::clone(&release);
            harness
                .bridge
                .subscribe(Topic::domain(Domain::Listings), move |_| {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        let _ = entered_tx.send(());
                        release.wait();
                    }
                })
                .expect("subscribe")
        };

        harness
            .channel
            .publish(ChangeNotification::new(Domain::Listings, ChangeKind::Update));
        harness
            .channel
            .publish(ChangeNotification::new(Domain::Listings, ChangeKind::Delete));

        // First callback is now parked on a worker thread with the second
        // notification already buffered behind it.
        entered_rx.recv().expect("first callback entered");
        subscription.unsubscribe();
        release.wait();
        settle().await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!subscription.is_active());
    }
}
