//! Invalidation bus.
//!
//! Mutation flows and the live-update bridge route every cache invalidation
//! through here. Each invalidation is recorded as an [`InvalidationEvent`] so
//! the most recent ones can be inspected when debugging stale screens.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use metrics::counter;
use serde::Serialize;
use time::OffsetDateTime;
use tracing::info;
use uuid::Uuid;

use super::keys::{Domain, Invalidation, KeyPattern, Scope};
use super::lock::mutex_lock;
use super::store::CacheStore;

const SOURCE: &str = "cache::events";
const METRIC_INVALIDATION_TOTAL: &str = "marketsync_invalidation_total";

/// Monotonic epoch for ordering invalidations within this process.
pub type Epoch = u64;

/// Who asked for an invalidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationSource {
    /// A local create/update/delete succeeded.
    Mutation,
    /// A push notification arrived from the data service.
    LiveUpdate,
    /// Direct call through the public API.
    Manual,
    /// A paginated list was refreshed and dropped its cached pages.
    Refresh,
}

impl InvalidationSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mutation => "mutation",
            Self::LiveUpdate => "live_update",
            Self::Manual => "manual",
            Self::Refresh => "refresh",
        }
    }
}

/// One recorded invalidation.
#[derive(Debug, Clone)]
pub struct InvalidationEvent {
    pub id: Uuid,
    pub epoch: Epoch,
    pub target: Invalidation,
    pub source: InvalidationSource,
    /// Entries removed by this invalidation.
    pub removed: usize,
    pub timestamp: OffsetDateTime,
}

/// A successful local write, expanded into the keys it makes stale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// A listing was created, edited, marked sold or deleted.
    ListingChanged { listing_id: String },
    /// An event was created, edited or cancelled.
    EventChanged { event_id: String },
    /// The user's RSVP to an event changed.
    RsvpChanged { event_id: String },
    /// A forum post or reply was created, edited or deleted.
    ForumPostChanged { post_id: String },
    /// A listing was added to or removed from favorites.
    FavoriteToggled { listing_id: String },
    /// A message was sent in a conversation.
    MessageSent { conversation_id: String },
    /// The signed-in user's profile changed.
    ProfileUpdated { user_id: String },
}

impl Mutation {
    /// Every pattern this mutation invalidates.
    ///
    /// Domain-wide patterns cover home, explore, detail and owned lists at once.
    pub fn plan(&self) -> Vec<Invalidation> {
        let pattern = |pattern: KeyPattern| Invalidation::Pattern(pattern);
        match self {
            Mutation::ListingChanged { listing_id } => vec![
                pattern(KeyPattern::domain(Domain::Listings)),
                // Favorites embed listing snapshots.
                pattern(KeyPattern::domain(Domain::Favorites)),
                pattern(KeyPattern::entity(Domain::Listings, listing_id)),
            ],
            Mutation::EventChanged { event_id } => vec![
                pattern(KeyPattern::domain(Domain::Events)),
                pattern(KeyPattern::entity(Domain::Rsvps, event_id)),
            ],
            Mutation::RsvpChanged { event_id } => vec![
                pattern(KeyPattern::domain(Domain::Rsvps)),
                // Attendee counts and the event detail view show RSVP totals.
                pattern(KeyPattern::view(Scope::Counts, Domain::Events)),
                pattern(KeyPattern::entity(Domain::Events, event_id)),
                pattern(KeyPattern::view(Scope::Owned, Domain::Events)),
            ],
            Mutation::ForumPostChanged { .. } => {
                vec![pattern(KeyPattern::domain(Domain::ForumPosts))]
            }
            Mutation::FavoriteToggled { listing_id } => vec![
                pattern(KeyPattern::domain(Domain::Favorites)),
                pattern(KeyPattern::entity(Domain::Listings, listing_id)),
                pattern(KeyPattern::view(Scope::Counts, Domain::Listings)),
            ],
            Mutation::MessageSent { conversation_id } => vec![
                pattern(KeyPattern::entity(Domain::Messages, conversation_id)),
                pattern(KeyPattern::view(Scope::Owned, Domain::Messages)),
                pattern(KeyPattern::view(Scope::Counts, Domain::Messages)),
            ],
            Mutation::ProfileUpdated { user_id } => vec![
                pattern(KeyPattern::entity(Domain::Profiles, user_id)),
                pattern(KeyPattern::view(Scope::Owned, Domain::Profiles)),
            ],
        }
    }
}

impl fmt::Display for Mutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mutation::ListingChanged { listing_id } => write!(f, "listing {listing_id} changed"),
            Mutation::EventChanged { event_id } => write!(f, "event {event_id} changed"),
            Mutation::RsvpChanged { event_id } => write!(f, "rsvp for event {event_id} changed"),
            Mutation::ForumPostChanged { post_id } => write!(f, "forum post {post_id} changed"),
            Mutation::FavoriteToggled { listing_id } => {
                write!(f, "favorite toggled on listing {listing_id}")
            }
            Mutation::MessageSent { conversation_id } => {
                write!(f, "message sent in {conversation_id}")
            }
            Mutation::ProfileUpdated { user_id } => write!(f, "profile {user_id} updated"),
        }
    }
}

/// Synchronous fan-in point for every cache invalidation.
pub struct InvalidationBus {
    store: Arc<CacheStore>,
    epoch_counter: AtomicU64,
    recent: Mutex<VecDeque<InvalidationEvent>>,
    capacity: usize,
}

impl InvalidationBus {
    pub fn new(store: Arc<CacheStore>, capacity: usize) -> Self {
        Self {
            store,
            epoch_counter: AtomicU64::new(0),
            recent: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Get the next epoch number.
    pub fn next_epoch(&self) -> Epoch {
        self.epoch_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Remove every entry matching `target`. Returns the number removed.
    ///
    /// Holds only at the instant of the call: a fetch already in flight for a
    /// matching key may repopulate it when it settles.
    pub fn invalidate(&self, target: impl Into<Invalidation>, source: InvalidationSource) -> usize {
        let target = target.into();
        let removed = self.store.invalidate(&target);
        let event = InvalidationEvent {
            id: Uuid::new_v4(),
            epoch: self.next_epoch(),
            target,
            source,
            removed,
            timestamp: OffsetDateTime::now_utc(),
        };

        // Observable: log every invalidation
        info!(
            event_id = %event.id,
            event_epoch = event.epoch,
            target = %event.target,
            source = source.as_str(),
            removed,
            "Cache invalidated"
        );
        counter!(METRIC_INVALIDATION_TOTAL, "source" => source.as_str()).increment(1);

        self.record(event);
        removed
    }

    /// Invalidate everything a successful mutation made stale.
    pub fn apply(&self, mutation: &Mutation) -> usize {
        info!(mutation = %mutation, "Applying mutation invalidation plan");
        mutation
            .plan()
            .into_iter()
            .map(|target| self.invalidate(target, InvalidationSource::Mutation))
            .sum()
    }

    fn record(&self, event: InvalidationEvent) {
        if self.capacity == 0 {
            return;
        }
        let mut recent = mutex_lock(&self.recent, SOURCE, "record");
        while recent.len() >= self.capacity {
            recent.pop_front();
        }
        recent.push_back(event);
    }

    /// Most recent invalidations, oldest first.
    pub fn recent(&self) -> Vec<InvalidationEvent> {
        mutex_lock(&self.recent, SOURCE, "recent")
            .iter()
            .cloned()
            .collect()
    }
}
