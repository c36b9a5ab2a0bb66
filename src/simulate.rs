//! Scripted session against an in-memory marketplace backend.
//!
//! Drives every cache component once: concurrent screens on the home feed,
//! an infinite-scroll list, background prefetch, a local mutation and a push
//! notification. The resulting report is what `marketsync simulate` prints.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tracing::{info, instrument};

use crate::cache::{
    CacheClient, CacheConfig, CacheKey, CacheStats, ChangeKind, ChangeNotification, Domain,
    FetchError, FetchOptions, InvalidationEvent, LocalPushChannel, Mutation, Priority,
};
use crate::config::{SimulateArgs, Settings};
use crate::infra::error::InfraError;

const UPCOMING_EVENTS_TTL: Duration = Duration::from_secs(120);
const SETTLE_TIMEOUT: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Serialize)]
pub struct Listing {
    pub id: String,
    pub title: String,
    pub price_cents: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub id: String,
    pub title: String,
    pub attendees: u32,
}

/// Fake data service that counts every call it serves.
#[derive(Debug, Default)]
pub struct MarketBackend {
    listings: Vec<Listing>,
    events: Vec<Event>,
    event_calls: AtomicUsize,
    catalog_calls: AtomicUsize,
    listing_calls: AtomicUsize,
}

impl MarketBackend {
    pub fn new(listing_count: usize) -> Self {
        let listings = (0..listing_count)
            .map(|index| Listing {
                id: format!("l-{index}"),
                title: format!("Project car #{index}"),
                price_cents: 450_000 + index as u64 * 12_500,
            })
            .collect();
        let events = ["Cars & Coffee", "Canyon drive", "Autocross", "Swap meet", "Track day"]
            .into_iter()
            .enumerate()
            .map(|(index, title)| Event {
                id: format!("ev-{index}"),
                title: title.to_string(),
                attendees: 10 + index as u32 * 3,
            })
            .collect();

        Self {
            listings,
            events,
            ..Default::default()
        }
    }

    async fn upcoming_events(&self, limit: usize) -> Result<Vec<Event>, FetchError> {
        self.event_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(self.events.iter().take(limit).cloned().collect())
    }

    async fn event(&self, id: &str) -> Result<Event, FetchError> {
        self.catalog_calls.fetch_add(1, Ordering::SeqCst);
        self.events
            .iter()
            .find(|event| event.id == id)
            .cloned()
            .ok_or_else(|| FetchError::service(Some(404), format!("event {id} not found")))
    }

    async fn event_catalog(&self) -> Result<Vec<Event>, FetchError> {
        self.catalog_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.events.clone())
    }

    async fn listings_page(&self, offset: usize, limit: usize) -> Result<Vec<Listing>, FetchError> {
        self.listing_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        Ok(self.listings.iter().skip(offset).take(limit).cloned().collect())
    }

    pub fn event_calls(&self) -> usize {
        self.event_calls.load(Ordering::SeqCst)
    }

    pub fn catalog_calls(&self) -> usize {
        self.catalog_calls.load(Ordering::SeqCst)
    }

    pub fn listing_calls(&self) -> usize {
        self.listing_calls.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InvalidationSummary {
    pub epoch: u64,
    pub source: &'static str,
    pub target: String,
    pub removed: usize,
}

impl From<&InvalidationEvent> for InvalidationSummary {
    fn from(event: &InvalidationEvent) -> Self {
        Self {
            epoch: event.epoch,
            source: event.source.as_str(),
            target: event.target.to_string(),
            removed: event.removed,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub screens: usize,
    /// Backend calls made for the home feed, however many screens asked.
    pub upcoming_event_fetches: usize,
    pub listings_loaded: usize,
    pub listing_page_fetches: usize,
    pub prefetched_keys: Vec<String>,
    pub notifications_delivered: usize,
    pub invalidations: Vec<InvalidationSummary>,
    pub stats: CacheStats,
}

/// Run the scripted session and return what happened.
#[instrument(skip_all, fields(screens = args.screens, page_size = args.page_size))]
pub async fn run(settings: &Settings, args: &SimulateArgs) -> Result<SimulationReport, InfraError> {
    let backend = Arc::new(MarketBackend::new(args.listings));
    let channel = LocalPushChannel::default();
    let client = CacheClient::new(CacheConfig::from(&settings.cache), Arc::new(channel.clone()));

    // Home feed: every screen asks for the same key at once.
    let upcoming = CacheKey::home(Domain::Events)
        .with("upcoming")
        .and_then(|key| key.with(5))
        .map_err(|err| InfraError::simulation(err.to_string()))?;
    let screens = (0..args.screens.max(1)).map(|_| {
        let backend = Arc::clone(&backend);
        client.fetch(
            &upcoming,
            move || async move { backend.upcoming_events(5).await },
            FetchOptions::new()
                .priority(Priority::High)
                .ttl(UPCOMING_EVENTS_TTL),
        )
    });
    for result in join_all(screens).await {
        result.map_err(|err| InfraError::simulation(err.to_string()))?;
    }
    let upcoming_event_fetches = backend.event_calls();
    client.mark_critical_loaded();
    info!(calls = upcoming_event_fetches, "Home feed loaded");

    // Secondary data goes to the background queue.
    let catalog_key = CacheKey::explore(Domain::Events);
    let featured_key = CacheKey::detail(Domain::Events, "ev-1")
        .map_err(|err| InfraError::simulation(err.to_string()))?;
    {
        let backend = Arc::clone(&backend);
        client.prefetch(
            catalog_key.clone(),
            move || async move { backend.event_catalog().await },
            None,
        );
    }
    {
        let backend = Arc::clone(&backend);
        client.prefetch(
            featured_key.clone(),
            move || async move { backend.event("ev-1").await },
            None,
        );
    }
    client.start_background();

    // Live updates for listings while the explore list is mounted.
    let delivered = Arc::new(AtomicUsize::new(0));
    let subscription = {
        let delivered = Arc::clone(&delivered);
        client
            .subscribe_to_domain_change(Domain::Listings, None, move |_| {
                delivered.fetch_add(1, Ordering::SeqCst);
            })
            .map_err(|err| InfraError::simulation(err.to_string()))?
    };

    let explore = {
        let backend = Arc::clone(&backend);
        client.paged(
            CacheKey::explore(Domain::Listings),
            move |offset, limit| {
                let backend = Arc::clone(&backend);
                async move { backend.listings_page(offset, limit).await }
            },
            args.page_size,
            FetchOptions::new(),
        )
    };
    let listings_loaded = loop {
        let state = explore.settled().await;
        if let Some(error) = state.error {
            return Err(InfraError::simulation(error.to_string()));
        }
        if !state.has_more {
            break state.items.len();
        }
        explore.load_more();
    };

    client.apply_mutation(&Mutation::RsvpChanged {
        event_id: "ev-0".to_string(),
    });
    channel.publish(ChangeNotification::new(Domain::Listings, ChangeKind::Update).for_entity("l-3"));

    wait_until(|| delivered.load(Ordering::SeqCst) > 0).await?;
    wait_until(|| {
        client.get_cache::<Vec<Event>>(&catalog_key).is_some()
            && client.get_cache::<Event>(&featured_key).is_some()
    })
    .await?;

    let report = SimulationReport {
        screens: args.screens.max(1),
        upcoming_event_fetches,
        listings_loaded,
        listing_page_fetches: backend.listing_calls(),
        prefetched_keys: vec![catalog_key.to_string(), featured_key.to_string()],
        notifications_delivered: delivered.load(Ordering::SeqCst),
        invalidations: client
            .recent_invalidations()
            .iter()
            .map(InvalidationSummary::from)
            .collect(),
        stats: client.stats(),
    };

    drop(subscription);
    client.clear();
    Ok(report)
}

async fn wait_until(mut condition: impl FnMut() -> bool) -> Result<(), InfraError> {
    tokio::time::timeout(SETTLE_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    })
    .await
    .map_err(|_| InfraError::simulation("timed out waiting for background work"))
}
