//! Marketplace cache and synchronization.
//!
//! - **CacheStore**: keyed values with write time and TTL, LRU bounded
//! - **RequestCoordinator**: fresh hits, one in-flight fetch per key, priority admission
//! - **BackgroundPrefetcher**: low-priority queue released by the startup gate
//! - **InvalidationBus**: exact and pattern invalidation from mutations and live updates
//! - **LiveUpdateBridge**: push notifications → invalidation → screen callbacks
//! - **Query / PagedQuery**: render-ready handles screens hold while mounted
//!
//! ## Configuration
//!
//! Cache behavior is controlled via `marketsync.toml`:
//!
//! ```toml
//! [cache]
//! default_ttl_ms = 300000
//! max_entries = 1000
//! prefetch_delay_ms = 1000
//! invalidation_log_capacity = 64
//! ```

mod client;
mod config;
mod coordinator;
mod error;
mod events;
mod keys;
mod live;
mod lock;
mod paged;
mod prefetch;
mod priority;
mod query;
mod store;

pub use client::{CacheClient, CacheStats};
pub use config::CacheConfig;
pub use coordinator::{FetchOptions, RequestCoordinator};
pub use error::FetchError;
pub use events::{Epoch, InvalidationBus, InvalidationEvent, InvalidationSource, Mutation};
pub use keys::{CacheKey, Domain, Invalidation, KeyParseError, KeyPattern, Scope};
pub use live::{
    ChangeKind, ChangeNotification, LiveUpdateBridge, LocalPushChannel, PushChannel,
    PushChannelError, Subscription, Topic,
};
pub use paged::{PagedQuery, PagedState};
pub use prefetch::{BackgroundPrefetcher, PrefetchTask};
pub use priority::{Priority, PriorityScheduler, StartupGate};
pub use query::{Query, QueryState};
pub use store::{CacheEntry, CacheStore, ErasedValue, Generation};
