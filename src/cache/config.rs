//! Cache configuration.
//!
//! Controls freshness defaults, store capacity and background prefetch pacing
//! via `marketsync.toml`.

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::Deserialize;

// Default values for cache configuration
const DEFAULT_TTL_MS: u64 = 5 * 60 * 1000;
const DEFAULT_MAX_ENTRIES: usize = 1000;
const DEFAULT_PREFETCH_DELAY_MS: u64 = 1000;
const DEFAULT_INVALIDATION_LOG_CAPACITY: usize = 64;

/// Cache configuration from `marketsync.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// TTL (ms) applied when a caller supplies none.
    pub default_ttl_ms: u64,
    /// Maximum entries held by the store before LRU eviction.
    pub max_entries: usize,
    /// Pause (ms) between consecutive background prefetch tasks.
    pub prefetch_delay_ms: u64,
    /// Number of recent invalidation events kept for diagnostics.
    pub invalidation_log_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: DEFAULT_TTL_MS,
            max_entries: DEFAULT_MAX_ENTRIES,
            prefetch_delay_ms: DEFAULT_PREFETCH_DELAY_MS,
            invalidation_log_capacity: DEFAULT_INVALIDATION_LOG_CAPACITY,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            default_ttl_ms: settings.default_ttl.as_millis() as u64,
            max_entries: settings.max_entries.get(),
            prefetch_delay_ms: settings.prefetch_delay.as_millis() as u64,
            invalidation_log_capacity: settings.invalidation_log_capacity,
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }

    pub fn prefetch_delay(&self) -> Duration {
        Duration::from_millis(self.prefetch_delay_ms)
    }

    /// Returns the store capacity as NonZeroUsize, clamping to 1 if zero.
    pub fn max_entries_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.max_entries).unwrap_or(NonZeroUsize::MIN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert_eq!(config.default_ttl(), Duration::from_secs(300));
        assert_eq!(config.max_entries, 1000);
        assert_eq!(config.prefetch_delay(), Duration::from_secs(1));
        assert_eq!(config.invalidation_log_capacity, 64);
    }

    #[test]
    fn non_zero_clamps_to_min() {
        let config = CacheConfig {
            max_entries: 0,
            ..Default::default()
        };
        assert_eq!(config.max_entries_non_zero().get(), 1);
    }
}
