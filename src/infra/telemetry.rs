use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "marketsync_cache_hit_total",
            Unit::Count,
            "Total number of fetches served from a cached entry."
        );
        describe_counter!(
            "marketsync_cache_miss_total",
            Unit::Count,
            "Total number of fetches that started a new miss episode."
        );
        describe_counter!(
            "marketsync_cache_dedup_join_total",
            Unit::Count,
            "Total number of fetches that joined an in-flight request."
        );
        describe_counter!(
            "marketsync_cache_evict_total",
            Unit::Count,
            "Total number of cache evictions due to capacity."
        );
        describe_counter!(
            "marketsync_fetch_error_total",
            Unit::Count,
            "Total number of failed fetches, labelled by error kind."
        );
        describe_counter!(
            "marketsync_prefetch_total",
            Unit::Count,
            "Total number of background jobs run (prefetch tasks and low-priority fetch turns), labelled by outcome."
        );
        describe_counter!(
            "marketsync_invalidation_total",
            Unit::Count,
            "Total number of invalidations, labelled by source."
        );
        describe_histogram!(
            "marketsync_fetch_ms",
            Unit::Milliseconds,
            "Underlying fetch latency in milliseconds."
        );
    });
}
