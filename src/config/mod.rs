//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{num::NonZeroUsize, path::PathBuf, str::FromStr, time::Duration};

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::CacheConfig;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "marketsync";
const ENV_PREFIX: &str = "MARKETSYNC";
const DEFAULT_SIMULATED_SCREENS: usize = 3;
const DEFAULT_SIMULATED_LISTINGS: usize = 25;
const DEFAULT_SIMULATED_PAGE_SIZE: usize = 10;

/// Command-line arguments for the marketsync binary.
#[derive(Debug, Parser)]
#[command(
    name = "marketsync",
    version,
    about = "Marketplace cache and sync coordinator"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "MARKETSYNC_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run a scripted session against an in-memory backend and print cache stats.
    Simulate(SimulateArgs),
}

#[derive(Debug, Args, Clone)]
pub struct SimulateArgs {
    #[command(flatten)]
    pub overrides: RuntimeOverrides,

    /// Screens that mount the home feed at the same time.
    #[arg(long = "screens", value_name = "COUNT", default_value_t = DEFAULT_SIMULATED_SCREENS)]
    pub screens: usize,

    /// Listings held by the simulated backend.
    #[arg(long = "listings", value_name = "COUNT", default_value_t = DEFAULT_SIMULATED_LISTINGS)]
    pub listings: usize,

    /// Page size used by the explore list.
    #[arg(long = "page-size", value_name = "COUNT", default_value_t = DEFAULT_SIMULATED_PAGE_SIZE)]
    pub page_size: usize,
}

impl Default for SimulateArgs {
    fn default() -> Self {
        Self {
            overrides: RuntimeOverrides::default(),
            screens: DEFAULT_SIMULATED_SCREENS,
            listings: DEFAULT_SIMULATED_LISTINGS,
            page_size: DEFAULT_SIMULATED_PAGE_SIZE,
        }
    }
}

#[derive(Debug, Args, Default, Clone)]
pub struct RuntimeOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the default freshness window in milliseconds.
    #[arg(long = "cache-default-ttl-ms", value_name = "MILLIS")]
    pub cache_default_ttl_ms: Option<u64>,

    /// Override the maximum number of cached entries.
    #[arg(long = "cache-max-entries", value_name = "COUNT")]
    pub cache_max_entries: Option<usize>,

    /// Override the pause between background prefetch tasks in milliseconds.
    #[arg(long = "cache-prefetch-delay-ms", value_name = "MILLIS")]
    pub cache_prefetch_delay_ms: Option<u64>,

    /// Override how many recent invalidations are kept for diagnostics.
    #[arg(long = "cache-invalidation-log-capacity", value_name = "COUNT")]
    pub cache_invalidation_log_capacity: Option<usize>,
}

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub default_ttl: Duration,
    pub max_entries: NonZeroUsize,
    pub prefetch_delay: Duration,
    pub invalidation_log_capacity: usize,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Simulate(args)) => raw.apply_runtime_overrides(&args.overrides),
        None => raw.apply_runtime_overrides(&RuntimeOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
}

impl RawSettings {
    fn apply_runtime_overrides(&mut self, overrides: &RuntimeOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(ttl) = overrides.cache_default_ttl_ms {
            self.cache.default_ttl_ms = Some(ttl);
        }
        if let Some(max_entries) = overrides.cache_max_entries {
            self.cache.max_entries = Some(max_entries);
        }
        if let Some(delay) = overrides.cache_prefetch_delay_ms {
            self.cache.prefetch_delay_ms = Some(delay);
        }
        if let Some(capacity) = overrides.cache_invalidation_log_capacity {
            self.cache.invalidation_log_capacity = Some(capacity);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings { logging, cache } = raw;

        let logging = build_logging_settings(logging)?;
        let cache = build_cache_settings(cache)?;

        Ok(Self { logging, cache })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let defaults = CacheConfig::default();
    let ttl_ms = cache.default_ttl_ms.unwrap_or(defaults.default_ttl_ms);
    if ttl_ms == 0 {
        return Err(LoadError::invalid(
            "cache.default_ttl_ms",
            "must be greater than zero",
        ));
    }

    let max_entries = non_zero_usize(
        cache.max_entries.unwrap_or(defaults.max_entries),
        "cache.max_entries",
    )?;

    Ok(CacheSettings {
        default_ttl: Duration::from_millis(ttl_ms),
        max_entries,
        prefetch_delay: Duration::from_millis(
            cache
                .prefetch_delay_ms
                .unwrap_or(defaults.prefetch_delay_ms),
        ),
        invalidation_log_capacity: cache
            .invalidation_log_capacity
            .unwrap_or(defaults.invalidation_log_capacity),
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    default_ttl_ms: Option<u64>,
    max_entries: Option<usize>,
    prefetch_delay_ms: Option<u64>,
    invalidation_log_capacity: Option<usize>,
}

fn non_zero_usize(value: usize, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    NonZeroUsize::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[cfg(test)]
mod tests;
