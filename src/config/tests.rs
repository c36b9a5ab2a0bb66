use std::io::Write;

use super::*;

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.cache.max_entries = Some(200);
    raw.logging.level = Some("info".to_string());

    let overrides = RuntimeOverrides {
        cache_max_entries: Some(50),
        log_level: Some("debug".to_string()),
        ..Default::default()
    };

    raw.apply_runtime_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.cache.max_entries.get(), 50);
    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
}

#[test]
fn cache_settings_use_correct_defaults() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

    assert_eq!(settings.cache.default_ttl, Duration::from_secs(300));
    assert_eq!(settings.cache.max_entries.get(), 1000);
    assert_eq!(settings.cache.prefetch_delay, Duration::from_secs(1));
    assert_eq!(settings.cache.invalidation_log_capacity, 64);
    assert_eq!(settings.logging.level, LevelFilter::INFO);
    assert!(matches!(settings.logging.format, LogFormat::Compact));
}

#[test]
fn cache_settings_convert_to_cache_config() {
    let mut raw = RawSettings::default();
    raw.cache.default_ttl_ms = Some(120_000);
    raw.cache.prefetch_delay_ms = Some(250);
    let settings = Settings::from_raw(raw).expect("valid settings");

    let config = crate::cache::CacheConfig::from(&settings.cache);

    assert_eq!(config.default_ttl(), Duration::from_secs(120));
    assert_eq!(config.prefetch_delay(), Duration::from_millis(250));
    assert_eq!(config.max_entries, 1000);
}

#[test]
fn cli_json_logging_enforces_format() {
    let mut raw = RawSettings::default();
    let overrides = RuntimeOverrides {
        log_json: Some(true),
        ..Default::default()
    };

    raw.apply_runtime_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert!(matches!(settings.logging.format, LogFormat::Json));
}

#[test]
fn zero_ttl_is_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.default_ttl_ms = Some(0);

    let err = Settings::from_raw(raw).expect_err("zero ttl");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "cache.default_ttl_ms",
            ..
        }
    ));
}

#[test]
fn zero_max_entries_is_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.max_entries = Some(0);

    let err = Settings::from_raw(raw).expect_err("zero capacity");
    assert_eq!(
        err.to_string(),
        "invalid configuration for `cache.max_entries`: must be greater than zero"
    );
}

#[test]
fn invalid_log_level_is_rejected() {
    let mut raw = RawSettings::default();
    raw.logging.level = Some("chatty".to_string());

    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn no_subcommand_parses() {
    let args = CliArgs::parse_from(["marketsync"]);
    assert!(args.command.is_none());
}

#[test]
fn parse_simulate_arguments() {
    let args = CliArgs::parse_from([
        "marketsync",
        "simulate",
        "--screens",
        "5",
        "--page-size",
        "4",
        "--cache-max-entries",
        "32",
        "--log-json=true",
    ]);

    match args.command.expect("simulate command") {
        Command::Simulate(simulate) => {
            assert_eq!(simulate.screens, 5);
            assert_eq!(simulate.page_size, 4);
            assert_eq!(simulate.listings, DEFAULT_SIMULATED_LISTINGS);
            assert_eq!(simulate.overrides.cache_max_entries, Some(32));
            assert_eq!(simulate.overrides.log_json, Some(true));
        }
    }
}

#[test]
fn config_file_values_sit_below_cli() {
    let mut file = temp_config_file("config_file_values_sit_below_cli.toml");
    writeln!(
        file.1,
        "[cache]\nmax_entries = 64\nprefetch_delay_ms = 10\n\n[logging]\nlevel = \"warn\""
    )
    .expect("write config");

    let args = CliArgs::parse_from([
        "marketsync",
        "--config-file",
        file.0.to_str().expect("utf-8 path"),
        "simulate",
        "--cache-max-entries",
        "8",
    ]);
    let settings = load(&args).expect("settings");

    assert_eq!(settings.cache.max_entries.get(), 8);
    assert_eq!(settings.cache.prefetch_delay, Duration::from_millis(10));
    assert_eq!(settings.logging.level, LevelFilter::WARN);

    let _ = std::fs::remove_file(&file.0);
}

fn temp_config_file(name: &str) -> (PathBuf, std::fs::File) {
    let path = std::env::temp_dir().join(format!("marketsync-{}-{name}", std::process::id()));
    let file = std::fs::File::create(&path).expect("create config file");
    (path, file)
}

#[test]
fn unset_cache_settings_match_cache_defaults() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");
    let from_settings = CacheConfig::from(&settings.cache);
    let defaults = CacheConfig::default();

    assert_eq!(from_settings.default_ttl_ms, defaults.default_ttl_ms);
    assert_eq!(from_settings.max_entries, defaults.max_entries);
    assert_eq!(from_settings.prefetch_delay_ms, defaults.prefetch_delay_ms);
    assert_eq!(
        from_settings.invalidation_log_capacity,
        defaults.invalidation_log_capacity
    );
}
