//! Tests for config file resolution and graceful degradation
//!
//! Tests that manipulate PHOTOPLACE_CONFIG are marked with #[serial] so
//! they never race on the process environment.

use photoplace_common::config::{
    AppConfig, ConfigResolver, CONFIG_ENV_VAR, MAX_TIME_OFFSET_SECONDS, MAX_UTC_ZONE_MINUTES,
};
use photoplace_common::Error;
use serial_test::serial;
use std::env;
use std::path::PathBuf;
use tempfile::TempDir;

#[test]
#[serial]
fn test_cli_arg_has_highest_priority() {
    env::set_var(CONFIG_ENV_VAR, "/tmp/from-env.toml");

    let resolver = ConfigResolver::new("photoplace");
    let cli = PathBuf::from("/tmp/from-cli.toml");
    assert_eq!(resolver.resolve(Some(&cli)), Some(cli));

    env::remove_var(CONFIG_ENV_VAR);
}

#[test]
#[serial]
fn test_env_var_used_without_cli_arg() {
    env::set_var(CONFIG_ENV_VAR, "/tmp/from-env.toml");

    let resolver = ConfigResolver::new("photoplace");
    assert_eq!(resolver.resolve(None), Some(PathBuf::from("/tmp/from-env.toml")));

    env::remove_var(CONFIG_ENV_VAR);
}

#[test]
#[serial]
fn test_missing_named_file_degrades_to_defaults() {
    env::remove_var(CONFIG_ENV_VAR);
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("nope.toml");

    let config = AppConfig::resolve(Some(&missing)).unwrap();
    assert_eq!(config, AppConfig::default());
}

#[test]
#[serial]
fn test_resolve_loads_file_from_env() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        r#"
        [main]
        max_delta_seconds = 120
        overwrite = true

        [logging]
        level = "debug"
        "#,
    )
    .unwrap();
    env::set_var(CONFIG_ENV_VAR, &path);

    let config = AppConfig::resolve(None).unwrap();
    assert_eq!(config.main.max_delta_seconds, 120);
    assert!(config.main.overwrite);
    assert_eq!(config.logging.level, "debug");

    env::remove_var(CONFIG_ENV_VAR);
}

#[test]
fn test_malformed_file_is_an_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("broken.toml");
    std::fs::write(&path, "[main\nthis is not toml").unwrap();

    let result = AppConfig::resolve(Some(&path));
    assert!(matches!(result, Err(Error::Toml(_))));
}

#[test]
fn test_write_then_load() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("config.toml");

    let mut config = AppConfig::default();
    config.main.photo_input_dir = Some(PathBuf::from("/photos"));
    config.main.copy_mode = 2;
    config.addons.insert("manifest".to_string(), true);
    config.write(&path).unwrap();

    let loaded = AppConfig::load(&path).unwrap();
    assert_eq!(loaded, config);
}

#[test]
fn test_load_rejects_invalid_values() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[main]\ncopy_mode = 9\n").unwrap();

    assert!(matches!(AppConfig::load(&path), Err(Error::Config(_))));
}

#[test]
fn test_validate_bounds_clock_corrections() {
    let mut config = AppConfig::default();
    config.main.utc_zone_minutes = -MAX_UTC_ZONE_MINUTES;
    config.main.time_offset_seconds = MAX_TIME_OFFSET_SECONDS;
    assert!(config.validate().is_ok());

    config.main.utc_zone_minutes = 1_000_000_000_000;
    assert!(matches!(config.validate(), Err(Error::Config(msg)) if msg.contains("utc_zone_minutes")));

    config.main.utc_zone_minutes = 0;
    config.main.time_offset_seconds = i64::MIN;
    assert!(matches!(config.validate(), Err(Error::Config(msg)) if msg.contains("time_offset_seconds")));
}
