//! Configuration loading and config file resolution
//!
//! Configuration is a single TOML file with three tables:
//! - `[main]`: processing settings (input dir, track, output, time handling)
//! - `[logging]`: log level and optional log file
//! - `[addons]`: plugin name → enabled
//!
//! # Config File Priority
//!
//! 1. Command-line argument (highest priority)
//! 2. `PHOTOPLACE_CONFIG` environment variable
//! 3. User config dir (`~/.config/photoplace/config.toml` on Linux)
//! 4. Compiled defaults (fallback)
//!
//! A config file that is named but missing is NOT fatal: a warning is
//! logged and the compiled defaults are used. A file that exists but does
//! not parse is an error.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable naming the config file
pub const CONFIG_ENV_VAR: &str = "PHOTOPLACE_CONFIG";

/// Highest accepted copy mode (0 = none, 1 = geotagged only, 2 = all)
pub const MAX_COPY_MODE: u8 = 2;

/// Largest accepted camera clock distance from UTC, either way (24 hours)
pub const MAX_UTC_ZONE_MINUTES: i64 = 24 * 60;

/// Largest accepted load-time correction, either way (100 years)
pub const MAX_TIME_OFFSET_SECONDS: i64 = 100 * 365 * 24 * 3600;

/// Complete application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Processing settings
    #[serde(default)]
    pub main: MainConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Plugin name → enabled
    #[serde(default)]
    pub addons: BTreeMap<String, bool>,
}

/// Processing settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MainConfig {
    /// Directory photos are loaded from
    #[serde(default)]
    pub photo_input_dir: Option<PathBuf>,

    /// Track file (`time,lat,lon[,ele]` lines)
    #[serde(default)]
    pub track_file: Option<PathBuf>,

    /// KML output file
    #[serde(default)]
    pub output_file: Option<PathBuf>,

    /// Camera clock offset from UTC in minutes
    #[serde(default)]
    pub utc_zone_minutes: i64,

    /// Seconds added to every photo timestamp at load time
    #[serde(default)]
    pub time_offset_seconds: i64,

    /// Largest accepted gap between photo time and track point time
    #[serde(default = "default_max_delta_seconds")]
    pub max_delta_seconds: u64,

    /// Recompute positions of photos that already carry coordinates
    #[serde(default)]
    pub overwrite: bool,

    /// 0 = no copies, 1 = copy geotagged photos, 2 = copy all photos
    #[serde(default)]
    pub copy_mode: u8,

    /// Regular expression selecting photo files by name
    #[serde(default = "default_photo_pattern")]
    pub photo_pattern: String,

    /// Prefix (or `%s` pattern) used to build photo links in the KML
    #[serde(default = "default_photo_uri")]
    pub photo_uri: String,

    /// Separator between stage name and phase tag in event names
    #[serde(default = "default_event_separator")]
    pub event_separator: String,
}

impl Default for MainConfig {
    fn default() -> Self {
        Self {
            photo_input_dir: None,
            track_file: None,
            output_file: None,
            utc_zone_minutes: 0,
            time_offset_seconds: 0,
            max_delta_seconds: default_max_delta_seconds(),
            overwrite: false,
            copy_mode: 0,
            photo_pattern: default_photo_pattern(),
            photo_uri: default_photo_uri(),
            event_separator: default_event_separator(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path (optional, logs to stderr if not specified)
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_max_delta_seconds() -> u64 {
    300
}

fn default_photo_pattern() -> String {
    r"(?i)\.jpe?g$".to_string()
}

fn default_photo_uri() -> String {
    "images/".to_string()
}

fn default_event_separator() -> String {
    crate::events::DEFAULT_SEPARATOR.to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Parse a config file
    ///
    /// Unlike [`AppConfig::resolve`], a missing file is an error here.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        config.validate()?;
        info!("Loaded TOML configuration from {:?}", path);
        Ok(config)
    }

    /// Resolve the config file by priority and load it
    ///
    /// Falls back to compiled defaults when no file is found.
    pub fn resolve(cli_arg: Option<&Path>) -> Result<Self> {
        let resolver = ConfigResolver::new("photoplace");
        match resolver.resolve(cli_arg) {
            Some(path) if path.exists() => Self::load(&path),
            Some(path) => {
                warn!("Config file {:?} not found, using compiled defaults", path);
                Ok(Self::default())
            }
            None => {
                info!("No config file found, using compiled defaults");
                Ok(Self::default())
            }
        }
    }

    /// Write this configuration as TOML, creating parent directories
    pub fn write(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject values no stage can work with
    pub fn validate(&self) -> Result<()> {
        if self.main.copy_mode > MAX_COPY_MODE {
            return Err(Error::Config(format!(
                "copy_mode must be 0..={}, got {}",
                MAX_COPY_MODE, self.main.copy_mode
            )));
        }
        if self.main.utc_zone_minutes.unsigned_abs() > MAX_UTC_ZONE_MINUTES.unsigned_abs() {
            return Err(Error::Config(format!(
                "utc_zone_minutes must be within ±{}, got {}",
                MAX_UTC_ZONE_MINUTES, self.main.utc_zone_minutes
            )));
        }
        if self.main.time_offset_seconds.unsigned_abs() > MAX_TIME_OFFSET_SECONDS.unsigned_abs() {
            return Err(Error::Config(format!(
                "time_offset_seconds must be within ±{}, got {}",
                MAX_TIME_OFFSET_SECONDS, self.main.time_offset_seconds
            )));
        }
        if self.main.event_separator.is_empty() {
            return Err(Error::Config("event_separator must not be empty".to_string()));
        }
        Ok(())
    }

    /// True when the `[addons]` table enables `name`
    pub fn addon_enabled(&self, name: &str) -> bool {
        self.addons.get(name).copied().unwrap_or(false)
    }
}

/// Locates the config file for an application
#[derive(Debug, Clone)]
pub struct ConfigResolver {
    app_name: String,
}

impl ConfigResolver {
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
        }
    }

    /// Config file path by priority, or `None` when only defaults apply
    ///
    /// CLI and environment paths are returned even when the file does not
    /// exist, so callers can warn about them. The user config dir is only
    /// returned when the file is present.
    pub fn resolve(&self, cli_arg: Option<&Path>) -> Option<PathBuf> {
        // Priority 1: Command-line argument
        if let Some(path) = cli_arg {
            return Some(path.to_path_buf());
        }

        // Priority 2: Environment variable
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            if !path.is_empty() {
                return Some(PathBuf::from(path));
            }
        }

        // Priority 3: User config dir
        self.default_config_path().filter(|path| path.exists())
    }

    /// `<config dir>/<app>/config.toml` for the current platform
    pub fn default_config_path(&self) -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join(&self.app_name).join("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.main.max_delta_seconds, 300);
        assert_eq!(config.main.event_separator, ":");
        assert_eq!(config.main.photo_uri, "images/");
        assert_eq!(config.logging.level, "info");
        assert!(config.addons.is_empty());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [main]
            utc_zone_minutes = 60
            copy_mode = 1

            [addons]
            manifest = true
            "#,
        )
        .unwrap();

        assert_eq!(config.main.utc_zone_minutes, 60);
        assert_eq!(config.main.copy_mode, 1);
        assert_eq!(config.main.max_delta_seconds, 300);
        assert_eq!(config.logging, LoggingConfig::default());
        assert!(config.addon_enabled("manifest"));
        assert!(!config.addon_enabled("tour"));
    }

    #[test]
    fn test_validate_rejects_bad_copy_mode() {
        let mut config = AppConfig::default();
        config.main.copy_mode = 3;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_empty_separator() {
        let mut config = AppConfig::default();
        config.main.event_separator.clear();
        assert!(config.validate().is_err());
    }
}
