//! Monitor configuration management.
//!
//! Handles loading and saving the monitor's tuning knobs:
//! - smoothing window span and visibility timeout
//! - reconnect and first-connect delays
//! - scan sweep interval
//! - whether the optional wake-up service may be skipped during updates
//!
//! Every duration is stored as integer milliseconds in TOML and exposed as
//! [`Duration`] through the accessor methods.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::time::Duration;

use crate::error::{CairnError, Result};

/// Tuning knobs for a [`BeaconMonitor`](crate::monitor::BeaconMonitor).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Span of the zone smoothing window, in milliseconds.
    pub window_ms: u64,

    /// How long a beacon stays visible without a new advertisement, in
    /// milliseconds.
    pub visibility_timeout_ms: u64,

    /// Fixed delay before each reconnect attempt, in milliseconds.
    pub reconnect_delay_ms: u64,

    /// Delay between spotting a configurable tag and opening its
    /// connection, in milliseconds.
    pub connect_delay_ms: u64,

    /// Interval between scan sweeps over visible devices, in milliseconds.
    pub rescan_interval_ms: u64,

    /// Whether a tag without the wake-up service may still complete an
    /// update, settling its wake-up attributes untouched.
    pub skip_optional_service: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            window_ms: 2000,
            visibility_timeout_ms: 30_000,
            reconnect_delay_ms: 500,
            connect_delay_ms: 100,
            rescan_interval_ms: 2000,
            skip_optional_service: false,
        }
    }
}

impl MonitorConfig {
    /// Span of the zone smoothing window.
    #[must_use]
    pub const fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// How long a beacon stays visible without a new advertisement.
    #[must_use]
    pub const fn visibility_timeout(&self) -> Duration {
        Duration::from_millis(self.visibility_timeout_ms)
    }

    /// Fixed delay before each reconnect attempt.
    #[must_use]
    pub const fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Delay between spotting a configurable tag and connecting to it.
    #[must_use]
    pub const fn connect_delay(&self) -> Duration {
        Duration::from_millis(self.connect_delay_ms)
    }

    /// Interval between scan sweeps over visible devices.
    #[must_use]
    pub const fn rescan_interval(&self) -> Duration {
        Duration::from_millis(self.rescan_interval_ms)
    }

    /// Load configuration from the default path, falling back to defaults
    /// when no file exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be read or parsed.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration from `path`, falling back to defaults when no
    /// file exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be read or parsed.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)
                .map_err(|err| CairnError::ConfigParse(err.to_string()))?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to the default path.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be written.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    /// Save configuration to `path`, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be written.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|err| CairnError::ConfigSerialize(err.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the configuration file path.
    fn config_path() -> Result<PathBuf> {
        // On embedded deployments: /etc/cairn/config.toml
        // For development: ~/.config/cairn/config.toml
        #[cfg(target_os = "linux")]
        {
            Ok(PathBuf::from("/etc/cairn/config.toml"))
        }
        #[cfg(not(target_os = "linux"))]
        {
            let dirs = directories::ProjectDirs::from("", "", "cairn")
                .ok_or(CairnError::ConfigDirUnavailable)?;
            Ok(dirs.config_dir().join("config.toml"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MonitorConfig::default();
        assert_eq!(config.window(), Duration::from_millis(2000));
        assert_eq!(config.visibility_timeout(), Duration::from_millis(30_000));
        assert_eq!(config.reconnect_delay(), Duration::from_millis(500));
        assert_eq!(config.connect_delay(), Duration::from_millis(100));
        assert_eq!(config.rescan_interval(), Duration::from_millis(2000));
        assert!(!config.skip_optional_service);
    }

    #[test]
    fn test_round_trip_through_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("monitor").join("config.toml");

        let config = MonitorConfig {
            reconnect_delay_ms: 750,
            skip_optional_service: true,
            ..MonitorConfig::default()
        };
        config.save_to(&path).unwrap();

        let loaded = MonitorConfig::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = MonitorConfig::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(loaded, MonitorConfig::default());
    }

    #[test]
    fn test_malformed_file_reports_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "window_ms = \"fast\"").unwrap();

        let err = MonitorConfig::load_from(&path).unwrap_err();
        assert!(err.is_config_error());
    }
}
