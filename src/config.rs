//! # Configuration Management Module
//!
//! Persistent settings for the presence tracker, stored in the platform config directory.
//! Handles loading, saving, and providing defaults for configuration options.
//!
//! ## Settings
//! - `adapter`: Bluetooth adapter to scan with (e.g. "hci0")
//! - `track_new`: Record devices that are not listed in `known_devices`
//! - `known_devices`: Addresses always tracked
//! - `consider_home_secs`: How long a device counts as present after its last sighting
//! - `report_interval_secs`: How often the binary logs a presence summary
//! - `dispatch_interval_ms`: Upper bound of one bus dispatch iteration (bounds stop latency)
//! - `join_timeout_ms`: How long `stop()` waits for the dispatch thread
//! - `coalesce_window_ms`: Suppress repeated sightings of one address within this window (0 = off)
//!
//! ## Storage Location
//! - Linux: ~/.config/bt-presence/config.toml

use crate::error::ConfigError;
use crate::supervisor::SupervisorOptions;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub adapter: String,
    pub track_new: bool,
    pub known_devices: Vec<String>,
    pub consider_home_secs: u64,
    pub report_interval_secs: u64,
    pub dispatch_interval_ms: u64,
    pub join_timeout_ms: u64,
    pub coalesce_window_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            adapter: "hci0".to_string(),
            track_new: true,
            known_devices: Vec::new(),
            consider_home_secs: 180,
            report_interval_secs: 12,
            dispatch_interval_ms: 250,
            join_timeout_ms: 5000,
            coalesce_window_ms: 0,
        }
    }
}

impl Config {
    /// Get the path to the config file
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("bt-presence")
            .join("config.toml")
    }

    /// Load config from the default location, or create default if it doesn't exist
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Self::config_path())
    }

    /// Save config to the default location
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(Self::config_path())
    }

    /// Load config from `path`, writing the defaults there if the file doesn't exist
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(contents) => {
                let config = toml::from_str(&contents).map_err(ConfigError::ParseFailed)?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = Self::default();
                config.save_to(path)?;
                Ok(config)
            }
            Err(e) => Err(ConfigError::ReadFailed(e)),
        }
    }

    /// Save config to `path`, creating parent directories as needed
    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(ConfigError::WriteFailed)?;
        }

        let toml_string = toml::to_string_pretty(self).map_err(ConfigError::SerializeFailed)?;
        fs::write(path, toml_string).map_err(ConfigError::WriteFailed)?;

        Ok(())
    }

    pub fn consider_home(&self) -> Duration {
        Duration::from_secs(self.consider_home_secs)
    }

    pub fn report_interval(&self) -> Duration {
        // A zero tick would spin the binary's select loop
        Duration::from_secs(self.report_interval_secs.max(1))
    }

    /// Supervisor tuning derived from this config
    pub fn supervisor_options(&self) -> SupervisorOptions {
        SupervisorOptions {
            dispatch_interval: Duration::from_millis(self.dispatch_interval_ms.max(1)),
            join_timeout: Duration::from_millis(self.join_timeout_ms),
            coalesce_window: match self.coalesce_window_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
            ..SupervisorOptions::default()
        }
    }
}
