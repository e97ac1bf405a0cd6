//! # Presence Tracker
//!
//! The host side of the pipeline: keeps the latest record per device and answers who is
//! currently present. Nothing is persisted and no history is kept.
//!
//! ## Policy
//! - Devices are keyed `BTD_<address>`.
//! - Unknown addresses are only recorded when `track_new` is set.
//! - A device is present while its last sighting is younger than `consider_home`.

use crate::config::Config;
use crate::sighting::Sighting;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

pub const DEVICE_ID_PREFIX: &str = "BTD_";
pub const SOURCE_TYPE_BLUETOOTH: &str = "bluetooth";

/// Latest known state of one tracked device
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRecord {
    pub dev_id: String,
    pub address: String,
    pub host_name: String,
    pub rssi: i16,
    pub source_type: &'static str,
    pub last_seen: DateTime<Utc>,
}

pub struct PresenceTracker {
    devices: HashMap<String, DeviceRecord>,
    known: HashSet<String>,
    track_new: bool,
    consider_home: chrono::Duration,
}

impl PresenceTracker {
    pub fn new(track_new: bool, known_devices: &[String], consider_home: Duration) -> Self {
        Self {
            devices: HashMap::new(),
            known: known_devices.iter().map(|a| a.to_uppercase()).collect(),
            track_new,
            consider_home: chrono::Duration::from_std(consider_home)
                .unwrap_or(chrono::Duration::MAX),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.track_new, &config.known_devices, config.consider_home())
    }

    /// Records a sighting. Returns false when the device is untracked under the current policy.
    pub fn see(&mut self, sighting: Sighting) -> bool {
        let address = sighting.address.to_uppercase();
        let dev_id = format!("{}{}", DEVICE_ID_PREFIX, address);

        if !self.devices.contains_key(&dev_id) && !self.track_new && !self.known.contains(&address) {
            log::debug!("Ignoring new device {} ({})", address, sighting.display_name);
            return false;
        }

        let record = DeviceRecord {
            dev_id: dev_id.clone(),
            address,
            host_name: sighting.display_name,
            rssi: sighting.signal_strength,
            source_type: SOURCE_TYPE_BLUETOOTH,
            last_seen: sighting.observed_at,
        };
        if self.devices.insert(dev_id, record).is_none() {
            log::info!("Tracking new device {}", sighting.address);
        }
        true
    }

    pub fn device(&self, address: &str) -> Option<&DeviceRecord> {
        self.devices
            .get(&format!("{}{}", DEVICE_ID_PREFIX, address.to_uppercase()))
    }

    /// Devices whose last sighting is within `consider_home` of `now`, most recent first
    pub fn present(&self, now: DateTime<Utc>) -> Vec<&DeviceRecord> {
        let mut present: Vec<&DeviceRecord> = self
            .devices
            .values()
            .filter(|record| now.signed_duration_since(record.last_seen) <= self.consider_home)
            .collect();
        present.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        present
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
