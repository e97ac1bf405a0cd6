//! Presence Bus Client
//!
//! The I/O boundary to the Bluetooth management daemon. No policy lives here: the
//! supervisor decides when to clear, scan, subscribe and forget.
//!
//! ## Modules
//!
//! - [`bluez`] - BlueZ backend over the system D-Bus

pub mod bluez;
#[cfg(test)]
pub(crate) mod recording;

use crate::error::{ConnectionError, DiscoveryError};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

pub use bluez::BluezClient;

/// Opaque reference to one Bluetooth radio
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterHandle {
    name: String,
    object_path: String,
}

impl AdapterHandle {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            object_path: format!("/org/bluez/{}", name),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn object_path(&self) -> &str {
        &self.object_path
    }

    /// Whether `path` names an object below this adapter (a device, not the adapter itself)
    pub fn owns(&self, path: &str) -> bool {
        path.strip_prefix(self.object_path.as_str())
            .map(|rest| rest.len() > 1 && rest.starts_with('/'))
            .unwrap_or(false)
    }
}

impl fmt::Display for AdapterHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// A property value as delivered by the daemon, reduced to what sightings need
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Str(String),
    Int(i64),
    Bool(bool),
    /// Containers and other types the tracker has no use for
    Other,
}

pub type PropertyMap = HashMap<String, PropertyValue>;

/// One "interfaces added" notification for an object on the bus
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    pub object_path: String,
    pub interfaces: HashMap<String, PropertyMap>,
}

/// Discovery filter passed to the daemon. The default accepts every advertising device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryFilter {
    /// "auto", "bredr" or "le"
    pub transport: Option<String>,
    /// Only report devices at or above this signal strength
    pub rssi_threshold: Option<i16>,
}

impl DiscoveryFilter {
    pub fn is_empty(&self) -> bool {
        self.transport.is_none() && self.rssi_threshold.is_none()
    }
}

/// Forgets a device on the daemon so it can be announced again
pub trait DeviceRemover {
    fn remove_device(&self, device_path: &str) -> Result<(), ConnectionError>;
}

/// Called once per appearance signal, on the thread driving [`BusClient::process`]
pub type AppearanceCallback = Box<dyn FnMut(RawEvent, &dyn DeviceRemover) + Send + 'static>;

/// Operations the supervisor needs from the management daemon.
///
/// Implementations are moved into the supervisor's dispatch thread once discovery starts,
/// hence the `Send + 'static` bound.
pub trait BusClient: DeviceRemover + Send + 'static {
    fn adapter(&self) -> &AdapterHandle;

    /// Remove every device object currently known under the adapter. Returns how many were removed.
    fn clear_known_devices(&mut self) -> Result<usize, ConnectionError>;

    fn start_discovery(&mut self, filter: &DiscoveryFilter) -> Result<(), DiscoveryError>;

    /// Idempotent: does nothing when discovery is not active
    fn stop_discovery(&mut self) -> Result<(), DiscoveryError>;

    /// Register the appearance callback. A second subscription delivers every event twice.
    fn subscribe_appearances(&mut self, callback: AppearanceCallback) -> Result<(), ConnectionError>;

    /// Run one dispatch iteration, blocking for at most `timeout`
    fn process(&mut self, timeout: Duration) -> Result<(), ConnectionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_handle_paths() {
        let adapter = AdapterHandle::new("hci0");
        assert_eq!(adapter.object_path(), "/org/bluez/hci0");
        assert_eq!(adapter.to_string(), "hci0");
    }

    #[test]
    fn test_adapter_owns_only_its_children() {
        let adapter = AdapterHandle::new("hci0");
        assert!(adapter.owns("/org/bluez/hci0/dev_AA_BB_CC_DD_EE_01"));
        assert!(!adapter.owns("/org/bluez/hci0"));
        assert!(!adapter.owns("/org/bluez/hci0/"));
        assert!(!adapter.owns("/org/bluez/hci1/dev_AA_BB_CC_DD_EE_01"));
        assert!(!adapter.owns("/org/bluez/hci01/dev_AA_BB_CC_DD_EE_01"));
    }

    #[test]
    fn test_default_filter_is_empty() {
        assert!(DiscoveryFilter::default().is_empty());
        let filter = DiscoveryFilter {
            transport: Some("le".to_string()),
            ..DiscoveryFilter::default()
        };
        assert!(!filter.is_empty());
    }
}
