//! BlueZ backend for the presence bus client.
//!
//! Talks to `org.bluez` on the system bus with the blocking `dbus` connection. The
//! connection's own `process` call is the notification loop; the supervisor drives it
//! from its dispatch thread.

use super::{
    AdapterHandle, AppearanceCallback, BusClient, DeviceRemover, DiscoveryFilter,
    PropertyMap, PropertyValue, RawEvent,
};
use crate::error::{ConnectionError, DiscoveryError};
use dbus::arg::{ArgType, PropMap, RefArg, Variant};
use dbus::blocking::stdintf::org_freedesktop_dbus::{
    ObjectManager, ObjectManagerInterfacesAdded, Properties,
};
use dbus::blocking::Connection;
use dbus::message::MatchRule;
use dbus::{Message, Path};
use std::collections::HashMap;
use std::time::Duration;

const BLUEZ_SERVICE: &str = "org.bluez";
const ADAPTER_IFACE: &str = "org.bluez.Adapter1";
pub(crate) const DEVICE_IFACE: &str = "org.bluez.Device1";
const OBJECT_MANAGER_IFACE: &str = "org.freedesktop.DBus.ObjectManager";

/// Timeout for individual method calls to the daemon
const CALL_TIMEOUT: Duration = Duration::from_secs(5);

type ManagedObjects = HashMap<Path<'static>, HashMap<String, PropMap>>;

/// Presence bus client backed by BlueZ
pub struct BluezClient {
    conn: Connection,
    adapter: AdapterHandle,
    adapter_path: Path<'static>,
    discovering: bool,
}

impl BluezClient {
    /// Opens the system bus and checks that `adapter_name` exists on the daemon
    pub fn connect(adapter_name: &str) -> Result<Self, ConnectionError> {
        let adapter = AdapterHandle::new(adapter_name);
        let adapter_path = Path::new(adapter.object_path().to_string()).map_err(|reason| {
            ConnectionError::AdapterNotFound {
                adapter: adapter_name.to_string(),
                reason,
            }
        })?;

        let conn = Connection::new_system()
            .map_err(|e| ConnectionError::BusUnavailable(e.to_string()))?;

        // Reading a property fails when the daemon is down or the adapter object is missing
        let address: String = conn
            .with_proxy(BLUEZ_SERVICE, adapter_path.clone(), CALL_TIMEOUT)
            .get(ADAPTER_IFACE, "Address")
            .map_err(|e| ConnectionError::AdapterNotFound {
                adapter: adapter_name.to_string(),
                reason: e.to_string(),
            })?;

        log::info!("Connected to Bluetooth adapter {} ({})", adapter, address);

        Ok(Self {
            conn,
            adapter,
            adapter_path,
            discovering: false,
        })
    }

    fn adapter_call(&self, method: &'static str, args: impl dbus::arg::AppendAll) -> Result<(), dbus::Error> {
        self.conn
            .with_proxy(BLUEZ_SERVICE, self.adapter_path.clone(), CALL_TIMEOUT)
            .method_call::<(), _, _, _>(ADAPTER_IFACE, method, args)
    }
}

impl DeviceRemover for BluezClient {
    fn remove_device(&self, device_path: &str) -> Result<(), ConnectionError> {
        remove_device_on(&self.conn, &self.adapter_path, device_path)
    }
}

impl BusClient for BluezClient {
    fn adapter(&self) -> &AdapterHandle {
        &self.adapter
    }

    fn clear_known_devices(&mut self) -> Result<usize, ConnectionError> {
        let objects: ManagedObjects = self
            .conn
            .with_proxy(BLUEZ_SERVICE, "/", CALL_TIMEOUT)
            .get_managed_objects()
            .map_err(|e| call_failed("GetManagedObjects", e))?;

        let stale = known_device_paths(&self.adapter, &objects);
        for path in &stale {
            log::debug!("Forgetting known device {}", path);
            self.remove_device(path)?;
        }

        Ok(stale.len())
    }

    fn start_discovery(&mut self, filter: &DiscoveryFilter) -> Result<(), DiscoveryError> {
        if self.discovering {
            return Err(DiscoveryError::AlreadyActive);
        }

        self.adapter_call("SetDiscoveryFilter", (filter_props(filter),))
            .map_err(|e| discovery_error(&e))?;
        self.adapter_call("StartDiscovery", ())
            .map_err(|e| discovery_error(&e))?;

        self.discovering = true;
        log::info!("Discovery started on {}", self.adapter);
        Ok(())
    }

    fn stop_discovery(&mut self) -> Result<(), DiscoveryError> {
        if !self.discovering {
            return Ok(());
        }

        // The flag only drops once the daemon agrees it is not scanning
        settle_stop(self.adapter_call("StopDiscovery", ()), &self.adapter)?;
        self.discovering = false;

        log::info!("Discovery stopped on {}", self.adapter);
        Ok(())
    }

    fn subscribe_appearances(&mut self, mut callback: AppearanceCallback) -> Result<(), ConnectionError> {
        let rule = MatchRule::new_signal(OBJECT_MANAGER_IFACE, "InterfacesAdded")
            .with_sender(BLUEZ_SERVICE);
        let adapter = self.adapter.clone();
        let adapter_path = self.adapter_path.clone();

        self.conn
            .add_match(
                rule,
                move |signal: ObjectManagerInterfacesAdded, conn: &Connection, _: &Message| {
                    let event = raw_event(signal);
                    if adapter.owns(&event.object_path) {
                        let remover = ConnectionRemover {
                            conn,
                            adapter_path: &adapter_path,
                        };
                        callback(event, &remover);
                    }
                    // Keep the match registered
                    true
                },
            )
            .map_err(|e| call_failed("AddMatch", e))?;

        Ok(())
    }

    fn process(&mut self, timeout: Duration) -> Result<(), ConnectionError> {
        self.conn
            .process(timeout)
            .map(|_| ())
            .map_err(|e| call_failed("process", e))
    }
}

/// Remover handed to the appearance callback while the connection is dispatching
struct ConnectionRemover<'a> {
    conn: &'a Connection,
    adapter_path: &'a Path<'static>,
}

impl DeviceRemover for ConnectionRemover<'_> {
    fn remove_device(&self, device_path: &str) -> Result<(), ConnectionError> {
        remove_device_on(self.conn, self.adapter_path, device_path)
    }
}

fn remove_device_on(
    conn: &Connection,
    adapter_path: &Path<'static>,
    device_path: &str,
) -> Result<(), ConnectionError> {
    let device = Path::new(device_path.to_string()).map_err(ConnectionError::InvalidPath)?;

    conn.with_proxy(BLUEZ_SERVICE, adapter_path.clone(), CALL_TIMEOUT)
        .method_call::<(), _, _, _>(ADAPTER_IFACE, "RemoveDevice", (device,))
        .map_err(|e| call_failed("RemoveDevice", e))
}

fn call_failed(method: &'static str, e: dbus::Error) -> ConnectionError {
    ConnectionError::CallFailed {
        method,
        reason: e.to_string(),
    }
}

fn discovery_error(e: &dbus::Error) -> DiscoveryError {
    match e.name() {
        Some("org.bluez.Error.InProgress") => DiscoveryError::AlreadyActive,
        Some("org.bluez.Error.NotReady") => DiscoveryError::RadioDisabled,
        _ => DiscoveryError::Failed(e.to_string()),
    }
}

/// BlueZ answers StopDiscovery with a generic failure when no session of ours is running
fn is_not_discovering(e: &dbus::Error) -> bool {
    e.name() == Some("org.bluez.Error.Failed")
        && e.message().map_or(false, |m| m.contains("No discovery started"))
}

/// Device objects below `adapter`, sorted so removal order is stable
/// Maps a `StopDiscovery` reply; "No discovery started" counts as stopped
fn settle_stop(reply: Result<(), dbus::Error>, adapter: &AdapterHandle) -> Result<(), DiscoveryError> {
    match reply {
        Ok(()) => Ok(()),
        Err(e) if is_not_discovering(&e) => {
            log::debug!("Discovery on {} was already stopped", adapter);
            Ok(())
        }
        Err(e) => Err(discovery_error(&e)),
    }
}

fn known_device_paths(adapter: &AdapterHandle, objects: &ManagedObjects) -> Vec<String> {
    let mut paths: Vec<String> = objects
        .iter()
        .filter(|(path, interfaces)| adapter.owns(path) && interfaces.contains_key(DEVICE_IFACE))
        .map(|(path, _)| path.to_string())
        .collect();
    paths.sort();
    paths
}

fn filter_props(filter: &DiscoveryFilter) -> PropMap {
    let mut props = PropMap::new();
    if let Some(transport) = &filter.transport {
        props.insert(
            "Transport".to_string(),
            Variant(Box::new(transport.clone()) as Box<dyn RefArg>),
        );
    }
    if let Some(rssi) = filter.rssi_threshold {
        props.insert("RSSI".to_string(), Variant(Box::new(rssi) as Box<dyn RefArg>));
    }
    props
}

fn raw_event(signal: ObjectManagerInterfacesAdded) -> RawEvent {
    let interfaces = signal
        .interfaces
        .iter()
        .map(|(iface, props)| (iface.clone(), property_map(props)))
        .collect();

    RawEvent {
        object_path: signal.object.to_string(),
        interfaces,
    }
}

fn property_map(props: &PropMap) -> PropertyMap {
    props
        .iter()
        .map(|(name, value)| (name.clone(), property_value(value)))
        .collect()
}

fn property_value(value: &Variant<Box<dyn RefArg>>) -> PropertyValue {
    let arg: &dyn RefArg = &*value.0;
    let converted = match arg.arg_type() {
        ArgType::String | ArgType::ObjectPath => arg.as_str().map(|s| PropertyValue::Str(s.to_string())),
        ArgType::Boolean => arg.as_any().downcast_ref::<bool>().map(|b| PropertyValue::Bool(*b)),
        ArgType::Byte
        | ArgType::Int16
        | ArgType::UInt16
        | ArgType::Int32
        | ArgType::UInt32
        | ArgType::Int64
        | ArgType::UInt64 => arg.as_i64().map(PropertyValue::Int),
        _ => None,
    };
    converted.unwrap_or(PropertyValue::Other)
}
