//! Recording bus client for tests: logs every call in order and replays synthetic
//! appearance events pushed through its [`BusProbe`].

use super::{
    AdapterHandle, AppearanceCallback, BusClient, DeviceRemover, DiscoveryFilter, RawEvent,
};
use crate::error::{ConnectionError, DiscoveryError};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Call {
    ClearKnownDevices,
    RemoveDevice(String),
    StartDiscovery(DiscoveryFilter),
    StopDiscovery,
    Subscribe,
    /// A `process` iteration that returned an error
    ProcessFailed,
}

pub(crate) struct RecordingBus {
    adapter: AdapterHandle,
    calls: Arc<Mutex<Vec<Call>>>,
    known: Arc<Mutex<Vec<String>>>,
    events: Receiver<RawEvent>,
    callbacks: Vec<AppearanceCallback>,
    discovering: bool,
    pub(crate) fail_clear: bool,
    pub(crate) start_error: Option<DiscoveryError>,
    pub(crate) fail_subscribe: bool,
    /// Number of upcoming `process` iterations that fail before touching events
    pub(crate) fail_process: usize,
}

/// Test-side view of a [`RecordingBus`] that has been moved into a supervisor
#[derive(Clone)]
pub(crate) struct BusProbe {
    calls: Arc<Mutex<Vec<Call>>>,
    known: Arc<Mutex<Vec<String>>>,
    events: Sender<RawEvent>,
}

impl RecordingBus {
    pub(crate) fn new(known_devices: &[&str]) -> (Self, BusProbe) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let known = Arc::new(Mutex::new(
            known_devices.iter().map(|path| path.to_string()).collect(),
        ));
        let (events_tx, events_rx) = unbounded();

        let bus = Self {
            adapter: AdapterHandle::new("hci0"),
            calls: calls.clone(),
            known: known.clone(),
            events: events_rx,
            callbacks: Vec::new(),
            discovering: false,
            fail_clear: false,
            start_error: None,
            fail_subscribe: false,
            fail_process: 0,
        };
        let probe = BusProbe {
            calls,
            known,
            events: events_tx,
        };
        (bus, probe)
    }
}

impl BusProbe {
    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn known_devices(&self) -> Vec<String> {
        self.known.lock().unwrap().clone()
    }

    pub(crate) fn emit(&self, event: RawEvent) {
        self.events.send(event).unwrap();
    }
}

struct Recorder<'a> {
    calls: &'a Mutex<Vec<Call>>,
    known: &'a Mutex<Vec<String>>,
}

impl DeviceRemover for Recorder<'_> {
    fn remove_device(&self, device_path: &str) -> Result<(), ConnectionError> {
        self.calls
            .lock()
            .unwrap()
            .push(Call::RemoveDevice(device_path.to_string()));
        self.known.lock().unwrap().retain(|path| path != device_path);
        Ok(())
    }
}

impl DeviceRemover for RecordingBus {
    fn remove_device(&self, device_path: &str) -> Result<(), ConnectionError> {
        Recorder {
            calls: &self.calls,
            known: &self.known,
        }
        .remove_device(device_path)
    }
}

impl BusClient for RecordingBus {
    fn adapter(&self) -> &AdapterHandle {
        &self.adapter
    }

    fn clear_known_devices(&mut self) -> Result<usize, ConnectionError> {
        self.calls.lock().unwrap().push(Call::ClearKnownDevices);
        if self.fail_clear {
            return Err(ConnectionError::BusUnavailable("daemon unreachable".to_string()));
        }

        let stale = self.known.lock().unwrap().clone();
        for path in &stale {
            self.remove_device(path)?;
        }
        Ok(stale.len())
    }

    fn start_discovery(&mut self, filter: &DiscoveryFilter) -> Result<(), DiscoveryError> {
        self.calls
            .lock()
            .unwrap()
            .push(Call::StartDiscovery(filter.clone()));
        if let Some(e) = self.start_error.clone() {
            return Err(e);
        }
        if self.discovering {
            return Err(DiscoveryError::AlreadyActive);
        }
        self.discovering = true;
        Ok(())
    }

    fn stop_discovery(&mut self) -> Result<(), DiscoveryError> {
        if self.discovering {
            self.calls.lock().unwrap().push(Call::StopDiscovery);
            self.discovering = false;
        }
        Ok(())
    }

    fn subscribe_appearances(&mut self, callback: AppearanceCallback) -> Result<(), ConnectionError> {
        self.calls.lock().unwrap().push(Call::Subscribe);
        if self.fail_subscribe {
            return Err(ConnectionError::CallFailed {
                method: "AddMatch",
                reason: "match rule rejected".to_string(),
            });
        }
        self.callbacks.push(callback);
        Ok(())
    }

    fn process(&mut self, timeout: Duration) -> Result<(), ConnectionError> {
        if self.fail_process > 0 {
            self.fail_process -= 1;
            self.calls.lock().unwrap().push(Call::ProcessFailed);
            return Err(ConnectionError::BusUnavailable("connection reset".to_string()));
        }

        let mut pending = Vec::new();
        if let Ok(event) = self.events.recv_timeout(timeout) {
            pending.push(event);
            pending.extend(self.events.try_iter());
        }

        let remover = Recorder {
            calls: &self.calls,
            known: &self.known,
        };
        for event in pending {
            for callback in self.callbacks.iter_mut() {
                callback(event.clone(), &remover);
            }
        }
        Ok(())
    }
}
