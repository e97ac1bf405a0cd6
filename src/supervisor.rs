//! # Discovery Supervisor
//!
//! Owns one bus client and the dedicated thread that drives its notification loop.
//!
//! ## Lifecycle
//! ```text
//! Idle --start()--> Discovering --stop()--> Stopping --(loop exits)--> Stopped
//! ```
//! `Stopped` is terminal: construct a new supervisor to scan again.
//!
//! ## Threads
//! Exactly two: the caller's (start/stop) and the dispatch thread. The client is moved into
//! the dispatch thread once discovery starts, so nothing else can touch the bus while it
//! runs. The dispatch thread only notices a stop request between `process` iterations,
//! which is why `dispatch_interval` bounds how quickly `stop()` completes.

use crate::bus::{AdapterHandle, BluezClient, BusClient, DeviceRemover, DiscoveryFilter, RawEvent};
use crate::dispatch::{DispatchStats, Dispatcher};
use crate::error::{ConnectionError, InvalidStateError, SupervisorError};
use crate::handler::SightingHandler;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Discovering,
    Stopping,
    Stopped,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SupervisorState::Idle => "idle",
            SupervisorState::Discovering => "discovering",
            SupervisorState::Stopping => "stopping",
            SupervisorState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorOptions {
    /// Filter passed to the daemon; the default accepts every advertising device
    pub filter: DiscoveryFilter,
    /// Longest single blocking dispatch iteration
    pub dispatch_interval: Duration,
    /// How long `stop()` waits for the dispatch thread to exit
    pub join_timeout: Duration,
    /// Suppress repeated sightings of one address within this window
    pub coalesce_window: Option<Duration>,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            filter: DiscoveryFilter::default(),
            dispatch_interval: Duration::from_millis(250),
            join_timeout: Duration::from_secs(5),
            coalesce_window: None,
        }
    }
}

/// Handles to a running dispatch thread
struct DispatchLoop {
    quit: Sender<()>,
    done: Receiver<()>,
    thread: thread::JoinHandle<()>,
}

/// Runs continuous discovery on one adapter and reports sightings to a handler
pub struct Supervisor<C: BusClient> {
    client: Option<C>,
    adapter: AdapterHandle,
    options: SupervisorOptions,
    state: SupervisorState,
    running: Option<DispatchLoop>,
    stats: Arc<DispatchStats>,
}

impl Supervisor<BluezClient> {
    /// Connects to `adapter_name` on the BlueZ daemon
    pub fn connect(adapter_name: &str, options: SupervisorOptions) -> Result<Self, ConnectionError> {
        let client = BluezClient::connect(adapter_name)?;
        Ok(Self::new(client, options))
    }
}

impl<C: BusClient> Supervisor<C> {
    pub fn new(client: C, options: SupervisorOptions) -> Self {
        let adapter = client.adapter().clone();
        Self {
            client: Some(client),
            adapter,
            options,
            state: SupervisorState::Idle,
            running: None,
            stats: Arc::default(),
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn adapter(&self) -> &AdapterHandle {
        &self.adapter
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    /// Clears the adapter's known devices, starts discovery and spawns the dispatch thread.
    ///
    /// Bus failures leave the supervisor `Idle`. `handler` runs on the dispatch thread; see
    /// [`SightingHandler`] for what that implies.
    pub fn start<H: SightingHandler>(&mut self, handler: H) -> Result<(), SupervisorError> {
        let invalid = InvalidStateError {
            operation: "start",
            state: self.state,
        };
        if self.state != SupervisorState::Idle {
            return Err(invalid.into());
        }
        let Some(mut client) = self.client.take() else {
            return Err(invalid.into());
        };

        if let Err(e) = self.begin_discovery(&mut client, Box::new(handler)) {
            self.client = Some(client);
            return Err(e);
        }

        let (quit_tx, quit_rx) = bounded(1);
        let (done_tx, done_rx) = bounded(1);
        let interval = self.options.dispatch_interval;

        let spawned = thread::Builder::new()
            .name(format!("bt-presence-{}", self.adapter.name()))
            .spawn(move || {
                dispatch_loop(client, quit_rx, interval);
                let _ = done_tx.send(());
            });

        match spawned {
            Ok(thread) => {
                self.running = Some(DispatchLoop {
                    quit: quit_tx,
                    done: done_rx,
                    thread,
                });
                self.state = SupervisorState::Discovering;
                log::info!("Discovery supervisor running on {}", self.adapter);
                Ok(())
            }
            Err(e) => {
                // The client went down with the closure
                self.state = SupervisorState::Stopped;
                Err(SupervisorError::Spawn(e))
            }
        }
    }

    /// Clear, scan, subscribe. On failure discovery is not left running.
    fn begin_discovery(
        &self,
        client: &mut C,
        handler: Box<dyn SightingHandler>,
    ) -> Result<(), SupervisorError> {
        let cleared = client.clear_known_devices()?;
        log::info!("Cleared {} known device(s) from {}", cleared, self.adapter);

        client.start_discovery(&self.options.filter)?;

        let mut dispatcher =
            Dispatcher::new(handler, self.options.coalesce_window, self.stats.clone());
        let subscribed = client.subscribe_appearances(Box::new(
            move |event: RawEvent, remover: &dyn DeviceRemover| {
                dispatcher.on_appearance(event, remover)
            },
        ));
        if let Err(e) = subscribed {
            if let Err(why) = client.stop_discovery() {
                log::warn!("Could not stop discovery on {}: {}", self.adapter, why);
            }
            return Err(e.into());
        }

        Ok(())
    }

    /// Asks the dispatch loop to quit and waits for it, at most `join_timeout`.
    ///
    /// No-op when `Idle` or `Stopped`. On `JoinTimeout` the supervisor stays `Stopping` and
    /// a later call waits again; the caller decides whether to escalate.
    pub fn stop(&mut self) -> Result<(), SupervisorError> {
        match self.state {
            SupervisorState::Idle | SupervisorState::Stopped => return Ok(()),
            SupervisorState::Discovering => {
                self.state = SupervisorState::Stopping;
                log::info!("Stopping discovery on {}", self.adapter);
                if let Some(running) = &self.running {
                    let _ = running.quit.try_send(());
                }
            }
            SupervisorState::Stopping => {}
        }

        let Some(running) = self.running.take() else {
            self.state = SupervisorState::Stopped;
            return Ok(());
        };

        match running.done.recv_timeout(self.options.join_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {}
            Err(RecvTimeoutError::Timeout) => {
                log::error!(
                    "Dispatch loop on {} did not exit within {:?}",
                    self.adapter,
                    self.options.join_timeout
                );
                self.running = Some(running);
                return Err(SupervisorError::JoinTimeout(self.options.join_timeout));
            }
        }

        self.state = SupervisorState::Stopped;
        match running.thread.join() {
            Ok(()) => {
                log::info!(
                    "Discovery on {} stopped after {} sighting(s), {} ignored event(s)",
                    self.adapter,
                    self.stats.delivered(),
                    self.stats.dropped()
                );
                Ok(())
            }
            Err(_) => {
                log::error!("Dispatch loop on {} panicked", self.adapter);
                Err(SupervisorError::LoopPanicked)
            }
        }
    }
}

impl<C: BusClient> Drop for Supervisor<C> {
    fn drop(&mut self) {
        if let Err(why) = self.stop() {
            log::error!("Discovery supervisor for {} did not shut down: {}", self.adapter, why);
        }
    }
}

/// Body of the dispatch thread: drive the bus until a quit request, then stop discovery
fn dispatch_loop<C: BusClient>(mut client: C, quit: Receiver<()>, interval: Duration) {
    log::debug!("Dispatch loop for {} started", client.adapter());

    loop {
        match quit.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => {}
        }

        if let Err(why) = client.process(interval) {
            log::warn!("Bus dispatch on {} failed: {}", client.adapter(), why);
            // Back off instead of spinning on a broken connection
            match quit.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    if let Err(why) = client.stop_discovery() {
        log::warn!("Could not stop discovery on {}: {}", client.adapter(), why);
    }
    log::debug!("Dispatch loop for {} exited", client.adapter());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::recording::{BusProbe, Call, RecordingBus};
    use crate::bus::PropertyValue;
    use crate::error::DiscoveryError;
    use crate::sighting::tests::{device_event, phone_event};
    use crate::sighting::Sighting;
    use crossbeam_channel::unbounded;

    const STALE_1: &str = "/org/bluez/hci0/dev_11_22_33_44_55_01";
    const STALE_2: &str = "/org/bluez/hci0/dev_11_22_33_44_55_02";
    const WAIT: Duration = Duration::from_secs(2);

    fn options() -> SupervisorOptions {
        SupervisorOptions {
            dispatch_interval: Duration::from_millis(10),
            join_timeout: WAIT,
            ..SupervisorOptions::default()
        }
    }

    fn supervisor(known: &[&str]) -> (Supervisor<RecordingBus>, BusProbe) {
        let (bus, probe) = RecordingBus::new(known);
        (Supervisor::new(bus, options()), probe)
    }

    fn collecting_handler() -> (impl SightingHandler, Receiver<Sighting>) {
        let (tx, rx) = unbounded();
        (move |s: Sighting| tx.send(s).unwrap(), rx)
    }

    #[test]
    fn test_end_to_end_sighting() {
        let (mut supervisor, probe) = supervisor(&[STALE_1, STALE_2]);
        let (handler, sightings) = collecting_handler();

        supervisor.start(handler).unwrap();
        assert_eq!(supervisor.state(), SupervisorState::Discovering);
        assert!(probe.known_devices().is_empty());

        probe.emit(phone_event("AA:BB:CC:DD:EE:01", "Phone", -60));
        let sighting = sightings.recv_timeout(WAIT).unwrap();
        assert_eq!(sighting.address, "AA:BB:CC:DD:EE:01");
        assert_eq!(sighting.display_name, "Phone");
        assert_eq!(sighting.signal_strength, -60);

        supervisor.stop().unwrap();
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
        assert_eq!(
            probe.calls(),
            vec![
                Call::ClearKnownDevices,
                Call::RemoveDevice(STALE_1.to_string()),
                Call::RemoveDevice(STALE_2.to_string()),
                Call::StartDiscovery(DiscoveryFilter::default()),
                Call::Subscribe,
                Call::RemoveDevice("/org/bluez/hci0/dev_AA_BB_CC_DD_EE_01".to_string()),
                Call::StopDiscovery,
            ]
        );
        assert_eq!(supervisor.stats().delivered(), 1);
    }

    #[test]
    fn test_start_orders_clear_discover_subscribe() {
        let (mut supervisor, probe) = supervisor(&[]);
        let (handler, _sightings) = collecting_handler();

        supervisor.start(handler).unwrap();
        assert_eq!(
            probe.calls(),
            vec![
                Call::ClearKnownDevices,
                Call::StartDiscovery(DiscoveryFilter::default()),
                Call::Subscribe,
            ]
        );
    }

    #[test]
    fn test_every_event_is_delivered_in_order() {
        let (mut supervisor, probe) = supervisor(&[]);
        let (handler, sightings) = collecting_handler();
        supervisor.start(handler).unwrap();

        let events = [
            ("AA:BB:CC:DD:EE:01", "Phone", -60),
            ("AA:BB:CC:DD:EE:02", "Watch", -71),
            ("AA:BB:CC:DD:EE:01", "Phone", -58),
        ];
        for (address, name, rssi) in events {
            probe.emit(phone_event(address, name, rssi));
        }

        for (address, name, rssi) in events {
            let sighting = sightings.recv_timeout(WAIT).unwrap();
            assert_eq!(sighting.address, address);
            assert_eq!(sighting.display_name, name);
            assert_eq!(i64::from(sighting.signal_strength), rssi);
        }
        supervisor.stop().unwrap();
        assert!(sightings.try_recv().is_err());
    }

    #[test]
    fn test_malformed_events_are_skipped() {
        let (mut supervisor, probe) = supervisor(&[]);
        let (handler, sightings) = collecting_handler();
        supervisor.start(handler).unwrap();

        probe.emit(device_event(
            "AA:BB:CC:DD:EE:02",
            &[
                ("Address", PropertyValue::Str("AA:BB:CC:DD:EE:02".to_string())),
                ("Alias", PropertyValue::Str("No signal".to_string())),
            ],
        ));
        probe.emit(phone_event("AA:BB:CC:DD:EE:01", "Phone", -60));

        assert_eq!(sightings.recv_timeout(WAIT).unwrap().address, "AA:BB:CC:DD:EE:01");
        supervisor.stop().unwrap();
        assert!(sightings.try_recv().is_err());
        assert_eq!(supervisor.stats().dropped(), 1);
    }

    #[test]
    fn test_double_start_is_rejected() {
        let (mut supervisor, _probe) = supervisor(&[]);
        let (first, _rx1) = collecting_handler();
        let (second, _rx2) = collecting_handler();

        supervisor.start(first).unwrap();
        let err = supervisor.start(second).unwrap_err();
        assert!(matches!(
            err,
            SupervisorError::InvalidState(InvalidStateError {
                operation: "start",
                state: SupervisorState::Discovering,
            })
        ));
        assert_eq!(supervisor.state(), SupervisorState::Discovering);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let (mut supervisor, probe) = supervisor(&[]);
        let (handler, _sightings) = collecting_handler();
        supervisor.start(handler).unwrap();

        supervisor.stop().unwrap();
        supervisor.stop().unwrap();

        let stops = probe
            .calls()
            .into_iter()
            .filter(|call| *call == Call::StopDiscovery)
            .count();
        assert_eq!(stops, 1);
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
    }

    #[test]
    fn test_stop_before_start_is_a_noop() {
        let (mut supervisor, probe) = supervisor(&[]);
        supervisor.stop().unwrap();
        assert_eq!(supervisor.state(), SupervisorState::Idle);
        assert!(probe.calls().is_empty());
    }

    #[test]
    fn test_no_restart_after_stop() {
        let (mut supervisor, _probe) = supervisor(&[]);
        let (first, _rx1) = collecting_handler();
        let (second, _rx2) = collecting_handler();

        supervisor.start(first).unwrap();
        supervisor.stop().unwrap();
        assert!(matches!(
            supervisor.start(second),
            Err(SupervisorError::InvalidState(InvalidStateError {
                state: SupervisorState::Stopped,
                ..
            }))
        ));
    }

    #[test]
    fn test_connection_failure_leaves_idle() {
        let (mut bus, probe) = RecordingBus::new(&[STALE_1]);
        bus.fail_clear = true;
        let mut supervisor = Supervisor::new(bus, options());
        let (handler, _sightings) = collecting_handler();

        assert!(matches!(
            supervisor.start(handler),
            Err(SupervisorError::Connection(_))
        ));
        assert_eq!(supervisor.state(), SupervisorState::Idle);
        assert_eq!(probe.calls(), vec![Call::ClearKnownDevices]);
    }

    #[test]
    fn test_discovery_failure_leaves_idle() {
        let (mut bus, _probe) = RecordingBus::new(&[]);
        bus.start_error = Some(DiscoveryError::RadioDisabled);
        let mut supervisor = Supervisor::new(bus, options());
        let (handler, _sightings) = collecting_handler();

        assert!(matches!(
            supervisor.start(handler),
            Err(SupervisorError::Discovery(DiscoveryError::RadioDisabled))
        ));
        assert_eq!(supervisor.state(), SupervisorState::Idle);
    }

    #[test]
    fn test_subscribe_failure_stops_discovery_and_leaves_idle() {
        let (mut bus, probe) = RecordingBus::new(&[]);
        bus.fail_subscribe = true;
        let mut supervisor = Supervisor::new(bus, options());
        let (handler, _sightings) = collecting_handler();

        assert!(matches!(
            supervisor.start(handler),
            Err(SupervisorError::Connection(ConnectionError::CallFailed { .. }))
        ));
        assert_eq!(supervisor.state(), SupervisorState::Idle);
        assert_eq!(
            probe.calls(),
            vec![
                Call::ClearKnownDevices,
                Call::StartDiscovery(DiscoveryFilter::default()),
                Call::Subscribe,
                Call::StopDiscovery,
            ]
        );
    }

    #[test]
    fn test_failed_iteration_backs_off_and_keeps_dispatching() {
        let (mut bus, probe) = RecordingBus::new(&[]);
        bus.fail_process = 2;
        let mut supervisor = Supervisor::new(bus, options());
        let (handler, sightings) = collecting_handler();
        supervisor.start(handler).unwrap();

        probe.emit(phone_event("AA:BB:CC:DD:EE:01", "Phone", -60));
        assert_eq!(sightings.recv_timeout(WAIT).unwrap().address, "AA:BB:CC:DD:EE:01");

        supervisor.stop().unwrap();
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
        assert_eq!(
            probe.calls(),
            vec![
                Call::ClearKnownDevices,
                Call::StartDiscovery(DiscoveryFilter::default()),
                Call::Subscribe,
                Call::ProcessFailed,
                Call::ProcessFailed,
                Call::RemoveDevice("/org/bluez/hci0/dev_AA_BB_CC_DD_EE_01".to_string()),
                Call::StopDiscovery,
            ]
        );
    }

    #[test]
    fn test_join_timeout_then_retry() {
        let (mut supervisor, probe) = supervisor(&[]);
        supervisor.options.join_timeout = Duration::from_millis(100);

        // Wedge the dispatch thread inside the handler until `release` is dropped
        let (entered_tx, entered) = bounded::<()>(1);
        let (release, wedge) = bounded::<()>(0);
        let handler = move |_: Sighting| {
            let _ = entered_tx.send(());
            let _ = wedge.recv();
        };
        supervisor.start(handler).unwrap();

        probe.emit(phone_event("AA:BB:CC:DD:EE:01", "Phone", -60));
        entered.recv_timeout(WAIT).unwrap();

        assert!(matches!(
            supervisor.stop(),
            Err(SupervisorError::JoinTimeout(_))
        ));
        assert_eq!(supervisor.state(), SupervisorState::Stopping);

        drop(release);
        supervisor.stop().unwrap();
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
        assert_eq!(probe.calls().last(), Some(&Call::StopDiscovery));
    }

    #[test]
    fn test_handler_panic_is_reported() {
        let (mut supervisor, probe) = supervisor(&[]);
        let (entered_tx, entered) = bounded::<()>(1);
        let handler = move |s: Sighting| {
            let _ = entered_tx.send(());
            if !s.address.is_empty() {
                panic!("handler failure");
            }
        };
        supervisor.start(handler).unwrap();

        probe.emit(phone_event("AA:BB:CC:DD:EE:01", "Phone", -60));
        entered.recv_timeout(WAIT).unwrap();

        assert!(matches!(supervisor.stop(), Err(SupervisorError::LoopPanicked)));
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
    }

    #[test]
    fn test_drop_stops_discovery() {
        let (mut supervisor, probe) = supervisor(&[]);
        let (handler, _sightings) = collecting_handler();
        supervisor.start(handler).unwrap();

        drop(supervisor);
        assert_eq!(probe.calls().last(), Some(&Call::StopDiscovery));
    }
}
