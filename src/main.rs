use bt_presence::{ChannelHandler, Config, PresenceTracker, Sighting, Supervisor, SupervisorError};
use crossbeam_channel::{select, tick, unbounded, Receiver};
use std::io::BufRead;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::thread;

fn main() -> ExitCode {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            log::warn!("{}; using defaults", e);
            Config::default()
        }
    };

    let mut supervisor = match Supervisor::connect(&config.adapter, config.supervisor_options()) {
        Ok(supervisor) => supervisor,
        Err(e) => {
            log::error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    // Sightings are handed off so the dispatch thread never waits on the tracker
    let (sighting_sender, sighting_receiver) = unbounded::<Sighting>();
    let tracker = Arc::new(Mutex::new(PresenceTracker::from_config(&config)));
    let tracker_thread = {
        let tracker = tracker.clone();
        thread::spawn(move || track(sighting_receiver, tracker))
    };

    if let Err(e) = supervisor.start(ChannelHandler::new(sighting_sender)) {
        log::error!("{}", e);
        return ExitCode::FAILURE;
    }

    let shutdown = host_shutdown_signal();
    let report = tick(config.report_interval());
    loop {
        select! {
            recv(shutdown) -> _ => break,
            recv(report) -> _ => log_presence(&tracker),
        }
    }

    let code = match supervisor.stop() {
        Ok(()) => ExitCode::SUCCESS,
        Err(SupervisorError::JoinTimeout(timeout)) => {
            // The dispatch thread is wedged in the bus library; only exiting frees it
            log::error!("Discovery did not stop within {:?}, exiting", timeout);
            std::process::exit(1);
        }
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    };

    // The last sender went away with the dispatch loop
    let _ = tracker_thread.join();
    log_presence(&tracker);
    code
}

fn track(sightings: Receiver<Sighting>, tracker: Arc<Mutex<PresenceTracker>>) {
    for sighting in sightings {
        match tracker.lock() {
            Ok(mut tracker) => {
                tracker.see(sighting);
            }
            Err(_) => {
                log::error!("Presence table poisoned, dropping sightings");
                return;
            }
        }
    }
}

fn log_presence(tracker: &Mutex<PresenceTracker>) {
    let Ok(tracker) = tracker.lock() else {
        return;
    };
    let present = tracker.present(chrono::Utc::now());
    log::info!("{} of {} tracked device(s) present", present.len(), tracker.len());
    for record in present {
        log::info!(
            "  {} {} ({} dBm, seen {})",
            record.dev_id,
            record.host_name,
            record.rssi,
            record.last_seen.format("%H:%M:%S")
        );
    }
}

/// Host lifecycle stand-in: fires once when stdin reaches EOF or reads "quit"
fn host_shutdown_signal() -> Receiver<()> {
    let (sender, receiver) = crossbeam_channel::bounded(1);
    thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) if line.trim().eq_ignore_ascii_case("quit") => break,
                Ok(_) => {}
                Err(_) => break,
            }
        }
        log::info!("Shutdown requested");
        let _ = sender.send(());
    });
    receiver
}
