//! # Appearance Dispatch
//!
//! Per-event protocol run on the supervisor's dispatch thread for every "device appeared"
//! signal:
//! 1. normalize the raw event into a [`Sighting`] (malformed events are dropped),
//! 2. hand the sighting to the registered handler,
//! 3. forget the device on the daemon so its next advertisement is announced again.
//!
//! Step 3 is what makes repeated sightings possible at all: BlueZ stops announcing a
//! device once it is known.
//!
//! An optional coalescing window suppresses step 2 for an address that was reported less
//! than the window ago (step 3 still runs).

use crate::bus::{DeviceRemover, RawEvent};
use crate::handler::SightingHandler;
use crate::sighting::Sighting;
use chrono::Utc;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Addresses remembered for coalescing; the oldest is evicted beyond this
const COALESCE_CAPACITY: usize = 256;

/// Counters shared between the dispatch thread and the supervisor
#[derive(Debug, Default)]
pub struct DispatchStats {
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl DispatchStats {
    /// Sightings handed to the handler
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Appearance events that were not device sightings
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

pub(crate) struct Dispatcher {
    handler: Box<dyn SightingHandler>,
    recent: Option<(Duration, LruCache<String, Instant>)>,
    stats: Arc<DispatchStats>,
}

impl Dispatcher {
    pub(crate) fn new(
        handler: Box<dyn SightingHandler>,
        coalesce_window: Option<Duration>,
        stats: Arc<DispatchStats>,
    ) -> Self {
        let recent = coalesce_window.map(|window| {
            let capacity = NonZeroUsize::new(COALESCE_CAPACITY).unwrap_or(NonZeroUsize::MIN);
            (window, LruCache::new(capacity))
        });

        Self {
            handler,
            recent,
            stats,
        }
    }

    pub(crate) fn on_appearance(&mut self, event: RawEvent, remover: &dyn DeviceRemover) {
        let sighting = match Sighting::from_event(&event, Utc::now()) {
            Ok(sighting) => sighting,
            Err(why) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                log::debug!("Ignoring object {}: {}", event.object_path, why);
                return;
            }
        };

        if self.is_repeat(&sighting.address, Instant::now()) {
            log::trace!("Coalesced repeated sighting of {}", sighting.address);
        } else {
            log::debug!(
                "Sighted {} ({}) at {} dBm",
                sighting.address,
                sighting.display_name,
                sighting.signal_strength
            );
            self.stats.delivered.fetch_add(1, Ordering::Relaxed);
            self.handler.handle(sighting);
        }

        if let Err(why) = remover.remove_device(&event.object_path) {
            log::warn!("Could not forget {}: {}", event.object_path, why);
        }
    }

    /// Records `address` as seen at `now`; true if it was already seen within the window
    fn is_repeat(&mut self, address: &str, now: Instant) -> bool {
        let Some((window, recent)) = self.recent.as_mut() else {
            return false;
        };

        let repeat = recent
            .get(address)
            .map_or(false, |last| now.duration_since(*last) < *window);
        if !repeat {
            recent.put(address.to_string(), now);
        }
        repeat
    }
}
