//! Bluetooth presence tracking over BlueZ.
//!
//! A [`Supervisor`] clears the adapter's known devices, keeps discovery running on a
//! dedicated thread and reports every device announcement as a [`Sighting`] to a
//! [`SightingHandler`]. After each report the device is forgotten on the daemon so its
//! next advertisement is reported again.
//!
//! ```no_run
//! use bt_presence::{Sighting, Supervisor, SupervisorOptions};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut supervisor = Supervisor::connect("hci0", SupervisorOptions::default())?;
//! supervisor.start(|sighting: Sighting| {
//!     println!("{} ({}) at {} dBm", sighting.address, sighting.display_name, sighting.signal_strength);
//! })?;
//! // ... until the host shuts down
//! supervisor.stop()?;
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod config;
mod dispatch;
pub mod error;
pub mod handler;
pub mod sighting;
pub mod supervisor;
pub mod tracker;

pub use bus::{AdapterHandle, BluezClient, BusClient, DiscoveryFilter};
pub use config::Config;
pub use dispatch::DispatchStats;
pub use error::{ConnectionError, DiscoveryError, InvalidStateError, SupervisorError};
pub use handler::{ChannelHandler, SightingHandler};
pub use sighting::Sighting;
pub use supervisor::{Supervisor, SupervisorOptions, SupervisorState};
pub use tracker::PresenceTracker;
