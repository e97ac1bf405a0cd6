//! # Error Types Module
//!
//! Centralized error handling for bt-presence.
//! One error type per concern, chained through `source()` where another error is wrapped.
//!
//! ## Error Types
//! - `ConnectionError`: system bus, daemon and adapter failures
//! - `DiscoveryError`: starting or stopping a discovery session
//! - `InvalidStateError`: lifecycle misuse of the supervisor (e.g. double start)
//! - `MalformedEventError`: an appearance signal without the expected device attributes.
//!   Crate-internal: logged and dropped, never returned to callers.
//! - `SupervisorError`: what `Supervisor::start`/`Supervisor::stop` return
//! - `ConfigError`: configuration file I/O and parsing errors

use crate::supervisor::SupervisorState;
use std::fmt;
use std::time::Duration;

/// Errors reaching the management daemon or the adapter
#[derive(Debug, Clone)]
pub enum ConnectionError {
    /// System bus could not be opened
    BusUnavailable(String),
    /// The daemon does not expose the requested adapter
    AdapterNotFound { adapter: String, reason: String },
    /// A method call on the daemon failed
    CallFailed { method: &'static str, reason: String },
    /// An object path handed to the daemon was not a valid D-Bus path
    InvalidPath(String),
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::BusUnavailable(msg) => {
                write!(f, "Cannot connect to the system bus: {}", msg)
            }
            ConnectionError::AdapterNotFound { adapter, reason } => {
                write!(f, "Bluetooth adapter {} not found: {}", adapter, reason)
            }
            ConnectionError::CallFailed { method, reason } => {
                write!(f, "Bluetooth daemon call {} failed: {}", method, reason)
            }
            ConnectionError::InvalidPath(path) => {
                write!(f, "Invalid object path: {}", path)
            }
        }
    }
}

impl std::error::Error for ConnectionError {}

/// Errors starting or stopping discovery
#[derive(Debug, Clone)]
pub enum DiscoveryError {
    /// A discovery session is already running on this adapter
    AlreadyActive,
    /// The radio is powered off or blocked
    RadioDisabled,
    /// Any other daemon-side failure
    Failed(String),
}

impl fmt::Display for DiscoveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscoveryError::AlreadyActive => write!(f, "Discovery is already active"),
            DiscoveryError::RadioDisabled => {
                write!(f, "Bluetooth radio is disabled. Please ensure Bluetooth is powered on.")
            }
            DiscoveryError::Failed(msg) => write!(f, "Discovery failed: {}", msg),
        }
    }
}

impl std::error::Error for DiscoveryError {}

/// A supervisor operation was called in a state that does not allow it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidStateError {
    pub operation: &'static str,
    pub state: SupervisorState,
}

impl fmt::Display for InvalidStateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cannot {} while supervisor is {}", self.operation, self.state)
    }
}

impl std::error::Error for InvalidStateError {}

/// Why an appearance signal could not be turned into a sighting
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum MalformedEventError {
    /// The added object does not carry the device interface
    NotADevice,
    /// A required device attribute is absent
    MissingAttribute(&'static str),
    /// A required device attribute has an unexpected type or range
    WrongType(&'static str),
}

impl fmt::Display for MalformedEventError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MalformedEventError::NotADevice => write!(f, "object is not a device"),
            MalformedEventError::MissingAttribute(name) => {
                write!(f, "device attribute {} is missing", name)
            }
            MalformedEventError::WrongType(name) => {
                write!(f, "device attribute {} has an unexpected type", name)
            }
        }
    }
}

impl std::error::Error for MalformedEventError {}

/// Errors returned by the discovery supervisor
#[derive(Debug)]
pub enum SupervisorError {
    Connection(ConnectionError),
    Discovery(DiscoveryError),
    InvalidState(InvalidStateError),
    /// The dispatch thread could not be spawned
    Spawn(std::io::Error),
    /// The dispatch loop did not exit within the join timeout
    JoinTimeout(Duration),
    /// The dispatch loop panicked (usually inside the sighting handler)
    LoopPanicked,
}

impl fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SupervisorError::Connection(e) => write!(f, "{}", e),
            SupervisorError::Discovery(e) => write!(f, "{}", e),
            SupervisorError::InvalidState(e) => write!(f, "{}", e),
            SupervisorError::Spawn(e) => {
                write!(f, "Failed to spawn discovery thread: {}", e)
            }
            SupervisorError::JoinTimeout(timeout) => {
                write!(f, "Discovery loop did not exit within {:?}", timeout)
            }
            SupervisorError::LoopPanicked => write!(f, "Discovery loop panicked"),
        }
    }
}

impl std::error::Error for SupervisorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SupervisorError::Connection(e) => Some(e),
            SupervisorError::Discovery(e) => Some(e),
            SupervisorError::InvalidState(e) => Some(e),
            SupervisorError::Spawn(e) => Some(e),
            SupervisorError::JoinTimeout(_) | SupervisorError::LoopPanicked => None,
        }
    }
}

impl From<ConnectionError> for SupervisorError {
    fn from(e: ConnectionError) -> Self {
        SupervisorError::Connection(e)
    }
}

impl From<DiscoveryError> for SupervisorError {
    fn from(e: DiscoveryError) -> Self {
        SupervisorError::Discovery(e)
    }
}

impl From<InvalidStateError> for SupervisorError {
    fn from(e: InvalidStateError) -> Self {
        SupervisorError::InvalidState(e)
    }
}

/// Errors that can occur during configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read config file
    ReadFailed(std::io::Error),
    /// Failed to write config file
    WriteFailed(std::io::Error),
    /// Failed to parse config file
    ParseFailed(toml::de::Error),
    /// Failed to serialize config
    SerializeFailed(toml::ser::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::ReadFailed(e) => {
                write!(f, "Failed to read config file: {}", e)
            }
            ConfigError::WriteFailed(e) => {
                write!(f, "Failed to write config file: {}", e)
            }
            ConfigError::ParseFailed(e) => {
                write!(f, "Failed to parse config file: {}", e)
            }
            ConfigError::SerializeFailed(e) => {
                write!(f, "Failed to serialize config: {}", e)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::ReadFailed(e) => Some(e),
            ConfigError::WriteFailed(e) => Some(e),
            ConfigError::ParseFailed(e) => Some(e),
            ConfigError::SerializeFailed(e) => Some(e),
        }
    }
}
