//! Error types for railhub-core.
//!
//! # Failure dispositions
//!
//! | Kind | Disposition |
//! |------|-------------|
//! | [`Error::Transport`] | Retried with backoff, surfaced as a failed delivery once the budget is spent |
//! | [`Error::VerificationTimeout`] | Retried, same as transport |
//! | [`Error::InvalidCommand`] | Rejected immediately, never retried |
//! | [`Error::ScannerFault`] | Scanner self-recovers; repeated faults raise a degraded signal |
//!
//! Nothing here is fatal to the process. Chronic device trouble shows up in
//! [`crate::ReliabilityStats`] rather than as errors.

use std::time::Duration;

use railhub_types::{HubRole, MotorPort, ParseError};
use thiserror::Error;

/// Errors that can occur while talking to hubs.
///
/// Marked `#[non_exhaustive]` so variants can be added without breaking
/// downstream matches.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Bluetooth Low Energy error.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// A session could not be opened or a write did not go through.
    #[error("Transport error on hub {hub_id}: {reason}")]
    Transport {
        hub_id: String,
        reason: TransportFailure,
    },

    /// The hub accepted a write but never reported the expected state.
    #[error("Hub {hub_id} did not confirm command #{correlation} within {timeout:?}")]
    VerificationTimeout {
        hub_id: String,
        correlation: u64,
        timeout: Duration,
    },

    /// The command failed validation and was not sent.
    #[error("Invalid command: {0}")]
    InvalidCommand(InvalidCommandReason),

    /// The scan subsystem failed.
    #[error("Scanner fault: {0}")]
    ScannerFault(String),

    /// No hub is registered under this id.
    #[error("Unknown hub: {0}")]
    UnknownHub(String),

    /// Operation attempted while no session is open.
    #[error("Not connected to hub")]
    NotConnected,

    /// Operation timed out.
    #[error("Operation '{operation}' timed out after {duration:?}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    /// Operation was cancelled by a reset or shutdown.
    #[error("Operation cancelled")]
    Cancelled,

    /// A hub pushed a payload the codec could not decode.
    #[error("Invalid payload: {0}")]
    Codec(#[from] ParseError),

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Why a transport operation failed.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TransportFailure {
    /// No session is open for the hub.
    NotConnected,
    /// The session closed while the operation was in progress.
    LinkLost,
    /// The BLE write returned an error.
    WriteFailed(String),
    /// The write did not complete in time.
    WriteTimeout(Duration),
    /// Connecting to the hub failed.
    ConnectFailed(String),
    /// The hub does not expose the command characteristic.
    CharacteristicNotFound(String),
    /// No Bluetooth adapter is available.
    AdapterUnavailable,
}

impl std::fmt::Display for TransportFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotConnected => write!(f, "not connected"),
            Self::LinkLost => write!(f, "link lost"),
            Self::WriteFailed(msg) => write!(f, "write failed: {}", msg),
            Self::WriteTimeout(d) => write!(f, "write timed out after {:?}", d),
            Self::ConnectFailed(msg) => write!(f, "connect failed: {}", msg),
            Self::CharacteristicNotFound(uuid) => {
                write!(f, "characteristic {} not found", uuid)
            }
            Self::AdapterUnavailable => write!(f, "no Bluetooth adapter available"),
        }
    }
}

/// Why a command was rejected before being sent.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum InvalidCommandReason {
    /// Train power outside the accepted range.
    PowerOutOfRange { power: i32, min: i8, max: i8 },
    /// The hub exists but plays a different role.
    WrongRole { hub_id: String, expected: HubRole },
    /// No motor is attached to the requested port.
    UnknownPort { hub_id: String, port: MotorPort },
    /// The port letter is not one of A–D.
    InvalidPort(char),
    /// Motor kind on the port has not been detected yet.
    MotorKindUnknown { hub_id: String, port: MotorPort },
}

impl std::fmt::Display for InvalidCommandReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PowerOutOfRange { power, min, max } => {
                write!(f, "power {} outside {}..={}", power, min, max)
            }
            Self::WrongRole { hub_id, expected } => {
                write!(f, "hub {} is not a {} hub", hub_id, expected)
            }
            Self::UnknownPort { hub_id, port } => {
                write!(f, "no switch motor on port {} of hub {}", port, hub_id)
            }
            Self::InvalidPort(letter) => write!(f, "invalid switch port '{}'", letter),
            Self::MotorKindUnknown { hub_id, port } => {
                write!(f, "motor kind on port {} of hub {} not detected yet", port, hub_id)
            }
        }
    }
}

impl Error {
    pub fn transport(hub_id: impl Into<String>, reason: TransportFailure) -> Self {
        Self::Transport {
            hub_id: hub_id.into(),
            reason,
        }
    }

    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Whether retrying the same operation could succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Bluetooth(_)
            | Error::Timeout { .. }
            | Error::NotConnected
            | Error::VerificationTimeout { .. } => true,
            Error::Transport { reason, .. } => !matches!(
                reason,
                TransportFailure::CharacteristicNotFound(_) | TransportFailure::AdapterUnavailable
            ),
            _ => false,
        }
    }
}

/// Result type alias using railhub-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;
