//! Error types for flora-core.
//!
//! Errors fall into four classes, and the class decides who reacts:
//!
//! | Class | Examples | Handling |
//! |-------|----------|----------|
//! | Transient | [`Error::Timeout`], [`Error::Bluetooth`], [`Error::Disconnected`] | Retried by the operation sequencer up to the operation's `max_retries` |
//! | Protocol | [`Error::InvalidFrame`] | The frame is rejected; history paging skips to the next index |
//! | Authentication | none | The handshake falls back to authenticated, it never fails |
//! | Fatal | [`Error::RadioUnavailable`], [`Error::InvalidDeviceId`], [`Error::MaxRetriesExceeded`] | Surfaced to the caller, no automatic retry |
//!
//! Use [`Error::is_transient`] and [`Error::is_fatal`] instead of matching
//! variants directly.

use std::time::Duration;

use thiserror::Error;

use crate::operation::OperationKind;
use crate::state::ConnectionState;

/// Errors that can occur when talking to Flower Care devices.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Bluetooth Low Energy error.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Device not found during scan or connection.
    #[error("Device not found: {0}")]
    DeviceNotFound(DeviceNotFoundReason),

    /// Operation attempted while not connected to device.
    #[error("Not connected to device")]
    NotConnected,

    /// Operation attempted before the link finished authenticating.
    #[error("Device link not ready (state: {state})")]
    NotReady {
        /// State the link was in.
        state: ConnectionState,
    },

    /// Required BLE characteristic not found on device.
    #[error("Characteristic not found: {uuid} (searched in {service_count} services)")]
    CharacteristicNotFound {
        /// The UUID that was not found.
        uuid: String,
        /// Number of services that were searched.
        service_count: usize,
    },

    /// A frame received from the device was rejected by the codec.
    #[error("Invalid frame: {0}")]
    InvalidFrame(#[from] flora_types::ParseError),

    /// Operation timed out.
    #[error("Operation '{operation}' timed out after {duration:?}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// The timeout duration.
        duration: Duration,
    },

    /// The link dropped while an operation was in flight.
    #[error("Device disconnected during {operation}")]
    Disconnected {
        /// The interrupted operation.
        operation: OperationKind,
    },

    /// The operation was drained from the queue before it ran.
    #[error("Operation dropped from queue: {reason}")]
    Drained {
        /// Why the queue was drained.
        reason: String,
    },

    /// Operation was cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Connection failed with specific reason.
    #[error("Connection failed: {reason}")]
    ConnectionFailed {
        /// The device identifier that failed to connect.
        device_id: Option<String>,
        /// The structured reason for the failure.
        reason: ConnectionFailureReason,
    },

    /// Write operation failed.
    #[error("Write failed to characteristic {uuid}: {reason}")]
    WriteFailed {
        /// The characteristic UUID.
        uuid: String,
        /// The reason for the failure.
        reason: String,
    },

    /// The connect retry budget is spent until the counter is reset.
    #[error("Maximum connection attempts ({attempts}) exceeded for {device_id}")]
    MaxRetriesExceeded {
        /// The device identifier.
        device_id: String,
        /// Attempts made.
        attempts: u32,
    },

    /// A history download is already running on this device.
    #[error("History download already in progress for {0}")]
    HistoryInProgress(String),

    /// The device identifier is empty or malformed.
    #[error("Invalid device identifier: {0:?}")]
    InvalidDeviceId(String),

    /// The Bluetooth radio is off, missing, or not authorized.
    #[error("Bluetooth radio unavailable: {0}")]
    RadioUnavailable(String),

    /// Reading or writing a history checkpoint failed.
    #[error("Checkpoint storage error: {0}")]
    Checkpoint(String),

    /// A repository collaborator rejected a reading.
    #[error("Repository error: {0}")]
    Repository(String),

    /// The device still has a connection or work in flight.
    #[error("Device {0} is busy")]
    DeviceBusy(String),

    /// The connection pool has shut down.
    #[error("Connection pool is closed")]
    PoolClosed,

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Structured reasons for connection failures.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new reasons
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectionFailureReason {
    /// Bluetooth adapter not available or powered off.
    AdapterUnavailable,
    /// Device is out of range.
    OutOfRange,
    /// Generic BLE error.
    BleError(String),
}

impl std::fmt::Display for ConnectionFailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AdapterUnavailable => write!(f, "Bluetooth adapter unavailable"),
            Self::OutOfRange => write!(f, "device out of range"),
            Self::BleError(msg) => write!(f, "BLE error: {}", msg),
        }
    }
}

/// Reason why a device was not found.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum DeviceNotFoundReason {
    /// Device with specified identifier not found.
    NotFound { identifier: String },
    /// Scan deadline passed before the device advertised.
    ScanTimeout { duration: Duration },
    /// No Bluetooth adapter available.
    NoAdapter,
}

impl std::fmt::Display for DeviceNotFoundReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound { identifier } => write!(f, "device '{}' not found", identifier),
            Self::ScanTimeout { duration } => write!(f, "scan timed out after {:?}", duration),
            Self::NoAdapter => write!(f, "no Bluetooth adapter available"),
        }
    }
}

impl Error {
    /// Create a device not found error for a specific identifier.
    pub fn device_not_found(identifier: impl Into<String>) -> Self {
        Self::DeviceNotFound(DeviceNotFoundReason::NotFound {
            identifier: identifier.into(),
        })
    }

    /// Create a timeout error with operation context.
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Create a characteristic not found error.
    pub fn characteristic_not_found(uuid: impl Into<String>, service_count: usize) -> Self {
        Self::CharacteristicNotFound {
            uuid: uuid.into(),
            service_count,
        }
    }

    /// Create a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Create a connection failure with structured reason.
    pub fn connection_failed(device_id: Option<String>, reason: ConnectionFailureReason) -> Self {
        Self::ConnectionFailed { device_id, reason }
    }

    /// Returns `true` for failures worth retrying: timeouts, platform
    /// read/write/connect errors and unexpected disconnects.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Timeout { .. }
            | Error::Bluetooth(_)
            | Error::NotConnected
            | Error::Disconnected { .. }
            | Error::WriteFailed { .. }
            | Error::Io(_) => true,
            Error::ConnectionFailed { reason, .. } => matches!(
                reason,
                ConnectionFailureReason::OutOfRange | ConnectionFailureReason::BleError(_)
            ),
            _ => false,
        }
    }

    /// Returns `true` for failures that stop all automatic retrying.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::RadioUnavailable(_)
                | Error::InvalidDeviceId(_)
                | Error::MaxRetriesExceeded { .. }
                | Error::DeviceNotFound(DeviceNotFoundReason::NoAdapter)
                | Error::ConnectionFailed {
                    reason: ConnectionFailureReason::AdapterUnavailable,
                    ..
                }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Checkpoint(err.to_string())
    }
}

/// Result type alias using flora-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;
