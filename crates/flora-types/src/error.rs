//! Error types for frame decoding in flora-types.

use thiserror::Error;

/// Errors that can occur when decoding Flower Care frames.
///
/// Every decoder rejects a malformed frame instead of clamping it. Range
/// clamping of plausible-but-out-of-range live values is done separately via
/// [`LiveSensorReading::clamped`](crate::LiveSensorReading::clamped).
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// The frame is shorter than the layout requires.
    #[error("Insufficient bytes: expected at least {expected}, got {actual}")]
    InsufficientBytes { expected: usize, actual: usize },

    /// The frame does not have the exact length of its fixed layout.
    #[error("Invalid frame length: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    /// The entry-count frame reports more entries than a device can store.
    #[error("Entry count {count} exceeds maximum of {max}")]
    EntryCountTooLarge { count: u16, max: u16 },

    /// A history entry claims to be newer than the device's own clock.
    #[error("Entry timestamp {timestamp}s is ahead of device uptime {uptime}s")]
    TimestampInFuture { timestamp: u32, uptime: u64 },

    /// The firmware field is not printable ASCII.
    #[error("Invalid firmware version bytes: {0:02x?}")]
    InvalidFirmware(Vec<u8>),

    /// Any other structurally invalid field.
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// Result type alias using flora-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;
