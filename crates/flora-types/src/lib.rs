//! Platform-agnostic types for Flower Care soil sensors.
//!
//! This crate holds everything about the sensor's proprietary GATT protocol
//! that does not need a Bluetooth stack: the identifier catalog, command
//! frames, and the pure frame codec.
//!
//! # Features
//!
//! - UUID constants for services and characteristics ([`uuids`])
//! - Fixed command byte sequences ([`commands`])
//! - Frame decoders and encoders ([`codec`])
//! - Reading types shared with flora-core
//!
//! # Example
//!
//! ```
//! use flora_types::codec::decode_live_values;
//!
//! let frame = [
//!     0x64, 0x00, 0xFF, 0x0A, 0x00, 0x00, 0x00, 0x32, 0x64, 0x00, 0, 0, 0, 0, 0, 0,
//! ];
//! let values = decode_live_values(&frame).unwrap();
//! assert_eq!(values.moisture, 50);
//! ```

pub mod codec;
pub mod commands;
pub mod error;
pub mod types;
pub mod uuid;

pub use error::{ParseError, ParseResult};
pub use types::{
    DeviceClock, DeviceId, FirmwareInfo, HistoricalSensorReading, HistoryEntry, HistoryMetadata,
    LiveSensorReading, SensorValues,
};
pub use uuid as uuids;
