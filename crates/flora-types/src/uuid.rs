//! Bluetooth UUIDs for Flower Care soil sensors.
//!
//! All identifiers except [`AUTHENTICATION`] use the 16-bit shorthand expanded
//! onto the Bluetooth base UUID `0000XXXX-0000-1000-8000-00805f9b34fb`.

use uuid::{Uuid, uuid};

// --- Service UUIDs ---

/// Primary sensor service. Also carried as service data in advertisements.
pub const PRIMARY_SERVICE: Uuid = uuid!("0000fe95-0000-1000-8000-00805f9b34fb");

/// Data service exposing live values, firmware and the mode-change register.
pub const DATA_SERVICE: Uuid = uuid!("00001204-0000-1000-8000-00805f9b34fb");

/// History service exposing the paged history protocol.
pub const HISTORY_SERVICE: Uuid = uuid!("00001206-0000-1000-8000-00805f9b34fb");

// --- Characteristic UUIDs ---

/// Standard GAP device name characteristic.
pub const DEVICE_NAME: Uuid = uuid!("00002a00-0000-1000-8000-00805f9b34fb");

/// Mode-change register. Switches the device to live mode and blinks the LED.
pub const MODE_CHANGE: Uuid = uuid!("00001a00-0000-1000-8000-00805f9b34fb");

/// Real-time sensor values (16-byte frame).
pub const REAL_TIME_VALUES: Uuid = uuid!("00001a01-0000-1000-8000-00805f9b34fb");

/// Battery level and firmware version (7-byte frame).
pub const FIRMWARE_BATTERY: Uuid = uuid!("00001a02-0000-1000-8000-00805f9b34fb");

/// History control register. Receives the history mode switch and address frames.
pub const HISTORY_CONTROL: Uuid = uuid!("00001a10-0000-1000-8000-00805f9b34fb");

/// History data. Returns the entry selected through [`HISTORY_CONTROL`].
pub const HISTORY_DATA: Uuid = uuid!("00001a11-0000-1000-8000-00805f9b34fb");

/// Device clock in seconds since boot (4-byte frame).
pub const DEVICE_TIME: Uuid = uuid!("00001a12-0000-1000-8000-00805f9b34fb");

/// Entry count register present on newer firmware.
pub const ENTRY_COUNT: Uuid = uuid!("00001a13-0000-1000-8000-00805f9b34fb");

/// Non-standard authentication characteristic.
pub const AUTHENTICATION: Uuid = uuid!("00000001-0000-1000-8000-00805f9b34fb");

/// Every characteristic the link caches during discovery.
pub const CATALOG_CHARACTERISTICS: [Uuid; 9] = [
    DEVICE_NAME,
    MODE_CHANGE,
    REAL_TIME_VALUES,
    FIRMWARE_BATTERY,
    HISTORY_CONTROL,
    HISTORY_DATA,
    DEVICE_TIME,
    ENTRY_COUNT,
    AUTHENTICATION,
];

/// Returns `true` if the characteristic is one the protocol uses.
#[must_use]
pub fn is_catalog_characteristic(uuid: &Uuid) -> bool {
    CATALOG_CHARACTERISTICS.contains(uuid)
}

/// Human readable role of a catalog characteristic, for logging.
#[must_use]
pub fn characteristic_name(uuid: &Uuid) -> &'static str {
    match *uuid {
        DEVICE_NAME => "device name",
        MODE_CHANGE => "mode change",
        REAL_TIME_VALUES => "real-time values",
        FIRMWARE_BATTERY => "firmware/battery",
        HISTORY_CONTROL => "history control",
        HISTORY_DATA => "history data",
        DEVICE_TIME => "device time",
        ENTRY_COUNT => "entry count",
        AUTHENTICATION => "authentication",
        _ => "unknown",
    }
}
