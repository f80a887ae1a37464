//! Core types for Flower Care sensor data.

use core::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

/// Lowest temperature, in °C, handed to a repository.
pub const MIN_TEMPERATURE: f32 = -10.0;
/// Highest temperature, in °C, handed to a repository.
pub const MAX_TEMPERATURE: f32 = 60.0;
/// Highest soil moisture percentage.
pub const MAX_MOISTURE: u8 = 100;
/// Highest plausible brightness in lux.
pub const MAX_BRIGHTNESS: u32 = 100_000;

/// Opaque identifier naming one physical sensor.
///
/// On Linux and Windows this is the Bluetooth address; on macOS it is the
/// CoreBluetooth peripheral UUID. Either way it is stable across sessions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct DeviceId(String);

impl DeviceId {
    /// Create an identifier from any string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// An identifier is usable when it is non-empty and not just whitespace.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.0.trim().is_empty()
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for DeviceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for DeviceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// The four physical quantities a Flower Care measures.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SensorValues {
    /// Temperature in °C.
    pub temperature: f32,
    /// Illuminance in lux.
    pub brightness: u32,
    /// Soil moisture in percent.
    pub moisture: u8,
    /// Soil conductivity in µS/cm.
    pub conductivity: u16,
}

impl SensorValues {
    /// Clamp every field into its physically plausible range.
    #[must_use]
    pub fn clamped(self) -> Self {
        Self {
            temperature: self.temperature.clamp(MIN_TEMPERATURE, MAX_TEMPERATURE),
            brightness: self.brightness.min(MAX_BRIGHTNESS),
            moisture: self.moisture.min(MAX_MOISTURE),
            conductivity: self.conductivity,
        }
    }

    /// Returns `true` if no field would be changed by [`clamped`](Self::clamped).
    #[must_use]
    pub fn is_in_range(&self) -> bool {
        (MIN_TEMPERATURE..=MAX_TEMPERATURE).contains(&self.temperature)
            && self.brightness <= MAX_BRIGHTNESS
            && self.moisture <= MAX_MOISTURE
    }
}

impl fmt::Display for SensorValues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.1}°C, {} lx, {}% moisture, {} µS/cm",
            self.temperature, self.brightness, self.moisture, self.conductivity
        )
    }
}

/// A live reading captured from the real-time characteristic.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LiveSensorReading {
    /// Device the reading came from.
    pub device_id: DeviceId,
    /// Decoded sensor values.
    #[cfg_attr(feature = "serde", serde(flatten))]
    pub values: SensorValues,
    /// When the host received the frame.
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub captured_at: OffsetDateTime,
}

impl LiveSensorReading {
    /// Create a reading from decoded values.
    pub fn new(device_id: DeviceId, values: SensorValues, captured_at: OffsetDateTime) -> Self {
        Self {
            device_id,
            values,
            captured_at,
        }
    }

    /// The same reading with its values range-clamped.
    #[must_use]
    pub fn clamped(self) -> Self {
        Self {
            values: self.values.clamped(),
            ..self
        }
    }
}

/// One decoded history entry before it is anchored to wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct HistoryEntry {
    /// Seconds since device boot at which the entry was recorded.
    pub relative_timestamp: u32,
    /// Decoded sensor values.
    pub values: SensorValues,
}

impl HistoryEntry {
    /// Absolute date of the entry given the device's boot-time reference.
    #[must_use]
    pub fn recorded_at(&self, boot_reference: OffsetDateTime) -> OffsetDateTime {
        boot_reference + Duration::seconds(i64::from(self.relative_timestamp))
    }
}

/// A history entry anchored to an absolute date.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct HistoricalSensorReading {
    /// Device the entry came from.
    pub device_id: DeviceId,
    /// Position of the entry in the device's history.
    pub index: u16,
    /// Seconds since device boot, as stored on the device.
    pub relative_timestamp: u32,
    /// Absolute date derived from the boot-time reference.
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub recorded_at: OffsetDateTime,
    /// Decoded sensor values.
    #[cfg_attr(feature = "serde", serde(flatten))]
    pub values: SensorValues,
}

impl HistoricalSensorReading {
    /// Anchor a decoded entry.
    pub fn from_entry(
        device_id: DeviceId,
        index: u16,
        entry: HistoryEntry,
        boot_reference: OffsetDateTime,
    ) -> Self {
        Self {
            device_id,
            index,
            relative_timestamp: entry.relative_timestamp,
            recorded_at: entry.recorded_at(boot_reference),
            values: entry.values,
        }
    }
}

/// Decoded entry-count frame.
///
/// Bytes `[2..14]` carry fields whose meaning is undocumented. They are kept
/// verbatim in [`vendor_fields`](Self::vendor_fields) and never interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct HistoryMetadata {
    /// Number of stored history entries.
    pub entry_count: u16,
    /// Raw bytes `[2..14]` of the frame.
    pub vendor_fields: [u8; 12],
}

/// The device clock, in seconds since the device booted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DeviceClock {
    /// Seconds since device boot.
    pub seconds_since_boot: u32,
}

impl DeviceClock {
    /// Wall-clock time at which the device booted, given the current time.
    #[must_use]
    pub fn boot_reference(&self, now: OffsetDateTime) -> OffsetDateTime {
        now - Duration::seconds(i64::from(self.seconds_since_boot))
    }
}

/// Battery level and firmware version.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FirmwareInfo {
    /// Battery level in percent.
    pub battery: u8,
    /// Firmware version string, e.g. `3.2.1`.
    pub firmware: String,
}

impl fmt::Display for FirmwareInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "firmware {} (battery {}%)", self.firmware, self.battery)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(temperature: f32, brightness: u32, moisture: u8) -> SensorValues {
        SensorValues {
            temperature,
            brightness,
            moisture,
            conductivity: 350,
        }
    }

    #[test]
    fn test_device_id_validity() {
        assert!(DeviceId::from("C4:7C:8D:6A:12:34").is_valid());
        assert!(!DeviceId::from("").is_valid());
        assert!(!DeviceId::from("   ").is_valid());
    }

    #[test]
    fn test_device_id_display() {
        let id = DeviceId::new("C4:7C:8D:6A:12:34");
        assert_eq!(id.to_string(), "C4:7C:8D:6A:12:34");
        assert_eq!(id.as_str(), "C4:7C:8D:6A:12:34");
    }

    #[test]
    fn test_clamp_out_of_range_values() {
        let clamped = values(85.3, 250_000, 140).clamped();
        assert_eq!(clamped.temperature, MAX_TEMPERATURE);
        assert_eq!(clamped.brightness, MAX_BRIGHTNESS);
        assert_eq!(clamped.moisture, MAX_MOISTURE);
        assert_eq!(clamped.conductivity, 350);

        let cold = values(-32.0, 0, 0).clamped();
        assert_eq!(cold.temperature, MIN_TEMPERATURE);
    }

    #[test]
    fn test_clamp_keeps_plausible_values() {
        let v = values(21.4, 1200, 42);
        assert!(v.is_in_range());
        assert_eq!(v.clamped(), v);
    }

    #[test]
    fn test_boot_reference_and_recorded_at() {
        let now = OffsetDateTime::UNIX_EPOCH + Duration::days(10);
        let clock = DeviceClock {
            seconds_since_boot: 3600,
        };
        let boot = clock.boot_reference(now);
        assert_eq!(now - boot, Duration::hours(1));

        let entry = HistoryEntry {
            relative_timestamp: 1800,
            values: values(20.0, 10, 5),
        };
        assert_eq!(entry.recorded_at(boot), now - Duration::minutes(30));
    }

    #[test]
    fn test_historical_reading_from_entry() {
        let boot = OffsetDateTime::UNIX_EPOCH;
        let entry = HistoryEntry {
            relative_timestamp: 60,
            values: values(18.5, 300, 33),
        };
        let reading = HistoricalSensorReading::from_entry("dev".into(), 7, entry, boot);
        assert_eq!(reading.index, 7);
        assert_eq!(reading.recorded_at, boot + Duration::minutes(1));
        assert_eq!(reading.values.moisture, 33);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_live_reading_serialization_is_flat() {
        let reading = LiveSensorReading::new(
            "dev".into(),
            values(10.0, 10, 50),
            OffsetDateTime::UNIX_EPOCH,
        );
        let json = serde_json::to_string(&reading).unwrap();
        assert!(json.contains("\"device_id\":\"dev\""));
        assert!(json.contains("\"moisture\":50"));
        assert!(json.contains("1970-01-01T00:00:00Z"));
    }
}
