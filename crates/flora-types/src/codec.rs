//! Fixed-layout frame decoding and command frame encoding.
//!
//! All multi-byte fields are little-endian. Every decoder checks the frame
//! length up front and returns a [`ParseError`] instead of guessing.
//!
//! | Frame | Length | Layout |
//! |-------|--------|--------|
//! | Live values | 16 | temp `i16`/10 `[0..2]`, brightness `u32` `[3..7]`, moisture `[7]`, conductivity `u16` `[8..10]` |
//! | History entry | ≥14 | timestamp `u32` `[0..4]`, temp `[4..6]`, brightness `[7..11]`, moisture `[11]`, conductivity `[12..14]` |
//! | Entry count | 16 | count `u16` `[0..2]`, vendor fields `[2..14]` |
//! | Device time | 4 | seconds since boot `u32` |
//! | Firmware/battery | 7 | battery `[0]`, ASCII version `[2..7]` |

use bytes::{Buf, BufMut};

use crate::commands::HISTORY_ADDRESS;
use crate::error::{ParseError, ParseResult};
use crate::types::{DeviceClock, FirmwareInfo, HistoryEntry, HistoryMetadata, SensorValues};

/// Length of the live values frame.
pub const LIVE_FRAME_LEN: usize = 16;
/// Minimum length of a history entry frame.
pub const MIN_HISTORY_ENTRY_LEN: usize = 14;
/// Length of a history entry frame as sent by the device.
pub const HISTORY_ENTRY_FRAME_LEN: usize = 16;
/// Length of the entry-count frame.
pub const ENTRY_COUNT_FRAME_LEN: usize = 16;
/// Length of the device time frame.
pub const DEVICE_TIME_FRAME_LEN: usize = 4;
/// Length of the firmware/battery frame.
pub const FIRMWARE_FRAME_LEN: usize = 7;
/// Entry counts above this are treated as corruption.
pub const MAX_ENTRY_COUNT: u16 = 10_000;

fn expect_len(data: &[u8], expected: usize) -> ParseResult<()> {
    if data.len() != expected {
        return Err(ParseError::InvalidLength {
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

fn temperature_from_raw(raw: i16) -> f32 {
    f32::from(raw) / 10.0
}

fn temperature_to_raw(temperature: f32) -> i16 {
    // `as` saturates out-of-range floats
    (temperature * 10.0).round() as i16
}

/// Decode the 16-byte real-time values frame.
///
/// Values are returned exactly as transmitted. Use
/// [`SensorValues::clamped`] before persisting them.
///
/// # Errors
///
/// Returns [`ParseError::InvalidLength`] if `data` is not 16 bytes.
pub fn decode_live_values(data: &[u8]) -> ParseResult<SensorValues> {
    expect_len(data, LIVE_FRAME_LEN)?;

    let mut buf = data;
    let temperature = temperature_from_raw(buf.get_i16_le());
    buf.advance(1);
    let brightness = buf.get_u32_le();
    let moisture = buf.get_u8();
    let conductivity = buf.get_u16_le();

    Ok(SensorValues {
        temperature,
        brightness,
        moisture,
        conductivity,
    })
}

/// Encode values into a real-time values frame.
#[must_use]
pub fn encode_live_values(values: &SensorValues) -> [u8; LIVE_FRAME_LEN] {
    let mut frame = [0u8; LIVE_FRAME_LEN];
    let mut buf = &mut frame[..];
    buf.put_i16_le(temperature_to_raw(values.temperature));
    buf.put_u8(0);
    buf.put_u32_le(values.brightness);
    buf.put_u8(values.moisture);
    buf.put_u16_le(values.conductivity);
    frame
}

/// Decode a history entry frame.
///
/// `uptime_seconds` is the device's current boot-relative time. An entry
/// stamped later than that cannot have been recorded yet and is rejected.
///
/// # Errors
///
/// Returns [`ParseError::InsufficientBytes`] for frames shorter than 14 bytes
/// and [`ParseError::TimestampInFuture`] for entries newer than the device clock.
pub fn decode_history_entry(data: &[u8], uptime_seconds: u64) -> ParseResult<HistoryEntry> {
    if data.len() < MIN_HISTORY_ENTRY_LEN {
        return Err(ParseError::InsufficientBytes {
            expected: MIN_HISTORY_ENTRY_LEN,
            actual: data.len(),
        });
    }

    let mut buf = data;
    let relative_timestamp = buf.get_u32_le();
    if u64::from(relative_timestamp) > uptime_seconds {
        return Err(ParseError::TimestampInFuture {
            timestamp: relative_timestamp,
            uptime: uptime_seconds,
        });
    }

    let temperature = temperature_from_raw(buf.get_i16_le());
    buf.advance(1);
    let brightness = buf.get_u32_le();
    let moisture = buf.get_u8();
    let conductivity = buf.get_u16_le();

    Ok(HistoryEntry {
        relative_timestamp,
        values: SensorValues {
            temperature,
            brightness,
            moisture,
            conductivity,
        },
    })
}

/// Encode a history entry frame in the 16-byte form the device sends.
#[must_use]
pub fn encode_history_entry(entry: &HistoryEntry) -> [u8; HISTORY_ENTRY_FRAME_LEN] {
    let mut frame = [0u8; HISTORY_ENTRY_FRAME_LEN];
    let mut buf = &mut frame[..];
    buf.put_u32_le(entry.relative_timestamp);
    buf.put_i16_le(temperature_to_raw(entry.values.temperature));
    buf.put_u8(0);
    buf.put_u32_le(entry.values.brightness);
    buf.put_u8(entry.values.moisture);
    buf.put_u16_le(entry.values.conductivity);
    frame
}

/// Decode the 16-byte entry-count frame.
///
/// # Errors
///
/// Returns [`ParseError::InvalidLength`] for frames that are not 16 bytes and
/// [`ParseError::EntryCountTooLarge`] when the count exceeds [`MAX_ENTRY_COUNT`].
pub fn decode_history_metadata(data: &[u8]) -> ParseResult<HistoryMetadata> {
    expect_len(data, ENTRY_COUNT_FRAME_LEN)?;

    let mut buf = data;
    let entry_count = buf.get_u16_le();
    if entry_count > MAX_ENTRY_COUNT {
        return Err(ParseError::EntryCountTooLarge {
            count: entry_count,
            max: MAX_ENTRY_COUNT,
        });
    }

    let mut vendor_fields = [0u8; 12];
    buf.copy_to_slice(&mut vendor_fields);

    Ok(HistoryMetadata {
        entry_count,
        vendor_fields,
    })
}

/// Encode an entry-count frame.
#[must_use]
pub fn encode_history_metadata(metadata: &HistoryMetadata) -> [u8; ENTRY_COUNT_FRAME_LEN] {
    let mut frame = [0u8; ENTRY_COUNT_FRAME_LEN];
    let mut buf = &mut frame[..];
    buf.put_u16_le(metadata.entry_count);
    buf.put_slice(&metadata.vendor_fields);
    frame
}

/// Decode the 4-byte device time frame.
///
/// # Errors
///
/// Returns [`ParseError::InvalidLength`] if `data` is not 4 bytes.
pub fn decode_device_clock(data: &[u8]) -> ParseResult<DeviceClock> {
    expect_len(data, DEVICE_TIME_FRAME_LEN)?;
    let mut buf = data;
    Ok(DeviceClock {
        seconds_since_boot: buf.get_u32_le(),
    })
}

/// Encode a device time frame.
#[must_use]
pub fn encode_device_clock(clock: &DeviceClock) -> [u8; DEVICE_TIME_FRAME_LEN] {
    clock.seconds_since_boot.to_le_bytes()
}

/// Decode the 7-byte firmware/battery frame.
///
/// Trailing NUL padding in the version field is dropped.
///
/// # Errors
///
/// Returns [`ParseError::InvalidLength`] if `data` is not 7 bytes and
/// [`ParseError::InvalidFirmware`] if the version is not printable ASCII.
pub fn decode_firmware_info(data: &[u8]) -> ParseResult<FirmwareInfo> {
    expect_len(data, FIRMWARE_FRAME_LEN)?;

    let battery = data[0];
    let raw = &data[2..FIRMWARE_FRAME_LEN];
    let trimmed: &[u8] = match raw.iter().rposition(|&b| b != 0) {
        Some(last) => &raw[..=last],
        None => &[],
    };
    if !trimmed.iter().all(|b| b.is_ascii_graphic()) {
        return Err(ParseError::InvalidFirmware(raw.to_vec()));
    }

    // All bytes are ASCII graphic characters at this point
    let firmware = trimmed.iter().map(|&b| char::from(b)).collect();
    Ok(FirmwareInfo { battery, firmware })
}

/// Encode a firmware/battery frame. Versions longer than five characters are
/// truncated.
#[must_use]
pub fn encode_firmware_info(info: &FirmwareInfo) -> [u8; FIRMWARE_FRAME_LEN] {
    let mut frame = [0u8; FIRMWARE_FRAME_LEN];
    frame[0] = info.battery;
    for (slot, byte) in frame[2..].iter_mut().zip(info.firmware.bytes()) {
        *slot = byte;
    }
    frame
}

/// Build the history address frame selecting entry `index`.
#[must_use]
pub fn history_address_frame(index: u16) -> [u8; 3] {
    let [lo, hi] = index.to_le_bytes();
    [HISTORY_ADDRESS, lo, hi]
}

/// Extract the index from a history address frame.
#[must_use]
pub fn parse_history_address(frame: &[u8]) -> Option<u16> {
    match frame {
        [HISTORY_ADDRESS, lo, hi] => Some(u16::from_le_bytes([*lo, *hi])),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_decode_live_reference_frame() {
        let frame = [
            0x64, 0x00, // temperature = 100 -> 10.0 °C
            0xFF, // gap
            0x0A, 0x00, 0x00, 0x00, // brightness = 10
            0x32, // moisture = 50
            0x64, 0x00, // conductivity = 100
            0x02, 0x3C, 0x00, 0xFB, 0x34, 0x9B,
        ];

        let values = decode_live_values(&frame).unwrap();
        assert!((values.temperature - 10.0).abs() < f32::EPSILON);
        assert_eq!(values.brightness, 10);
        assert_eq!(values.moisture, 50);
        assert_eq!(values.conductivity, 100);
    }

    #[test]
    fn test_decode_live_negative_temperature() {
        let mut frame = [0u8; 16];
        frame[..2].copy_from_slice(&(-55i16).to_le_bytes());
        let values = decode_live_values(&frame).unwrap();
        assert!((values.temperature + 5.5).abs() < 0.001);
    }

    #[test]
    fn test_decode_live_wrong_length() {
        let err = decode_live_values(&[0u8; 15]).unwrap_err();
        assert_eq!(
            err,
            ParseError::InvalidLength {
                expected: 16,
                actual: 15
            }
        );
        assert!(decode_live_values(&[0u8; 17]).is_err());
        assert!(decode_live_values(&[]).is_err());
    }

    #[test]
    fn test_decode_live_does_not_clamp() {
        let values = SensorValues {
            temperature: 75.0,
            brightness: 200_000,
            moisture: 150,
            conductivity: 9000,
        };
        let decoded = decode_live_values(&encode_live_values(&values)).unwrap();
        assert_eq!(decoded, values);
        assert!(!decoded.is_in_range());
    }

    #[test]
    fn test_decode_history_entry() {
        let frame = [
            0x10, 0x0E, 0x00, 0x00, // timestamp = 3600
            0xD7, 0x00, // temperature = 215 -> 21.5
            0x00, // reserved
            0xE8, 0x03, 0x00, 0x00, // brightness = 1000
            0x2A, // moisture = 42
            0x5E, 0x01, // conductivity = 350
            0x00, 0x00,
        ];

        let entry = decode_history_entry(&frame, 7200).unwrap();
        assert_eq!(entry.relative_timestamp, 3600);
        assert!((entry.values.temperature - 21.5).abs() < 0.001);
        assert_eq!(entry.values.brightness, 1000);
        assert_eq!(entry.values.moisture, 42);
        assert_eq!(entry.values.conductivity, 350);
    }

    #[test]
    fn test_decode_history_entry_accepts_fourteen_bytes() {
        let mut frame = [0u8; 14];
        frame[0] = 5;
        assert!(decode_history_entry(&frame, 5).is_ok());
    }

    #[test]
    fn test_decode_history_entry_too_short() {
        let err = decode_history_entry(&[0u8; 13], 100).unwrap_err();
        assert_eq!(
            err,
            ParseError::InsufficientBytes {
                expected: 14,
                actual: 13
            }
        );
    }

    #[test]
    fn test_decode_history_entry_future_timestamp() {
        let mut frame = [0u8; 16];
        frame[..4].copy_from_slice(&500u32.to_le_bytes());
        let err = decode_history_entry(&frame, 499).unwrap_err();
        assert!(matches!(
            err,
            ParseError::TimestampInFuture {
                timestamp: 500,
                uptime: 499
            }
        ));
    }

    #[test]
    fn test_decode_entry_count_reference_frame() {
        let mut frame = [0u8; 16];
        frame[0] = 0x05;
        frame[2..14].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]);

        let metadata = decode_history_metadata(&frame).unwrap();
        assert_eq!(metadata.entry_count, 5);
        assert_eq!(
            metadata.vendor_fields,
            [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]
        );
    }

    #[test]
    fn test_decode_entry_count_guard() {
        let mut frame = [0u8; 16];
        frame[..2].copy_from_slice(&10_000u16.to_le_bytes());
        assert_eq!(decode_history_metadata(&frame).unwrap().entry_count, 10_000);

        frame[..2].copy_from_slice(&10_001u16.to_le_bytes());
        assert!(matches!(
            decode_history_metadata(&frame),
            Err(ParseError::EntryCountTooLarge { count: 10_001, .. })
        ));
    }

    #[test]
    fn test_decode_entry_count_wrong_length() {
        assert!(decode_history_metadata(&[0x05, 0x00]).is_err());
    }

    #[test]
    fn test_decode_device_clock() {
        let clock = decode_device_clock(&[0x80, 0x51, 0x01, 0x00]).unwrap();
        assert_eq!(clock.seconds_since_boot, 86_400);
        assert!(decode_device_clock(&[0x00, 0x01, 0x02]).is_err());
        assert_eq!(encode_device_clock(&clock), [0x80, 0x51, 0x01, 0x00]);
    }

    #[test]
    fn test_decode_firmware_info() {
        let info = decode_firmware_info(b"\x63\x153.2.1").unwrap();
        assert_eq!(info.battery, 99);
        assert_eq!(info.firmware, "3.2.1");
    }

    #[test]
    fn test_decode_firmware_info_trims_padding() {
        let info = decode_firmware_info(&[50, 0, b'2', b'.', b'7', 0, 0]).unwrap();
        assert_eq!(info.firmware, "2.7");
    }

    #[test]
    fn test_decode_firmware_info_rejects_binary() {
        let result = decode_firmware_info(&[50, 0, b'2', 0xFF, b'7', 0, 0]);
        assert!(matches!(result, Err(ParseError::InvalidFirmware(_))));
        assert!(decode_firmware_info(&[50, 0, b'3']).is_err());
    }

    #[test]
    fn test_encode_firmware_info() {
        let frame = encode_firmware_info(&FirmwareInfo {
            battery: 88,
            firmware: "3.3.5".to_string(),
        });
        assert_eq!(frame, [88, 0, b'3', b'.', b'3', b'.', b'5']);
    }

    #[test]
    fn test_history_address_frame() {
        assert_eq!(history_address_frame(0), [0xA1, 0x00, 0x00]);
        assert_eq!(history_address_frame(37), [0xA1, 0x25, 0x00]);
        assert_eq!(history_address_frame(0x1234), [0xA1, 0x34, 0x12]);
        assert_eq!(parse_history_address(&[0xA1, 0x34, 0x12]), Some(0x1234));
        assert_eq!(parse_history_address(&[0xA0, 0x00, 0x00]), None);
    }

    fn sensor_values() -> impl Strategy<Value = SensorValues> {
        (any::<i16>(), any::<u32>(), any::<u8>(), any::<u16>()).prop_map(
            |(raw, brightness, moisture, conductivity)| SensorValues {
                temperature: temperature_from_raw(raw),
                brightness,
                moisture,
                conductivity,
            },
        )
    }

    proptest! {
        #[test]
        fn prop_live_frame_round_trips(values in sensor_values()) {
            let decoded = decode_live_values(&encode_live_values(&values)).unwrap();
            prop_assert_eq!(decoded, values);
        }

        #[test]
        fn prop_future_entries_are_rejected(
            values in sensor_values(),
            uptime in 0u64..u64::from(u32::MAX),
            ahead in 1u32..10_000,
        ) {
            let relative_timestamp = u32::try_from(uptime)
                .unwrap()
                .saturating_add(ahead);
            prop_assume!(u64::from(relative_timestamp) > uptime);
            let frame = encode_history_entry(&HistoryEntry { relative_timestamp, values });
            prop_assert!(decode_history_entry(&frame, uptime).is_err());
        }

        #[test]
        fn prop_past_entries_decode(values in sensor_values(), relative_timestamp: u32, slack in 0u64..1_000) {
            let frame = encode_history_entry(&HistoryEntry { relative_timestamp, values });
            let entry = decode_history_entry(&frame, u64::from(relative_timestamp) + slack).unwrap();
            prop_assert_eq!(entry.relative_timestamp, relative_timestamp);
            prop_assert_eq!(entry.values, values);
        }

        #[test]
        fn prop_arbitrary_bytes_never_panic(data in proptest::collection::vec(any::<u8>(), 0..32)) {
            let _ = decode_live_values(&data);
            let _ = decode_history_entry(&data, u64::MAX);
            let _ = decode_history_metadata(&data);
            let _ = decode_device_clock(&data);
            let _ = decode_firmware_info(&data);
        }
    }
}
