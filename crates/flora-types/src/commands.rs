//! BLE command frames for Flower Care devices.
//!
//! This module contains the fixed byte sequences written to the mode-change,
//! history-control and authentication characteristics.

/// Switch to live mode so the real-time characteristic refreshes.
/// Written to the mode-change characteristic.
pub const MODE_LIVE: [u8; 2] = [0xA0, 0x1F];

/// Switch to history mode. Written to the history-control characteristic.
pub const MODE_HISTORY: [u8; 3] = [0xA0, 0x00, 0x00];

/// Request the stored entry count.
pub const ENTRY_COUNT_REQUEST: [u8; 1] = [0x3C];

/// Leading byte of a history address frame.
/// Format: `[HISTORY_ADDRESS, index_lo, index_hi]`
pub const HISTORY_ADDRESS: u8 = 0xA1;

/// Blink the device LED. Written to the mode-change characteristic.
pub const BLINK: [u8; 2] = [0xFD, 0xFF];

/// First step of the authentication handshake.
pub const AUTH_CHALLENGE: [u8; 4] = [0x90, 0xCA, 0x85, 0xDE];

/// Prefix a device answers the challenge with when it wants the key.
pub const AUTH_RESPONSE_PREFIX: [u8; 4] = AUTH_CHALLENGE;

/// Second step of the authentication handshake.
pub const AUTH_KEY: [u8; 8] = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_values() {
        assert_eq!(MODE_LIVE, [0xA0, 0x1F]);
        assert_eq!(MODE_HISTORY, [0xA0, 0x00, 0x00]);
        assert_eq!(ENTRY_COUNT_REQUEST, [0x3C]);
        assert_eq!(HISTORY_ADDRESS, 0xA1);
        assert_eq!(BLINK, [0xFD, 0xFF]);
    }

    #[test]
    fn test_auth_frames() {
        assert_eq!(AUTH_CHALLENGE, [0x90, 0xCA, 0x85, 0xDE]);
        assert_eq!(AUTH_KEY.len(), 8);
        assert_eq!(AUTH_KEY[0], 0x01);
        assert_eq!(AUTH_KEY[7], 0x08);
    }
}
