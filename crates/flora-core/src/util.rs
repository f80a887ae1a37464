//! Utility functions for flora-core.
//!
//! Identifier helpers shared by the scanner and the btleplug transport.

use btleplug::platform::PeripheralId;

/// Format a peripheral ID as a string.
///
/// On macOS, peripheral IDs are UUIDs. On other platforms, they may be
/// MAC addresses or other formats. This function extracts the useful
/// identifier string.
pub fn format_peripheral_id(id: &PeripheralId) -> String {
    strip_peripheral_id(&format!("{:?}", id))
}

fn strip_peripheral_id(debug: &str) -> String {
    debug
        .trim_start_matches("PeripheralId(")
        .trim_end_matches(')')
        .to_string()
}

/// Create an identifier string from an address and peripheral ID.
///
/// On macOS where addresses are 00:00:00:00:00:00, uses the peripheral ID.
/// On other platforms, uses the Bluetooth address.
pub fn create_identifier(address: &str, peripheral_id: &PeripheralId) -> String {
    if is_placeholder_address(address) {
        format_peripheral_id(peripheral_id)
    } else {
        address.to_string()
    }
}

fn is_placeholder_address(address: &str) -> bool {
    address == "00:00:00:00:00:00"
}

/// Compare two device identifiers, ignoring case and MAC separators.
pub fn identifiers_match(a: &str, b: &str) -> bool {
    fn normalize(s: &str) -> String {
        s.chars()
            .filter(|c| *c != ':' && *c != '-')
            .flat_map(char::to_lowercase)
            .collect()
    }
    !a.is_empty() && normalize(a) == normalize(b)
}
