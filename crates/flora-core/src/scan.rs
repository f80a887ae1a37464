//! Device discovery and scanning.
//!
//! This module provides functionality to find Flower Care devices using
//! Bluetooth Low Energy, either as a one-shot timed scan or as a filter the
//! btleplug transport applies to every advertisement.

use std::time::Duration;

use btleplug::api::{Central, Manager as _, Peripheral as _, PeripheralProperties, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use tokio::time::sleep;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{DeviceNotFoundReason, Error, Result};
use crate::util::create_identifier;
use flora_types::uuid::PRIMARY_SERVICE;

/// MiBeacon product id Flower Care puts in its fe95 service data.
pub const FLOWER_CARE_PRODUCT_ID: u16 = 0x0098;

/// Advertised names used by Flower Care devices.
const FLOWER_CARE_NAMES: [&str; 2] = ["flower care", "flower mate"];

/// Information about a discovered Flower Care device.
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    /// The advertised name (usually "Flower care").
    pub name: Option<String>,
    /// The peripheral ID for connecting.
    pub id: PeripheralId,
    /// The BLE address as a string (may be zeros on macOS, use `id` instead).
    pub address: String,
    /// A connection identifier (peripheral ID on macOS, address on other platforms).
    pub identifier: String,
    /// RSSI signal strength.
    pub rssi: Option<i16>,
    /// Whether the advertisement matched a Flower Care device.
    pub is_flower_care: bool,
}

/// Options for scanning.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// How long to scan for devices.
    pub duration: Duration,
    /// Only return devices that appear to be Flower Care devices.
    pub flower_care_only: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(10),
            flower_care_only: true,
        }
    }
}

impl ScanOptions {
    /// Create new scan options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the scan duration.
    #[must_use]
    pub fn duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Set scan duration in seconds.
    #[must_use]
    pub fn duration_secs(mut self, secs: u64) -> Self {
        self.duration = Duration::from_secs(secs);
        self
    }

    /// Scan for all BLE devices, not just Flower Care.
    #[must_use]
    pub fn all_devices(mut self) -> Self {
        self.flower_care_only = false;
        self
    }
}

/// Get the first available Bluetooth adapter.
pub async fn get_adapter() -> Result<Adapter> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;

    adapters
        .into_iter()
        .next()
        .ok_or(Error::DeviceNotFound(DeviceNotFoundReason::NoAdapter))
}

/// Scan for devices with custom options.
pub async fn scan_with_options(options: ScanOptions) -> Result<Vec<DiscoveredDevice>> {
    let adapter = get_adapter().await?;
    scan_with_adapter(&adapter, options).await
}

/// Scan for devices using a specific adapter.
///
/// An empty list means nothing matched, not an error.
pub async fn scan_with_adapter(
    adapter: &Adapter,
    options: ScanOptions,
) -> Result<Vec<DiscoveredDevice>> {
    info!(
        "Starting BLE scan for {} seconds...",
        options.duration.as_secs()
    );

    adapter.start_scan(ScanFilter::default()).await?;
    sleep(options.duration).await;
    adapter.stop_scan().await?;

    let peripherals = adapter.peripherals().await?;
    let mut discovered = Vec::new();

    for peripheral in peripherals {
        match process_peripheral(&peripheral, options.flower_care_only).await {
            Ok(Some(device)) => {
                info!("Found device: {:?} ({})", device.name, device.identifier);
                discovered.push(device);
            }
            Ok(None) => {}
            Err(e) => {
                debug!("Error processing peripheral: {}", e);
            }
        }
    }

    info!("Scan complete. Found {} device(s)", discovered.len());
    Ok(discovered)
}

/// Inspect a peripheral and describe it if it passes the filter.
pub(crate) async fn process_peripheral(
    peripheral: &Peripheral,
    flower_care_only: bool,
) -> Result<Option<DiscoveredDevice>> {
    let Some(properties) = peripheral.properties().await? else {
        return Ok(None);
    };

    let is_flower_care = is_flower_care(&properties);
    if flower_care_only && !is_flower_care {
        return Ok(None);
    }

    let id = peripheral.id();
    let address = properties.address.to_string();
    let identifier = create_identifier(&address, &id);

    Ok(Some(DiscoveredDevice {
        name: properties.local_name,
        id,
        address,
        identifier,
        rssi: properties.rssi,
        is_flower_care,
    }))
}

/// Check if a peripheral is a Flower Care device based on its properties.
pub(crate) fn is_flower_care(properties: &PeripheralProperties) -> bool {
    is_flower_care_advertisement(
        properties.local_name.as_deref(),
        properties.service_data.get(&PRIMARY_SERVICE).map(Vec::as_slice),
        &properties.services,
    )
}

/// Matches on the advertised name, on MiBeacon service data carrying the
/// Flower Care product id, or on an advertised fe95 service when neither is
/// present.
fn is_flower_care_advertisement(
    name: Option<&str>,
    service_data: Option<&[u8]>,
    services: &[Uuid],
) -> bool {
    if let Some(name) = name {
        let name = name.to_lowercase();
        if FLOWER_CARE_NAMES.iter().any(|n| name.contains(n)) {
            return true;
        }
    }

    match service_data {
        Some(data) if data.len() >= 4 => {
            u16::from_le_bytes([data[2], data[3]]) == FLOWER_CARE_PRODUCT_ID
        }
        Some(_) => false,
        None => name.is_none() && services.contains(&PRIMARY_SERVICE),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_match() {
        assert!(is_flower_care_advertisement(Some("Flower care"), None, &[]));
        assert!(is_flower_care_advertisement(Some("Flower mate"), None, &[]));
        assert!(!is_flower_care_advertisement(Some("Mi Smart Band 6"), None, &[]));
    }

    #[test]
    fn test_service_data_product_id() {
        let mibeacon = [0x71, 0x20, 0x98, 0x00, 0x12, 0x34];
        assert!(is_flower_care_advertisement(None, Some(&mibeacon), &[]));

        // A different Xiaomi product on the same service.
        let other = [0x50, 0x20, 0x5b, 0x05, 0x12];
        assert!(!is_flower_care_advertisement(None, Some(&other), &[]));
        assert!(!is_flower_care_advertisement(None, Some(&[0x71]), &[]));
    }

    #[test]
    fn test_anonymous_fe95_service() {
        assert!(is_flower_care_advertisement(None, None, &[PRIMARY_SERVICE]));
        assert!(!is_flower_care_advertisement(
            Some("Mi Band"),
            None,
            &[PRIMARY_SERVICE]
        ));
        assert!(!is_flower_care_advertisement(None, None, &[]));
    }

    #[test]
    fn test_scan_options_builder() {
        let options = ScanOptions::new().duration_secs(3).all_devices();
        assert_eq!(options.duration, Duration::from_secs(3));
        assert!(!options.flower_care_only);
        assert!(ScanOptions::default().flower_care_only);
    }
}
