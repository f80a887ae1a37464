//! Example: Scanning for Flower Care Devices
//!
//! Lists every Flower Care sensor that advertises within ten seconds.
//!
//! Run with: `cargo run --example scan_devices`

use flora_core::scan::{self, ScanOptions};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    println!("Scanning for Flower Care devices...");
    println!();

    let devices = scan::scan_with_options(ScanOptions::default().duration_secs(10)).await?;

    if devices.is_empty() {
        println!("No Flower Care devices found.");
        println!();
        println!("Make sure:");
        println!("  - The sensor has a battery and is within range");
        println!("  - Bluetooth is enabled on this computer");
        return Ok(());
    }

    println!("Found {} device(s):", devices.len());
    println!();
    for device in &devices {
        let name = device.name.as_deref().unwrap_or("Unknown");
        let rssi = device
            .rssi
            .map(|r| format!("{} dBm", r))
            .unwrap_or_else(|| "N/A".to_string());

        println!("  {}", name);
        println!("    Identifier: {}", device.identifier);
        println!("    RSSI: {}", rssi);
        println!();
    }

    Ok(())
}
