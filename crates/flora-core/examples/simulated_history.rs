//! Example: Downloading History from a Simulated Sensor
//!
//! Runs the full connection pool against [`MockTransport`], so no Bluetooth
//! hardware is needed. The link drops halfway through the download and the
//! pool reconnects and resumes where it stopped.
//!
//! Run with: `cargo run --example simulated_history`

use std::sync::Arc;
use std::time::Duration;

use flora_core::{
    ConnectionPool, ConnectionState, DeviceEvent, DeviceId, MockSensor, MockTransport, PoolConfig,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter("flora_core=info")
        .init();

    let id = DeviceId::new("C4:7C:8D:6A:12:34");
    let transport = Arc::new(MockTransport::new());
    transport.add_device(id.clone(), MockSensor::new().hourly_history(48));
    transport.drop_link_at_entry(&id, 20);

    let pool = ConnectionPool::builder(transport)
        .config(PoolConfig::fast())
        .build()?;
    let mut events = pool.subscribe();

    pool.connect(&id).await?;
    pool.wait_for_state(&id, Duration::from_secs(30), ConnectionState::is_ready)
        .await?;
    pool.request_historical_data(&id).await?;

    println!("{:<28} {:>8} {:>8} {:>10} {:>8}", "Recorded", "Temp", "Moist", "Light", "Cond");
    println!("{}", "-".repeat(66));
    while let Ok(event) = events.recv().await {
        match event {
            DeviceEvent::HistoricalReading { reading } => {
                let v = reading.values;
                println!(
                    "{:<28} {:>6.1}°C {:>7}% {:>6} lux {:>5} µS",
                    reading.recorded_at, v.temperature, v.moisture, v.brightness, v.conductivity
                );
            }
            DeviceEvent::ReconnectScheduled { delay_ms, .. } => {
                println!("-- link dropped, reconnecting in {} ms", delay_ms);
            }
            DeviceEvent::HistoryStarted {
                start_index,
                resumed: true,
                ..
            } => println!("-- resumed at entry {}", start_index),
            DeviceEvent::HistoryCompleted { total_entries, .. } => {
                println!();
                println!("Downloaded {} entries", total_entries);
                break;
            }
            DeviceEvent::HistoryAborted { reason, .. } => {
                eprintln!("History aborted: {}", reason);
                break;
            }
            _ => {}
        }
    }

    pool.shutdown().await;
    Ok(())
}
