//! Output formatting for text and JSON.

use anyhow::Result;
use flora_core::{
    DiscoveredDevice, FirmwareInfo, HistoricalSensorReading, LiveSensorReading, SensorValues,
};
use serde::Serialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

fn timestamp(at: OffsetDateTime) -> String {
    at.format(&Rfc3339).unwrap_or_else(|_| at.to_string())
}

fn values_row(values: &SensorValues) -> String {
    format!(
        "{:>7.1} {:>8} {:>5} {:>6}",
        values.temperature, values.brightness, values.moisture, values.conductivity
    )
}

#[derive(Serialize)]
struct ScanRow<'a> {
    identifier: &'a str,
    name: Option<&'a str>,
    rssi: Option<i16>,
    flower_care: bool,
}

pub fn format_scan_text(devices: &[DiscoveredDevice]) -> String {
    if devices.is_empty() {
        return "No devices found.\n".to_string();
    }
    let mut out = format!("{:<38} {:<16} {:>5}\n", "IDENTIFIER", "NAME", "RSSI");
    for device in devices {
        out.push_str(&format!(
            "{:<38} {:<16} {:>5}\n",
            device.identifier,
            device.name.as_deref().unwrap_or("-"),
            device
                .rssi
                .map(|r| r.to_string())
                .unwrap_or_else(|| "-".into()),
        ));
    }
    out
}

pub fn format_scan_json(devices: &[DiscoveredDevice]) -> Result<String> {
    let rows: Vec<_> = devices
        .iter()
        .map(|d| ScanRow {
            identifier: &d.identifier,
            name: d.name.as_deref(),
            rssi: d.rssi,
            flower_care: d.is_flower_care,
        })
        .collect();
    Ok(serde_json::to_string_pretty(&rows)?)
}

/// A live reading with the status read alongside it.
#[derive(Serialize)]
pub struct LiveReport<'a> {
    #[serde(flatten)]
    pub reading: &'a LiveSensorReading,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<&'a FirmwareInfo>,
}

pub fn format_live_text(report: &LiveReport<'_>) -> String {
    let values = &report.reading.values;
    let mut out = format!(
        "{}  {}\n  Temperature:  {:.1} °C\n  Brightness:   {} lx\n  Moisture:     {} %\n  Conductivity: {} µS/cm\n",
        report.reading.device_id,
        timestamp(report.reading.captured_at),
        values.temperature,
        values.brightness,
        values.moisture,
        values.conductivity,
    );
    if let Some(status) = report.status {
        out.push_str(&format!(
            "  Battery:      {} %\n  Firmware:     {}\n",
            status.battery, status.firmware
        ));
    }
    out
}

pub fn format_live_json(report: &LiveReport<'_>) -> Result<String> {
    Ok(serde_json::to_string(report)?)
}

pub fn format_history_text(readings: &[HistoricalSensorReading]) -> String {
    let mut out = format!(
        "{:>5}  {:<25} {:>7} {:>8} {:>5} {:>6}\n",
        "INDEX", "RECORDED", "TEMP°C", "LUX", "MOIST", "µS/cm"
    );
    for reading in readings {
        out.push_str(&format!(
            "{:>5}  {:<25} {}\n",
            reading.index,
            timestamp(reading.recorded_at),
            values_row(&reading.values)
        ));
    }
    out
}
