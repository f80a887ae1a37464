//! Simulated Flower Care devices for testing.
//!
//! [`MockTransport`] implements [`BleTransport`] without any Bluetooth
//! hardware. Each device is described by a [`MockSensor`] and answers reads
//! and writes the way the real firmware does: mode switches, the history
//! address register, the entry count and the authentication exchange.
//!
//! # Features
//!
//! - **Scanning**: devices can be known up front or only appear while a scan runs
//! - **Failure injection**: failing connects, failing reads, a one-time link drop
//!   at a chosen history entry and corrupt history frames
//! - **Latency simulation**: an artificial delay on every request
//! - **Request log**: every request is recorded for assertions

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::time::sleep;
use uuid::Uuid;

use flora_types::codec::{
    encode_device_clock, encode_firmware_info, encode_history_entry, encode_history_metadata,
    encode_live_values, parse_history_address,
};
use flora_types::commands::{
    AUTH_KEY, AUTH_RESPONSE_PREFIX, BLINK, ENTRY_COUNT_REQUEST, MODE_HISTORY, MODE_LIVE,
};
use flora_types::uuids::{
    AUTHENTICATION, DATA_SERVICE, DEVICE_NAME, DEVICE_TIME, ENTRY_COUNT, FIRMWARE_BATTERY,
    HISTORY_CONTROL, HISTORY_DATA, HISTORY_SERVICE, MODE_CHANGE, PRIMARY_SERVICE,
    REAL_TIME_VALUES,
};
use flora_types::{
    DeviceClock, DeviceId, FirmwareInfo, HistoryEntry, HistoryMetadata, SensorValues,
};

use crate::error::{ConnectionFailureReason, Error, Result};
use crate::transport::{BleTransport, DiscoveredService, TransportEvent};

/// How a simulated device answers the authentication challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockAuth {
    /// Answer with the expected prefix and accept the key.
    Accept,
    /// Answer with bytes that do not match the prefix.
    Mismatch,
    /// The device has no authentication characteristic.
    Absent,
}

/// Description of one simulated Flower Care.
#[derive(Debug, Clone)]
pub struct MockSensor {
    name: String,
    values: SensorValues,
    firmware: FirmwareInfo,
    uptime_secs: u32,
    history: Vec<Option<HistoryEntry>>,
    auth: MockAuth,
    entry_count_characteristic: bool,
    rssi: i16,
}

impl Default for MockSensor {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSensor {
    /// A healthy device with plausible values and no history.
    pub fn new() -> Self {
        Self {
            name: "Flower care".to_string(),
            values: SensorValues {
                temperature: 21.5,
                brightness: 1_200,
                moisture: 35,
                conductivity: 480,
            },
            firmware: FirmwareInfo {
                battery: 92,
                firmware: "3.2.1".to_string(),
            },
            uptime_secs: 86_400,
            history: Vec::new(),
            auth: MockAuth::Accept,
            entry_count_characteristic: true,
            rssi: -62,
        }
    }

    #[must_use]
    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    #[must_use]
    pub fn values(mut self, values: SensorValues) -> Self {
        self.values = values;
        self
    }

    #[must_use]
    pub fn battery(mut self, battery: u8) -> Self {
        self.firmware.battery = battery;
        self
    }

    #[must_use]
    pub fn firmware(mut self, version: &str) -> Self {
        self.firmware.firmware = version.to_string();
        self
    }

    #[must_use]
    pub fn uptime_secs(mut self, secs: u32) -> Self {
        self.uptime_secs = secs;
        self
    }

    /// Generate `count` entries recorded hourly, oldest first, ending one
    /// minute before the device clock.
    #[must_use]
    pub fn hourly_history(mut self, count: u16) -> Self {
        let count = u32::from(count);
        let newest = self.uptime_secs.saturating_sub(60);
        self.history = (0..count)
            .map(|i| {
                Some(HistoryEntry {
                    relative_timestamp: newest.saturating_sub((count - 1 - i) * 3_600),
                    values: SensorValues {
                        temperature: 18.0 + (i % 10) as f32 * 0.5,
                        brightness: 100 * i,
                        moisture: (20 + i % 50) as u8,
                        conductivity: (300 + i % 200) as u16,
                    },
                })
            })
            .collect();
        self
    }

    /// Replace the stored history.
    #[must_use]
    pub fn history(mut self, entries: Vec<HistoryEntry>) -> Self {
        self.history = entries.into_iter().map(Some).collect();
        self
    }

    /// Make entry `index` answer with a frame the codec rejects.
    #[must_use]
    pub fn corrupt_entry(mut self, index: u16) -> Self {
        if let Some(slot) = self.history.get_mut(usize::from(index)) {
            *slot = None;
        }
        self
    }

    #[must_use]
    pub fn auth(mut self, auth: MockAuth) -> Self {
        self.auth = auth;
        self
    }

    /// Older firmware reports the entry count on the history data
    /// characteristic instead of a dedicated one.
    #[must_use]
    pub fn without_entry_count_characteristic(mut self) -> Self {
        self.entry_count_characteristic = false;
        self
    }

    #[must_use]
    pub fn rssi(mut self, rssi: i16) -> Self {
        self.rssi = rssi;
        self
    }

    pub fn entry_count(&self) -> u16 {
        u16::try_from(self.history.len()).unwrap_or(u16::MAX)
    }

    fn services(&self) -> Vec<DiscoveredService> {
        let mut primary = vec![DEVICE_NAME];
        if self.auth != MockAuth::Absent {
            primary.push(AUTHENTICATION);
        }
        let mut history = vec![HISTORY_CONTROL, HISTORY_DATA, DEVICE_TIME];
        if self.entry_count_characteristic {
            history.push(ENTRY_COUNT);
        }
        vec![
            DiscoveredService::new(PRIMARY_SERVICE, primary),
            DiscoveredService::new(DATA_SERVICE, [MODE_CHANGE, REAL_TIME_VALUES, FIRMWARE_BATTERY]),
            DiscoveredService::new(HISTORY_SERVICE, history),
        ]
    }
}

/// One request the mock received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockRequest {
    StartScan,
    StopScan,
    Connect(DeviceId),
    Disconnect(DeviceId),
    Discover(DeviceId),
    Read(DeviceId, Uuid),
    Write(DeviceId, Uuid, Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Idle,
    Live,
    History,
}

#[derive(Debug)]
struct MockDevice {
    sensor: MockSensor,
    known: bool,
    connected: bool,
    mode: Mode,
    history_address: Option<u16>,
    auth_challenged: bool,
    authenticated: bool,
    blinks: u32,
    connect_failures: u32,
    read_failures: HashMap<Uuid, u32>,
    drop_at_entry: Option<u16>,
}

impl MockDevice {
    fn new(sensor: MockSensor, known: bool) -> Self {
        Self {
            sensor,
            known,
            connected: false,
            mode: Mode::Idle,
            history_address: None,
            auth_challenged: false,
            authenticated: false,
            blinks: 0,
            connect_failures: 0,
            read_failures: HashMap::new(),
            drop_at_entry: None,
        }
    }

    fn read(&mut self, characteristic: Uuid) -> Result<Vec<u8>> {
        if let Some(remaining) = self.read_failures.get_mut(&characteristic) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Error::timeout(
                    format!("mock read {}", characteristic),
                    Duration::from_secs(1),
                ));
            }
        }

        let metadata = HistoryMetadata {
            entry_count: self.sensor.entry_count(),
            vendor_fields: [0; 12],
        };
        let value = match characteristic {
            REAL_TIME_VALUES => encode_live_values(&self.sensor.values).to_vec(),
            FIRMWARE_BATTERY => encode_firmware_info(&self.sensor.firmware).to_vec(),
            DEVICE_TIME => encode_device_clock(&DeviceClock {
                seconds_since_boot: self.sensor.uptime_secs,
            })
            .to_vec(),
            ENTRY_COUNT if self.sensor.entry_count_characteristic => {
                encode_history_metadata(&metadata).to_vec()
            }
            HISTORY_DATA => match self.history_address {
                Some(index) => match self.sensor.history.get(usize::from(index)) {
                    Some(Some(entry)) => encode_history_entry(entry).to_vec(),
                    Some(None) => vec![0xFF; 3],
                    None => vec![0xFF; 16],
                },
                None if self.mode == Mode::History => encode_history_metadata(&metadata).to_vec(),
                None => vec![0; 16],
            },
            AUTHENTICATION if self.sensor.auth != MockAuth::Absent => {
                match (self.sensor.auth, self.auth_challenged) {
                    (MockAuth::Accept, true) => {
                        let mut answer = AUTH_RESPONSE_PREFIX.to_vec();
                        answer.extend_from_slice(&[0x5A, 0x12]);
                        answer
                    }
                    _ => vec![0x00; 6],
                }
            }
            DEVICE_NAME => self.sensor.name.clone().into_bytes(),
            other => return Err(Error::characteristic_not_found(other.to_string(), 3)),
        };
        Ok(value)
    }

    fn write(&mut self, characteristic: Uuid, payload: &[u8]) -> Result<()> {
        match characteristic {
            MODE_CHANGE if payload == MODE_LIVE => self.mode = Mode::Live,
            MODE_CHANGE if payload == BLINK => self.blinks += 1,
            HISTORY_CONTROL if payload == MODE_HISTORY => {
                self.mode = Mode::History;
                self.history_address = None;
            }
            HISTORY_CONTROL => match parse_history_address(payload) {
                Some(index) => self.history_address = Some(index),
                None => {
                    return Err(Error::WriteFailed {
                        uuid: characteristic.to_string(),
                        reason: "unknown history command".to_string(),
                    });
                }
            },
            ENTRY_COUNT if payload == ENTRY_COUNT_REQUEST => {}
            AUTHENTICATION if payload == AUTH_KEY => {
                self.authenticated = self.auth_challenged && self.sensor.auth == MockAuth::Accept;
            }
            AUTHENTICATION => self.auth_challenged = true,
            _ => {}
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Inner {
    devices: HashMap<DeviceId, MockDevice>,
    scanning: bool,
    log: Vec<MockRequest>,
    latency: Duration,
    scan_delay: Duration,
}

/// A [`BleTransport`] serving simulated Flower Care devices.
#[derive(Debug)]
pub struct MockTransport {
    inner: Mutex<Inner>,
    events: broadcast::Sender<TransportEvent>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Mutex::new(Inner::default()),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_device<T>(
        &self,
        id: &DeviceId,
        f: impl FnOnce(&mut MockDevice) -> Result<T>,
    ) -> Result<T> {
        let mut inner = self.lock();
        let device = inner
            .devices
            .get_mut(id)
            .ok_or_else(|| Error::device_not_found(id.as_str()))?;
        f(device)
    }

    fn with_connected<T>(
        &self,
        id: &DeviceId,
        f: impl FnOnce(&mut MockDevice) -> Result<T>,
    ) -> Result<T> {
        self.with_device(id, |device| {
            if !device.connected {
                return Err(Error::NotConnected);
            }
            f(device)
        })
    }

    async fn simulate_latency(&self) {
        let latency = self.lock().latency;
        if !latency.is_zero() {
            sleep(latency).await;
        }
    }

    // ==================== Setup ====================

    /// Add a device the platform already knows, so it connects without a scan.
    pub fn add_device(&self, id: impl Into<DeviceId>, sensor: MockSensor) {
        self.lock()
            .devices
            .insert(id.into(), MockDevice::new(sensor, true));
    }

    /// Add a device that is only found by scanning.
    pub fn add_advertising_device(&self, id: impl Into<DeviceId>, sensor: MockSensor) {
        self.lock()
            .devices
            .insert(id.into(), MockDevice::new(sensor, false));
    }

    /// Remove a device, as if it went out of range for good.
    pub fn remove_device(&self, id: &DeviceId) {
        self.lock().devices.remove(id);
    }

    /// Delay every request by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Delay between a scan starting and advertisers being reported.
    pub fn set_scan_delay(&self, delay: Duration) {
        self.lock().scan_delay = delay;
    }

    /// Fail the next `count` connects to `id`.
    pub fn fail_connects(&self, id: &DeviceId, count: u32) {
        if let Some(device) = self.lock().devices.get_mut(id) {
            device.connect_failures = count;
        }
    }

    /// Fail the next `count` reads of `characteristic` on `id`.
    pub fn fail_reads(&self, id: &DeviceId, characteristic: Uuid, count: u32) {
        if let Some(device) = self.lock().devices.get_mut(id) {
            device.read_failures.insert(characteristic, count);
        }
    }

    /// Drop the link once, when the history address of `index` is written.
    pub fn drop_link_at_entry(&self, id: &DeviceId, index: u16) {
        if let Some(device) = self.lock().devices.get_mut(id) {
            device.drop_at_entry = Some(index);
        }
    }

    /// Drop the link now.
    pub fn drop_link(&self, id: &DeviceId) {
        let dropped = self
            .lock()
            .devices
            .get_mut(id)
            .map(|device| std::mem::replace(&mut device.connected, false))
            .unwrap_or(false);
        if dropped {
            let _ = self.events.send(TransportEvent::Disconnected { id: id.clone() });
        }
    }

    /// Report the radio as gone.
    pub fn drop_adapter(&self, reason: &str) {
        let _ = self.events.send(TransportEvent::AdapterUnavailable {
            reason: reason.to_string(),
        });
    }

    // ==================== Inspection ====================

    /// Every request received so far.
    pub fn requests(&self) -> Vec<MockRequest> {
        self.lock().log.clone()
    }

    /// Number of requests matching `predicate`.
    pub fn count_requests(&self, predicate: impl Fn(&MockRequest) -> bool) -> usize {
        self.lock().log.iter().filter(|r| predicate(r)).count()
    }

    /// History entry indices read, in order.
    pub fn history_addresses(&self, id: &DeviceId) -> Vec<u16> {
        self.lock()
            .log
            .iter()
            .filter_map(|r| match r {
                MockRequest::Write(device, HISTORY_CONTROL, payload) if device == id => {
                    parse_history_address(payload)
                }
                _ => None,
            })
            .collect()
    }

    pub fn is_connected(&self, id: &DeviceId) -> bool {
        self.lock().devices.get(id).is_some_and(|d| d.connected)
    }

    pub fn is_scanning(&self) -> bool {
        self.lock().scanning
    }

    pub fn is_authenticated(&self, id: &DeviceId) -> bool {
        self.lock().devices.get(id).is_some_and(|d| d.authenticated)
    }

    pub fn blink_count(&self, id: &DeviceId) -> u32 {
        self.lock().devices.get(id).map_or(0, |d| d.blinks)
    }

    fn record(&self, request: MockRequest) {
        self.lock().log.push(request);
    }
}

#[async_trait]
impl BleTransport for MockTransport {
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    fn knows(&self, id: &DeviceId) -> bool {
        self.lock().devices.get(id).is_some_and(|d| d.known)
    }

    async fn start_scan(&self) -> Result<()> {
        self.record(MockRequest::StartScan);
        let delay = {
            let mut inner = self.lock();
            inner.scanning = true;
            inner.scan_delay
        };
        if !delay.is_zero() {
            sleep(delay).await;
        }

        let advertisers: Vec<(DeviceId, String, i16)> = {
            let mut inner = self.lock();
            if !inner.scanning {
                return Ok(());
            }
            inner
                .devices
                .iter_mut()
                .map(|(id, device)| {
                    device.known = true;
                    (id.clone(), device.sensor.name.clone(), device.sensor.rssi)
                })
                .collect()
        };
        for (id, name, rssi) in advertisers {
            let _ = self.events.send(TransportEvent::Discovered {
                id,
                name: Some(name),
                rssi: Some(rssi),
            });
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.record(MockRequest::StopScan);
        self.lock().scanning = false;
        Ok(())
    }

    async fn connect(&self, id: &DeviceId) -> Result<()> {
        self.record(MockRequest::Connect(id.clone()));
        self.simulate_latency().await;
        self.with_device(id, |device| {
            if device.connect_failures > 0 {
                device.connect_failures -= 1;
                return Err(Error::connection_failed(
                    Some(id.to_string()),
                    ConnectionFailureReason::OutOfRange,
                ));
            }
            device.connected = true;
            device.mode = Mode::Idle;
            device.history_address = None;
            device.auth_challenged = false;
            Ok(())
        })
    }

    async fn disconnect(&self, id: &DeviceId) -> Result<()> {
        self.record(MockRequest::Disconnect(id.clone()));
        self.simulate_latency().await;
        let mut inner = self.lock();
        if let Some(device) = inner.devices.get_mut(id) {
            device.connected = false;
        }
        Ok(())
    }

    async fn discover(&self, id: &DeviceId) -> Result<Vec<DiscoveredService>> {
        self.record(MockRequest::Discover(id.clone()));
        self.simulate_latency().await;
        self.with_connected(id, |device| Ok(device.sensor.services()))
    }

    async fn read(&self, id: &DeviceId, characteristic: Uuid) -> Result<Vec<u8>> {
        self.record(MockRequest::Read(id.clone(), characteristic));
        self.simulate_latency().await;
        self.with_connected(id, |device| device.read(characteristic))
    }

    async fn write(&self, id: &DeviceId, characteristic: Uuid, payload: &[u8]) -> Result<()> {
        self.record(MockRequest::Write(id.clone(), characteristic, payload.to_vec()));
        self.simulate_latency().await;

        let dropped = self.with_connected(id, |device| {
            let target = parse_history_address(payload).filter(|_| characteristic == HISTORY_CONTROL);
            if target.is_some() && target == device.drop_at_entry {
                device.drop_at_entry = None;
                device.connected = false;
                return Ok(true);
            }
            device.write(characteristic, payload).map(|()| false)
        })?;

        if dropped {
            let _ = self.events.send(TransportEvent::Disconnected { id: id.clone() });
            return Err(Error::NotConnected);
        }
        Ok(())
    }
}

/// Characteristics of a fully featured simulated device.
pub fn mock_characteristics() -> HashSet<Uuid> {
    MockSensor::new()
        .services()
        .into_iter()
        .flat_map(|s| s.characteristics)
        .collect()
}
