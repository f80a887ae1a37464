//! [`BleTransport`] on top of btleplug.
//!
//! The transport keeps a cache of Flower Care peripherals keyed by
//! [`DeviceId`]. A background task watches the adapter's event stream,
//! adds every matching advertiser to the cache and reports link loss.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Peripheral, PeripheralId};
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use flora_types::DeviceId;

use crate::error::{Error, Result};
use crate::retry::{RetryConfig, with_retry};
use crate::scan::{get_adapter, process_peripheral};
use crate::transport::{BleTransport, DiscoveredService, TransportEvent};

const TRANSPORT_EVENT_CAPACITY: usize = 256;

type PeripheralCache = Arc<RwLock<HashMap<DeviceId, Peripheral>>>;

/// Bluetooth transport backed by the first system adapter.
pub struct BtleTransport {
    adapter: Adapter,
    peripherals: PeripheralCache,
    events: broadcast::Sender<TransportEvent>,
    watcher: JoinHandle<()>,
}

impl BtleTransport {
    /// Open the first adapter, retrying while it comes up.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn new() -> Result<Self> {
        let adapter = with_retry(&RetryConfig::for_adapter(), "open_adapter", get_adapter).await?;
        Self::with_adapter(adapter).await
    }

    /// Wrap an already opened adapter.
    ///
    /// Peripherals the platform already knows about are cached immediately,
    /// so they can be connected without a scan.
    pub async fn with_adapter(adapter: Adapter) -> Result<Self> {
        let (events, _) = broadcast::channel(TRANSPORT_EVENT_CAPACITY);
        let peripherals: PeripheralCache = Arc::default();

        for peripheral in adapter.peripherals().await? {
            if let Ok(Some(device)) = process_peripheral(&peripheral, true).await {
                debug!("Known peripheral: {}", device.identifier);
                write_cache(&peripherals).insert(DeviceId::new(device.identifier), peripheral);
            }
        }

        let stream = adapter.events().await?;
        let watcher = tokio::spawn(watch_adapter(
            adapter.clone(),
            stream,
            Arc::clone(&peripherals),
            events.clone(),
        ));

        Ok(Self {
            adapter,
            peripherals,
            events,
            watcher,
        })
    }

    fn peripheral(&self, id: &DeviceId) -> Result<Peripheral> {
        read_cache(&self.peripherals)
            .get(id)
            .cloned()
            .ok_or_else(|| Error::device_not_found(id.as_str()))
    }

    fn characteristic(peripheral: &Peripheral, uuid: Uuid) -> Result<Characteristic> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or_else(|| {
                Error::characteristic_not_found(uuid.to_string(), peripheral.services().len())
            })
    }
}

impl Drop for BtleTransport {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

fn read_cache(
    cache: &PeripheralCache,
) -> std::sync::RwLockReadGuard<'_, HashMap<DeviceId, Peripheral>> {
    cache.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_cache(
    cache: &PeripheralCache,
) -> std::sync::RwLockWriteGuard<'_, HashMap<DeviceId, Peripheral>> {
    cache.write().unwrap_or_else(PoisonError::into_inner)
}

async fn watch_adapter(
    adapter: Adapter,
    mut stream: std::pin::Pin<Box<dyn futures::Stream<Item = CentralEvent> + Send>>,
    peripherals: PeripheralCache,
    events: broadcast::Sender<TransportEvent>,
) {
    while let Some(event) = stream.next().await {
        match event {
            CentralEvent::DeviceDiscovered(pid) => {
                on_advertisement(&adapter, &pid, &peripherals, &events, true).await;
            }
            CentralEvent::DeviceUpdated(pid)
            | CentralEvent::ServiceDataAdvertisement { id: pid, .. } => {
                on_advertisement(&adapter, &pid, &peripherals, &events, false).await;
            }
            CentralEvent::DeviceDisconnected(pid) => {
                let id = read_cache(&peripherals)
                    .iter()
                    .find(|(_, p)| p.id() == pid)
                    .map(|(id, _)| id.clone());
                if let Some(id) = id {
                    info!("Platform reported disconnect for {}", id);
                    let _ = events.send(TransportEvent::Disconnected { id });
                }
            }
            _ => {}
        }
    }

    warn!("Adapter event stream ended");
    let _ = events.send(TransportEvent::AdapterUnavailable {
        reason: "adapter event stream ended".to_string(),
    });
}

/// Cache a Flower Care advertiser. Discovery is reported for fresh
/// advertisements and for the first sighting of a device.
async fn on_advertisement(
    adapter: &Adapter,
    pid: &PeripheralId,
    peripherals: &PeripheralCache,
    events: &broadcast::Sender<TransportEvent>,
    fresh: bool,
) {
    let Ok(peripheral) = adapter.peripheral(pid).await else {
        return;
    };
    let device = match process_peripheral(&peripheral, true).await {
        Ok(Some(device)) => device,
        Ok(None) => return,
        Err(e) => {
            debug!("Error processing peripheral: {}", e);
            return;
        }
    };

    let id = DeviceId::new(device.identifier);
    let first_sighting = write_cache(peripherals)
        .insert(id.clone(), peripheral)
        .is_none();

    if fresh || first_sighting {
        let _ = events.send(TransportEvent::Discovered {
            id,
            name: device.name,
            rssi: device.rssi,
        });
    }
}

#[async_trait]
impl BleTransport for BtleTransport {
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    fn knows(&self, id: &DeviceId) -> bool {
        read_cache(&self.peripherals).contains_key(id)
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn start_scan(&self) -> Result<()> {
        self.adapter.start_scan(ScanFilter::default()).await?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn stop_scan(&self) -> Result<()> {
        self.adapter.stop_scan().await?;
        Ok(())
    }

    #[tracing::instrument(level = "info", skip_all, fields(device = %id))]
    async fn connect(&self, id: &DeviceId) -> Result<()> {
        let peripheral = self.peripheral(id)?;
        if !peripheral.is_connected().await? {
            peripheral.connect().await?;
        }
        Ok(())
    }

    #[tracing::instrument(level = "info", skip_all, fields(device = %id))]
    async fn disconnect(&self, id: &DeviceId) -> Result<()> {
        let peripheral = self.peripheral(id)?;
        if peripheral.is_connected().await? {
            peripheral.disconnect().await?;
        }
        Ok(())
    }

    #[tracing::instrument(level = "info", skip_all, fields(device = %id))]
    async fn discover(&self, id: &DeviceId) -> Result<Vec<DiscoveredService>> {
        let peripheral = self.peripheral(id)?;
        peripheral.discover_services().await?;

        let services: Vec<DiscoveredService> = peripheral
            .services()
            .into_iter()
            .map(|service| {
                DiscoveredService::new(
                    service.uuid,
                    service.characteristics.into_iter().map(|c| c.uuid),
                )
            })
            .collect();
        debug!("Discovered {} services", services.len());
        Ok(services)
    }

    #[tracing::instrument(level = "debug", skip_all, fields(device = %id, characteristic = %characteristic))]
    async fn read(&self, id: &DeviceId, characteristic: Uuid) -> Result<Vec<u8>> {
        let peripheral = self.peripheral(id)?;
        let characteristic = Self::characteristic(&peripheral, characteristic)?;
        Ok(peripheral.read(&characteristic).await?)
    }

    #[tracing::instrument(level = "debug", skip_all, fields(device = %id, characteristic = %characteristic))]
    async fn write(&self, id: &DeviceId, characteristic: Uuid, payload: &[u8]) -> Result<()> {
        let peripheral = self.peripheral(id)?;
        let characteristic = Self::characteristic(&peripheral, characteristic)?;
        peripheral
            .write(&characteristic, payload, WriteType::WithResponse)
            .await
            .map_err(|e| Error::WriteFailed {
                uuid: characteristic.uuid.to_string(),
                reason: e.to_string(),
            })
    }
}
