//! The seam between the pool and a Bluetooth stack.
//!
//! [`BleTransport`] is the narrow set of radio operations the pool needs.
//! Implementations deliver unsolicited platform events (advertisements,
//! link loss) through [`BleTransport::subscribe`]. Request outcomes are the
//! return values of the async methods.
//!
//! Two implementations ship with the crate: [`BtleTransport`](crate::btle::BtleTransport)
//! on top of btleplug, and [`MockTransport`](crate::mock::MockTransport)
//! which simulates Flower Care devices for tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use flora_types::DeviceId;

use crate::error::Result;

/// A service and the characteristics it exposes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredService {
    pub uuid: Uuid,
    pub characteristics: Vec<Uuid>,
}

impl DiscoveredService {
    pub fn new(uuid: Uuid, characteristics: impl IntoIterator<Item = Uuid>) -> Self {
        Self {
            uuid,
            characteristics: characteristics.into_iter().collect(),
        }
    }
}

/// Unsolicited events from the radio.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportEvent {
    /// A Flower Care device advertised.
    Discovered {
        id: DeviceId,
        name: Option<String>,
        rssi: Option<i16>,
    },
    /// The platform connection to a device dropped.
    Disconnected { id: DeviceId },
    /// The radio went away or lost permission.
    AdapterUnavailable { reason: String },
}

/// Radio operations used by the connection pool.
///
/// All methods may be called concurrently for different devices. The pool
/// never issues two requests for the same device at once.
#[async_trait]
pub trait BleTransport: Send + Sync + 'static {
    /// Subscribe to unsolicited events.
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;

    /// Returns `true` if a platform handle for `id` is already known, so it
    /// can be connected without scanning.
    fn knows(&self, id: &DeviceId) -> bool;

    /// Start scanning for devices.
    async fn start_scan(&self) -> Result<()>;

    /// Stop scanning.
    async fn stop_scan(&self) -> Result<()>;

    /// Open the platform connection.
    async fn connect(&self, id: &DeviceId) -> Result<()>;

    /// Close the platform connection.
    async fn disconnect(&self, id: &DeviceId) -> Result<()>;

    /// Discover every service and its characteristics.
    async fn discover(&self, id: &DeviceId) -> Result<Vec<DiscoveredService>>;

    /// Read a characteristic.
    async fn read(&self, id: &DeviceId, characteristic: Uuid) -> Result<Vec<u8>>;

    /// Write to a characteristic, with response.
    async fn write(&self, id: &DeviceId, characteristic: Uuid, payload: &[u8]) -> Result<()>;
}
