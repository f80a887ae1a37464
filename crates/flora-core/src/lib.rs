//! Device link and protocol engine for Flower Care soil sensors.
//!
//! This crate opens, authenticates and sequences commands against one or
//! many Flower Care BLE sensors, decodes their frames with
//! [`flora_types::codec`], and resumes long history downloads across
//! disconnects.
//!
//! # Layers
//!
//! - [`DeviceLink`](link::DeviceLink): the sans-IO state machine of one
//!   device. It consumes [`LinkInput`](link::LinkInput)s and returns
//!   [`LinkAction`](link::LinkAction)s, so it never touches a radio or a clock.
//! - [`OperationSequencer`](sequencer::OperationSequencer): one operation in
//!   flight per device, with a timeout and retry budget per operation kind.
//! - [`HistorySession`](history::HistorySession): the paged history protocol
//!   with checkpointed resume.
//! - [`ConnectionPool`]: one task that owns every link and drives it against
//!   a [`BleTransport`], adding scanning, connect retries, auto-reconnect,
//!   checkpoint persistence and the reading repository.
//!
//! # Platform Differences
//!
//! Device identifiers depend on the platform. On Linux and Windows they are
//! MAC addresses (`C4:7C:8D:6A:12:34`). On macOS CoreBluetooth assigns a
//! per-host UUID that may change if Bluetooth is reset.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use flora_core::{BtleTransport, ConnectionPool, ConnectionState, DeviceEvent, DeviceId};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = Arc::new(BtleTransport::new().await?);
//!     let pool = ConnectionPool::new(transport)?;
//!     let mut events = pool.subscribe();
//!
//!     let id = DeviceId::new("C4:7C:8D:6A:12:34");
//!     pool.connect(&id).await?;
//!     pool.wait_for_state(&id, Duration::from_secs(60), ConnectionState::is_ready)
//!         .await?;
//!     pool.request_live_data(&id).await?;
//!
//!     while let Ok(event) = events.recv().await {
//!         if let DeviceEvent::LiveReading { reading } = event {
//!             println!("moisture: {}%", reading.values.moisture);
//!             break;
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod btle;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod events;
pub mod history;
pub mod link;
pub mod metrics;
pub mod mock;
pub mod operation;
pub mod pool;
pub mod reconnect;
pub mod repository;
pub mod retry;
pub mod scan;
pub mod sequencer;
pub mod state;
pub mod transport;
pub mod util;

pub use flora_types;
pub use flora_types::uuid as uuids;
pub use flora_types::{
    DeviceId, FirmwareInfo, HistoricalSensorReading, LiveSensorReading, ParseError, SensorValues,
};

// Core exports
pub use btle::BtleTransport;
pub use checkpoint::{
    CheckpointStore, FileCheckpointStore, HistorySessionProgress, MemoryCheckpointStore,
};
pub use config::{AuthSettings, EventSettings, HistorySettings, PoolConfig};
pub use error::{ConnectionFailureReason, DeviceNotFoundReason, Error, Result};
pub use events::{DeviceEvent, EventDispatcher, EventReceiver, EventSender};
pub use history::{HistoryConfig, HistorySession, SessionPhase};
pub use link::{DeviceLink, LinkAction, LinkConfig, LinkInput, LinkTimer};
pub use metrics::{MetricsSnapshot, OperationMetrics, PoolMetrics};
pub use mock::{MockAuth, MockRequest, MockSensor, MockTransport};
pub use operation::{Operation, OperationKind, OperationPolicies, OperationPolicy};
pub use pool::{ConnectionPool, DeviceSummary, PoolBuilder};
pub use reconnect::ReconnectOptions;
pub use repository::{MemoryRepository, NullRepository, ReadingRepository};
pub use retry::{RetryConfig, with_retry};
pub use scan::{DiscoveredDevice, ScanOptions};
pub use sequencer::{BatchPacing, OperationSequencer};
pub use state::{ConnectionState, FailureReason};
pub use transport::{BleTransport, DiscoveredService, TransportEvent};
pub use util::{create_identifier, format_peripheral_id};
