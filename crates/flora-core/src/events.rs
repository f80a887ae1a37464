//! Device event system.
//!
//! Everything the pool observes is published as a [`DeviceEvent`] on one
//! broadcast channel: state transitions, readings, history progress and the
//! terminal outcome of every requested operation. Each requested operation
//! produces exactly one [`DeviceEvent::OperationCompleted`] or
//! [`DeviceEvent::OperationFailed`].

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use flora_types::{DeviceId, FirmwareInfo, HistoricalSensorReading, LiveSensorReading};

use crate::operation::OperationKind;
use crate::state::ConnectionState;

/// Default broadcast capacity. Draining a long history queue emits one event
/// per dropped operation, so this is sized well above a typical burst.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Events emitted by the pool and its device links.
///
/// All events are serializable for logging, persistence, and IPC.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new event types
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum DeviceEvent {
    /// A Flower Care device advertised during a scan.
    Discovered {
        device: DeviceId,
        name: Option<String>,
        rssi: Option<i16>,
    },
    /// The link moved to a new state.
    StateChanged {
        device: DeviceId,
        from: ConnectionState,
        to: ConnectionState,
    },
    /// A live reading, range-clamped.
    LiveReading { reading: LiveSensorReading },
    /// Battery level and firmware version, read with live data.
    DeviceStatus { device: DeviceId, info: FirmwareInfo },
    /// A history entry anchored to wall-clock time.
    HistoricalReading { reading: HistoricalSensorReading },
    /// A history download began or resumed.
    HistoryStarted {
        device: DeviceId,
        start_index: u16,
        total_entries: u16,
        resumed: bool,
    },
    /// Progress after each history entry.
    HistoryProgress {
        device: DeviceId,
        current_index: u16,
        total_entries: u16,
    },
    /// Every history entry was fetched.
    HistoryCompleted {
        device: DeviceId,
        total_entries: u16,
        rejected: u32,
    },
    /// The history download stopped early.
    HistoryAborted {
        device: DeviceId,
        current_index: u16,
        total_entries: u16,
        reason: String,
    },
    /// A history entry was rejected by the codec and skipped.
    EntryRejected {
        device: DeviceId,
        index: u16,
        error: String,
    },
    /// An operation finished successfully.
    OperationCompleted {
        device: DeviceId,
        operation: OperationKind,
        attempts: u32,
    },
    /// An operation attempt failed and will be retried.
    OperationRetrying {
        device: DeviceId,
        operation: OperationKind,
        next_attempt: u32,
        delay_ms: u64,
        error: String,
    },
    /// An operation ended without success.
    OperationFailed {
        device: DeviceId,
        operation: OperationKind,
        error: String,
    },
    /// A connect attempt failed and another is scheduled.
    ConnectRetryScheduled {
        device: DeviceId,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    /// The connect retry budget is spent until it is reset.
    MaxRetriesExceeded { device: DeviceId, attempts: u32 },
    /// The link dropped during a history download and will reconnect.
    ReconnectScheduled { device: DeviceId, delay_ms: u64 },
}

impl DeviceEvent {
    /// The device this event is about.
    pub fn device(&self) -> &DeviceId {
        match self {
            Self::LiveReading { reading } => &reading.device_id,
            Self::HistoricalReading { reading } => &reading.device_id,
            Self::Discovered { device, .. }
            | Self::StateChanged { device, .. }
            | Self::DeviceStatus { device, .. }
            | Self::HistoryStarted { device, .. }
            | Self::HistoryProgress { device, .. }
            | Self::HistoryCompleted { device, .. }
            | Self::HistoryAborted { device, .. }
            | Self::EntryRejected { device, .. }
            | Self::OperationCompleted { device, .. }
            | Self::OperationRetrying { device, .. }
            | Self::OperationFailed { device, .. }
            | Self::ConnectRetryScheduled { device, .. }
            | Self::MaxRetriesExceeded { device, .. }
            | Self::ReconnectScheduled { device, .. } => device,
        }
    }

    /// Returns `true` for the terminal event of an operation.
    pub fn is_operation_terminal(&self) -> bool {
        matches!(
            self,
            Self::OperationCompleted { .. } | Self::OperationFailed { .. }
        )
    }
}

/// Sender for device events.
pub type EventSender = broadcast::Sender<DeviceEvent>;

/// Receiver for device events.
pub type EventReceiver = broadcast::Receiver<DeviceEvent>;

/// Event dispatcher for sending events to multiple receivers.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    sender: EventSender,
}

impl EventDispatcher {
    /// Create a new event dispatcher.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to events.
    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Send an event.
    pub fn send(&self, event: DeviceEvent) {
        // Ignore error if no receivers
        let _ = self.sender.send(event);
    }

    /// Get the number of active receivers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
