//! Device operations and their timeout/retry budgets.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A unit of work the sequencer runs against one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Platform connect followed by service and characteristic discovery.
    Connect,
    /// Two-step challenge/key handshake.
    Authenticate,
    /// Switch to live mode, read real-time values and firmware/battery.
    ReadLiveData,
    /// Switch to history mode, read the device clock and the entry count.
    ReadHistoryCount,
    /// Select and read one history entry.
    ReadHistoryEntry(u16),
    /// Blink the device LED.
    Blink,
    /// Platform disconnect.
    Disconnect,
}

impl Operation {
    /// The kind of this operation, without parameters.
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Connect => OperationKind::Connect,
            Self::Authenticate => OperationKind::Authenticate,
            Self::ReadLiveData => OperationKind::ReadLiveData,
            Self::ReadHistoryCount => OperationKind::ReadHistoryCount,
            Self::ReadHistoryEntry(_) => OperationKind::ReadHistoryEntry,
            Self::Blink => OperationKind::Blink,
            Self::Disconnect => OperationKind::Disconnect,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadHistoryEntry(index) => write!(f, "read_history_entry({})", index),
            other => f.write_str(other.kind().as_str()),
        }
    }
}

/// Operation kinds, used to look up budgets and label events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Connect,
    Authenticate,
    ReadLiveData,
    ReadHistoryCount,
    ReadHistoryEntry,
    Blink,
    Disconnect,
}

impl OperationKind {
    /// Every kind, in declaration order.
    pub const ALL: [OperationKind; 7] = [
        OperationKind::Connect,
        OperationKind::Authenticate,
        OperationKind::ReadLiveData,
        OperationKind::ReadHistoryCount,
        OperationKind::ReadHistoryEntry,
        OperationKind::Blink,
        OperationKind::Disconnect,
    ];

    /// Snake case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Authenticate => "authenticate",
            Self::ReadLiveData => "read_live_data",
            Self::ReadHistoryCount => "read_history_count",
            Self::ReadHistoryEntry => "read_history_entry",
            Self::Blink => "blink",
            Self::Disconnect => "disconnect",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timeout and retry budget of one operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationPolicy {
    /// Time allowed for one attempt, in milliseconds.
    pub timeout_ms: u64,
    /// Retries after the first attempt.
    pub max_retries: u32,
}

impl OperationPolicy {
    /// Create a policy.
    pub const fn new(timeout: Duration, max_retries: u32) -> Self {
        Self {
            timeout_ms: timeout.as_millis() as u64,
            max_retries,
        }
    }

    /// Time allowed for one attempt.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Upper bound on attempts, first attempt included.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Budgets for every operation kind.
///
/// Connect carries no retries of its own: connect retries are owned by the
/// connection pool, which also spans the scan that precedes the connect.
/// Authenticate carries none either because the handshake falls back to
/// authenticated on its own deadline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationPolicies {
    pub connect: OperationPolicy,
    pub authenticate: OperationPolicy,
    pub read_live_data: OperationPolicy,
    pub read_history_count: OperationPolicy,
    pub read_history_entry: OperationPolicy,
    pub blink: OperationPolicy,
    pub disconnect: OperationPolicy,
}

impl Default for OperationPolicies {
    fn default() -> Self {
        Self {
            connect: OperationPolicy::new(Duration::from_secs(10), 0),
            authenticate: OperationPolicy::new(Duration::from_secs(5), 0),
            read_live_data: OperationPolicy::new(Duration::from_secs(8), 2),
            read_history_count: OperationPolicy::new(Duration::from_secs(5), 2),
            read_history_entry: OperationPolicy::new(Duration::from_secs(3), 2),
            blink: OperationPolicy::new(Duration::from_secs(3), 1),
            disconnect: OperationPolicy::new(Duration::from_secs(5), 0),
        }
    }
}

impl OperationPolicies {
    /// Budget for an operation kind.
    pub fn get(&self, kind: OperationKind) -> OperationPolicy {
        match kind {
            OperationKind::Connect => self.connect,
            OperationKind::Authenticate => self.authenticate,
            OperationKind::ReadLiveData => self.read_live_data,
            OperationKind::ReadHistoryCount => self.read_history_count,
            OperationKind::ReadHistoryEntry => self.read_history_entry,
            OperationKind::Blink => self.blink,
            OperationKind::Disconnect => self.disconnect,
        }
    }

    /// Tighter budgets for strong signal and tests.
    pub fn fast() -> Self {
        Self {
            connect: OperationPolicy::new(Duration::from_secs(5), 0),
            authenticate: OperationPolicy::new(Duration::from_secs(3), 0),
            read_live_data: OperationPolicy::new(Duration::from_secs(3), 1),
            read_history_count: OperationPolicy::new(Duration::from_secs(3), 1),
            read_history_entry: OperationPolicy::new(Duration::from_millis(1500), 1),
            blink: OperationPolicy::new(Duration::from_secs(2), 0),
            disconnect: OperationPolicy::new(Duration::from_secs(3), 0),
        }
    }

    /// Longer budgets and more retries for weak signal.
    pub fn challenging_environment() -> Self {
        Self {
            connect: OperationPolicy::new(Duration::from_secs(15), 0),
            authenticate: OperationPolicy::new(Duration::from_secs(5), 0),
            read_live_data: OperationPolicy::new(Duration::from_secs(8), 3),
            read_history_count: OperationPolicy::new(Duration::from_secs(8), 3),
            read_history_entry: OperationPolicy::new(Duration::from_secs(3), 3),
            blink: OperationPolicy::new(Duration::from_secs(3), 1),
            disconnect: OperationPolicy::new(Duration::from_secs(5), 0),
        }
    }
}
