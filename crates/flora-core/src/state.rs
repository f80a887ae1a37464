//! Connection state machine for a single device link.
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Authenticating -> Ready
//!                     |             |              |             |
//!                     +-------------+-- Failed ----+-------------+
//! ```
//!
//! Every state may return to `Disconnected` on an external disconnect, and a
//! state is only entered again after passing through `Disconnected`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::operation::OperationKind;

/// Why a link ended up in [`ConnectionState::Failed`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
#[non_exhaustive]
pub enum FailureReason {
    /// The connect retry budget is spent.
    MaxRetriesExceeded { attempts: u32 },
    /// An operation failed after all of its retries.
    OperationExhausted {
        operation: OperationKind,
        error: String,
    },
    /// The radio is off or not authorized.
    RadioUnavailable { message: String },
    /// A connect attempt failed in a way that cannot be retried.
    ConnectFailed { message: String },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MaxRetriesExceeded { attempts } => {
                write!(f, "gave up after {} connection attempts", attempts)
            }
            Self::OperationExhausted { operation, error } => {
                write!(f, "{} failed: {}", operation, error)
            }
            Self::RadioUnavailable { message } => write!(f, "radio unavailable: {}", message),
            Self::ConnectFailed { message } => write!(f, "connect failed: {}", message),
        }
    }
}

/// Connection state of a device link.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum ConnectionState {
    /// No platform connection.
    #[default]
    Disconnected,
    /// Waiting for the device to be found or the platform connect to finish.
    Connecting,
    /// Connected, discovering services and characteristics.
    Connected,
    /// Running the authentication handshake.
    Authenticating,
    /// Authenticated and accepting data operations.
    Ready,
    /// Stopped because of an unrecoverable error.
    Failed(FailureReason),
}

impl ConnectionState {
    /// Whether the documented state graph has an edge from `self` to `next`.
    pub fn can_transition_to(&self, next: &ConnectionState) -> bool {
        use ConnectionState::*;

        match (self, next) {
            (Disconnected, Disconnected) => false,
            (_, Disconnected) => true,
            (Disconnected, Connecting)
            | (Connecting, Connected)
            | (Connected, Authenticating)
            | (Authenticating, Ready) => true,
            (Connecting | Connected | Authenticating | Ready, Failed(_)) => true,
            _ => false,
        }
    }

    /// Returns `true` while a platform connection exists or is being made.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Connected | Self::Authenticating | Self::Ready
        )
    }

    /// Returns `true` once the link accepts data operations.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Returns `true` for [`ConnectionState::Failed`].
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    /// Short lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Authenticating => "authenticating",
            Self::Ready => "ready",
            Self::Failed(_) => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(reason) => write!(f, "failed ({})", reason),
            other => f.write_str(other.as_str()),
        }
    }
}
