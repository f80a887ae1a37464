//! Connect retry and automatic reconnection policy.
//!
//! The pool owns connect retries because a connect attempt spans the scan
//! that finds the device as well as the platform connect. After a failed
//! attempt the pool waits `retry_base_delay * attempt` (linear) and tries
//! again, up to `max_attempts`. Then the link fails with
//! [`FailureReason::MaxRetriesExceeded`](crate::FailureReason::MaxRetriesExceeded)
//! until the counter is reset.
//!
//! A link that drops during a history download is reconnected after
//! `reconnect_settle`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The `connection` section of the pool configuration.
///
/// The per-attempt connect timeout lives with the other operation budgets in
/// [`OperationPolicies::connect`](crate::OperationPolicies).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectOptions {
    /// Connect attempts before the link fails.
    pub max_attempts: u32,
    /// Delay unit of the linear backoff, in milliseconds.
    pub retry_base_delay_ms: u64,
    /// Pause before reconnecting an interrupted history download, in milliseconds.
    pub reconnect_settle_ms: u64,
    /// How long one attempt may wait for the device to advertise, in milliseconds.
    pub scan_deadline_ms: u64,
}

impl Default for ReconnectOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_base_delay_ms: 1_000,
            reconnect_settle_ms: 500,
            scan_deadline_ms: 10_000,
        }
    }
}

impl ReconnectOptions {
    /// Create new reconnect options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Short delays for tests and strong signal.
    pub fn fast() -> Self {
        Self {
            max_attempts: 3,
            retry_base_delay_ms: 250,
            reconnect_settle_ms: 200,
            scan_deadline_ms: 5_000,
        }
    }

    /// More attempts and longer scans for weak signal.
    pub fn challenging_environment() -> Self {
        Self {
            max_attempts: 5,
            retry_base_delay_ms: 2_000,
            reconnect_settle_ms: 1_000,
            scan_deadline_ms: 20_000,
        }
    }

    /// Set maximum number of connect attempts.
    #[must_use]
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set the linear backoff unit.
    #[must_use]
    pub fn retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Delay before the next attempt, after `failed` attempts have failed.
    pub fn delay_for_attempt(&self, failed: u32) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms.saturating_mul(u64::from(failed.max(1))))
    }

    /// Returns `true` once `failed` attempts exhaust the budget.
    pub fn is_exhausted(&self, failed: u32) -> bool {
        failed >= self.max_attempts
    }

    pub fn reconnect_settle(&self) -> Duration {
        Duration::from_millis(self.reconnect_settle_ms)
    }

    pub fn scan_deadline(&self) -> Duration {
        Duration::from_millis(self.scan_deadline_ms)
    }

    /// Validate the options and return an error if invalid.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::invalid_config(
                "connection.max_attempts must be > 0",
            ));
        }
        if self.scan_deadline_ms == 0 {
            return Err(Error::invalid_config(
                "connection.scan_deadline_ms must be > 0",
            ));
        }
        Ok(())
    }
}
