//! Connection and operation metrics tracking.
//!
//! The pool records every operation outcome and connect attempt into a
//! shared [`PoolMetrics`]. Handles read a [`MetricsSnapshot`] without going
//! through the pool task.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::events::DeviceEvent;
use crate::operation::OperationKind;

/// Counters for a single operation kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationMetrics {
    /// Operations that completed.
    pub success_count: u64,
    /// Operations that ended without success.
    pub failure_count: u64,
    /// Retries scheduled after a failed attempt.
    pub retry_count: u64,
}

impl OperationMetrics {
    /// Total number of finished operations.
    pub fn count(&self) -> u64 {
        self.success_count + self.failure_count
    }
}

/// Thread-safe atomic operation metrics tracker.
#[derive(Debug, Default)]
struct AtomicOperationMetrics {
    success_count: AtomicU64,
    failure_count: AtomicU64,
    retry_count: AtomicU64,
}

impl AtomicOperationMetrics {
    fn snapshot(&self) -> OperationMetrics {
        OperationMetrics {
            success_count: self.success_count.load(Ordering::Relaxed),
            failure_count: self.failure_count.load(Ordering::Relaxed),
            retry_count: self.retry_count.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        self.success_count.store(0, Ordering::Relaxed);
        self.failure_count.store(0, Ordering::Relaxed);
        self.retry_count.store(0, Ordering::Relaxed);
    }
}

/// Pool-wide counters.
#[derive(Debug, Default)]
pub struct PoolMetrics {
    operations: [AtomicOperationMetrics; OperationKind::ALL.len()],
    connect_attempts: AtomicU64,
    connect_failures: AtomicU64,
    reconnects: AtomicU64,
    history_entries: AtomicU64,
    rejected_entries: AtomicU64,
}

fn slot(kind: OperationKind) -> usize {
    OperationKind::ALL
        .iter()
        .position(|k| *k == kind)
        .unwrap_or_default()
}

impl PoolMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// A connect attempt started.
    pub fn record_connect_attempt(&self) {
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    /// A connect attempt failed.
    pub fn record_connect_failure(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Update counters from an event the pool is about to publish.
    pub fn observe(&self, event: &DeviceEvent) {
        match event {
            DeviceEvent::OperationCompleted { operation, .. } => {
                self.operations[slot(*operation)]
                    .success_count
                    .fetch_add(1, Ordering::Relaxed);
            }
            DeviceEvent::OperationFailed { operation, .. } => {
                self.operations[slot(*operation)]
                    .failure_count
                    .fetch_add(1, Ordering::Relaxed);
            }
            DeviceEvent::OperationRetrying { operation, .. } => {
                self.operations[slot(*operation)]
                    .retry_count
                    .fetch_add(1, Ordering::Relaxed);
            }
            DeviceEvent::HistoricalReading { .. } => {
                self.history_entries.fetch_add(1, Ordering::Relaxed);
            }
            DeviceEvent::EntryRejected { .. } => {
                self.rejected_entries.fetch_add(1, Ordering::Relaxed);
            }
            DeviceEvent::ReconnectScheduled { .. } => {
                self.reconnects.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    /// Get a snapshot of the current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            operations: OperationKind::ALL
                .iter()
                .map(|kind| (*kind, self.operations[slot(*kind)].snapshot()))
                .collect(),
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            history_entries: self.history_entries.load(Ordering::Relaxed),
            rejected_entries: self.rejected_entries.load(Ordering::Relaxed),
        }
    }

    /// Reset all metrics to zero.
    pub fn reset(&self) {
        for op in &self.operations {
            op.reset();
        }
        self.connect_attempts.store(0, Ordering::Relaxed);
        self.connect_failures.store(0, Ordering::Relaxed);
        self.reconnects.store(0, Ordering::Relaxed);
        self.history_entries.store(0, Ordering::Relaxed);
        self.rejected_entries.store(0, Ordering::Relaxed);
    }
}

/// Point-in-time copy of [`PoolMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub operations: BTreeMap<OperationKind, OperationMetrics>,
    pub connect_attempts: u64,
    pub connect_failures: u64,
    pub reconnects: u64,
    pub history_entries: u64,
    pub rejected_entries: u64,
}

impl MetricsSnapshot {
    /// Counters for one operation kind.
    pub fn operation(&self, kind: OperationKind) -> OperationMetrics {
        self.operations.get(&kind).copied().unwrap_or_default()
    }
}
