//! Strictly serialized operation queue for one device.
//!
//! The sequencer is a pure state machine. It never sleeps or touches the
//! radio: it tells its owner which operation to start, how long the attempt
//! may take, and when to retry or pause. The owner schedules the timers and
//! feeds the outcome back tagged with the [`AttemptId`] it was given.
//!
//! Because every attempt gets a fresh id, a late success after a timeout, or
//! a timeout firing after a success, is simply reported as stale.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Error;
use crate::operation::{Operation, OperationKind, OperationPolicies, OperationPolicy};
use crate::retry::RetryConfig;

/// Identifies one attempt of one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttemptId(u64);

impl AttemptId {
    /// Raw id value, for logging.
    pub fn get(&self) -> u64 {
        self.0
    }
}

/// Pause inserted after every `batch_size` completed history entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchPacing {
    /// Entries per batch. Zero disables pacing.
    pub batch_size: u32,
    /// Pause between batches, in milliseconds.
    pub pause_ms: u64,
}

impl Default for BatchPacing {
    fn default() -> Self {
        Self {
            batch_size: 20,
            pause_ms: 1_000,
        }
    }
}

impl BatchPacing {
    /// Pause between batches.
    pub fn pause(&self) -> Duration {
        Duration::from_millis(self.pause_ms)
    }
}

/// An attempt the owner should now execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Started {
    pub id: AttemptId,
    pub operation: Operation,
    /// 1-based attempt number.
    pub attempt: u32,
    pub timeout: Duration,
}

/// What the owner should do after asking for the next operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Next {
    /// Execute this attempt.
    Start(Started),
    /// Wait, then call [`OperationSequencer::resume`] with the token.
    Pause { token: u64, delay: Duration },
    /// Nothing to do: busy, paused or empty.
    Idle,
}

/// Outcome of reporting a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    /// The attempt was not current; nothing changed.
    Stale,
    /// Wait `delay`, then call [`OperationSequencer::retry_due`] with `id`.
    Retry {
        id: AttemptId,
        operation: Operation,
        next_attempt: u32,
        delay: Duration,
    },
    /// The budget is spent. The queue was drained without running anything.
    Exhausted {
        operation: Operation,
        attempts: u32,
        drained: Vec<Operation>,
    },
}

#[derive(Debug, Clone)]
struct Current {
    operation: Operation,
    attempt: u32,
    id: AttemptId,
    awaiting_retry: bool,
}

/// FIFO queue with at most one current operation.
#[derive(Debug, Clone)]
pub struct OperationSequencer {
    queue: VecDeque<Operation>,
    current: Option<Current>,
    next_id: u64,
    paused: Option<u64>,
    completed_entries: u32,
    policies: OperationPolicies,
    retry: RetryConfig,
    pacing: BatchPacing,
}

impl OperationSequencer {
    /// Create an empty sequencer.
    pub fn new(policies: OperationPolicies, retry: RetryConfig, pacing: BatchPacing) -> Self {
        Self {
            queue: VecDeque::new(),
            current: None,
            next_id: 0,
            paused: None,
            completed_entries: 0,
            policies,
            retry,
            pacing,
        }
    }

    /// Budget for an operation kind.
    pub fn policy(&self, kind: OperationKind) -> OperationPolicy {
        self.policies.get(kind)
    }

    /// Append an operation to the queue. Call [`next`](Self::next) to start it.
    pub fn enqueue(&mut self, operation: Operation) {
        self.queue.push_back(operation);
    }

    /// Append several operations in order.
    pub fn enqueue_all(&mut self, operations: impl IntoIterator<Item = Operation>) {
        self.queue.extend(operations);
    }

    /// The current operation and its attempt id, if any.
    pub fn current(&self) -> Option<(AttemptId, Operation)> {
        self.current.as_ref().map(|c| (c.id, c.operation))
    }

    /// Returns `true` if `id` is the attempt currently executing.
    pub fn is_running(&self, id: AttemptId) -> bool {
        self.current
            .as_ref()
            .is_some_and(|c| c.id == id && !c.awaiting_retry)
    }

    /// Returns `true` if nothing is current, queued or paused.
    pub fn is_idle(&self) -> bool {
        self.current.is_none() && self.queue.is_empty() && self.paused.is_none()
    }

    /// Number of queued operations, excluding the current one.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Queued operations in execution order.
    pub fn queued(&self) -> impl Iterator<Item = &Operation> {
        self.queue.iter()
    }

    fn allocate_id(&mut self) -> AttemptId {
        self.next_id += 1;
        AttemptId(self.next_id)
    }

    /// Start the next queued operation if nothing is running.
    pub fn next(&mut self) -> Next {
        if self.current.is_some() || self.paused.is_some() {
            return Next::Idle;
        }
        let Some(front) = self.queue.front().copied() else {
            return Next::Idle;
        };

        if self.pacing.batch_size > 0
            && matches!(front, Operation::ReadHistoryEntry(_))
            && self.completed_entries >= self.pacing.batch_size
        {
            self.completed_entries = 0;
            let token = self.allocate_id().0;
            self.paused = Some(token);
            debug!("Pausing {:?} after a batch of history entries", self.pacing.pause());
            return Next::Pause {
                token,
                delay: self.pacing.pause(),
            };
        }

        self.queue.pop_front();
        let id = self.allocate_id();
        self.current = Some(Current {
            operation: front,
            attempt: 1,
            id,
            awaiting_retry: false,
        });
        Next::Start(Started {
            id,
            operation: front,
            attempt: 1,
            timeout: self.policies.get(front.kind()).timeout(),
        })
    }

    /// End a batch pause. Returns `false` for an unknown token.
    pub fn resume(&mut self, token: u64) -> bool {
        if self.paused == Some(token) {
            self.paused = None;
            true
        } else {
            false
        }
    }

    /// Mark attempt `id` successful. Returns the finished operation and the
    /// number of attempts it took, or `None` if the attempt was stale.
    pub fn complete(&mut self, id: AttemptId) -> Option<(Operation, u32)> {
        if !self.is_running(id) {
            return None;
        }
        let current = self.current.take()?;
        if matches!(current.operation, Operation::ReadHistoryEntry(_)) {
            self.completed_entries = self.completed_entries.saturating_add(1);
        }
        Some((current.operation, current.attempt))
    }

    /// Report that attempt `id` failed with `error`.
    pub fn fail(&mut self, id: AttemptId, error: &Error) -> Failure {
        if !self.is_running(id) {
            return Failure::Stale;
        }
        let Some(current) = self.current.as_mut() else {
            return Failure::Stale;
        };

        let policy = self.policies.get(current.operation.kind());
        if error.is_transient() && current.attempt < policy.max_attempts() {
            current.awaiting_retry = true;
            return Failure::Retry {
                id: current.id,
                operation: current.operation,
                next_attempt: current.attempt + 1,
                delay: self.retry.delay_for_attempt(current.attempt - 1),
            };
        }

        let operation = current.operation;
        let attempts = current.attempt;
        self.current = None;
        self.paused = None;
        let drained = self.queue.drain(..).collect();
        Failure::Exhausted {
            operation,
            attempts,
            drained,
        }
    }

    /// Start the pending retry for `id`. Returns `None` if it is stale.
    pub fn retry_due(&mut self, id: AttemptId) -> Option<Started> {
        match self.current.as_ref() {
            Some(c) if c.id == id && c.awaiting_retry => {}
            _ => return None,
        }
        let new_id = self.allocate_id();
        let current = self.current.as_mut()?;
        current.attempt += 1;
        current.id = new_id;
        current.awaiting_retry = false;
        Some(Started {
            id: new_id,
            operation: current.operation,
            attempt: current.attempt,
            timeout: self.policies.get(current.operation.kind()).timeout(),
        })
    }

    /// Drop the current operation and everything queued. Outstanding
    /// callbacks for the dropped attempt become stale.
    pub fn drain(&mut self) -> Vec<Operation> {
        let mut drained: Vec<Operation> =
            self.current.take().map(|c| c.operation).into_iter().collect();
        drained.extend(self.queue.drain(..));
        self.paused = None;
        self.completed_entries = 0;
        drained
    }

    /// Remove queued operations matching `predicate`, keeping the rest in order.
    pub fn remove_queued(&mut self, predicate: impl Fn(&Operation) -> bool) -> Vec<Operation> {
        let mut removed = Vec::new();
        self.queue.retain(|op| {
            if predicate(op) {
                removed.push(*op);
                false
            } else {
                true
            }
        });
        removed
    }
}
