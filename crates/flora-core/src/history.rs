//! Resumable history download.
//!
//! A [`HistorySession`] tracks one paged download of a device's stored
//! entries. It is driven by the device link, which runs the actual
//! operations:
//!
//! 1. Load the checkpoint for the device.
//! 2. `ReadHistoryCount`: switch to history mode, read the device clock to
//!    anchor relative timestamps, read the entry count.
//! 3. `ReadHistoryEntry(i)` for every index from the resume point, in order.
//! 4. Discard the checkpoint once every entry has been fetched.
//!
//! Entries that fail to decode are skipped rather than re-read. A run of
//! more than [`HistoryConfig::max_consecutive_failures`] bad entries aborts
//! the session.
//!
//! When the link drops mid-download the session is interrupted instead of
//! discarded. After reconnecting it reloads the checkpoint and continues from
//! the first entry it has not fetched yet.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use flora_types::{
    DeviceClock, DeviceId, HistoricalSensorReading, HistoryEntry, HistoryMetadata, ParseError,
};

use crate::checkpoint::{DEFAULT_CHECKPOINT_TTL, HistorySessionProgress};

/// Tuning for history downloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Persist a checkpoint after this many entries.
    pub checkpoint_interval: u16,
    /// Abort after more than this many consecutive undecodable entries.
    pub max_consecutive_failures: u32,
    /// Checkpoints older than this are discarded, in seconds.
    pub checkpoint_ttl_secs: u64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval: 10,
            max_consecutive_failures: 10,
            checkpoint_ttl_secs: DEFAULT_CHECKPOINT_TTL.as_secs(),
        }
    }
}

impl HistoryConfig {
    /// Checkpoint time to live.
    pub fn checkpoint_ttl(&self) -> Duration {
        Duration::from_secs(self.checkpoint_ttl_secs)
    }
}

/// Lifecycle of a history session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    /// Waiting for the checkpoint store.
    LoadingCheckpoint,
    /// Waiting for the entry count.
    AwaitingCount,
    /// Fetching entries.
    Fetching,
    /// The link dropped; waiting to resume.
    Interrupted,
    /// Every entry was fetched.
    Completed,
    /// Stopped early.
    Aborted,
}

/// What the checkpoint lookup decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointVerdict {
    /// Resume from this progress once the entry count is known.
    Resume(HistorySessionProgress),
    /// No usable checkpoint; start from the first entry.
    Fresh,
    /// A stale or invalid checkpoint was found and should be deleted.
    Discard,
}

/// What to do after the entry count is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CountOutcome {
    /// Fetch entries `start..total`.
    Fetch { start: u16, total: u16 },
    /// Nothing to fetch; the session is complete.
    Complete { total: u16 },
}

/// Whether the session continues after an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Continue,
    Completed,
    Aborted { reason: String },
}

/// Result of handing one fetched entry to the session.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryOutcome {
    /// The anchored reading, if the entry decoded.
    pub reading: Option<HistoricalSensorReading>,
    /// Why the entry was rejected, if it did not.
    pub rejection: Option<ParseError>,
    /// A checkpoint to persist, when one is due.
    pub checkpoint: Option<HistorySessionProgress>,
    pub status: SessionStatus,
}

/// State of one history download.
#[derive(Debug, Clone)]
pub struct HistorySession {
    device_id: DeviceId,
    config: HistoryConfig,
    phase: SessionPhase,
    current_index: u16,
    total_entries: u16,
    boot_reference: Option<OffsetDateTime>,
    last_successful_index: Option<u16>,
    consecutive_failures: u32,
    rejected: u32,
    resume_from: Option<HistorySessionProgress>,
}

impl HistorySession {
    /// Create a session waiting for its checkpoint.
    pub fn new(device_id: DeviceId, config: HistoryConfig) -> Self {
        Self {
            device_id,
            config,
            phase: SessionPhase::LoadingCheckpoint,
            current_index: 0,
            total_entries: 0,
            boot_reference: None,
            last_successful_index: None,
            consecutive_failures: 0,
            rejected: 0,
            resume_from: None,
        }
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Next entry index to fetch.
    pub fn current_index(&self) -> u16 {
        self.current_index
    }

    pub fn total_entries(&self) -> u16 {
        self.total_entries
    }

    pub fn boot_reference(&self) -> Option<OffsetDateTime> {
        self.boot_reference
    }

    pub fn last_successful_index(&self) -> Option<u16> {
        self.last_successful_index
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Entries rejected so far.
    pub fn rejected(&self) -> u32 {
        self.rejected
    }

    /// Returns `true` until the session completes or aborts.
    pub fn is_active(&self) -> bool {
        !matches!(self.phase, SessionPhase::Completed | SessionPhase::Aborted)
    }

    /// Snapshot suitable for persisting.
    pub fn progress(&self, now: OffsetDateTime) -> HistorySessionProgress {
        HistorySessionProgress {
            device_id: self.device_id.clone(),
            current_index: self.current_index,
            total_entries: self.total_entries,
            last_update: now,
            device_boot_time: self.boot_reference,
        }
    }

    /// Device uptime at `now`, derived from the boot-time reference.
    pub fn uptime_seconds(&self, now: OffsetDateTime) -> u64 {
        self.boot_reference
            .map(|boot| u64::try_from((now - boot).whole_seconds()).unwrap_or(0))
            .unwrap_or(0)
    }

    /// Decide how to use a checkpoint loaded from storage.
    pub fn on_checkpoint_loaded(
        &mut self,
        loaded: Option<HistorySessionProgress>,
        now: OffsetDateTime,
    ) -> CheckpointVerdict {
        let ttl = self.config.checkpoint_ttl();
        let in_memory = (self.current_index > 0 && self.total_entries > 0)
            .then(|| self.progress(now));
        self.phase = SessionPhase::AwaitingCount;

        let verdict = match loaded {
            Some(p) if p.device_id == self.device_id && p.is_resumable(now, ttl) => {
                CheckpointVerdict::Resume(p)
            }
            Some(_) => CheckpointVerdict::Discard,
            None => CheckpointVerdict::Fresh,
        };

        // An interrupted session never moves backwards, even if the store lost
        // or never received its last flush.
        let verdict = match (verdict, in_memory) {
            (CheckpointVerdict::Resume(p), Some(mem)) if mem.current_index > p.current_index => {
                CheckpointVerdict::Resume(mem)
            }
            (CheckpointVerdict::Resume(p), _) => CheckpointVerdict::Resume(p),
            (other, Some(mem)) => {
                self.resume_from = Some(mem);
                return other;
            }
            (other, None) => other,
        };

        match &verdict {
            CheckpointVerdict::Resume(p) => {
                debug!(
                    "Resuming history for {} at {}/{}",
                    self.device_id, p.current_index, p.total_entries
                );
                self.resume_from = Some(p.clone());
            }
            CheckpointVerdict::Discard => {
                info!("Discarding stale history checkpoint for {}", self.device_id);
                self.resume_from = None;
            }
            CheckpointVerdict::Fresh => self.resume_from = None,
        }
        verdict
    }

    /// Apply the entry count and device clock read by `ReadHistoryCount`.
    pub fn on_count(
        &mut self,
        metadata: HistoryMetadata,
        clock: DeviceClock,
        now: OffsetDateTime,
    ) -> CountOutcome {
        let total = metadata.entry_count;
        let fresh_boot = clock.boot_reference(now);

        match self.resume_from.take() {
            Some(hint) if total >= hint.total_entries => {
                // Entries logged after the download started wait for the next one
                self.current_index = hint.current_index;
                self.total_entries = hint.total_entries;
                self.boot_reference = Some(hint.device_boot_time.unwrap_or(fresh_boot));
            }
            Some(hint) => {
                warn!(
                    "{} now reports {} entries, fewer than the {} recorded; restarting history",
                    self.device_id, total, hint.total_entries
                );
                self.start_over(total, fresh_boot);
            }
            None => self.start_over(total, fresh_boot),
        }

        if self.total_entries == 0 || self.current_index >= self.total_entries {
            self.phase = SessionPhase::Completed;
            return CountOutcome::Complete {
                total: self.total_entries,
            };
        }

        self.phase = SessionPhase::Fetching;
        CountOutcome::Fetch {
            start: self.current_index,
            total: self.total_entries,
        }
    }

    fn start_over(&mut self, total: u16, boot: OffsetDateTime) {
        self.current_index = 0;
        self.total_entries = total;
        self.boot_reference = Some(boot);
        self.last_successful_index = None;
        self.consecutive_failures = 0;
    }

    /// Hand the decode result of entry `index` to the session.
    ///
    /// Returns `None` if the session is not fetching or `index` is not the
    /// next expected entry.
    pub fn on_entry(
        &mut self,
        index: u16,
        decoded: Result<HistoryEntry, ParseError>,
        now: OffsetDateTime,
    ) -> Option<EntryOutcome> {
        if self.phase != SessionPhase::Fetching || index != self.current_index {
            return None;
        }

        let mut outcome = EntryOutcome {
            reading: None,
            rejection: None,
            checkpoint: None,
            status: SessionStatus::Continue,
        };

        self.current_index += 1;
        match decoded {
            Ok(entry) => {
                let boot = self.boot_reference.unwrap_or(now);
                outcome.reading = Some(HistoricalSensorReading::from_entry(
                    self.device_id.clone(),
                    index,
                    entry,
                    boot,
                ));
                self.consecutive_failures = 0;
                self.last_successful_index = Some(index);
            }
            Err(e) => {
                self.consecutive_failures += 1;
                self.rejected += 1;
                warn!(
                    "Rejected history entry {} of {}: {} ({} in a row)",
                    index, self.device_id, e, self.consecutive_failures
                );
                outcome.rejection = Some(e);

                if self.consecutive_failures > self.config.max_consecutive_failures {
                    self.phase = SessionPhase::Aborted;
                    outcome.status = SessionStatus::Aborted {
                        reason: format!(
                            "{} consecutive entries failed to decode",
                            self.consecutive_failures
                        ),
                    };
                    outcome.checkpoint = Some(self.progress(now));
                    return Some(outcome);
                }
            }
        }

        if self.current_index >= self.total_entries {
            self.phase = SessionPhase::Completed;
            outcome.status = SessionStatus::Completed;
        } else if self.config.checkpoint_interval > 0
            && self.current_index % self.config.checkpoint_interval == 0
        {
            outcome.checkpoint = Some(self.progress(now));
        }
        Some(outcome)
    }

    /// The link dropped. Returns the progress to flush, if any was made.
    pub fn interrupt(&mut self, now: OffsetDateTime) -> Option<HistorySessionProgress> {
        if !self.is_active() {
            return None;
        }
        let was_fetching = self.phase == SessionPhase::Fetching;
        self.phase = SessionPhase::Interrupted;
        (was_fetching && self.total_entries > 0).then(|| self.progress(now))
    }

    /// Prepare to resume after a reconnect.
    pub fn resume(&mut self) -> bool {
        if self.phase == SessionPhase::Interrupted {
            self.phase = SessionPhase::LoadingCheckpoint;
            true
        } else {
            false
        }
    }

    /// Stop the session. Returns the progress at the time of the abort.
    pub fn abort(&mut self, now: OffsetDateTime) -> HistorySessionProgress {
        self.phase = SessionPhase::Aborted;
        self.progress(now)
    }
}
