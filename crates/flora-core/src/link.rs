//! Per-device link state machine.
//!
//! A [`DeviceLink`] owns the protocol state of one sensor: the connection
//! state, the characteristics found during discovery, the operation queue,
//! the authentication handshake and the active history session. It performs
//! no I/O. Platform callbacks and timer expiries come in as [`LinkInput`]s;
//! the link answers with [`LinkAction`]s that the connection pool executes.
//!
//! Every platform request and timer carries the [`AttemptId`] it was issued
//! for. Inputs tagged with an attempt that is no longer current are ignored,
//! which makes "timeout vs. late success" races harmless.

use std::collections::HashSet;
use std::time::Duration;

use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

use flora_types::codec::{
    decode_device_clock, decode_firmware_info, decode_history_entry, decode_history_metadata,
    decode_live_values, history_address_frame,
};
use flora_types::commands::{BLINK, ENTRY_COUNT_REQUEST, MODE_HISTORY, MODE_LIVE};
use flora_types::uuids::{
    AUTHENTICATION, DEVICE_TIME, ENTRY_COUNT, FIRMWARE_BATTERY, HISTORY_CONTROL, HISTORY_DATA,
    MODE_CHANGE, REAL_TIME_VALUES, characteristic_name, is_catalog_characteristic,
};
use flora_types::{
    DeviceClock, DeviceId, FirmwareInfo, HistoryEntry, HistoryMetadata, LiveSensorReading,
    ParseError, SensorValues,
};

use crate::auth::{AuthHandshake, AuthOutcome, AuthStep};
use crate::checkpoint::HistorySessionProgress;
use crate::error::{Error, Result};
use crate::events::DeviceEvent;
use crate::history::{
    CheckpointVerdict, CountOutcome, HistoryConfig, HistorySession, SessionPhase, SessionStatus,
};
use crate::operation::{Operation, OperationKind, OperationPolicies};
use crate::retry::RetryConfig;
use crate::sequencer::{AttemptId, BatchPacing, Failure, Next, OperationSequencer, Started};
use crate::state::{ConnectionState, FailureReason};

/// Settings a link needs from the pool configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkConfig {
    pub policies: OperationPolicies,
    pub retry: RetryConfig,
    pub pacing: BatchPacing,
    pub history: HistoryConfig,
    /// Pause between a command write and the read that depends on it.
    pub write_settle: Duration,
    /// Deadline of one authentication round.
    pub auth_deadline: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            policies: OperationPolicies::default(),
            retry: RetryConfig::default(),
            pacing: BatchPacing::default(),
            history: HistoryConfig::default(),
            write_settle: Duration::from_millis(100),
            auth_deadline: Duration::from_secs(4),
        }
    }
}

/// Timers a link asks its owner to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkTimer {
    /// The attempt ran out of time.
    OperationTimeout(AttemptId),
    /// The retry delay of the attempt elapsed.
    RetryDue(AttemptId),
    /// The settle pause after a command write elapsed.
    StepDelay(AttemptId),
    /// A batch pause between history entries elapsed.
    BatchPause(u64),
    /// The deadline of an authentication round elapsed.
    AuthDeadline { attempt: AttemptId, round: u32 },
}

/// Inputs to a link: platform callbacks, timer expiries and storage results.
#[derive(Debug)]
pub enum LinkInput {
    /// The platform connect of `attempt` finished.
    Connected { attempt: AttemptId },
    /// Service discovery found these services.
    ServicesDiscovered {
        attempt: AttemptId,
        services: Vec<Uuid>,
    },
    /// Characteristic discovery finished for one service.
    CharacteristicsDiscovered {
        attempt: AttemptId,
        service: Uuid,
        characteristics: Vec<Uuid>,
    },
    /// A write issued for `attempt` was acknowledged.
    WriteAck { attempt: AttemptId },
    /// A read issued for `attempt` returned a value.
    Value { attempt: AttemptId, value: Vec<u8> },
    /// A platform request issued for `attempt` failed.
    RequestFailed { attempt: AttemptId, error: Error },
    /// The platform connection dropped.
    Disconnected,
    /// A timer expired.
    Timer(LinkTimer),
    /// Result of a [`LinkAction::LoadCheckpoint`].
    CheckpointLoaded(Option<HistorySessionProgress>),
}

/// Work a link asks its owner to perform.
#[derive(Debug)]
pub enum LinkAction {
    /// Open the platform connection.
    Connect { attempt: AttemptId },
    /// Close the platform connection.
    Disconnect,
    /// Discover services and their characteristics.
    DiscoverServices { attempt: AttemptId },
    /// Write `payload` to a characteristic.
    Write {
        attempt: AttemptId,
        characteristic: Uuid,
        payload: Vec<u8>,
    },
    /// Read a characteristic.
    Read {
        attempt: AttemptId,
        characteristic: Uuid,
    },
    /// Feed [`LinkInput::Timer`] back after `after`.
    StartTimer { timer: LinkTimer, after: Duration },
    /// Publish an event.
    Emit(DeviceEvent),
    /// Load this device's checkpoint and feed [`LinkInput::CheckpointLoaded`] back.
    LoadCheckpoint,
    /// Persist history progress.
    SaveCheckpoint(HistorySessionProgress),
    /// Delete this device's checkpoint.
    ClearCheckpoint,
    /// A connect attempt failed. The owner decides between retrying and failing.
    ConnectFailed { error: Error },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadPurpose {
    LiveValues,
    Firmware,
    DeviceClock,
    EntryCount,
    HistoryEntry(u16),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Step {
    Write { characteristic: Uuid, payload: Vec<u8> },
    Settle,
    Read { characteristic: Uuid, purpose: ReadPurpose },
}

#[derive(Debug, Default)]
struct Scratch {
    live: Option<SensorValues>,
    firmware: Option<FirmwareInfo>,
    clock: Option<DeviceClock>,
    metadata: Option<HistoryMetadata>,
    entry: Option<std::result::Result<HistoryEntry, ParseError>>,
}

#[derive(Debug)]
struct Plan {
    attempt: AttemptId,
    steps: Vec<Step>,
    cursor: usize,
    scratch: Scratch,
}

/// Protocol state of one device.
#[derive(Debug)]
pub struct DeviceLink {
    id: DeviceId,
    config: LinkConfig,
    state: ConnectionState,
    sequencer: OperationSequencer,
    characteristics: HashSet<Uuid>,
    expected_services: Option<usize>,
    discovered_services: usize,
    auth: AuthHandshake,
    plan: Option<Plan>,
    session: Option<HistorySession>,
    auto_reconnect: bool,
    cancelled: bool,
}

impl DeviceLink {
    /// Create a disconnected link.
    pub fn new(id: DeviceId, config: LinkConfig) -> Self {
        let sequencer = OperationSequencer::new(
            config.policies.clone(),
            config.retry.clone(),
            config.pacing,
        );
        Self {
            id,
            config,
            state: ConnectionState::Disconnected,
            sequencer,
            characteristics: HashSet::new(),
            expected_services: None,
            discovered_services: 0,
            auth: AuthHandshake::new(),
            plan: None,
            session: None,
            auto_reconnect: false,
            cancelled: false,
        }
    }

    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// The current or most recent history session.
    pub fn session(&self) -> Option<&HistorySession> {
        self.session.as_ref()
    }

    /// Returns `true` if a history session is running or waiting to resume.
    pub fn has_active_session(&self) -> bool {
        self.session.as_ref().is_some_and(HistorySession::is_active)
    }

    /// Returns `true` if the pool should reconnect this link on its own.
    pub fn should_auto_reconnect(&self) -> bool {
        self.auto_reconnect
            && !self.cancelled
            && self
                .session
                .as_ref()
                .is_some_and(|s| s.phase() == SessionPhase::Interrupted)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Returns `true` if discovery found `characteristic`.
    pub fn has_characteristic(&self, characteristic: &Uuid) -> bool {
        self.characteristics.contains(characteristic)
    }

    /// The operation currently executing, if any.
    pub fn current_operation(&self) -> Option<Operation> {
        self.sequencer.current().map(|(_, op)| op)
    }

    /// Number of operations waiting behind the current one.
    pub fn pending_operations(&self) -> usize {
        self.sequencer.pending()
    }

    /// Returns `true` when nothing runs and no connection exists, so the link
    /// can be dropped.
    pub fn is_idle(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Disconnected | ConnectionState::Failed(_)
        ) && self.sequencer.is_idle()
            && !self.has_active_session()
    }

    /// A platform connection exists or is being opened.
    fn has_platform_link(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::Authenticating | ConnectionState::Ready
        ) || self.current_operation() == Some(Operation::Connect)
    }

    fn emit(&self, out: &mut Vec<LinkAction>, event: DeviceEvent) {
        out.push(LinkAction::Emit(event));
    }

    fn transition(&mut self, to: ConnectionState, out: &mut Vec<LinkAction>) -> bool {
        if !self.state.can_transition_to(&to) {
            warn!("{}: ignoring transition {} -> {}", self.id, self.state, to);
            return false;
        }
        info!("{}: {} -> {}", self.id, self.state, to);
        let from = std::mem::replace(&mut self.state, to.clone());
        self.emit(
            out,
            DeviceEvent::StateChanged {
                device: self.id.clone(),
                from,
                to,
            },
        );
        true
    }

    fn require_ready(&self) -> Result<()> {
        if self.state.is_ready() {
            Ok(())
        } else {
            Err(Error::NotReady {
                state: self.state.clone(),
            })
        }
    }

    // ==================== Commands from the pool ====================

    /// Enter `Connecting` while the pool looks for the device.
    pub fn begin_connecting(&mut self) -> Vec<LinkAction> {
        let mut out = Vec::new();
        self.cancelled = false;
        if self.state.is_failed() {
            self.transition(ConnectionState::Disconnected, &mut out);
        }
        if self.state == ConnectionState::Disconnected {
            self.transition(ConnectionState::Connecting, &mut out);
        }
        out
    }

    /// Queue the platform connect. The pool calls this once it has a handle
    /// for the device.
    pub fn start_connect(&mut self, now: OffsetDateTime) -> Vec<LinkAction> {
        let mut out = self.begin_connecting();
        if self.state != ConnectionState::Connecting {
            return out;
        }
        let connect_pending = self.current_operation() == Some(Operation::Connect)
            || self.sequencer.queued().any(|op| *op == Operation::Connect);
        if !connect_pending {
            self.sequencer.enqueue(Operation::Connect);
        }
        self.pump(now, &mut out);
        out
    }

    /// Give up on the current connect attempt and return to `Disconnected`.
    pub fn abandon_connect(&mut self) -> Vec<LinkAction> {
        let mut out = Vec::new();
        let had_platform_connection = self.current_operation() == Some(Operation::Connect);
        self.drain_queue("connect attempt abandoned", &mut out);
        if had_platform_connection {
            out.push(LinkAction::Disconnect);
        }
        if self.state != ConnectionState::Disconnected {
            self.transition(ConnectionState::Disconnected, &mut out);
        }
        out
    }

    /// Stop the link for good with `reason`.
    pub fn fail(&mut self, reason: FailureReason, now: OffsetDateTime) -> Vec<LinkAction> {
        let mut out = Vec::new();
        let was_active = self.has_platform_link();
        self.drain_queue(&reason.to_string(), &mut out);
        self.abort_session(&reason.to_string(), now, &mut out);
        self.auto_reconnect = false;
        if self.state == ConnectionState::Disconnected {
            // Failed is only reachable from an active state
            self.transition(ConnectionState::Connecting, &mut out);
        }
        self.transition(ConnectionState::Failed(reason), &mut out);
        if was_active {
            out.push(LinkAction::Disconnect);
        }
        out
    }

    /// Leave `Failed` so the link can connect again.
    pub fn reset(&mut self) -> Vec<LinkAction> {
        let mut out = Vec::new();
        if self.state.is_failed() {
            self.transition(ConnectionState::Disconnected, &mut out);
        }
        out
    }

    /// Queue a live data read.
    pub fn request_live_data(&mut self, now: OffsetDateTime) -> Result<Vec<LinkAction>> {
        self.require_ready()?;
        let mut out = Vec::new();
        self.sequencer.enqueue(Operation::ReadLiveData);
        self.pump(now, &mut out);
        Ok(out)
    }

    /// Queue an LED blink.
    pub fn blink(&mut self, now: OffsetDateTime) -> Result<Vec<LinkAction>> {
        self.require_ready()?;
        let mut out = Vec::new();
        self.sequencer.enqueue(Operation::Blink);
        self.pump(now, &mut out);
        Ok(out)
    }

    /// Start a history download. The checkpoint is loaded first so a
    /// download interrupted in an earlier process resumes where it stopped.
    pub fn request_history(&mut self) -> Result<Vec<LinkAction>> {
        self.require_ready()?;
        if self.has_active_session() {
            return Err(Error::HistoryInProgress(self.id.to_string()));
        }
        info!("{}: starting history download", self.id);
        self.session = Some(HistorySession::new(
            self.id.clone(),
            self.config.history.clone(),
        ));
        self.auto_reconnect = true;
        Ok(vec![LinkAction::LoadCheckpoint])
    }

    /// Queue a graceful disconnect. Any history download is stopped.
    pub fn disconnect(&mut self, now: OffsetDateTime) -> Vec<LinkAction> {
        let mut out = Vec::new();
        self.auto_reconnect = false;
        match self.state {
            ConnectionState::Disconnected => {
                // An interrupted download may be waiting for a reconnect
                self.drain_queue("disconnect requested", &mut out);
                self.abort_session("disconnect requested", now, &mut out);
            }
            ConnectionState::Failed(_) => {
                self.abort_session("disconnect requested", now, &mut out);
                self.transition(ConnectionState::Disconnected, &mut out);
            }
            ConnectionState::Connecting if self.sequencer.current().is_none() => {
                // Still waiting for the scan, nothing to tear down
                self.drain_queue("disconnect requested", &mut out);
                self.abort_session("disconnect requested", now, &mut out);
                self.transition(ConnectionState::Disconnected, &mut out);
            }
            _ => {
                self.abort_session("disconnect requested", now, &mut out);
                if !self.sequencer.queued().any(|op| *op == Operation::Disconnect)
                    && self.current_operation() != Some(Operation::Disconnect)
                {
                    self.sequencer.enqueue(Operation::Disconnect);
                }
                self.pump(now, &mut out);
            }
        }
        out
    }

    /// Cancel everything: drain the queue, stop the history download and
    /// drop the connection. Callbacks still in flight become inert.
    pub fn cancel(&mut self, now: OffsetDateTime) -> Vec<LinkAction> {
        let mut out = Vec::new();
        info!("{}: cancelled", self.id);
        self.cancelled = true;
        self.auto_reconnect = false;
        let was_active = self.has_platform_link();
        self.drain_with_error(&Error::Cancelled, &mut out);
        self.abort_session("cancelled", now, &mut out);
        if self.state != ConnectionState::Disconnected {
            self.transition(ConnectionState::Disconnected, &mut out);
        }
        if was_active {
            out.push(LinkAction::Disconnect);
        }
        out
    }

    // ==================== Inputs ====================

    /// Apply one input and return the resulting actions.
    pub fn handle(&mut self, input: LinkInput, now: OffsetDateTime) -> Vec<LinkAction> {
        let mut out = Vec::new();
        if self.cancelled {
            debug!("{}: ignoring {:?} after cancel", self.id, input);
            return out;
        }

        match input {
            LinkInput::Connected { attempt } => self.on_connected(attempt, &mut out),
            LinkInput::ServicesDiscovered { attempt, services } => {
                self.on_services(attempt, services, now, &mut out)
            }
            LinkInput::CharacteristicsDiscovered {
                attempt,
                service,
                characteristics,
            } => self.on_characteristics(attempt, service, characteristics, now, &mut out),
            LinkInput::WriteAck { attempt } => self.on_write_ack(attempt, now, &mut out),
            LinkInput::Value { attempt, value } => self.on_value(attempt, value, now, &mut out),
            LinkInput::RequestFailed { attempt, error } => {
                self.on_request_failed(attempt, error, now, &mut out)
            }
            LinkInput::Disconnected => self.on_disconnected(now, &mut out),
            LinkInput::Timer(timer) => self.on_timer(timer, now, &mut out),
            LinkInput::CheckpointLoaded(loaded) => self.on_checkpoint_loaded(loaded, now, &mut out),
        }

        self.pump(now, &mut out);
        out
    }

    fn is_current(&self, attempt: AttemptId, operation: Operation) -> bool {
        self.sequencer.is_running(attempt)
            && self.sequencer.current().map(|(_, op)| op) == Some(operation)
    }

    fn on_connected(&mut self, attempt: AttemptId, out: &mut Vec<LinkAction>) {
        if !self.is_current(attempt, Operation::Connect) {
            debug!("{}: stale connect callback", self.id);
            // A timed-out connect finished late; close it unless another
            // attempt now owns the connection
            if !self.has_platform_link() {
                out.push(LinkAction::Disconnect);
            }
            return;
        }
        self.transition(ConnectionState::Connected, out);
        out.push(LinkAction::DiscoverServices { attempt });
    }

    fn on_services(
        &mut self,
        attempt: AttemptId,
        services: Vec<Uuid>,
        now: OffsetDateTime,
        out: &mut Vec<LinkAction>,
    ) {
        if !self.is_current(attempt, Operation::Connect) || self.state != ConnectionState::Connected
        {
            return;
        }
        debug!("{}: discovered {} services", self.id, services.len());
        self.expected_services = Some(services.len());
        self.discovered_services = 0;
        self.check_discovery_complete(attempt, now, out);
    }

    fn on_characteristics(
        &mut self,
        attempt: AttemptId,
        service: Uuid,
        characteristics: Vec<Uuid>,
        now: OffsetDateTime,
        out: &mut Vec<LinkAction>,
    ) {
        if !self.is_current(attempt, Operation::Connect) || self.expected_services.is_none() {
            return;
        }
        for characteristic in characteristics {
            if is_catalog_characteristic(&characteristic) {
                debug!(
                    "{}: found {} in {}",
                    self.id,
                    characteristic_name(&characteristic),
                    service
                );
                self.characteristics.insert(characteristic);
            }
        }
        self.discovered_services += 1;
        self.check_discovery_complete(attempt, now, out);
    }

    /// Discovery completes only once every service reported its
    /// characteristics; authenticating on a partial set misses characteristics.
    fn check_discovery_complete(
        &mut self,
        attempt: AttemptId,
        now: OffsetDateTime,
        out: &mut Vec<LinkAction>,
    ) {
        let Some(expected) = self.expected_services else {
            return;
        };
        if self.discovered_services < expected {
            return;
        }
        self.expected_services = None;
        if let Some((_, attempts)) = self.sequencer.complete(attempt) {
            info!(
                "{}: discovery complete, {} known characteristics",
                self.id,
                self.characteristics.len()
            );
            self.operation_completed(OperationKind::Connect, attempts, out);
            self.sequencer.enqueue(Operation::Authenticate);
            self.pump(now, out);
        }
    }

    fn on_write_ack(&mut self, attempt: AttemptId, now: OffsetDateTime, out: &mut Vec<LinkAction>) {
        if !self.sequencer.is_running(attempt) {
            debug!("{}: stale write ack", self.id);
            return;
        }
        if self.current_operation() == Some(Operation::Authenticate) {
            let step = self.auth.on_write_ack();
            self.apply_auth_step(attempt, step, out);
            return;
        }
        match self.current_step(attempt) {
            Some(Step::Write { .. }) => self.step_done(attempt, now, out),
            other => debug!("{}: unexpected write ack at {:?}", self.id, other),
        }
    }

    fn on_value(
        &mut self,
        attempt: AttemptId,
        value: Vec<u8>,
        now: OffsetDateTime,
        out: &mut Vec<LinkAction>,
    ) {
        if !self.sequencer.is_running(attempt) {
            debug!("{}: stale value ({} bytes)", self.id, value.len());
            return;
        }
        if self.current_operation() == Some(Operation::Authenticate) {
            let step = self.auth.on_response(&value);
            self.apply_auth_step(attempt, step, out);
            return;
        }
        let Some(Step::Read { purpose, .. }) = self.current_step(attempt) else {
            debug!("{}: unexpected value", self.id);
            return;
        };

        let uptime = self
            .session
            .as_ref()
            .map(|s| s.uptime_seconds(now))
            .unwrap_or(0);
        let Some(plan) = self.plan.as_mut() else {
            return;
        };
        let scratch = &mut plan.scratch;
        let decoded: std::result::Result<(), ParseError> = match purpose {
            ReadPurpose::LiveValues => decode_live_values(&value).map(|v| scratch.live = Some(v)),
            ReadPurpose::Firmware => {
                match decode_firmware_info(&value) {
                    Ok(info) => scratch.firmware = Some(info),
                    Err(e) => warn!("{}: ignoring firmware frame: {}", self.id, e),
                }
                Ok(())
            }
            ReadPurpose::DeviceClock => {
                decode_device_clock(&value).map(|c| scratch.clock = Some(c))
            }
            ReadPurpose::EntryCount => {
                decode_history_metadata(&value).map(|m| scratch.metadata = Some(m))
            }
            ReadPurpose::HistoryEntry(_) => {
                scratch.entry = Some(decode_history_entry(&value, uptime));
                Ok(())
            }
        };

        match decoded {
            Ok(()) => self.step_done(attempt, now, out),
            Err(e) => {
                if let Some(operation) = self.current_operation() {
                    self.reject(attempt, operation, Error::InvalidFrame(e), now, out);
                }
            }
        }
    }

    fn on_request_failed(
        &mut self,
        attempt: AttemptId,
        error: Error,
        now: OffsetDateTime,
        out: &mut Vec<LinkAction>,
    ) {
        if !self.sequencer.is_running(attempt) {
            debug!("{}: stale failure: {}", self.id, error);
            return;
        }
        if self.current_operation() == Some(Operation::Authenticate) {
            debug!("{}: authentication request failed: {}", self.id, error);
            let step = self.auth.on_error();
            self.apply_auth_step(attempt, step, out);
            return;
        }
        self.attempt_failed(attempt, error, now, out);
    }

    fn on_timer(&mut self, timer: LinkTimer, now: OffsetDateTime, out: &mut Vec<LinkAction>) {
        match timer {
            LinkTimer::OperationTimeout(attempt) => {
                if !self.sequencer.is_running(attempt) {
                    return;
                }
                let Some(operation) = self.current_operation() else {
                    return;
                };
                let timeout = self.sequencer.policy(operation.kind()).timeout();
                warn!("{}: {} timed out after {:?}", self.id, operation, timeout);
                if operation == Operation::Authenticate {
                    self.finish_authentication(attempt, AuthOutcome::FallbackTimeout, out);
                } else {
                    let error = Error::timeout(operation.to_string(), timeout);
                    self.attempt_failed(attempt, error, now, out);
                }
            }
            LinkTimer::RetryDue(attempt) => {
                if let Some(started) = self.sequencer.retry_due(attempt) {
                    self.start_attempt(started, now, out);
                }
            }
            LinkTimer::StepDelay(attempt) => {
                if self.sequencer.is_running(attempt)
                    && self.current_step(attempt) == Some(Step::Settle)
                {
                    self.step_done(attempt, now, out);
                }
            }
            LinkTimer::BatchPause(token) => {
                if self.sequencer.resume(token) {
                    debug!("{}: batch pause over", self.id);
                }
            }
            LinkTimer::AuthDeadline { attempt, round } => {
                if !self.is_current(attempt, Operation::Authenticate) {
                    return;
                }
                let step = self.auth.on_deadline(round);
                self.apply_auth_step(attempt, step, out);
            }
        }
    }

    fn on_disconnected(&mut self, now: OffsetDateTime, out: &mut Vec<LinkAction>) {
        if matches!(
            self.state,
            ConnectionState::Disconnected | ConnectionState::Failed(_)
        ) {
            return;
        }

        match self.sequencer.current() {
            Some((attempt, Operation::Disconnect)) => {
                if let Some((_, attempts)) = self.sequencer.complete(attempt) {
                    self.operation_completed(OperationKind::Disconnect, attempts, out);
                }
                self.drain_queue("disconnected", out);
                self.transition(ConnectionState::Disconnected, out);
            }
            Some((_, Operation::Connect)) => {
                warn!("{}: dropped while connecting", self.id);
                let error = Error::Disconnected {
                    operation: OperationKind::Connect,
                };
                self.drain_with_error(&error, out);
                out.push(LinkAction::ConnectFailed { error });
            }
            current => {
                warn!("{}: connection lost in state {}", self.id, self.state);
                if let Some((_, operation)) = current {
                    let error = Error::Disconnected {
                        operation: operation.kind(),
                    };
                    self.drain_with_error(&error, out);
                } else {
                    self.drain_queue("disconnected", out);
                }
                if let Some(session) = self.session.as_mut().filter(|s| s.is_active()) {
                    if let Some(progress) = session.interrupt(now) {
                        info!(
                            "{}: history interrupted at {}/{}",
                            self.id, progress.current_index, progress.total_entries
                        );
                        out.push(LinkAction::SaveCheckpoint(progress));
                    }
                }
                self.transition(ConnectionState::Disconnected, out);
            }
        }
    }

    fn on_checkpoint_loaded(
        &mut self,
        loaded: Option<HistorySessionProgress>,
        now: OffsetDateTime,
        out: &mut Vec<LinkAction>,
    ) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.phase() != SessionPhase::LoadingCheckpoint {
            return;
        }
        if !self.state.is_ready() {
            session.interrupt(now);
            return;
        }
        if session.on_checkpoint_loaded(loaded, now) == CheckpointVerdict::Discard {
            out.push(LinkAction::ClearCheckpoint);
        }
        self.sequencer.enqueue(Operation::ReadHistoryCount);
    }

    // ==================== Execution ====================

    fn pump(&mut self, now: OffsetDateTime, out: &mut Vec<LinkAction>) {
        if self.cancelled {
            return;
        }
        loop {
            match self.sequencer.next() {
                Next::Start(started) => self.start_attempt(started, now, out),
                Next::Pause { token, delay } => {
                    out.push(LinkAction::StartTimer {
                        timer: LinkTimer::BatchPause(token),
                        after: delay,
                    });
                    return;
                }
                Next::Idle => return,
            }
        }
    }

    fn start_attempt(&mut self, started: Started, now: OffsetDateTime, out: &mut Vec<LinkAction>) {
        let Started {
            id,
            operation,
            attempt,
            timeout,
        } = started;
        debug!("{}: starting {} (attempt {})", self.id, operation, attempt);
        self.plan = None;

        match operation {
            Operation::Connect => {
                self.characteristics.clear();
                self.expected_services = None;
                self.discovered_services = 0;
                out.push(LinkAction::StartTimer {
                    timer: LinkTimer::OperationTimeout(id),
                    after: timeout,
                });
                out.push(LinkAction::Connect { attempt: id });
            }
            Operation::Authenticate => {
                if self.state == ConnectionState::Connected {
                    self.transition(ConnectionState::Authenticating, out);
                }
                if !self.has_characteristic(&AUTHENTICATION) {
                    debug!("{}: no authentication characteristic", self.id);
                    self.finish_authentication(id, AuthOutcome::Verified, out);
                    return;
                }
                out.push(LinkAction::StartTimer {
                    timer: LinkTimer::OperationTimeout(id),
                    after: timeout,
                });
                self.auth = AuthHandshake::new();
                let step = self.auth.start();
                self.apply_auth_step(id, step, out);
            }
            Operation::Disconnect => {
                out.push(LinkAction::StartTimer {
                    timer: LinkTimer::OperationTimeout(id),
                    after: timeout,
                });
                out.push(LinkAction::Disconnect);
            }
            _ => match self.build_steps(operation) {
                Ok(steps) => {
                    self.plan = Some(Plan {
                        attempt: id,
                        steps,
                        cursor: 0,
                        scratch: Scratch::default(),
                    });
                    out.push(LinkAction::StartTimer {
                        timer: LinkTimer::OperationTimeout(id),
                        after: timeout,
                    });
                    self.run_step(id, out);
                }
                Err(e) => self.reject(id, operation, e, now, out),
            },
        }
    }

    fn require_characteristic(&self, characteristic: Uuid) -> Result<Uuid> {
        if self.has_characteristic(&characteristic) {
            Ok(characteristic)
        } else {
            Err(Error::characteristic_not_found(
                characteristic_name(&characteristic),
                self.characteristics.len(),
            ))
        }
    }

    fn build_steps(&self, operation: Operation) -> Result<Vec<Step>> {
        let steps = match operation {
            Operation::ReadLiveData => vec![
                Step::Write {
                    characteristic: self.require_characteristic(MODE_CHANGE)?,
                    payload: MODE_LIVE.to_vec(),
                },
                Step::Settle,
                Step::Read {
                    characteristic: self.require_characteristic(REAL_TIME_VALUES)?,
                    purpose: ReadPurpose::LiveValues,
                },
                Step::Read {
                    characteristic: self.require_characteristic(FIRMWARE_BATTERY)?,
                    purpose: ReadPurpose::Firmware,
                },
            ],
            Operation::ReadHistoryCount => {
                let mut steps = vec![
                    Step::Write {
                        characteristic: self.require_characteristic(HISTORY_CONTROL)?,
                        payload: MODE_HISTORY.to_vec(),
                    },
                    Step::Settle,
                    Step::Read {
                        characteristic: self.require_characteristic(DEVICE_TIME)?,
                        purpose: ReadPurpose::DeviceClock,
                    },
                ];
                if self.has_characteristic(&ENTRY_COUNT) {
                    steps.extend([
                        Step::Write {
                            characteristic: ENTRY_COUNT,
                            payload: ENTRY_COUNT_REQUEST.to_vec(),
                        },
                        Step::Settle,
                        Step::Read {
                            characteristic: ENTRY_COUNT,
                            purpose: ReadPurpose::EntryCount,
                        },
                    ]);
                } else {
                    // Firmware without the count characteristic answers on
                    // the data characteristic after the mode switch
                    steps.push(Step::Read {
                        characteristic: self.require_characteristic(HISTORY_DATA)?,
                        purpose: ReadPurpose::EntryCount,
                    });
                }
                steps
            }
            Operation::ReadHistoryEntry(index) => vec![
                Step::Write {
                    characteristic: self.require_characteristic(HISTORY_CONTROL)?,
                    payload: history_address_frame(index).to_vec(),
                },
                Step::Settle,
                Step::Read {
                    characteristic: self.require_characteristic(HISTORY_DATA)?,
                    purpose: ReadPurpose::HistoryEntry(index),
                },
            ],
            Operation::Blink => vec![Step::Write {
                characteristic: self.require_characteristic(MODE_CHANGE)?,
                payload: BLINK.to_vec(),
            }],
            Operation::Connect | Operation::Authenticate | Operation::Disconnect => Vec::new(),
        };
        Ok(steps)
    }

    fn current_step(&self, attempt: AttemptId) -> Option<Step> {
        self.plan
            .as_ref()
            .filter(|p| p.attempt == attempt)
            .and_then(|p| p.steps.get(p.cursor).cloned())
    }

    fn run_step(&mut self, attempt: AttemptId, out: &mut Vec<LinkAction>) {
        match self.current_step(attempt) {
            Some(Step::Write {
                characteristic,
                payload,
            }) => out.push(LinkAction::Write {
                attempt,
                characteristic,
                payload,
            }),
            Some(Step::Settle) => out.push(LinkAction::StartTimer {
                timer: LinkTimer::StepDelay(attempt),
                after: self.config.write_settle,
            }),
            Some(Step::Read { characteristic, .. }) => out.push(LinkAction::Read {
                attempt,
                characteristic,
            }),
            None => {}
        }
    }

    fn step_done(&mut self, attempt: AttemptId, now: OffsetDateTime, out: &mut Vec<LinkAction>) {
        let finished = match self.plan.as_mut().filter(|p| p.attempt == attempt) {
            Some(plan) => {
                plan.cursor += 1;
                plan.cursor >= plan.steps.len()
            }
            None => return,
        };
        if finished {
            self.finish_plan(attempt, now, out);
        } else {
            self.run_step(attempt, out);
        }
    }

    fn finish_plan(&mut self, attempt: AttemptId, now: OffsetDateTime, out: &mut Vec<LinkAction>) {
        let Some(plan) = self.plan.take() else {
            return;
        };
        let Some((operation, attempts)) = self.sequencer.complete(attempt) else {
            return;
        };
        let scratch = plan.scratch;

        match operation {
            Operation::ReadLiveData => {
                if let Some(values) = scratch.live {
                    if !values.is_in_range() {
                        debug!("{}: clamping out-of-range values {}", self.id, values);
                    }
                    let reading = LiveSensorReading::new(self.id.clone(), values, now).clamped();
                    self.emit(out, DeviceEvent::LiveReading { reading });
                }
                if let Some(info) = scratch.firmware {
                    self.emit(
                        out,
                        DeviceEvent::DeviceStatus {
                            device: self.id.clone(),
                            info,
                        },
                    );
                }
                self.operation_completed(OperationKind::ReadLiveData, attempts, out);
            }
            Operation::ReadHistoryCount => {
                self.operation_completed(OperationKind::ReadHistoryCount, attempts, out);
                match (scratch.metadata, scratch.clock) {
                    (Some(metadata), Some(clock)) => self.on_history_count(metadata, clock, now, out),
                    _ => self.abort_session("history count missing", now, out),
                }
            }
            Operation::ReadHistoryEntry(index) => {
                if let Some(decoded) = scratch.entry {
                    self.on_history_entry(index, decoded, now, out);
                }
            }
            Operation::Blink => self.operation_completed(OperationKind::Blink, attempts, out),
            Operation::Connect | Operation::Authenticate | Operation::Disconnect => {}
        }
    }

    fn on_history_count(
        &mut self,
        metadata: HistoryMetadata,
        clock: DeviceClock,
        now: OffsetDateTime,
        out: &mut Vec<LinkAction>,
    ) {
        let Some(session) = self.session.as_mut().filter(|s| s.is_active()) else {
            return;
        };
        debug!(
            "{}: {} entries, device up for {}s",
            self.id, metadata.entry_count, clock.seconds_since_boot
        );
        match session.on_count(metadata, clock, now) {
            CountOutcome::Fetch { start, total } => {
                let progress = session.progress(now);
                info!(
                    "{}: fetching history entries {}..{}",
                    self.id, start, total
                );
                self.emit(
                    out,
                    DeviceEvent::HistoryStarted {
                        device: self.id.clone(),
                        start_index: start,
                        total_entries: total,
                        resumed: start > 0,
                    },
                );
                out.push(LinkAction::SaveCheckpoint(progress));
                self.sequencer
                    .enqueue_all((start..total).map(Operation::ReadHistoryEntry));
            }
            CountOutcome::Complete { total } => {
                self.history_completed(total, 0, out);
            }
        }
    }

    fn on_history_entry(
        &mut self,
        index: u16,
        decoded: std::result::Result<HistoryEntry, ParseError>,
        now: OffsetDateTime,
        out: &mut Vec<LinkAction>,
    ) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let Some(outcome) = session.on_entry(index, decoded, now) else {
            debug!("{}: ignoring history entry {}", self.id, index);
            return;
        };
        let current_index = session.current_index();
        let total_entries = session.total_entries();
        let rejected = session.rejected();

        if let Some(reading) = outcome.reading {
            self.emit(out, DeviceEvent::HistoricalReading { reading });
        }
        if let Some(error) = outcome.rejection {
            self.emit(
                out,
                DeviceEvent::EntryRejected {
                    device: self.id.clone(),
                    index,
                    error: error.to_string(),
                },
            );
        }
        self.emit(
            out,
            DeviceEvent::HistoryProgress {
                device: self.id.clone(),
                current_index,
                total_entries,
            },
        );
        if let Some(progress) = outcome.checkpoint {
            out.push(LinkAction::SaveCheckpoint(progress));
        }

        match outcome.status {
            SessionStatus::Continue => {}
            SessionStatus::Completed => self.history_completed(total_entries, rejected, out),
            SessionStatus::Aborted { reason } => {
                warn!("{}: history aborted: {}", self.id, reason);
                self.sequencer
                    .remove_queued(|op| matches!(op, Operation::ReadHistoryEntry(_)));
                self.auto_reconnect = false;
                self.emit(
                    out,
                    DeviceEvent::HistoryAborted {
                        device: self.id.clone(),
                        current_index,
                        total_entries,
                        reason,
                    },
                );
            }
        }
    }

    fn history_completed(&mut self, total_entries: u16, rejected: u32, out: &mut Vec<LinkAction>) {
        info!(
            "{}: history complete ({} entries, {} rejected)",
            self.id, total_entries, rejected
        );
        self.auto_reconnect = false;
        out.push(LinkAction::ClearCheckpoint);
        self.emit(
            out,
            DeviceEvent::HistoryCompleted {
                device: self.id.clone(),
                total_entries,
                rejected,
            },
        );
    }

    // ==================== Authentication ====================

    fn apply_auth_step(
        &mut self,
        attempt: AttemptId,
        step: AuthStep,
        out: &mut Vec<LinkAction>,
    ) {
        match step {
            AuthStep::WriteChallenge { payload, round } => {
                debug!("{}: authentication round {}", self.id, round);
                out.push(LinkAction::StartTimer {
                    timer: LinkTimer::AuthDeadline { attempt, round },
                    after: self.config.auth_deadline,
                });
                out.push(LinkAction::Write {
                    attempt,
                    characteristic: AUTHENTICATION,
                    payload,
                });
            }
            AuthStep::ReadResponse => out.push(LinkAction::Read {
                attempt,
                characteristic: AUTHENTICATION,
            }),
            AuthStep::WriteKey { payload } => out.push(LinkAction::Write {
                attempt,
                characteristic: AUTHENTICATION,
                payload,
            }),
            AuthStep::Done(outcome) => self.finish_authentication(attempt, outcome, out),
            AuthStep::Ignored => {}
        }
    }

    fn finish_authentication(
        &mut self,
        attempt: AttemptId,
        outcome: AuthOutcome,
        out: &mut Vec<LinkAction>,
    ) {
        let Some((_, attempts)) = self.sequencer.complete(attempt) else {
            return;
        };
        match outcome {
            AuthOutcome::Verified => debug!("{}: authenticated", self.id),
            other => info!("{}: authentication fallback ({:?})", self.id, other),
        }
        self.transition(ConnectionState::Ready, out);
        self.operation_completed(OperationKind::Authenticate, attempts, out);
        self.on_ready(out);
    }

    fn on_ready(&mut self, out: &mut Vec<LinkAction>) {
        if let Some(session) = self.session.as_mut() {
            if session.resume() {
                info!(
                    "{}: resuming history at {}/{}",
                    self.id,
                    session.current_index(),
                    session.total_entries()
                );
                out.push(LinkAction::LoadCheckpoint);
            }
        }
    }

    // ==================== Failure handling ====================

    fn attempt_failed(
        &mut self,
        attempt: AttemptId,
        error: Error,
        now: OffsetDateTime,
        out: &mut Vec<LinkAction>,
    ) {
        match self.sequencer.fail(attempt, &error) {
            Failure::Stale => debug!("{}: stale failure: {}", self.id, error),
            Failure::Retry {
                id,
                operation,
                next_attempt,
                delay,
            } => {
                warn!(
                    "{}: {} failed: {}, retrying in {:?} (attempt {})",
                    self.id, operation, error, delay, next_attempt
                );
                self.plan = None;
                self.emit(
                    out,
                    DeviceEvent::OperationRetrying {
                        device: self.id.clone(),
                        operation: operation.kind(),
                        next_attempt,
                        delay_ms: delay.as_millis() as u64,
                        error: error.to_string(),
                    },
                );
                out.push(LinkAction::StartTimer {
                    timer: LinkTimer::RetryDue(id),
                    after: delay,
                });
            }
            Failure::Exhausted {
                operation,
                attempts,
                drained,
            } => {
                self.plan = None;
                self.on_exhausted(operation, attempts, drained, error, now, out);
            }
        }
    }

    fn on_exhausted(
        &mut self,
        operation: Operation,
        attempts: u32,
        drained: Vec<Operation>,
        error: Error,
        now: OffsetDateTime,
        out: &mut Vec<LinkAction>,
    ) {
        warn!(
            "{}: {} failed after {} attempts: {}",
            self.id, operation, attempts, error
        );
        self.operation_failed(operation, &error, out);
        let drained_error = Error::Drained {
            reason: format!("{} failed", operation),
        };
        self.report_drained(drained, &drained_error, out);

        match operation {
            Operation::Connect => out.push(LinkAction::ConnectFailed { error }),
            Operation::Disconnect => {
                self.transition(ConnectionState::Disconnected, out);
            }
            _ => {
                self.abort_session(&error.to_string(), now, out);
                self.auto_reconnect = false;
                self.transition(
                    ConnectionState::Failed(FailureReason::OperationExhausted {
                        operation: operation.kind(),
                        error: error.to_string(),
                    }),
                    out,
                );
                out.push(LinkAction::Disconnect);
            }
        }
    }

    /// End the current operation without success but keep the link as is.
    fn reject(
        &mut self,
        attempt: AttemptId,
        operation: Operation,
        error: Error,
        now: OffsetDateTime,
        out: &mut Vec<LinkAction>,
    ) {
        self.plan = None;
        if self.sequencer.complete(attempt).is_none() {
            return;
        }
        warn!("{}: {} rejected: {}", self.id, operation, error);
        match operation {
            Operation::ReadHistoryEntry(index) => {
                // Entries are skipped, never retried
                let parse_error = match error {
                    Error::InvalidFrame(e) => e,
                    other => ParseError::InvalidData(other.to_string()),
                };
                self.on_history_entry(index, Err(parse_error), now, out);
            }
            Operation::ReadHistoryCount => {
                self.operation_failed(operation, &error, out);
                self.abort_session(&error.to_string(), now, out);
            }
            _ => self.operation_failed(operation, &error, out),
        }
    }

    fn abort_session(&mut self, reason: &str, now: OffsetDateTime, out: &mut Vec<LinkAction>) {
        let Some(session) = self.session.as_mut().filter(|s| s.is_active()) else {
            return;
        };
        let progress = session.abort(now);
        self.auto_reconnect = false;
        info!(
            "{}: history aborted at {}/{}: {}",
            self.id, progress.current_index, progress.total_entries, reason
        );
        self.sequencer
            .remove_queued(|op| matches!(op, Operation::ReadHistoryEntry(_)));
        let (current_index, total_entries) = (progress.current_index, progress.total_entries);
        if progress.is_valid() && progress.current_index < progress.total_entries {
            out.push(LinkAction::SaveCheckpoint(progress));
        }
        self.emit(
            out,
            DeviceEvent::HistoryAborted {
                device: self.id.clone(),
                current_index,
                total_entries,
                reason: reason.to_string(),
            },
        );
    }

    fn operation_completed(
        &self,
        operation: OperationKind,
        attempts: u32,
        out: &mut Vec<LinkAction>,
    ) {
        self.emit(
            out,
            DeviceEvent::OperationCompleted {
                device: self.id.clone(),
                operation,
                attempts,
            },
        );
    }

    /// History entries report through history events, not per operation.
    fn operation_failed(&self, operation: Operation, error: &Error, out: &mut Vec<LinkAction>) {
        if matches!(operation, Operation::ReadHistoryEntry(_)) {
            return;
        }
        self.emit(
            out,
            DeviceEvent::OperationFailed {
                device: self.id.clone(),
                operation: operation.kind(),
                error: error.to_string(),
            },
        );
    }

    fn report_drained(&self, drained: Vec<Operation>, error: &Error, out: &mut Vec<LinkAction>) {
        for operation in drained {
            self.operation_failed(operation, error, out);
        }
    }

    /// Drop every operation; the current one fails with `error`, the queued
    /// ones as drained.
    fn drain_with_error(&mut self, error: &Error, out: &mut Vec<LinkAction>) {
        self.plan = None;
        let had_current = self.sequencer.current().is_some();
        let mut drained = self.sequencer.drain().into_iter();
        if had_current {
            if let Some(current) = drained.next() {
                self.operation_failed(current, error, out);
            }
        }
        let rest = Error::Drained {
            reason: error.to_string(),
        };
        self.report_drained(drained.collect(), &rest, out);
    }

    fn drain_queue(&mut self, reason: &str, out: &mut Vec<LinkAction>) {
        self.plan = None;
        let drained = self.sequencer.drain();
        let error = Error::Drained {
            reason: reason.to_string(),
        };
        self.report_drained(drained, &error, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flora_types::codec::{encode_device_clock, encode_history_entry, encode_history_metadata};
    use flora_types::commands::{AUTH_CHALLENGE, AUTH_KEY};
    use flora_types::uuids::{DATA_SERVICE, HISTORY_SERVICE, PRIMARY_SERVICE};
    use time::Duration as TimeDuration;

    fn now() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + TimeDuration::days(20_000)
    }

    fn all_characteristics() -> Vec<Uuid> {
        vec![
            MODE_CHANGE,
            REAL_TIME_VALUES,
            FIRMWARE_BATTERY,
            HISTORY_CONTROL,
            HISTORY_DATA,
            DEVICE_TIME,
            ENTRY_COUNT,
        ]
    }

    fn new_link() -> DeviceLink {
        DeviceLink::new("C4:7C:8D:6A:12:34".into(), LinkConfig::default())
    }

    fn attempt_of(actions: &[LinkAction]) -> AttemptId {
        actions
            .iter()
            .find_map(|a| match a {
                LinkAction::Connect { attempt }
                | LinkAction::Write { attempt, .. }
                | LinkAction::Read { attempt, .. } => Some(*attempt),
                _ => None,
            })
            .expect("no request in actions")
    }

    fn states(actions: &[LinkAction]) -> Vec<ConnectionState> {
        actions
            .iter()
            .filter_map(|a| match a {
                LinkAction::Emit(DeviceEvent::StateChanged { to, .. }) => Some(to.clone()),
                _ => None,
            })
            .collect()
    }

    fn events(actions: &[LinkAction]) -> Vec<&DeviceEvent> {
        actions
            .iter()
            .filter_map(|a| match a {
                LinkAction::Emit(e) => Some(e),
                _ => None,
            })
            .collect()
    }

    fn find_timer(actions: &[LinkAction], pred: impl Fn(&LinkTimer) -> bool) -> Option<LinkTimer> {
        actions.iter().find_map(|a| match a {
            LinkAction::StartTimer { timer, .. } if pred(timer) => Some(*timer),
            _ => None,
        })
    }

    /// Connect and discover; returns the actions of the last discovery step.
    fn connect_with(link: &mut DeviceLink, characteristics: Vec<Uuid>) -> Vec<LinkAction> {
        let actions = link.start_connect(now());
        let attempt = attempt_of(&actions);
        link.handle(LinkInput::Connected { attempt }, now());
        link.handle(
            LinkInput::ServicesDiscovered {
                attempt,
                services: vec![PRIMARY_SERVICE, DATA_SERVICE],
            },
            now(),
        );
        link.handle(
            LinkInput::CharacteristicsDiscovered {
                attempt,
                service: PRIMARY_SERVICE,
                characteristics: Vec::new(),
            },
            now(),
        );
        link.handle(
            LinkInput::CharacteristicsDiscovered {
                attempt,
                service: DATA_SERVICE,
                characteristics,
            },
            now(),
        )
    }

    fn ready_link() -> DeviceLink {
        let mut link = new_link();
        let actions = connect_with(&mut link, all_characteristics());
        assert_eq!(
            states(&actions),
            vec![ConnectionState::Authenticating, ConnectionState::Ready]
        );
        link
    }

    /// Acknowledge writes, fire settle timers and answer reads until the
    /// link asks for something not covered by `answer`.
    fn drive(
        link: &mut DeviceLink,
        mut actions: Vec<LinkAction>,
        answer: &mut dyn FnMut(Uuid) -> Option<Vec<u8>>,
    ) -> Vec<LinkAction> {
        let mut log = Vec::new();
        for _ in 0..10_000 {
            let next = actions.iter().find_map(|a| match a {
                LinkAction::Write { attempt, .. } => Some(LinkInput::WriteAck { attempt: *attempt }),
                LinkAction::Read {
                    attempt,
                    characteristic,
                } => answer(*characteristic).map(|value| LinkInput::Value {
                    attempt: *attempt,
                    value,
                }),
                LinkAction::StartTimer {
                    timer: timer @ (LinkTimer::StepDelay(_) | LinkTimer::BatchPause(_)),
                    ..
                } => Some(LinkInput::Timer(*timer)),
                _ => None,
            });
            log.append(&mut actions);
            let Some(input) = next else {
                return log;
            };
            actions = link.handle(input, now());
        }
        panic!("link did not settle");
    }

    fn live_frame() -> Vec<u8> {
        vec![
            0x64, 0x00, 0xFF, 0x0A, 0x00, 0x00, 0x00, 0x32, 0x64, 0x00, 0, 0, 0, 0, 0, 0,
        ]
    }

    fn firmware_frame() -> Vec<u8> {
        vec![99, 0x00, b'3', b'.', b'2', b'.', b'1']
    }

    #[test]
    fn test_connect_runs_discovery_then_ready() {
        let mut link = new_link();
        let actions = link.start_connect(now());
        assert_eq!(states(&actions), vec![ConnectionState::Connecting]);
        let attempt = attempt_of(&actions);

        let actions = link.handle(LinkInput::Connected { attempt }, now());
        assert_eq!(states(&actions), vec![ConnectionState::Connected]);
        assert!(matches!(actions.last(), Some(LinkAction::DiscoverServices { .. })));
    }

    #[test]
    fn test_authentication_waits_for_all_services() {
        let mut link = new_link();
        let actions = link.start_connect(now());
        let attempt = attempt_of(&actions);
        link.handle(LinkInput::Connected { attempt }, now());
        link.handle(
            LinkInput::ServicesDiscovered {
                attempt,
                services: vec![PRIMARY_SERVICE, DATA_SERVICE, HISTORY_SERVICE],
            },
            now(),
        );

        // The authentication characteristic arrives with the first service
        let actions = link.handle(
            LinkInput::CharacteristicsDiscovered {
                attempt,
                service: PRIMARY_SERVICE,
                characteristics: vec![AUTHENTICATION],
            },
            now(),
        );
        assert!(states(&actions).is_empty());
        assert_eq!(link.state(), &ConnectionState::Connected);

        link.handle(
            LinkInput::CharacteristicsDiscovered {
                attempt,
                service: DATA_SERVICE,
                characteristics: vec![MODE_CHANGE, REAL_TIME_VALUES],
            },
            now(),
        );
        assert_eq!(link.state(), &ConnectionState::Connected);

        let actions = link.handle(
            LinkInput::CharacteristicsDiscovered {
                attempt,
                service: HISTORY_SERVICE,
                characteristics: vec![HISTORY_CONTROL, HISTORY_DATA],
            },
            now(),
        );
        assert_eq!(states(&actions), vec![ConnectionState::Authenticating]);
        assert!(link.has_characteristic(&HISTORY_DATA));
        assert!(actions.iter().any(|a| matches!(
            a,
            LinkAction::Write { characteristic, payload, .. }
                if *characteristic == AUTHENTICATION && payload == &AUTH_CHALLENGE.to_vec()
        )));
    }

    #[test]
    fn test_authentication_deadline_falls_back_to_ready() {
        let mut link = new_link();
        let mut characteristics = all_characteristics();
        characteristics.push(AUTHENTICATION);
        let actions = connect_with(&mut link, characteristics);
        assert_eq!(link.state(), &ConnectionState::Authenticating);

        let deadline = find_timer(&actions, |t| matches!(t, LinkTimer::AuthDeadline { .. }))
            .expect("deadline scheduled");
        let attempt = attempt_of(&actions);
        link.handle(LinkInput::WriteAck { attempt }, now());

        // No answer within the deadline
        let actions = link.handle(LinkInput::Timer(deadline), now());
        assert_eq!(states(&actions), vec![ConnectionState::Ready]);
        assert!(!link.state().is_failed());
    }

    #[test]
    fn test_authentication_verified() {
        let mut link = new_link();
        let mut characteristics = all_characteristics();
        characteristics.push(AUTHENTICATION);
        let actions = connect_with(&mut link, characteristics);
        let attempt = attempt_of(&actions);

        let actions = link.handle(LinkInput::WriteAck { attempt }, now());
        assert!(matches!(actions[0], LinkAction::Read { .. }));
        let actions = link.handle(
            LinkInput::Value {
                attempt,
                value: AUTH_CHALLENGE.to_vec(),
            },
            now(),
        );
        assert!(actions.iter().any(|a| matches!(
            a,
            LinkAction::Write { payload, .. } if payload == &AUTH_KEY.to_vec()
        )));
        let actions = link.handle(LinkInput::WriteAck { attempt }, now());
        assert_eq!(states(&actions), vec![ConnectionState::Ready]);
    }

    #[test]
    fn test_data_operations_require_ready() {
        let mut link = new_link();
        assert!(matches!(
            link.request_live_data(now()),
            Err(Error::NotReady { .. })
        ));
        assert!(link.request_history().is_err());
        assert!(link.blink(now()).is_err());
    }

    #[test]
    fn test_live_data_is_clamped_and_reported() {
        let mut link = ready_link();
        let actions = link.request_live_data(now()).unwrap();
        assert!(matches!(
            &actions[1],
            LinkAction::Write { characteristic, payload, .. }
                if *characteristic == MODE_CHANGE && payload == &MODE_LIVE.to_vec()
        ));

        let mut hot = live_frame();
        hot[0] = 0xBC;
        hot[1] = 0x02; // 70.0
        hot[7] = 0xC8; // 200 %
        let log = drive(&mut link, actions, &mut |uuid| match uuid {
            u if u == REAL_TIME_VALUES => Some(hot.clone()),
            u if u == FIRMWARE_BATTERY => Some(firmware_frame()),
            _ => None,
        });

        let events = events(&log);
        let reading = events
            .iter()
            .find_map(|e| match e {
                DeviceEvent::LiveReading { reading } => Some(reading.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(reading.values.moisture, 100);
        assert_eq!(reading.values.temperature, 60.0);
        assert!(events.iter().any(|e| matches!(
            e,
            DeviceEvent::DeviceStatus { info, .. } if info.battery == 99 && info.firmware == "3.2.1"
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            DeviceEvent::OperationCompleted { operation: OperationKind::ReadLiveData, .. }
        )));
    }

    #[test]
    fn test_live_data_decode_error_is_rejected_without_failing_link() {
        let mut link = ready_link();
        let actions = link.request_live_data(now()).unwrap();
        let log = drive(&mut link, actions, &mut |uuid| {
            (uuid == REAL_TIME_VALUES).then(|| vec![0u8; 4])
        });
        assert!(events(&log).iter().any(|e| matches!(
            e,
            DeviceEvent::OperationFailed { operation: OperationKind::ReadLiveData, .. }
        )));
        assert_eq!(link.state(), &ConnectionState::Ready);
        assert!(link.current_operation().is_none());
    }

    #[test]
    fn test_stale_value_after_timeout_is_ignored() {
        let mut link = ready_link();
        let actions = link.request_live_data(now()).unwrap();
        let attempt = attempt_of(&actions);
        let timeout = find_timer(&actions, |t| matches!(t, LinkTimer::OperationTimeout(_))).unwrap();

        let actions = link.handle(LinkInput::Timer(timeout), now());
        let retry = find_timer(&actions, |t| matches!(t, LinkTimer::RetryDue(_))).unwrap();
        assert!(events(&actions).iter().any(|e| matches!(
            e,
            DeviceEvent::OperationRetrying { next_attempt: 2, .. }
        )));

        // Late ack for the timed out attempt
        assert!(link.handle(LinkInput::WriteAck { attempt }, now()).is_empty());

        let actions = link.handle(LinkInput::Timer(retry), now());
        assert_ne!(attempt_of(&actions), attempt);
    }

    #[test]
    fn test_exhausted_retries_fail_the_link() {
        let mut link = ready_link();
        let mut actions = link.request_live_data(now()).unwrap();
        link.blink(now()).unwrap();

        for _ in 0..2 {
            let attempt = attempt_of(&actions);
            let failed = link.handle(
                LinkInput::RequestFailed {
                    attempt,
                    error: Error::NotConnected,
                },
                now(),
            );
            let retry = find_timer(&failed, |t| matches!(t, LinkTimer::RetryDue(_))).unwrap();
            actions = link.handle(LinkInput::Timer(retry), now());
        }

        let attempt = attempt_of(&actions);
        let actions = link.handle(
            LinkInput::RequestFailed {
                attempt,
                error: Error::NotConnected,
            },
            now(),
        );
        assert!(link.state().is_failed());
        assert!(matches!(actions.last(), Some(LinkAction::Disconnect)));
        let failed: Vec<_> = events(&actions)
            .into_iter()
            .filter(|e| matches!(e, DeviceEvent::OperationFailed { .. }))
            .collect();
        // The live read and the drained blink
        assert_eq!(failed.len(), 2);
    }

    #[test]
    fn test_history_count_queues_entries_in_order() {
        let mut link = ready_link();
        let actions = link.request_history().unwrap();
        assert!(matches!(actions[..], [LinkAction::LoadCheckpoint]));

        let actions = link.handle(LinkInput::CheckpointLoaded(None), now());
        let metadata = encode_history_metadata(&HistoryMetadata {
            entry_count: 5,
            vendor_fields: [0; 12],
        });
        let clock = encode_device_clock(&DeviceClock {
            seconds_since_boot: 50_000,
        });
        let mut requested = Vec::new();
        let log = drive(&mut link, actions, &mut |uuid| match uuid {
            u if u == DEVICE_TIME => Some(clock.to_vec()),
            u if u == ENTRY_COUNT => Some(metadata.to_vec()),
            _ => None,
        });
        for action in &log {
            if let LinkAction::Write {
                characteristic,
                payload,
                ..
            } = action
            {
                if *characteristic == HISTORY_CONTROL {
                    requested.push(payload.clone());
                }
            }
        }
        assert_eq!(requested, vec![MODE_HISTORY.to_vec(), vec![0xA1, 0x00, 0x00]]);
        assert!(events(&log).iter().any(|e| matches!(
            e,
            DeviceEvent::HistoryStarted { start_index: 0, total_entries: 5, resumed: false, .. }
        )));
        assert_eq!(link.pending_operations(), 4);
        assert_eq!(
            link.current_operation(),
            Some(Operation::ReadHistoryEntry(0))
        );
    }

    #[test]
    fn test_full_history_download() {
        let mut link = ready_link();
        link.request_history().unwrap();
        let actions = link.handle(LinkInput::CheckpointLoaded(None), now());

        let entry = encode_history_entry(&HistoryEntry {
            relative_timestamp: 1_000,
            values: SensorValues {
                temperature: 21.0,
                brightness: 500,
                moisture: 30,
                conductivity: 200,
            },
        });
        let log = drive(&mut link, actions, &mut |uuid| match uuid {
            u if u == DEVICE_TIME => Some(encode_device_clock(&DeviceClock {
                seconds_since_boot: 50_000,
            })
            .to_vec()),
            u if u == ENTRY_COUNT => Some(
                encode_history_metadata(&HistoryMetadata {
                    entry_count: 3,
                    vendor_fields: [0; 12],
                })
                .to_vec(),
            ),
            u if u == HISTORY_DATA => Some(entry.to_vec()),
            _ => None,
        });

        let indices: Vec<u16> = events(&log)
            .iter()
            .filter_map(|e| match e {
                DeviceEvent::HistoricalReading { reading } => Some(reading.index),
                _ => None,
            })
            .collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert!(events(&log).iter().any(|e| matches!(
            e,
            DeviceEvent::HistoryCompleted { total_entries: 3, rejected: 0, .. }
        )));
        assert!(log.iter().any(|a| matches!(a, LinkAction::ClearCheckpoint)));
        assert!(!link.has_active_session());
        assert!(!link.should_auto_reconnect());
    }

    #[test]
    fn test_history_uses_data_characteristic_without_count_characteristic() {
        let mut link = new_link();
        let characteristics = all_characteristics()
            .into_iter()
            .filter(|c| *c != ENTRY_COUNT)
            .collect();
        connect_with(&mut link, characteristics);
        link.request_history().unwrap();
        let actions = link.handle(LinkInput::CheckpointLoaded(None), now());
        let log = drive(&mut link, actions, &mut |uuid| match uuid {
            u if u == DEVICE_TIME => Some(vec![0x10, 0x27, 0, 0]),
            _ => None,
        });
        let last_read = log.iter().rev().find_map(|a| match a {
            LinkAction::Read { characteristic, .. } => Some(*characteristic),
            _ => None,
        });
        assert_eq!(last_read, Some(HISTORY_DATA));
    }

    #[test]
    fn test_disconnect_mid_history_saves_checkpoint() {
        let mut link = ready_link();
        link.request_history().unwrap();
        let actions = link.handle(LinkInput::CheckpointLoaded(None), now());
        drive(&mut link, actions, &mut |uuid| match uuid {
            u if u == DEVICE_TIME => Some(vec![0x10, 0x27, 0, 0]),
            u if u == ENTRY_COUNT => Some(
                encode_history_metadata(&HistoryMetadata {
                    entry_count: 100,
                    vendor_fields: [0; 12],
                })
                .to_vec(),
            ),
            _ => None,
        });

        let actions = link.handle(LinkInput::Disconnected, now());
        assert_eq!(states(&actions), vec![ConnectionState::Disconnected]);
        assert!(actions.iter().any(|a| matches!(
            a,
            LinkAction::SaveCheckpoint(p) if p.current_index == 0 && p.total_entries == 100
        )));
        assert!(link.should_auto_reconnect());
        assert!(link.has_active_session());

        // Reconnecting resumes with a checkpoint load
        let actions = connect_with(&mut link, all_characteristics());
        assert!(actions.iter().any(|a| matches!(a, LinkAction::LoadCheckpoint)));
    }

    #[test]
    fn test_disconnect_while_waiting_to_resume_stops_download() {
        let mut link = ready_link();
        link.request_history().unwrap();
        let actions = link.handle(LinkInput::CheckpointLoaded(None), now());
        drive(&mut link, actions, &mut |uuid| match uuid {
            u if u == DEVICE_TIME => Some(vec![0x10, 0x27, 0, 0]),
            u if u == ENTRY_COUNT => Some(
                encode_history_metadata(&HistoryMetadata {
                    entry_count: 100,
                    vendor_fields: [0; 12],
                })
                .to_vec(),
            ),
            _ => None,
        });
        link.handle(LinkInput::Disconnected, now());
        assert!(link.should_auto_reconnect());

        let actions = link.disconnect(now());
        assert!(events(&actions).iter().any(|e| matches!(
            e,
            DeviceEvent::HistoryAborted { current_index: 0, total_entries: 100, .. }
        )));
        assert!(actions.iter().any(|a| matches!(a, LinkAction::SaveCheckpoint(_))));
        assert!(!link.has_active_session());
        assert!(!link.should_auto_reconnect());
        assert!(link.is_idle());

        // A later connect does not pick the download back up
        let actions = connect_with(&mut link, all_characteristics());
        assert!(!actions.iter().any(|a| matches!(a, LinkAction::LoadCheckpoint)));
    }

    #[test]
    fn test_late_connect_after_timeout_is_closed() {
        let mut link = new_link();
        let actions = link.start_connect(now());
        let attempt = attempt_of(&actions);

        let actions = link.handle(LinkInput::Timer(LinkTimer::OperationTimeout(attempt)), now());
        assert!(actions.iter().any(|a| matches!(a, LinkAction::ConnectFailed { .. })));
        link.abandon_connect();
        assert_eq!(link.state(), &ConnectionState::Disconnected);

        let actions = link.handle(LinkInput::Connected { attempt }, now());
        assert!(actions.iter().any(|a| matches!(a, LinkAction::Disconnect)));
        assert_eq!(link.state(), &ConnectionState::Disconnected);
    }

    #[test]
    fn test_late_connect_does_not_close_a_newer_attempt() {
        let mut link = new_link();
        let first = attempt_of(&link.start_connect(now()));
        link.handle(LinkInput::Timer(LinkTimer::OperationTimeout(first)), now());
        link.abandon_connect();

        let second = attempt_of(&link.start_connect(now()));
        assert_ne!(first, second);
        let actions = link.handle(LinkInput::Connected { attempt: first }, now());
        assert!(!actions.iter().any(|a| matches!(a, LinkAction::Disconnect)));
        assert_eq!(link.current_operation(), Some(Operation::Connect));
    }

    #[test]
    fn test_cancel_drains_and_disconnects() {
        let mut link = ready_link();
        let actions = link.request_live_data(now()).unwrap();
        let attempt = attempt_of(&actions);
        link.blink(now()).unwrap();

        let actions = link.cancel(now());
        assert_eq!(
            events(&actions)
                .iter()
                .filter(|e| matches!(e, DeviceEvent::OperationFailed { .. }))
                .count(),
            2
        );
        assert!(matches!(actions.last(), Some(LinkAction::Disconnect)));
        assert_eq!(link.state(), &ConnectionState::Disconnected);

        // In-flight callbacks are inert
        assert!(link.handle(LinkInput::WriteAck { attempt }, now()).is_empty());
        assert!(!link.should_auto_reconnect());
    }

    #[test]
    fn test_graceful_disconnect_completes_on_disconnected() {
        let mut link = ready_link();
        let actions = link.disconnect(now());
        assert!(actions.iter().any(|a| matches!(a, LinkAction::Disconnect)));
        let actions = link.handle(LinkInput::Disconnected, now());
        assert!(events(&actions).iter().any(|e| matches!(
            e,
            DeviceEvent::OperationCompleted { operation: OperationKind::Disconnect, .. }
        )));
        assert_eq!(link.state(), &ConnectionState::Disconnected);
    }

    #[test]
    fn test_drop_during_connect_reports_connect_failure() {
        let mut link = new_link();
        let actions = link.start_connect(now());
        let attempt = attempt_of(&actions);
        link.handle(LinkInput::Connected { attempt }, now());

        let actions = link.handle(LinkInput::Disconnected, now());
        assert!(actions.iter().any(|a| matches!(a, LinkAction::ConnectFailed { .. })));

        let actions = link.abandon_connect();
        assert_eq!(states(&actions), vec![ConnectionState::Disconnected]);
    }

    #[test]
    fn test_fail_and_reset() {
        let mut link = new_link();
        link.begin_connecting();
        let actions = link.fail(FailureReason::MaxRetriesExceeded { attempts: 3 }, now());
        assert!(link.state().is_failed());
        assert!(!actions.iter().any(|a| matches!(a, LinkAction::Disconnect)));

        link.reset();
        assert_eq!(link.state(), &ConnectionState::Disconnected);
        assert!(link.is_idle());
    }
}
