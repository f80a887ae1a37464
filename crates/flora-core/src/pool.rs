//! Multi-device connection pool.
//!
//! One task owns every [`DeviceLink`]. Commands from [`ConnectionPool`]
//! handles, completions of spawned transport requests, timer expiries and
//! transport events all arrive as messages on that task and are applied one
//! at a time, so a link is never touched concurrently.
//!
//! The pool adds what a single link cannot see:
//!
//! - finding devices by scanning, with a deadline per connect attempt
//! - connect retries with a linear backoff, and the terminal
//!   `MaxRetriesExceeded` state once they are spent
//! - reconnecting a link that dropped during a history download
//! - checkpoint persistence and handing readings to the repository

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use flora_types::DeviceId;

use crate::checkpoint::{CheckpointStore, HistorySessionProgress, MemoryCheckpointStore};
use crate::config::PoolConfig;
use crate::error::{ConnectionFailureReason, DeviceNotFoundReason, Error, Result};
use crate::events::{DeviceEvent, EventDispatcher, EventReceiver};
use crate::link::{DeviceLink, LinkAction, LinkConfig, LinkInput};
use crate::metrics::{MetricsSnapshot, PoolMetrics};
use crate::repository::{NullRepository, ReadingRepository};
use crate::state::{ConnectionState, FailureReason};
use crate::transport::{BleTransport, TransportEvent};

/// A row of [`ConnectionPool::devices`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSummary {
    pub id: DeviceId,
    pub state: ConnectionState,
    /// Failed connect attempts since the last successful connect.
    pub failed_connects: u32,
    /// Operations waiting behind the current one.
    pub pending_operations: usize,
    /// Progress of a running or interrupted history download.
    pub history: Option<HistorySessionProgress>,
}

type Reply<T> = oneshot::Sender<Result<T>>;

enum Command {
    Connect(DeviceId, Reply<()>),
    RequestLiveData(DeviceId, Reply<()>),
    RequestHistory(DeviceId, Reply<()>),
    Blink(DeviceId, Reply<()>),
    Cancel(DeviceId, Reply<()>),
    Disconnect(DeviceId, Reply<()>),
    ResetRetries(DeviceId, Reply<()>),
    Forget(DeviceId, Reply<bool>),
    State(DeviceId, Reply<Option<ConnectionState>>),
    Devices(Reply<Vec<DeviceSummary>>),
}

/// Messages the pool task sends itself.
#[derive(Debug)]
enum Internal {
    Link { id: DeviceId, input: LinkInput },
    ScanDeadline { id: DeviceId, generation: u64 },
    ConnectRetryDue { id: DeviceId, generation: u64 },
    ReconnectDue { id: DeviceId, generation: u64 },
    ScanFailed(Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingTimer {
    ConnectRetry,
    Reconnect,
}

struct Slot {
    link: DeviceLink,
    failed_connects: u32,
    /// Bumped whenever scheduled pool timers for this device become void.
    generation: u64,
    pending: Option<PendingTimer>,
}

impl Slot {
    fn new(id: DeviceId, config: LinkConfig) -> Self {
        Self {
            link: DeviceLink::new(id, config),
            failed_connects: 0,
            generation: 0,
            pending: None,
        }
    }

    fn invalidate_timers(&mut self) {
        self.generation += 1;
        self.pending = None;
    }
}

fn now() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

fn validate_id(id: &DeviceId) -> Result<()> {
    if id.is_valid() {
        Ok(())
    } else {
        Err(Error::InvalidDeviceId(id.to_string()))
    }
}

fn failure_reason(error: &Error) -> FailureReason {
    match error {
        Error::RadioUnavailable(message) => FailureReason::RadioUnavailable {
            message: message.clone(),
        },
        Error::DeviceNotFound(DeviceNotFoundReason::NoAdapter)
        | Error::ConnectionFailed {
            reason: ConnectionFailureReason::AdapterUnavailable,
            ..
        } => FailureReason::RadioUnavailable {
            message: error.to_string(),
        },
        other => FailureReason::ConnectFailed {
            message: other.to_string(),
        },
    }
}

struct PoolActor {
    transport: Arc<dyn BleTransport>,
    checkpoints: Arc<dyn CheckpointStore>,
    repository: Arc<dyn ReadingRepository>,
    config: PoolConfig,
    link_config: LinkConfig,
    slots: HashMap<DeviceId, Slot>,
    awaiting_scan: HashSet<DeviceId>,
    scanning: bool,
    internal: mpsc::UnboundedSender<Internal>,
    events: EventDispatcher,
    metrics: Arc<PoolMetrics>,
}

impl PoolActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
        shutdown: CancellationToken,
    ) {
        let mut transport_events = self.transport.subscribe();
        let mut transport_open = true;
        info!("Connection pool started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(command) = commands.recv() => self.on_command(command).await,
                Some(message) = internal.recv() => self.on_internal(message).await,
                event = transport_events.recv(), if transport_open => match event {
                    Ok(event) => self.on_transport_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Transport event stream lagged, {} events lost", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("Transport event stream closed");
                        transport_open = false;
                    }
                },
            }
        }

        self.shutdown().await;
        info!("Connection pool stopped");
    }

    async fn shutdown(&mut self) {
        let ids: Vec<DeviceId> = self.slots.keys().cloned().collect();
        for id in ids {
            if let Some(slot) = self.slots.get_mut(&id) {
                slot.invalidate_timers();
                if slot.link.is_idle() {
                    continue;
                }
                let actions = slot.link.cancel(now());
                self.apply(&id, actions).await;
            }
        }
        self.awaiting_scan.clear();
        self.stop_scan_if_idle();
    }

    // ==================== Commands ====================

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Connect(id, reply) => {
                let result = self.connect(&id).await;
                let _ = reply.send(result);
            }
            Command::RequestLiveData(id, reply) => {
                let result = self
                    .with_link(&id, |link| link.request_live_data(now()))
                    .await;
                let _ = reply.send(result);
            }
            Command::RequestHistory(id, reply) => {
                let result = self.with_link(&id, |link| link.request_history()).await;
                let _ = reply.send(result);
            }
            Command::Blink(id, reply) => {
                let result = self.with_link(&id, |link| link.blink(now())).await;
                let _ = reply.send(result);
            }
            Command::Cancel(id, reply) => {
                let result = self.stop(&id, |link| link.cancel(now())).await;
                let _ = reply.send(result);
            }
            Command::Disconnect(id, reply) => {
                let result = self.stop(&id, |link| link.disconnect(now())).await;
                let _ = reply.send(result);
            }
            Command::ResetRetries(id, reply) => {
                let result = self.reset_retries(&id).await;
                let _ = reply.send(result);
            }
            Command::Forget(id, reply) => {
                let _ = reply.send(self.forget(&id));
            }
            Command::State(id, reply) => {
                let state = self.slots.get(&id).map(|s| s.link.state().clone());
                let _ = reply.send(Ok(state));
            }
            Command::Devices(reply) => {
                let _ = reply.send(Ok(self.devices()));
            }
        }
    }

    async fn connect(&mut self, id: &DeviceId) -> Result<()> {
        validate_id(id)?;
        let link_config = self.link_config.clone();
        let slot = self
            .slots
            .entry(id.clone())
            .or_insert_with(|| Slot::new(id.clone(), link_config));

        match slot.link.state() {
            ConnectionState::Failed(FailureReason::MaxRetriesExceeded { attempts }) => {
                return Err(Error::MaxRetriesExceeded {
                    device_id: id.to_string(),
                    attempts: *attempts,
                });
            }
            state if state.is_active() => {
                debug!("{}: connect ignored, link is {}", id, state);
                return Ok(());
            }
            _ if slot.pending.is_some() => {
                debug!("{}: connect ignored, retry already scheduled", id);
                return Ok(());
            }
            _ => {}
        }
        // Leaving Failed by disconnect or cancel keeps the budget spent
        if self.config.connection.is_exhausted(slot.failed_connects) {
            return Err(Error::MaxRetriesExceeded {
                device_id: id.to_string(),
                attempts: slot.failed_connects,
            });
        }

        self.attempt_connect(id).await;
        Ok(())
    }

    /// Start one connect attempt: directly if the transport has a handle for
    /// the device, otherwise by scanning for it first.
    async fn attempt_connect(&mut self, id: &DeviceId) {
        let known = self.transport.knows(id);
        let scan_deadline = self.config.connection.scan_deadline();
        let Some(slot) = self.slots.get_mut(id) else {
            return;
        };
        slot.invalidate_timers();
        self.metrics.record_connect_attempt();

        if known {
            info!("{}: connecting", id);
            let actions = slot.link.start_connect(now());
            self.apply(id, actions).await;
            return;
        }

        info!("{}: scanning (deadline {:?})", id, scan_deadline);
        let generation = slot.generation;
        let actions = slot.link.begin_connecting();
        self.awaiting_scan.insert(id.clone());
        self.schedule(
            scan_deadline,
            Internal::ScanDeadline {
                id: id.clone(),
                generation,
            },
        );
        self.start_scan();
        self.apply(id, actions).await;
    }

    async fn with_link(
        &mut self,
        id: &DeviceId,
        f: impl FnOnce(&mut DeviceLink) -> Result<Vec<LinkAction>>,
    ) -> Result<()> {
        validate_id(id)?;
        let slot = self.slots.get_mut(id).ok_or(Error::NotConnected)?;
        let actions = f(&mut slot.link)?;
        self.apply(id, actions).await;
        Ok(())
    }

    /// Cancel or disconnect: pool timers for the device become void too.
    async fn stop(
        &mut self,
        id: &DeviceId,
        f: impl FnOnce(&mut DeviceLink) -> Vec<LinkAction>,
    ) -> Result<()> {
        validate_id(id)?;
        let Some(slot) = self.slots.get_mut(id) else {
            return Ok(());
        };
        slot.invalidate_timers();
        let actions = f(&mut slot.link);
        self.awaiting_scan.remove(id);
        self.stop_scan_if_idle();
        self.apply(id, actions).await;
        Ok(())
    }

    async fn reset_retries(&mut self, id: &DeviceId) -> Result<()> {
        validate_id(id)?;
        let Some(slot) = self.slots.get_mut(id) else {
            return Ok(());
        };
        info!("{}: connect retry counter reset", id);
        slot.failed_connects = 0;
        let actions = slot.link.reset();
        self.apply(id, actions).await;
        Ok(())
    }

    fn forget(&mut self, id: &DeviceId) -> Result<bool> {
        validate_id(id)?;
        match self.slots.get(id) {
            None => Ok(false),
            Some(slot) if slot.link.is_idle() && slot.pending.is_none() => {
                self.slots.remove(id);
                self.awaiting_scan.remove(id);
                info!("{}: forgotten", id);
                Ok(true)
            }
            Some(_) => Err(Error::DeviceBusy(id.to_string())),
        }
    }

    fn devices(&self) -> Vec<DeviceSummary> {
        let now = now();
        let mut devices: Vec<DeviceSummary> = self
            .slots
            .iter()
            .map(|(id, slot)| DeviceSummary {
                id: id.clone(),
                state: slot.link.state().clone(),
                failed_connects: slot.failed_connects,
                pending_operations: slot.link.pending_operations(),
                history: slot
                    .link
                    .session()
                    .filter(|s| s.is_active())
                    .map(|s| s.progress(now)),
            })
            .collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }

    // ==================== Internal messages ====================

    async fn on_internal(&mut self, message: Internal) {
        match message {
            Internal::Link { id, input } => {
                let Some(slot) = self.slots.get_mut(&id) else {
                    debug!("{}: input for forgotten device", id);
                    return;
                };
                let actions = slot.link.handle(input, now());
                self.apply(&id, actions).await;
            }
            Internal::ScanDeadline { id, generation } => {
                if !self.is_current(&id, generation) || !self.awaiting_scan.remove(&id) {
                    return;
                }
                let deadline = self.config.connection.scan_deadline();
                warn!("{}: not found within {:?}", id, deadline);
                self.stop_scan_if_idle();
                let error = Error::DeviceNotFound(DeviceNotFoundReason::ScanTimeout {
                    duration: deadline,
                });
                let actions = self.connect_failed(&id, error);
                self.apply(&id, actions).await;
            }
            Internal::ConnectRetryDue { id, generation } => {
                if !self.is_current(&id, generation) {
                    return;
                }
                if let Some(slot) = self.slots.get_mut(&id) {
                    slot.pending = None;
                    if *slot.link.state() == ConnectionState::Disconnected {
                        self.attempt_connect(&id).await;
                    }
                }
            }
            Internal::ReconnectDue { id, generation } => {
                if !self.is_current(&id, generation) {
                    return;
                }
                if let Some(slot) = self.slots.get_mut(&id) {
                    slot.pending = None;
                    if slot.link.should_auto_reconnect()
                        && *slot.link.state() == ConnectionState::Disconnected
                    {
                        info!("{}: reconnecting to resume history", id);
                        self.attempt_connect(&id).await;
                    }
                }
            }
            Internal::ScanFailed(error) => {
                warn!("Scan failed: {}", error);
                self.scanning = false;
                let waiting: Vec<DeviceId> = self.awaiting_scan.drain().collect();
                for id in waiting {
                    let error = if error.is_fatal() {
                        Error::RadioUnavailable(error.to_string())
                    } else {
                        Error::connection_failed(
                            Some(id.to_string()),
                            ConnectionFailureReason::BleError(error.to_string()),
                        )
                    };
                    let actions = self.connect_failed(&id, error);
                    self.apply(&id, actions).await;
                }
            }
        }
    }

    fn is_current(&self, id: &DeviceId, generation: u64) -> bool {
        self.slots
            .get(id)
            .is_some_and(|slot| slot.generation == generation)
    }

    async fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Discovered { id, name, rssi } => {
                self.emit(DeviceEvent::Discovered {
                    device: id.clone(),
                    name,
                    rssi,
                });
                if !self.awaiting_scan.remove(&id) {
                    return;
                }
                info!("{}: found, connecting", id);
                self.stop_scan_if_idle();
                if let Some(slot) = self.slots.get_mut(&id) {
                    // Voids the scan deadline
                    slot.generation += 1;
                    let actions = slot.link.start_connect(now());
                    self.apply(&id, actions).await;
                }
            }
            TransportEvent::Disconnected { id } => {
                if let Some(slot) = self.slots.get_mut(&id) {
                    let actions = slot.link.handle(LinkInput::Disconnected, now());
                    self.apply(&id, actions).await;
                }
            }
            TransportEvent::AdapterUnavailable { reason } => {
                warn!("Bluetooth adapter unavailable: {}", reason);
                self.scanning = false;
                self.awaiting_scan.clear();
                let ids: Vec<DeviceId> = self.slots.keys().cloned().collect();
                for id in ids {
                    let Some(slot) = self.slots.get_mut(&id) else {
                        continue;
                    };
                    slot.invalidate_timers();
                    if !slot.link.state().is_active() && !slot.link.has_active_session() {
                        continue;
                    }
                    let failure = FailureReason::RadioUnavailable {
                        message: reason.clone(),
                    };
                    let actions = slot.link.fail(failure, now());
                    self.apply(&id, actions).await;
                }
            }
        }
    }

    // ==================== Connect failures ====================

    /// Decide between retrying and failing after a connect attempt failed.
    fn connect_failed(&mut self, id: &DeviceId, error: Error) -> Vec<LinkAction> {
        self.metrics.record_connect_failure();
        self.awaiting_scan.remove(id);
        let policy = self.config.connection.clone();
        let Some(slot) = self.slots.get_mut(id) else {
            return Vec::new();
        };
        slot.invalidate_timers();

        if error.is_fatal() {
            warn!("{}: connect failed for good: {}", id, error);
            return slot.link.fail(failure_reason(&error), now());
        }

        slot.failed_connects += 1;
        let attempts = slot.failed_connects;
        if policy.is_exhausted(attempts) {
            warn!("{}: giving up after {} connect attempts", id, attempts);
            let mut actions = slot
                .link
                .fail(FailureReason::MaxRetriesExceeded { attempts }, now());
            actions.push(LinkAction::Emit(DeviceEvent::MaxRetriesExceeded {
                device: id.clone(),
                attempts,
            }));
            return actions;
        }

        // The platform may still hold a half-open connection
        if matches!(
            slot.link.state(),
            ConnectionState::Connected | ConnectionState::Authenticating
        ) {
            self.teardown(id);
        }
        let Some(slot) = self.slots.get_mut(id) else {
            return Vec::new();
        };
        let mut actions = slot.link.abandon_connect();
        let delay = policy.delay_for_attempt(attempts);
        warn!(
            "{}: connect attempt {} failed: {}, retrying in {:?}",
            id, attempts, error, delay
        );
        slot.pending = Some(PendingTimer::ConnectRetry);
        let generation = slot.generation;
        actions.push(LinkAction::Emit(DeviceEvent::ConnectRetryScheduled {
            device: id.clone(),
            attempt: attempts + 1,
            delay_ms: delay.as_millis() as u64,
            error: error.to_string(),
        }));
        self.schedule(
            delay,
            Internal::ConnectRetryDue {
                id: id.clone(),
                generation,
            },
        );
        actions
    }

    /// Schedule a reconnect for a link that dropped mid-download.
    fn check_auto_reconnect(&mut self, id: &DeviceId) {
        let settle = self.config.connection.reconnect_settle();
        let Some(slot) = self.slots.get_mut(id) else {
            return;
        };
        if slot.pending.is_some()
            || !slot.link.should_auto_reconnect()
            || *slot.link.state() != ConnectionState::Disconnected
        {
            return;
        }
        slot.pending = Some(PendingTimer::Reconnect);
        let generation = slot.generation;
        info!("{}: reconnecting in {:?}", id, settle);
        self.emit(DeviceEvent::ReconnectScheduled {
            device: id.clone(),
            delay_ms: settle.as_millis() as u64,
        });
        self.schedule(
            settle,
            Internal::ReconnectDue {
                id: id.clone(),
                generation,
            },
        );
    }

    // ==================== Executing link actions ====================

    async fn apply(&mut self, id: &DeviceId, actions: Vec<LinkAction>) {
        let mut queue: VecDeque<LinkAction> = actions.into();
        while let Some(action) = queue.pop_front() {
            match action {
                LinkAction::Connect { attempt } => self.spawn_io(id, move |t, id| async move {
                    match t.connect(&id).await {
                        Ok(()) => vec![LinkInput::Connected { attempt }],
                        Err(error) => vec![LinkInput::RequestFailed { attempt, error }],
                    }
                }),
                LinkAction::Disconnect => self.spawn_io(id, |t, id| async move {
                    match t.disconnect(&id).await {
                        Ok(()) => vec![LinkInput::Disconnected],
                        Err(e) => {
                            warn!("{}: disconnect failed: {}", id, e);
                            Vec::new()
                        }
                    }
                }),
                LinkAction::DiscoverServices { attempt } => {
                    self.spawn_io(id, move |t, id| async move {
                        match t.discover(&id).await {
                            Ok(services) => {
                                let mut inputs = vec![LinkInput::ServicesDiscovered {
                                    attempt,
                                    services: services.iter().map(|s| s.uuid).collect(),
                                }];
                                inputs.extend(services.into_iter().map(|s| {
                                    LinkInput::CharacteristicsDiscovered {
                                        attempt,
                                        service: s.uuid,
                                        characteristics: s.characteristics,
                                    }
                                }));
                                inputs
                            }
                            Err(error) => vec![LinkInput::RequestFailed { attempt, error }],
                        }
                    })
                }
                LinkAction::Write {
                    attempt,
                    characteristic,
                    payload,
                } => self.spawn_io(id, move |t, id| async move {
                    match t.write(&id, characteristic, &payload).await {
                        Ok(()) => vec![LinkInput::WriteAck { attempt }],
                        Err(error) => vec![LinkInput::RequestFailed { attempt, error }],
                    }
                }),
                LinkAction::Read {
                    attempt,
                    characteristic,
                } => self.spawn_io(id, move |t, id| async move {
                    match t.read(&id, characteristic).await {
                        Ok(value) => vec![LinkInput::Value { attempt, value }],
                        Err(error) => vec![LinkInput::RequestFailed { attempt, error }],
                    }
                }),
                LinkAction::StartTimer { timer, after } => self.schedule(
                    after,
                    Internal::Link {
                        id: id.clone(),
                        input: LinkInput::Timer(timer),
                    },
                ),
                LinkAction::Emit(event) => self.publish(id, event).await,
                LinkAction::LoadCheckpoint => {
                    let loaded = match self.checkpoints.load(id).await {
                        Ok(loaded) => loaded,
                        Err(e) => {
                            warn!("{}: could not load checkpoint: {}", id, e);
                            None
                        }
                    };
                    if let Some(slot) = self.slots.get_mut(id) {
                        queue.extend(slot.link.handle(LinkInput::CheckpointLoaded(loaded), now()));
                    }
                }
                LinkAction::SaveCheckpoint(progress) => {
                    if let Err(e) = self.checkpoints.save(&progress).await {
                        warn!("{}: could not save checkpoint: {}", id, e);
                    }
                }
                LinkAction::ClearCheckpoint => {
                    if let Err(e) = self.checkpoints.clear(id).await {
                        warn!("{}: could not clear checkpoint: {}", id, e);
                    }
                }
                LinkAction::ConnectFailed { error } => {
                    queue.extend(self.connect_failed(id, error));
                }
            }
        }
        self.check_auto_reconnect(id);
    }

    /// Readings reach the repository before subscribers see them.
    async fn publish(&mut self, id: &DeviceId, event: DeviceEvent) {
        match &event {
            DeviceEvent::LiveReading { reading } => {
                if let Err(e) = self.repository.save_live_reading(reading).await {
                    warn!("{}: repository rejected live reading: {}", id, e);
                }
            }
            DeviceEvent::HistoricalReading { reading } => {
                if let Err(e) = self.repository.save_historical_reading(reading).await {
                    warn!("{}: repository rejected history entry: {}", id, e);
                }
            }
            DeviceEvent::StateChanged {
                to: ConnectionState::Connected,
                ..
            } => {
                if let Some(slot) = self.slots.get_mut(id) {
                    slot.failed_connects = 0;
                }
            }
            _ => {}
        }
        self.emit(event);
    }

    fn emit(&self, event: DeviceEvent) {
        self.metrics.observe(&event);
        self.events.send(event);
    }

    fn spawn_io<F, Fut>(&self, id: &DeviceId, request: F)
    where
        F: FnOnce(Arc<dyn BleTransport>, DeviceId) -> Fut + Send + 'static,
        Fut: Future<Output = Vec<LinkInput>> + Send + 'static,
    {
        let transport = Arc::clone(&self.transport);
        let internal = self.internal.clone();
        let id = id.clone();
        tokio::spawn(async move {
            let inputs = request(transport, id.clone()).await;
            for input in inputs {
                let _ = internal.send(Internal::Link {
                    id: id.clone(),
                    input,
                });
            }
        });
    }

    /// Close a platform connection without telling the link.
    fn teardown(&self, id: &DeviceId) {
        let transport = Arc::clone(&self.transport);
        let id = id.clone();
        tokio::spawn(async move {
            if let Err(e) = transport.disconnect(&id).await {
                debug!("{}: teardown disconnect failed: {}", id, e);
            }
        });
    }

    fn schedule(&self, after: Duration, message: Internal) {
        let internal = self.internal.clone();
        tokio::spawn(async move {
            sleep(after).await;
            let _ = internal.send(message);
        });
    }

    fn start_scan(&mut self) {
        if self.scanning {
            return;
        }
        self.scanning = true;
        let transport = Arc::clone(&self.transport);
        let internal = self.internal.clone();
        tokio::spawn(async move {
            if let Err(e) = transport.start_scan().await {
                let _ = internal.send(Internal::ScanFailed(e));
            }
        });
    }

    fn stop_scan_if_idle(&mut self) {
        if !self.scanning || !self.awaiting_scan.is_empty() {
            return;
        }
        self.scanning = false;
        let transport = Arc::clone(&self.transport);
        tokio::spawn(async move {
            if let Err(e) = transport.stop_scan().await {
                debug!("Stopping scan failed: {}", e);
            }
        });
    }
}

/// Builder for a [`ConnectionPool`].
#[must_use]
pub struct PoolBuilder {
    transport: Arc<dyn BleTransport>,
    config: PoolConfig,
    checkpoints: Arc<dyn CheckpointStore>,
    repository: Arc<dyn ReadingRepository>,
}

impl PoolBuilder {
    /// Use this configuration instead of the defaults.
    pub fn config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    /// Persist history checkpoints here. Defaults to memory.
    pub fn checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = store;
        self
    }

    /// Hand readings to this repository. Defaults to discarding them.
    pub fn repository(mut self, repository: Arc<dyn ReadingRepository>) -> Self {
        self.repository = repository;
        self
    }

    /// Validate the configuration and start the pool task.
    ///
    /// Must be called within a Tokio runtime.
    pub fn build(self) -> Result<ConnectionPool> {
        self.config.validate()?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let events = EventDispatcher::new(self.config.events.capacity);
        let metrics = Arc::new(PoolMetrics::new());
        let shutdown = CancellationToken::new();

        let actor = PoolActor {
            transport: self.transport,
            checkpoints: self.checkpoints,
            repository: self.repository,
            link_config: self.config.link_config(),
            config: self.config,
            slots: HashMap::new(),
            awaiting_scan: HashSet::new(),
            scanning: false,
            internal: internal_tx,
            events: events.clone(),
            metrics: Arc::clone(&metrics),
        };
        let task = tokio::spawn(actor.run(command_rx, internal_rx, shutdown.clone()));

        Ok(ConnectionPool {
            commands: command_tx,
            events,
            metrics,
            shutdown,
            task: Some(task),
        })
    }
}

/// Handle to the pool task.
///
/// Every request method returns once the pool has accepted or rejected the
/// request. Outcomes of the device work arrive as [`DeviceEvent`]s. Dropping
/// the handle stops the pool.
pub struct ConnectionPool {
    commands: mpsc::UnboundedSender<Command>,
    events: EventDispatcher,
    metrics: Arc<PoolMetrics>,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("subscribers", &self.events.receiver_count())
            .field("running", &!self.shutdown.is_cancelled())
            .finish()
    }
}

impl ConnectionPool {
    /// Start configuring a pool on top of `transport`.
    pub fn builder(transport: Arc<dyn BleTransport>) -> PoolBuilder {
        PoolBuilder {
            transport,
            config: PoolConfig::default(),
            checkpoints: Arc::new(MemoryCheckpointStore::new()),
            repository: Arc::new(NullRepository),
        }
    }

    /// A pool with default configuration and in-memory checkpoints.
    pub fn new(transport: Arc<dyn BleTransport>) -> Result<Self> {
        Self::builder(transport).build()
    }

    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .map_err(|_| Error::PoolClosed)?;
        rx.await.map_err(|_| Error::PoolClosed)?
    }

    /// Subscribe to events from every device.
    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    /// Counters across all devices.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Connect to a device, scanning for it if the platform does not know it.
    ///
    /// Returns immediately if the link is already connecting or connected.
    /// Fails with [`Error::MaxRetriesExceeded`] until
    /// [`reset_retries`](Self::reset_retries) once the retry budget is spent.
    #[tracing::instrument(level = "info", skip(self), fields(device = %id))]
    pub async fn connect(&self, id: &DeviceId) -> Result<()> {
        self.request(|reply| Command::Connect(id.clone(), reply))
            .await
    }

    /// Connect to several devices. Each gets its own link and retry budget.
    pub async fn connect_to_multiple(&self, ids: &[DeviceId]) -> Vec<(DeviceId, Result<()>)> {
        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            results.push((id.clone(), self.connect(id).await));
        }
        results
    }

    /// Queue a live reading. The reading arrives as [`DeviceEvent::LiveReading`].
    #[tracing::instrument(level = "info", skip(self), fields(device = %id))]
    pub async fn request_live_data(&self, id: &DeviceId) -> Result<()> {
        self.request(|reply| Command::RequestLiveData(id.clone(), reply))
            .await
    }

    /// Start a history download, resuming from a stored checkpoint if one
    /// is fresh.
    #[tracing::instrument(level = "info", skip(self), fields(device = %id))]
    pub async fn request_historical_data(&self, id: &DeviceId) -> Result<()> {
        self.request(|reply| Command::RequestHistory(id.clone(), reply))
            .await
    }

    /// Blink the device LED.
    #[tracing::instrument(level = "info", skip(self), fields(device = %id))]
    pub async fn blink(&self, id: &DeviceId) -> Result<()> {
        self.request(|reply| Command::Blink(id.clone(), reply)).await
    }

    /// Drop all queued work and the connection. No reconnect follows.
    #[tracing::instrument(level = "info", skip(self), fields(device = %id))]
    pub async fn cancel(&self, id: &DeviceId) -> Result<()> {
        self.request(|reply| Command::Cancel(id.clone(), reply)).await
    }

    /// Disconnect gracefully after the current operation.
    #[tracing::instrument(level = "info", skip(self), fields(device = %id))]
    pub async fn disconnect(&self, id: &DeviceId) -> Result<()> {
        self.request(|reply| Command::Disconnect(id.clone(), reply))
            .await
    }

    /// Clear the connect retry counter and leave `Failed`.
    pub async fn reset_retries(&self, id: &DeviceId) -> Result<()> {
        self.request(|reply| Command::ResetRetries(id.clone(), reply))
            .await
    }

    /// Drop an idle link. Returns `false` if the device was unknown and
    /// [`Error::DeviceBusy`] if it is still connected or working.
    pub async fn forget(&self, id: &DeviceId) -> Result<bool> {
        self.request(|reply| Command::Forget(id.clone(), reply))
            .await
    }

    /// Current state of a device, `None` if the pool has no link for it.
    pub async fn state(&self, id: &DeviceId) -> Result<Option<ConnectionState>> {
        self.request(|reply| Command::State(id.clone(), reply)).await
    }

    /// Every device the pool has a link for.
    pub async fn devices(&self) -> Result<Vec<DeviceSummary>> {
        self.request(Command::Devices).await
    }

    /// Wait until the state of `id` satisfies `predicate`.
    pub async fn wait_for_state(
        &self,
        id: &DeviceId,
        timeout: Duration,
        predicate: impl Fn(&ConnectionState) -> bool,
    ) -> Result<ConnectionState> {
        let mut events = self.subscribe();
        if let Some(state) = self.state(id).await?
            && predicate(&state)
        {
            return Ok(state);
        }

        let wait = async {
            loop {
                match events.recv().await {
                    Ok(DeviceEvent::StateChanged { device, to, .. })
                        if &device == id && predicate(&to) =>
                    {
                        return Ok(to);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        if let Some(state) = self.state(id).await?
                            && predicate(&state)
                        {
                            return Ok(state);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return Err(Error::PoolClosed),
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| Error::timeout("wait_for_state", timeout))?
    }

    /// Stop the pool: cancel every link and wait for the task to end.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockSensor, MockTransport};

    const WAIT: Duration = Duration::from_secs(120);

    fn pool(transport: &Arc<MockTransport>) -> ConnectionPool {
        ConnectionPool::builder(Arc::clone(transport) as Arc<dyn BleTransport>)
            .config(PoolConfig::fast())
            .build()
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_known_device_becomes_ready() {
        let transport = Arc::new(MockTransport::new());
        let id = DeviceId::new("C4:7C:8D:6A:00:01");
        transport.add_device(id.clone(), MockSensor::new());
        let pool = pool(&transport);

        pool.connect(&id).await.unwrap();
        let state = pool
            .wait_for_state(&id, WAIT, ConnectionState::is_ready)
            .await
            .unwrap();
        assert_eq!(state, ConnectionState::Ready);
        assert!(transport.is_authenticated(&id));

        // Connecting again is a no-op
        pool.connect(&id).await.unwrap();
        let devices = pool.devices().await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].failed_connects, 0);
        assert_eq!(pool.metrics().connect_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forget_requires_idle_link() {
        let transport = Arc::new(MockTransport::new());
        let id = DeviceId::new("C4:7C:8D:6A:00:02");
        transport.add_device(id.clone(), MockSensor::new());
        let pool = pool(&transport);

        assert!(!pool.forget(&id).await.unwrap());
        pool.connect(&id).await.unwrap();
        pool.wait_for_state(&id, WAIT, ConnectionState::is_ready)
            .await
            .unwrap();
        assert!(matches!(pool.forget(&id).await, Err(Error::DeviceBusy(_))));

        pool.disconnect(&id).await.unwrap();
        pool.wait_for_state(&id, WAIT, |s| *s == ConnectionState::Disconnected)
            .await
            .unwrap();
        assert!(pool.forget(&id).await.unwrap());
        assert_eq!(pool.state(&id).await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_device_exhausts_connect_budget() {
        let transport = Arc::new(MockTransport::new());
        let id = DeviceId::new("C4:7C:8D:6A:00:03");
        let pool = pool(&transport);
        let mut events = pool.subscribe();

        pool.connect(&id).await.unwrap();
        let state = pool
            .wait_for_state(&id, WAIT, ConnectionState::is_failed)
            .await
            .unwrap();
        assert_eq!(
            state,
            ConnectionState::Failed(FailureReason::MaxRetriesExceeded { attempts: 3 })
        );

        let mut retries = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let DeviceEvent::ConnectRetryScheduled {
                attempt, delay_ms, ..
            } = event
            {
                retries.push((attempt, delay_ms));
            }
        }
        assert_eq!(retries, vec![(2, 250), (3, 500)]);

        assert!(matches!(
            pool.connect(&id).await,
            Err(Error::MaxRetriesExceeded { attempts: 3, .. })
        ));

        transport.add_device(id.clone(), MockSensor::new());
        pool.reset_retries(&id).await.unwrap();
        assert_eq!(
            pool.state(&id).await.unwrap(),
            Some(ConnectionState::Disconnected)
        );
        pool.connect(&id).await.unwrap();
        pool.wait_for_state(&id, WAIT, ConnectionState::is_ready)
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_spent_budget_survives_disconnect_and_cancel() {
        let transport = Arc::new(MockTransport::new());
        let id = DeviceId::new("C4:7C:8D:6A:00:05");
        let pool = pool(&transport);

        pool.connect(&id).await.unwrap();
        pool.wait_for_state(&id, WAIT, ConnectionState::is_failed)
            .await
            .unwrap();
        assert_eq!(pool.metrics().connect_attempts, 3);

        pool.disconnect(&id).await.unwrap();
        assert_eq!(
            pool.state(&id).await.unwrap(),
            Some(ConnectionState::Disconnected)
        );
        assert!(matches!(
            pool.connect(&id).await,
            Err(Error::MaxRetriesExceeded { attempts: 3, .. })
        ));

        pool.cancel(&id).await.unwrap();
        assert!(matches!(
            pool.connect(&id).await,
            Err(Error::MaxRetriesExceeded { attempts: 3, .. })
        ));
        assert_eq!(pool.metrics().connect_attempts, 3);
        assert_eq!(pool.devices().await.unwrap()[0].failed_connects, 3);

        pool.reset_retries(&id).await.unwrap();
        transport.add_device(id.clone(), MockSensor::new());
        pool.connect(&id).await.unwrap();
        pool.wait_for_state(&id, WAIT, ConnectionState::is_ready)
            .await
            .unwrap();
        assert_eq!(pool.metrics().connect_attempts, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejects_bad_requests() {
        let transport = Arc::new(MockTransport::new());
        let pool = pool(&transport);

        assert!(matches!(
            pool.connect(&DeviceId::new("  ")).await,
            Err(Error::InvalidDeviceId(_))
        ));
        assert!(matches!(
            pool.request_live_data(&DeviceId::new("C4:7C:8D:6A:00:04")).await,
            Err(Error::NotConnected)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_config_is_rejected() {
        let transport = Arc::new(MockTransport::new());
        let mut config = PoolConfig::fast();
        config.events.capacity = 0;
        let result = ConnectionPool::builder(transport as Arc<dyn BleTransport>)
            .config(config)
            .build();
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_fails_after_shutdown() {
        let transport = Arc::new(MockTransport::new());
        let pool = pool(&transport);
        let commands = pool.commands.clone();
        pool.shutdown().await;

        let (tx, rx) = oneshot::channel();
        let _ = commands.send(Command::Devices(tx));
        assert!(rx.await.is_err());
    }
}
