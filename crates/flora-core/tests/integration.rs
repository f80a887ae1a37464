//! End-to-end tests of the connection pool against simulated devices.
//!
//! All tests run on a paused Tokio clock, so timeouts, retry delays and batch
//! pauses elapse instantly once every task is idle.

use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;

use flora_core::flora_types::commands::AUTH_KEY;
use flora_core::flora_types::uuids::{AUTHENTICATION, REAL_TIME_VALUES};
use flora_core::{
    BleTransport, CheckpointStore, ConnectionPool, ConnectionState, DeviceEvent, DeviceId,
    EventReceiver, FailureReason, HistorySessionProgress, MemoryCheckpointStore, MemoryRepository,
    MockAuth, MockRequest, MockSensor, MockTransport, OperationKind, PoolConfig, SensorValues,
};

const WAIT: Duration = Duration::from_secs(600);

struct Harness {
    transport: Arc<MockTransport>,
    checkpoints: Arc<MemoryCheckpointStore>,
    repository: Arc<MemoryRepository>,
    pool: ConnectionPool,
    events: EventReceiver,
}

fn harness(config: PoolConfig) -> Harness {
    let transport = Arc::new(MockTransport::new());
    let checkpoints = Arc::new(MemoryCheckpointStore::new());
    let repository = Arc::new(MemoryRepository::new());
    let pool = ConnectionPool::builder(Arc::clone(&transport) as Arc<dyn BleTransport>)
        .config(config)
        .checkpoint_store(Arc::clone(&checkpoints) as Arc<dyn CheckpointStore>)
        .repository(Arc::clone(&repository) as Arc<dyn flora_core::ReadingRepository>)
        .build()
        .unwrap();
    let events = pool.subscribe();
    Harness {
        transport,
        checkpoints,
        repository,
        pool,
        events,
    }
}

/// Collect events until one matches `stop`, returning all of them.
async fn collect_until(
    events: &mut EventReceiver,
    stop: impl Fn(&DeviceEvent) -> bool,
) -> Vec<DeviceEvent> {
    let mut seen = Vec::new();
    tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv().await.unwrap();
            let done = stop(&event);
            seen.push(event);
            if done {
                break;
            }
        }
    })
    .await
    .expect("event did not arrive in time");
    seen
}

async fn connect_ready(h: &Harness, id: &DeviceId) {
    h.pool.connect(id).await.unwrap();
    h.pool
        .wait_for_state(id, WAIT, ConnectionState::is_ready)
        .await
        .unwrap();
}

fn is_history_end(event: &DeviceEvent) -> bool {
    matches!(
        event,
        DeviceEvent::HistoryCompleted { .. } | DeviceEvent::HistoryAborted { .. }
    )
}

#[tokio::test(start_paused = true)]
async fn test_history_download_reads_every_entry_in_order() {
    let mut h = harness(PoolConfig::fast());
    let id = DeviceId::new("C4:7C:8D:6A:10:01");
    h.transport
        .add_device(id.clone(), MockSensor::new().hourly_history(5));

    connect_ready(&h, &id).await;
    h.pool.request_historical_data(&id).await.unwrap();
    let events = collect_until(&mut h.events, is_history_end).await;

    assert_eq!(h.transport.history_addresses(&id), vec![0, 1, 2, 3, 4]);
    assert!(events.iter().any(|e| matches!(
        e,
        DeviceEvent::HistoryStarted {
            start_index: 0,
            total_entries: 5,
            resumed: false,
            ..
        }
    )));
    assert!(matches!(
        events.last(),
        Some(DeviceEvent::HistoryCompleted {
            total_entries: 5,
            rejected: 0,
            ..
        })
    ));

    let stored = h.repository.history_for(&id);
    assert_eq!(stored.len(), 5);
    assert!(stored.windows(2).all(|w| w[0].recorded_at < w[1].recorded_at));
    assert!(h.checkpoints.is_empty().await);
    assert_eq!(h.pool.metrics().history_entries, 5);
}

#[tokio::test(start_paused = true)]
async fn test_live_reading_reaches_repository_and_subscribers() {
    let mut h = harness(PoolConfig::fast());
    let id = DeviceId::new("C4:7C:8D:6A:10:02");
    let values = SensorValues {
        temperature: 10.0,
        brightness: 10,
        moisture: 50,
        conductivity: 100,
    };
    h.transport.add_device(
        id.clone(),
        MockSensor::new().values(values).battery(77).firmware("3.3.5"),
    );

    connect_ready(&h, &id).await;
    h.pool.request_live_data(&id).await.unwrap();
    let events = collect_until(&mut h.events, |e| {
        matches!(
            e,
            DeviceEvent::OperationCompleted {
                operation: OperationKind::ReadLiveData,
                ..
            }
        )
    })
    .await;

    let reading = events
        .iter()
        .find_map(|e| match e {
            DeviceEvent::LiveReading { reading } => Some(reading.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(reading.values, values);
    assert_eq!(h.repository.live_readings(), vec![reading]);

    let status = events
        .iter()
        .find_map(|e| match e {
            DeviceEvent::DeviceStatus { info, .. } => Some(info.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(status.battery, 77);
    assert_eq!(status.firmware, "3.3.5");
}

#[tokio::test(start_paused = true)]
async fn test_live_read_retries_transient_failures() {
    // Two retries for live reads
    let mut h = harness(PoolConfig::default());
    let id = DeviceId::new("C4:7C:8D:6A:10:03");
    h.transport.add_device(id.clone(), MockSensor::new());

    connect_ready(&h, &id).await;
    h.transport.fail_reads(&id, REAL_TIME_VALUES, 2);
    h.pool.request_live_data(&id).await.unwrap();
    let events = collect_until(&mut h.events, |e| {
        matches!(
            e,
            DeviceEvent::OperationCompleted {
                operation: OperationKind::ReadLiveData,
                ..
            } | DeviceEvent::OperationFailed {
                operation: OperationKind::ReadLiveData,
                ..
            }
        )
    })
    .await;

    assert!(matches!(
        events.last(),
        Some(DeviceEvent::OperationCompleted {
            operation: OperationKind::ReadLiveData,
            attempts: 3,
            ..
        })
    ));
    let retries = events
        .iter()
        .filter(|e| matches!(e, DeviceEvent::OperationRetrying { .. }))
        .count();
    assert_eq!(retries, 2);
    assert_eq!(
        h.pool
            .metrics()
            .operation(OperationKind::ReadLiveData)
            .retry_count,
        2
    );
}

#[tokio::test(start_paused = true)]
async fn test_authentication_timeout_falls_back_to_ready() {
    let mut h = harness(PoolConfig::default());
    let id = DeviceId::new("C4:7C:8D:6A:10:04");
    h.transport.add_device(id.clone(), MockSensor::new());
    // Slower than the 4s handshake deadline, faster than the connect budget
    h.transport.set_latency(Duration::from_millis(4_500));

    h.pool.connect(&id).await.unwrap();
    let events = collect_until(&mut h.events, |e| {
        matches!(
            e,
            DeviceEvent::StateChanged {
                to: ConnectionState::Ready | ConnectionState::Failed(_),
                ..
            }
        )
    })
    .await;

    assert!(matches!(
        events.last(),
        Some(DeviceEvent::StateChanged {
            from: ConnectionState::Authenticating,
            to: ConnectionState::Ready,
            ..
        })
    ));
    let key_writes = h.transport.count_requests(|r| {
        matches!(r, MockRequest::Write(_, AUTHENTICATION, payload) if payload.as_slice() == AUTH_KEY)
    });
    assert_eq!(key_writes, 0);
    assert!(!h.transport.is_authenticated(&id));
}

#[tokio::test(start_paused = true)]
async fn test_verified_and_absent_authentication() {
    let h = harness(PoolConfig::fast());
    let verified = DeviceId::new("C4:7C:8D:6A:10:05");
    let absent = DeviceId::new("C4:7C:8D:6A:10:06");
    h.transport.add_device(verified.clone(), MockSensor::new());
    h.transport
        .add_device(absent.clone(), MockSensor::new().auth(MockAuth::Absent));

    connect_ready(&h, &verified).await;
    connect_ready(&h, &absent).await;

    assert!(h.transport.is_authenticated(&verified));
    let absent_auth_requests = h.transport.count_requests(|r| match r {
        MockRequest::Write(d, c, _) | MockRequest::Read(d, c) => {
            d == &absent && *c == AUTHENTICATION
        }
        _ => false,
    });
    assert_eq!(absent_auth_requests, 0);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_download_reconnects_and_resumes() {
    let mut h = harness(PoolConfig::fast());
    let id = DeviceId::new("C4:7C:8D:6A:10:07");
    h.transport
        .add_device(id.clone(), MockSensor::new().hourly_history(100));
    h.transport.drop_link_at_entry(&id, 37);

    connect_ready(&h, &id).await;
    h.pool.request_historical_data(&id).await.unwrap();
    let events = collect_until(&mut h.events, is_history_end).await;

    assert!(matches!(
        events.last(),
        Some(DeviceEvent::HistoryCompleted {
            total_entries: 100,
            ..
        })
    ));
    assert!(
        events
            .iter()
            .any(|e| matches!(e, DeviceEvent::ReconnectScheduled { .. }))
    );
    assert!(events.iter().any(|e| matches!(
        e,
        DeviceEvent::HistoryStarted {
            start_index: 37,
            total_entries: 100,
            resumed: true,
            ..
        }
    )));

    // Nothing before 37 is fetched twice
    let addresses = h.transport.history_addresses(&id);
    for index in 0..37u16 {
        assert_eq!(addresses.iter().filter(|a| **a == index).count(), 1);
    }
    let drop_at = addresses.iter().position(|a| *a == 37).unwrap();
    assert!(addresses[drop_at..].iter().all(|a| *a >= 37));
    assert_eq!(addresses.last(), Some(&99));

    assert_eq!(h.repository.history_for(&id).len(), 100);
    assert!(h.transport.count_requests(|r| matches!(r, MockRequest::Connect(_))) >= 2);
}

#[tokio::test(start_paused = true)]
async fn test_consecutive_corrupt_entries_abort_session() {
    let mut h = harness(PoolConfig::fast());
    let id = DeviceId::new("C4:7C:8D:6A:10:08");
    let mut sensor = MockSensor::new().hourly_history(30);
    for index in 0..11 {
        sensor = sensor.corrupt_entry(index);
    }
    h.transport.add_device(id.clone(), sensor);

    connect_ready(&h, &id).await;
    h.pool.request_historical_data(&id).await.unwrap();
    let events = collect_until(&mut h.events, is_history_end).await;

    assert!(matches!(
        events.last(),
        Some(DeviceEvent::HistoryAborted {
            current_index: 11,
            total_entries: 30,
            ..
        })
    ));
    let rejected = events
        .iter()
        .filter(|e| matches!(e, DeviceEvent::EntryRejected { .. }))
        .count();
    assert_eq!(rejected, 11);
    assert_eq!(
        h.transport.history_addresses(&id),
        (0..11).collect::<Vec<u16>>()
    );
    assert_eq!(
        h.pool.state(&id).await.unwrap(),
        Some(ConnectionState::Ready)
    );
    assert!(h.repository.history_for(&id).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_isolated_corrupt_entry_is_skipped() {
    let mut h = harness(PoolConfig::fast());
    let id = DeviceId::new("C4:7C:8D:6A:10:09");
    h.transport.add_device(
        id.clone(),
        MockSensor::new().hourly_history(8).corrupt_entry(3),
    );

    connect_ready(&h, &id).await;
    h.pool.request_historical_data(&id).await.unwrap();
    let events = collect_until(&mut h.events, is_history_end).await;

    assert!(matches!(
        events.last(),
        Some(DeviceEvent::HistoryCompleted {
            total_entries: 8,
            rejected: 1,
            ..
        })
    ));
    let indices: Vec<u16> = h
        .repository
        .history_for(&id)
        .iter()
        .map(|r| r.index)
        .collect();
    assert_eq!(indices, vec![0, 1, 2, 4, 5, 6, 7]);
}

#[tokio::test(start_paused = true)]
async fn test_stored_checkpoint_resumes_download() {
    let mut h = harness(PoolConfig::fast());
    let id = DeviceId::new("C4:7C:8D:6A:10:0A");
    h.transport
        .add_device(id.clone(), MockSensor::new().hourly_history(50));
    h.checkpoints
        .save(&HistorySessionProgress {
            device_id: id.clone(),
            current_index: 40,
            total_entries: 50,
            last_update: OffsetDateTime::now_utc(),
            device_boot_time: None,
        })
        .await
        .unwrap();

    connect_ready(&h, &id).await;
    h.pool.request_historical_data(&id).await.unwrap();
    collect_until(&mut h.events, is_history_end).await;

    assert_eq!(
        h.transport.history_addresses(&id),
        (40..50).collect::<Vec<u16>>()
    );
    assert!(h.checkpoints.is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn test_expired_checkpoint_is_discarded() {
    let mut h = harness(PoolConfig::fast());
    let id = DeviceId::new("C4:7C:8D:6A:10:0B");
    h.transport
        .add_device(id.clone(), MockSensor::new().hourly_history(4));
    h.checkpoints
        .save(&HistorySessionProgress {
            device_id: id.clone(),
            current_index: 2,
            total_entries: 4,
            last_update: OffsetDateTime::now_utc() - time::Duration::hours(25),
            device_boot_time: None,
        })
        .await
        .unwrap();

    connect_ready(&h, &id).await;
    h.pool.request_historical_data(&id).await.unwrap();
    collect_until(&mut h.events, is_history_end).await;

    assert_eq!(h.transport.history_addresses(&id), vec![0, 1, 2, 3]);
}

#[tokio::test(start_paused = true)]
async fn test_second_history_request_is_rejected() {
    let h = harness(PoolConfig::fast());
    let id = DeviceId::new("C4:7C:8D:6A:10:0C");
    h.transport
        .add_device(id.clone(), MockSensor::new().hourly_history(40));

    connect_ready(&h, &id).await;
    h.pool.request_historical_data(&id).await.unwrap();
    assert!(matches!(
        h.pool.request_historical_data(&id).await,
        Err(flora_core::Error::HistoryInProgress(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_connect_retries_then_succeeds() {
    let mut h = harness(PoolConfig::fast());
    let id = DeviceId::new("C4:7C:8D:6A:10:0D");
    h.transport.add_device(id.clone(), MockSensor::new());
    h.transport.fail_connects(&id, 2);

    h.pool.connect(&id).await.unwrap();
    let events = collect_until(&mut h.events, |e| {
        matches!(
            e,
            DeviceEvent::StateChanged {
                to: ConnectionState::Ready,
                ..
            }
        )
    })
    .await;

    let scheduled: Vec<(u32, u64)> = events
        .iter()
        .filter_map(|e| match e {
            DeviceEvent::ConnectRetryScheduled {
                attempt, delay_ms, ..
            } => Some((*attempt, *delay_ms)),
            _ => None,
        })
        .collect();
    assert_eq!(scheduled, vec![(2, 250), (3, 500)]);

    let devices = h.pool.devices().await.unwrap();
    assert_eq!(devices[0].failed_connects, 0);
    let metrics = h.pool.metrics();
    assert_eq!(metrics.connect_attempts, 3);
    assert_eq!(metrics.connect_failures, 2);
}

#[tokio::test(start_paused = true)]
async fn test_slow_connects_time_out_each_attempt() {
    let mut h = harness(PoolConfig::default());
    let id = DeviceId::new("C4:7C:8D:6A:10:0E");
    h.transport.add_device(id.clone(), MockSensor::new());
    h.transport.set_latency(Duration::from_secs(11));

    let started = tokio::time::Instant::now();
    h.pool.connect(&id).await.unwrap();
    let events = collect_until(&mut h.events, |e| {
        matches!(
            e,
            DeviceEvent::StateChanged {
                to: ConnectionState::Failed(_),
                ..
            }
        )
    })
    .await;
    let elapsed = started.elapsed();

    // Three 10 s attempts separated by 1 s and 2 s backoff
    assert!(elapsed >= Duration::from_secs(33), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(34), "elapsed {:?}", elapsed);
    assert_eq!(
        h.transport
            .count_requests(|r| matches!(r, MockRequest::Connect(_))),
        3
    );
    assert_eq!(h.pool.metrics().connect_attempts, 3);
    assert!(events.iter().any(|e| matches!(
        e,
        DeviceEvent::StateChanged {
            to: ConnectionState::Failed(FailureReason::MaxRetriesExceeded { attempts: 3 }),
            ..
        }
    )));
    assert!(
        !events
            .iter()
            .any(|e| matches!(e, DeviceEvent::StateChanged { to, .. } if to.is_ready()))
    );
}

#[tokio::test(start_paused = true)]
async fn test_advertising_device_is_found_by_scan() {
    let mut h = harness(PoolConfig::fast());
    let id = DeviceId::new("C4:7C:8D:6A:10:0E");
    h.transport.add_advertising_device(id.clone(), MockSensor::new());
    h.transport.set_scan_delay(Duration::from_secs(2));

    connect_ready(&h, &id).await;

    assert!(
        h.transport
            .count_requests(|r| matches!(r, MockRequest::StartScan))
            >= 1
    );
    let mut discovered = false;
    while let Ok(event) = h.events.try_recv() {
        if matches!(event, DeviceEvent::Discovered { ref device, .. } if device == &id) {
            discovered = true;
        }
    }
    assert!(discovered);
    tokio::task::yield_now().await;
    assert!(!h.transport.is_scanning());
}

#[tokio::test(start_paused = true)]
async fn test_blink_and_cancel() {
    let mut h = harness(PoolConfig::fast());
    let id = DeviceId::new("C4:7C:8D:6A:10:0F");
    h.transport.add_device(id.clone(), MockSensor::new());

    connect_ready(&h, &id).await;
    h.pool.blink(&id).await.unwrap();
    collect_until(&mut h.events, |e| {
        matches!(
            e,
            DeviceEvent::OperationCompleted {
                operation: OperationKind::Blink,
                ..
            }
        )
    })
    .await;
    assert_eq!(h.transport.blink_count(&id), 1);

    h.pool.cancel(&id).await.unwrap();
    let state = h
        .pool
        .wait_for_state(&id, WAIT, |s| *s == ConnectionState::Disconnected)
        .await
        .unwrap();
    assert_eq!(state, ConnectionState::Disconnected);
    assert!(h.pool.forget(&id).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_adapter_loss_fails_connected_links() {
    let h = harness(PoolConfig::fast());
    let id = DeviceId::new("C4:7C:8D:6A:10:10");
    h.transport.add_device(id.clone(), MockSensor::new());

    connect_ready(&h, &id).await;
    h.transport.drop_adapter("powered off");
    let state = h
        .pool
        .wait_for_state(&id, WAIT, ConnectionState::is_failed)
        .await
        .unwrap();
    assert!(matches!(
        state,
        ConnectionState::Failed(FailureReason::RadioUnavailable { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_devices_are_independent() {
    let mut h = harness(PoolConfig::fast());
    let healthy = DeviceId::new("C4:7C:8D:6A:10:11");
    let missing = DeviceId::new("C4:7C:8D:6A:10:12");
    h.transport
        .add_device(healthy.clone(), MockSensor::new().hourly_history(3));

    let results = h
        .pool
        .connect_to_multiple(&[healthy.clone(), missing.clone()])
        .await;
    assert!(results.iter().all(|(_, r)| r.is_ok()));

    h.pool
        .wait_for_state(&healthy, WAIT, ConnectionState::is_ready)
        .await
        .unwrap();
    h.pool.request_historical_data(&healthy).await.unwrap();
    collect_until(&mut h.events, is_history_end).await;

    let state = h
        .pool
        .wait_for_state(&missing, WAIT, ConnectionState::is_failed)
        .await
        .unwrap();
    assert_eq!(
        state,
        ConnectionState::Failed(FailureReason::MaxRetriesExceeded { attempts: 3 })
    );
    assert_eq!(
        h.pool.state(&healthy).await.unwrap(),
        Some(ConnectionState::Ready)
    );
    assert_eq!(h.repository.history_for(&healthy).len(), 3);
}
