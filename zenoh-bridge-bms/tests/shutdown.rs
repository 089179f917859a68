//! Shutdown while devices hang in the middle of a read.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use common::{Behavior, HungAdapter, MockDriver, device, sessions};
use zenoh_bridge_bms::cache::ValueCache;
use zenoh_bridge_bms::recovery::{AdapterRecoveryManager, RecoveryPolicy};
use zenoh_bridge_bms::scheduler::{SamplingMode, Scheduler};
use zenoh_bridge_bms::session::{SessionPolicy, SessionState};
use zenoh_bridge_bms::watchdog::Watchdog;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

async fn stop_hung_devices(mode: SamplingMode) {
    let devices = [device("A"), device("B"), device("C")];
    let driver = Arc::new(MockDriver::new(&[
        ("A", Behavior::Hung),
        ("B", Behavior::Hung),
        ("C", Behavior::Hung),
    ]));
    let policy = SessionPolicy {
        io_timeout: Duration::from_secs(60),
        shutdown_timeout: SHUTDOWN_TIMEOUT,
        ..SessionPolicy::default()
    };

    let scheduler = Scheduler::new(
        sessions(&driver, &devices, policy),
        mode,
        Duration::from_secs(1),
        Arc::new(ValueCache::new()),
    );
    let handles = scheduler.sessions().to_vec();

    let mut dog = Watchdog::new(Duration::from_secs(300));
    let token = CancellationToken::new();
    let sampling = tokio::spawn(scheduler.run(dog.heartbeat("scheduler"), token.clone()));

    tokio::time::sleep(Duration::from_millis(1_500)).await;

    let started = Instant::now();
    token.cancel();
    sampling.await.unwrap();

    // sessions close in parallel, each within its own bound
    assert!(started.elapsed() <= SHUTDOWN_TIMEOUT + Duration::from_millis(100));
    for handle in handles {
        assert_eq!(handle.lock().await.state(), SessionState::Closed);
    }
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_shutdown_is_bounded() {
    stop_hung_devices(SamplingMode::Concurrent { max_in_flight: 3 }).await;
}

#[tokio::test(start_paused = true)]
async fn test_sequential_shutdown_is_bounded() {
    stop_hung_devices(SamplingMode::Sequential).await;
}

#[tokio::test(start_paused = true)]
async fn test_closed_sessions_are_not_polled_again() {
    let devices = [device("A")];
    let driver = Arc::new(MockDriver::new(&[("A", Behavior::Healthy)]));
    let scheduler = Scheduler::new(
        sessions(&driver, &devices, SessionPolicy::default()),
        SamplingMode::Sequential,
        Duration::from_secs(1),
        Arc::new(ValueCache::new()),
    );
    let handles = scheduler.sessions().to_vec();
    scheduler.close_all().await;

    let mut session = handles[0].lock().await;
    assert!(matches!(
        session.poll(0).await,
        zenoh_bridge_bms::session::PollOutcome::Closed
    ));
    assert_eq!(driver.stats("A").connects.load(std::sync::atomic::Ordering::SeqCst), 0);
}

async fn stop_during_power_cycle(mode: SamplingMode) {
    let devices = [device("A"), device("B")];
    let driver = Arc::new(MockDriver::new(&[
        ("A", Behavior::Unreachable),
        ("B", Behavior::Unreachable),
    ]));
    let policy = SessionPolicy {
        failure_cap: 1,
        ..SessionPolicy::default()
    };

    let adapter = Arc::new(HungAdapter::default());
    let recovery = Arc::new(AdapterRecoveryManager::new(
        RecoveryPolicy {
            window: Duration::from_secs(30),
            failure_threshold: 0.5,
            sustain: Duration::from_secs(2),
            settle: Duration::from_secs(1),
        },
        adapter.clone(),
        true,
    ));

    let scheduler = Scheduler::new(
        sessions(&driver, &devices, policy),
        mode,
        Duration::from_secs(1),
        Arc::new(ValueCache::new()),
    )
    .with_recovery(recovery.clone());

    let mut dog = Watchdog::new(Duration::from_secs(300));
    let token = CancellationToken::new();
    let sampling = tokio::spawn(scheduler.run(dog.heartbeat("scheduler"), token.clone()));

    // breach at 0s, power-cycle from 2s, stuck on power off
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(adapter.calls.load(std::sync::atomic::Ordering::SeqCst), 1);

    let started = Instant::now();
    token.cancel();
    sampling.await.unwrap();

    assert!(started.elapsed() < Duration::from_millis(100));
    assert_eq!(recovery.generation(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_stop_during_power_cycle() {
    stop_during_power_cycle(SamplingMode::Concurrent { max_in_flight: 2 }).await;
}

#[tokio::test(start_paused = true)]
async fn test_sequential_stop_during_power_cycle() {
    stop_during_power_cycle(SamplingMode::Sequential).await;
}
