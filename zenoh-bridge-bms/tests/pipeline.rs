//! Scheduler, cache and publish pipeline running together on a paused clock.

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use batmon_common::KeyExprBuilder;
use tokio_util::sync::CancellationToken;

use common::{Behavior, CountingAdapter, MockDriver, RecordingSink, device, sessions};
use zenoh_bridge_bms::cache::ValueCache;
use zenoh_bridge_bms::publish::PublishPipeline;
use zenoh_bridge_bms::recovery::{AdapterRecoveryManager, RecoveryPolicy};
use zenoh_bridge_bms::scheduler::{SamplingMode, Scheduler};
use zenoh_bridge_bms::session::SessionPolicy;
use zenoh_bridge_bms::watchdog::Watchdog;

fn secs(s: u64) -> Duration {
    Duration::from_secs(s)
}

#[tokio::test(start_paused = true)]
async fn test_healthy_device_published_while_absent_device_backs_off() {
    let devices = [device("A"), device("B")];
    let driver = Arc::new(MockDriver::new(&[
        ("A", Behavior::Healthy),
        ("B", Behavior::Unreachable),
    ]));
    let policy = SessionPolicy {
        keep_alive: false,
        failure_cap: 3,
        ..SessionPolicy::default()
    };

    let cache = Arc::new(ValueCache::new());
    let scheduler = Scheduler::new(
        sessions(&driver, &devices, policy),
        SamplingMode::Sequential,
        secs(1),
        cache.clone(),
    );
    let handles = scheduler.sessions().to_vec();

    let sink = Arc::new(RecordingSink::default());
    let pipeline = PublishPipeline::new(
        cache,
        &devices,
        KeyExprBuilder::new("batmon/bms"),
        secs(5),
        sink.clone(),
    );

    let mut dog = Watchdog::new(secs(300));
    let token = CancellationToken::new();
    let sampling = tokio::spawn(scheduler.run(dog.heartbeat("scheduler"), token.clone()));
    let publishing = tokio::spawn(pipeline.run(secs(2), dog.heartbeat("publish"), token.clone()));

    tokio::time::sleep(Duration::from_millis(6_100)).await;

    assert!(sink.frames_with("A") >= 2);
    assert_eq!(sink.frames_with("B"), 0);
    // attempts at 0s, 2s and 5s
    assert_eq!(handles[1].lock().await.consecutive_failures(), 3);
    assert_eq!(driver.stats("B").connects.load(Ordering::SeqCst), 3);

    tokio::time::sleep(secs(14)).await;

    // the count stays at the cap while attempts go on every 5 ticks
    assert_eq!(handles[1].lock().await.consecutive_failures(), 3);
    assert_eq!(driver.stats("B").connects.load(Ordering::SeqCst), 6);
    assert_eq!(sink.frames_with("B"), 0);
    assert_eq!(handles[0].lock().await.consecutive_failures(), 0);

    token.cancel();
    sampling.await.unwrap();
    publishing.await.unwrap();

    let keys: Vec<_> = sink.frames().last().unwrap().entries.iter().map(|e| e.key.clone()).collect();
    assert!(keys.contains(&"batmon/bms/A/voltage".to_string()));
    assert!(keys.contains(&"batmon/bms/A/cell_voltages/delta".to_string()));
}

async fn run_dying_device(keep_alive: bool) -> Arc<RecordingSink> {
    let devices = [device("A")];
    let driver = Arc::new(MockDriver::new(&[("A", Behavior::DiesAfter(1))]));
    let policy = SessionPolicy {
        keep_alive,
        ..SessionPolicy::default()
    };

    let cache = Arc::new(ValueCache::new());
    let scheduler = Scheduler::new(
        sessions(&driver, &devices, policy),
        SamplingMode::Sequential,
        secs(1),
        cache.clone(),
    );
    let sink = Arc::new(RecordingSink::default());
    let pipeline = PublishPipeline::new(
        cache,
        &devices,
        KeyExprBuilder::new("batmon/bms"),
        secs(5),
        sink.clone(),
    )
    .with_keep_alive(keep_alive);

    let mut dog = Watchdog::new(secs(300));
    let token = CancellationToken::new();
    let sampling = tokio::spawn(scheduler.run(dog.heartbeat("scheduler"), token.clone()));
    let publishing = tokio::spawn(pipeline.run(secs(1), dog.heartbeat("publish"), token.clone()));

    tokio::time::sleep(Duration::from_millis(12_100)).await;
    token.cancel();
    sampling.await.unwrap();
    publishing.await.unwrap();

    sink
}

#[tokio::test(start_paused = true)]
async fn test_stale_values_dropped_without_keep_alive() {
    let sink = run_dying_device(false).await;
    let frames = sink.frames();

    assert!(!frames.is_empty());
    // one sample at 0s, stale after 5s
    assert!(frames.len() <= 6);
    assert!(frames.iter().flat_map(|f| &f.entries).all(|e| !e.point.stale));
}

#[tokio::test(start_paused = true)]
async fn test_stale_values_republished_with_keep_alive() {
    let sink = run_dying_device(true).await;
    let frames = sink.frames();

    assert!(frames.len() >= 12);
    let last = frames.last().unwrap();
    assert!(last.entries.iter().any(|e| e.key == "batmon/bms/A/voltage"));
    assert!(last.entries.iter().all(|e| e.point.stale));
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_mode_keeps_one_poll_per_device() {
    let devices = [device("A"), device("B"), device("C")];
    let driver = Arc::new(
        MockDriver::new(&[
            ("A", Behavior::Healthy),
            ("B", Behavior::Healthy),
            ("C", Behavior::Healthy),
        ])
        .with_read_delay(Duration::from_millis(2_500)),
    );
    let policy = SessionPolicy {
        io_timeout: secs(10),
        ..SessionPolicy::default()
    };

    let cache = Arc::new(ValueCache::new());
    let scheduler = Scheduler::new(
        sessions(&driver, &devices, policy),
        SamplingMode::Concurrent { max_in_flight: 2 },
        secs(1),
        cache.clone(),
    );

    let mut dog = Watchdog::new(secs(300));
    let token = CancellationToken::new();
    let sampling = tokio::spawn(scheduler.run(dog.heartbeat("scheduler"), token.clone()));

    tokio::time::sleep(Duration::from_millis(20_100)).await;
    token.cancel();
    sampling.await.unwrap();

    for address in ["A", "B", "C"] {
        let stats = driver.stats(address);
        assert_eq!(stats.max_reads_in_flight.load(Ordering::SeqCst), 1, "{address}");
        assert!(stats.reads.load(Ordering::SeqCst) >= 2, "{address}");
        assert!(cache.get(address, "voltage").is_some());
    }
    let global = driver.global();
    assert_eq!(global.max_reads_in_flight.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_sustained_link_failures_power_cycle_once() {
    let devices = [device("A"), device("B")];
    let driver = Arc::new(MockDriver::new(&[
        ("A", Behavior::Unreachable),
        ("B", Behavior::Unreachable),
    ]));
    let policy = SessionPolicy {
        failure_cap: 1,
        ..SessionPolicy::default()
    };

    let adapter = Arc::new(CountingAdapter::default());
    let recovery = Arc::new(AdapterRecoveryManager::new(
        RecoveryPolicy {
            window: secs(30),
            failure_threshold: 0.5,
            sustain: secs(5),
            settle: secs(1),
        },
        adapter.clone(),
        true,
    ));

    let scheduler = Scheduler::new(
        sessions(&driver, &devices, policy),
        SamplingMode::Sequential,
        secs(1),
        Arc::new(ValueCache::new()),
    )
    .with_recovery(recovery.clone());

    let mut dog = Watchdog::new(secs(300));
    let token = CancellationToken::new();
    let sampling = tokio::spawn(scheduler.run(dog.heartbeat("scheduler"), token.clone()));

    // breach from 0s, cycle at 6s, done by 8s; the next breach needs until 13s
    tokio::time::sleep(Duration::from_millis(10_500)).await;
    token.cancel();
    sampling.await.unwrap();

    assert_eq!(adapter.power_offs.load(Ordering::SeqCst), 1);
    assert_eq!(adapter.power_ons.load(Ordering::SeqCst), 1);
    assert_eq!(recovery.generation(), 1);
    assert!(driver.stats("A").connects.load(Ordering::SeqCst) >= 5);
}
