//! Zenoh bridge for battery management systems.
//!
//! Samples the configured BMS devices and publishes their telemetry to Zenoh.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use batmon_bridge_framework::{BridgeArgs, BridgeConfig, BridgeHealth, BridgeRunner};
use batmon_common::KeyExprBuilder;
use tokio::sync::Semaphore;

use zenoh_bridge_bms::config::BmsBridgeConfig;
use zenoh_bridge_bms::meter::{MeterBank, MeterState, MeterStore, run_store};
use zenoh_bridge_bms::publish::{PublishPipeline, ZenohSink};
use zenoh_bridge_bms::recovery::{AdapterRecoveryManager, BluetoothCtl, RecoveryPolicy};
use zenoh_bridge_bms::scheduler::{SamplingMode, Scheduler};
use zenoh_bridge_bms::session::{DeviceSession, SessionPolicy};
use zenoh_bridge_bms::watchdog::Watchdog;

/// Time left for the final meter write after sessions are closed.
const SHUTDOWN_SLACK: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<()> {
    let args = BridgeArgs::parse_with_default("bms.json5");

    let config = BmsBridgeConfig::load(&args.config).map_err(|e| anyhow::anyhow!("{}", e))?;

    let runner = BridgeRunner::new_with_args("bms", config, Some(&args))
        .await
        .map_err(|e| anyhow::anyhow!("{}", e))?;

    let bms = runner.config().bms.clone();
    let mut runner = runner
        .with_status_publishing()
        .with_format(bms.format)
        .with_grace_period(bms.shutdown_timeout() + SHUTDOWN_SLACK);

    // Bad entries only take themselves out
    let (devices, rejected) = bms.resolve_devices();
    for e in &rejected {
        tracing::warn!(error = %e, "Skipping device");
    }
    anyhow::ensure!(!devices.is_empty(), "no usable device in configuration");

    let recovery = Arc::new(AdapterRecoveryManager::new(
        RecoveryPolicy::from_config(&bms.recovery),
        Arc::new(BluetoothCtl),
        bms.bt_power_cycle,
    ));
    if bms.bt_power_cycle {
        recovery.power_cycle().await;
    }

    let store = bms.meters.state_file.clone().map(MeterStore::new);
    let meters = if bms.meters.enabled {
        let state = match &store {
            Some(store) => store.load().await.unwrap_or_else(|e| {
                tracing::warn!(path = %store.path().display(), error = %e, "Ignoring meter state");
                MeterState::new()
            }),
            None => MeterState::new(),
        };
        Some(Arc::new(MeterBank::with_state(bms.meter_max_gap(), &state)))
    } else {
        None
    };

    let health = Arc::new(BridgeHealth::new("bms").with_publisher(runner.publisher()));
    let cache = Arc::new(zenoh_bridge_bms::ValueCache::new());

    let connect_gate = Arc::new(Semaphore::new(bms.max_parallel_connects));
    let policy = SessionPolicy::from_config(&bms);
    let sessions = devices
        .iter()
        .map(|d| DeviceSession::new(d.clone(), d.kind.driver(), policy.clone(), connect_gate.clone()))
        .collect();

    let mut watchdog = Watchdog::new(bms.watchdog_timeout());
    let scheduler_beat = watchdog.heartbeat("scheduler");
    let publish_beat = watchdog.heartbeat("publish");

    let mut scheduler = Scheduler::new(
        sessions,
        SamplingMode::from_config(&bms),
        bms.sample_period(),
        cache.clone(),
    )
    .with_health(health.clone())
    .with_recovery(recovery);
    if let Some(meters) = &meters {
        scheduler = scheduler.with_meters(meters.clone());
    }

    let sink = Arc::new(ZenohSink::new(runner.publisher(), bms.payload));
    let mut pipeline = PublishPipeline::new(
        cache,
        &devices,
        KeyExprBuilder::new(&bms.key_prefix),
        bms.effective_expiry(),
        sink,
    )
    .with_keep_alive(bms.keep_alive)
    .with_invert_current(bms.invert_current);
    if bms.publish_health {
        pipeline = pipeline.with_health(health);
    }

    tracing::info!(
        prefix = %bms.key_prefix,
        devices = devices.len(),
        sample_period_s = bms.sample_period,
        publish_period_s = bms.publish_period().as_secs_f64(),
        expire_after_s = bms.effective_expiry().as_secs_f64(),
        "BMS bridge configured"
    );

    let shutdown = runner.shutdown_handle();
    runner.spawn(scheduler.run(scheduler_beat, shutdown.token()));
    runner.spawn(pipeline.run(bms.publish_period(), publish_beat, shutdown.token()));
    if bms.watchdog {
        runner.spawn(watchdog.run(shutdown.clone()));
    }
    if let (Some(meters), Some(store)) = (meters, store) {
        let interval = Duration::from_secs_f64(bms.meters.store_interval);
        runner.spawn(run_store(meters, store, interval, shutdown.token()));
    }

    let metadata = serde_json::json!({
        "devices": devices
            .iter()
            .map(|d| serde_json::json!({
                "name": d.name(),
                "address": d.address,
                "type": d.kind.as_str(),
            }))
            .collect::<Vec<_>>(),
        "concurrent_sampling": bms.concurrent_sampling,
        "sample_period": bms.sample_period,
        "publish_period": bms.publish_period().as_secs_f64(),
        "keep_alive": bms.keep_alive,
    });

    let outcome = runner
        .run_with_metadata(Some(metadata))
        .await
        .map_err(|e| anyhow::anyhow!("{}", e))?;

    tracing::info!(?outcome, "BMS bridge stopped");
    std::process::exit(outcome.exit_code());
}
