//! Sampling scheduler.
//!
//! Drives every device session once per sample period, either one after the
//! other or as parallel tasks bounded by `max_in_flight`. Each session sits
//! behind its own mutex; a session still busy when the next tick comes is
//! skipped for that tick, so there is never more than one poll per device.
//!
//! Outcomes are applied as soon as each poll returns.

use std::sync::Arc;
use std::time::Duration;

use batmon_bridge_framework::BridgeHealth;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::cache::ValueCache;
use crate::config::{BmsConfig, DeviceSpec};
use crate::meter::MeterBank;
use crate::recovery::AdapterRecoveryManager;
use crate::session::{DeviceSession, PollOutcome};
use crate::watchdog::Heartbeat;

pub type SharedSession = Arc<Mutex<DeviceSession>>;

/// How sessions are polled within a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingMode {
    /// One at a time, in configured order.
    Sequential,
    /// In parallel, at most `max_in_flight` polls at once.
    Concurrent { max_in_flight: usize },
}

impl SamplingMode {
    pub fn from_config(config: &BmsConfig) -> Self {
        if config.concurrent_sampling {
            SamplingMode::Concurrent {
                max_in_flight: config.max_in_flight.max(1),
            }
        } else {
            SamplingMode::Sequential
        }
    }
}

/// Where poll outcomes go.
#[derive(Clone)]
struct OutcomeSink {
    cache: Arc<ValueCache>,
    meters: Option<Arc<MeterBank>>,
    health: Option<Arc<BridgeHealth>>,
    recovery: Option<Arc<AdapterRecoveryManager>>,
}

impl OutcomeSink {
    /// Apply one outcome. Returns `true` when the adapter is due for a
    /// power-cycle.
    fn apply(&self, device: &DeviceSpec, outcome: PollOutcome) -> bool {
        let link_failed = match outcome {
            PollOutcome::Sampled(samples) => {
                let fields = samples.len();
                let meter_samples = self
                    .meters
                    .as_ref()
                    .map(|m| m.update(&samples))
                    .unwrap_or_default();
                self.cache.put_all(samples.into_iter().chain(meter_samples));

                if let Some(health) = &self.health {
                    health.record_device_success(device.name());
                }
                tracing::debug!(device = %device.name(), fields, "Sampled");
                false
            }
            PollOutcome::Failed(e) => {
                if let Some(health) = &self.health {
                    health.record_device_failure(device.name(), &e.to_string());
                }
                e.is_link()
            }
            PollOutcome::BackingOff { remaining } => {
                tracing::trace!(device = %device.name(), remaining, "Backing off");
                return false;
            }
            PollOutcome::Closed => return false,
        };

        self.recovery
            .as_ref()
            .is_some_and(|r| r.record(link_failed))
    }
}

pub struct Scheduler {
    sessions: Vec<SharedSession>,
    mode: SamplingMode,
    period: Duration,
    sink: OutcomeSink,
}

impl Scheduler {
    pub fn new(
        sessions: Vec<DeviceSession>,
        mode: SamplingMode,
        period: Duration,
        cache: Arc<ValueCache>,
    ) -> Self {
        Self {
            sessions: sessions
                .into_iter()
                .map(|s| Arc::new(Mutex::new(s)))
                .collect(),
            mode,
            period,
            sink: OutcomeSink {
                cache,
                meters: None,
                health: None,
                recovery: None,
            },
        }
    }

    pub fn with_meters(mut self, meters: Arc<MeterBank>) -> Self {
        self.sink.meters = Some(meters);
        self
    }

    pub fn with_health(mut self, health: Arc<BridgeHealth>) -> Self {
        health.set_devices_total(self.sessions.len() as u64);
        self.sink.health = Some(health);
        self
    }

    pub fn with_recovery(mut self, recovery: Arc<AdapterRecoveryManager>) -> Self {
        self.sink.recovery = Some(recovery);
        self
    }

    pub fn sessions(&self) -> &[SharedSession] {
        &self.sessions
    }

    fn generation(&self) -> u64 {
        self.sink.recovery.as_ref().map_or(0, |r| r.generation())
    }

    async fn power_cycle(&self) {
        if let Some(recovery) = &self.sink.recovery {
            recovery.power_cycle().await;
        }
    }

    /// Poll until cancelled, then close every session.
    ///
    /// `heartbeat` beats on every tick.
    pub async fn run(self, heartbeat: Heartbeat, token: CancellationToken) {
        tracing::info!(
            devices = self.sessions.len(),
            mode = ?self.mode,
            period_ms = self.period.as_millis() as u64,
            "Sampling started"
        );

        match self.mode {
            SamplingMode::Sequential => self.run_sequential(&heartbeat, &token).await,
            SamplingMode::Concurrent { max_in_flight } => {
                self.run_concurrent(max_in_flight, &heartbeat, &token).await
            }
        }

        self.close_all().await;
        tracing::info!("Sampling stopped");
    }

    async fn run_sequential(&self, heartbeat: &Heartbeat, token: &CancellationToken) {
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => {}
            }
            heartbeat.beat();

            tokio::select! {
                _ = token.cancelled() => return,
                _ = self.round() => {}
            }
        }
    }

    async fn round(&self) {
        let started = Instant::now();
        let generation = self.generation();

        for shared in &self.sessions {
            let mut session = shared.lock().await;
            let outcome = session.poll(generation).await;
            let cycle_due = self.sink.apply(session.spec(), outcome);
            drop(session);

            if cycle_due {
                self.power_cycle().await;
                break;
            }
        }

        if let Some(health) = &self.sink.health {
            health.record_cycle_duration(started.elapsed().as_millis() as u64);
        }
    }

    async fn run_concurrent(
        &self,
        max_in_flight: usize,
        heartbeat: &Heartbeat,
        token: &CancellationToken,
    ) {
        let permits = Arc::new(Semaphore::new(max_in_flight));
        let mut in_flight: JoinSet<bool> = JoinSet::new();
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    heartbeat.beat();
                    self.dispatch(&mut in_flight, &permits);
                }
                Some(joined) = in_flight.join_next() => {
                    if self.reap(joined) {
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = self.power_cycle() => {}
                        }
                    }
                }
            }
        }

        in_flight.abort_all();
        while in_flight.join_next().await.is_some() {}
    }

    /// Start a poll for every idle session.
    fn dispatch(&self, in_flight: &mut JoinSet<bool>, permits: &Arc<Semaphore>) {
        let generation = self.generation();

        for shared in &self.sessions {
            let Ok(mut session) = shared.clone().try_lock_owned() else {
                tracing::debug!("Previous poll still running, skipping device this tick");
                continue;
            };

            let permits = permits.clone();
            let sink = self.sink.clone();
            in_flight.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return false;
                };
                let started = Instant::now();
                let outcome = session.poll(generation).await;
                if let Some(health) = &sink.health {
                    health.record_cycle_duration(started.elapsed().as_millis() as u64);
                }
                sink.apply(session.spec(), outcome)
            });
        }
    }

    fn reap(&self, joined: Result<bool, JoinError>) -> bool {
        match joined {
            Ok(cycle_due) => cycle_due,
            Err(e) if e.is_panic() => {
                tracing::error!(error = %e, "Poll task panicked");
                false
            }
            Err(_) => false,
        }
    }

    /// Close every session, each within its own shutdown bound.
    pub async fn close_all(&self) {
        futures_util::future::join_all(self.sessions.iter().map(|shared| async move {
            shared.lock().await.close().await;
        }))
        .await;
    }
}
