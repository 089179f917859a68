//! Adapter recovery: power-cycle the radio when link failures are host-wide.
//!
//! Every poll outcome enters a rolling window. When the share of link failures
//! stays above the threshold for the sustain period, the manager reports one
//! breach and clears the window, so the next breach must accumulate anew.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::Instant;

use crate::config::RecoveryConfig;
use crate::error::LinkError;

/// Pause between powering the adapter off and on.
const OFF_PAUSE: Duration = Duration::from_secs(1);

/// Bound on each adapter command. A wedged bluetoothd hangs them.
pub const ADAPTER_TIMEOUT: Duration = Duration::from_secs(10);

/// Host-level control over the radio adapter.
#[async_trait]
pub trait AdapterControl: Send + Sync + 'static {
    async fn power_off(&self) -> Result<(), LinkError>;
    async fn power_on(&self) -> Result<(), LinkError>;
}

/// Adapter control through `bluetoothctl`.
#[derive(Debug, Default, Clone)]
pub struct BluetoothCtl;

impl BluetoothCtl {
    async fn power(&self, state: &str) -> Result<(), LinkError> {
        let output = Command::new("bluetoothctl")
            .args(["power", state])
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| LinkError::Adapter(format!("bluetoothctl: {e}")))?;

        if !output.status.success() {
            return Err(LinkError::Adapter(format!(
                "bluetoothctl power {state}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl AdapterControl for BluetoothCtl {
    async fn power_off(&self) -> Result<(), LinkError> {
        self.power("off").await
    }

    async fn power_on(&self) -> Result<(), LinkError> {
        self.power("on").await
    }
}

/// Thresholds of the failure window.
#[derive(Debug, Clone)]
pub struct RecoveryPolicy {
    pub window: Duration,
    /// Link failure share in (0, 1].
    pub failure_threshold: f64,
    pub sustain: Duration,
    /// Wait after power-on before sessions reconnect.
    pub settle: Duration,
}

impl RecoveryPolicy {
    pub fn from_config(config: &RecoveryConfig) -> Self {
        Self {
            window: Duration::from_secs_f64(config.window),
            failure_threshold: config.failure_threshold,
            sustain: Duration::from_secs_f64(config.sustain),
            settle: Duration::from_secs_f64(config.settle),
        }
    }
}

#[derive(Debug, Default)]
struct AdapterHealth {
    outcomes: VecDeque<(Instant, bool)>,
    breach_since: Option<Instant>,
    last_power_cycle: Option<Instant>,
}

impl AdapterHealth {
    fn failure_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        let failed = self.outcomes.iter().filter(|(_, f)| *f).count();
        failed as f64 / self.outcomes.len() as f64
    }
}

/// Watches link failures across all sessions.
pub struct AdapterRecoveryManager {
    policy: RecoveryPolicy,
    control: Arc<dyn AdapterControl>,
    /// Whether breaches lead to a power-cycle.
    enabled: bool,
    health: Mutex<AdapterHealth>,
    generation: AtomicU64,
}

impl std::fmt::Debug for AdapterRecoveryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRecoveryManager")
            .field("policy", &self.policy)
            .field("enabled", &self.enabled)
            .field("generation", &self.generation())
            .finish()
    }
}

impl AdapterRecoveryManager {
    pub fn new(policy: RecoveryPolicy, control: Arc<dyn AdapterControl>, enabled: bool) -> Self {
        Self {
            policy,
            control,
            enabled,
            health: Mutex::new(AdapterHealth::default()),
            generation: AtomicU64::new(0),
        }
    }

    fn health(&self) -> MutexGuard<'_, AdapterHealth> {
        self.health.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bumped by every power-cycle. Sessions reconnect when it moves.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn failure_rate(&self) -> f64 {
        self.health().failure_rate()
    }

    pub fn last_power_cycle(&self) -> Option<Instant> {
        self.health().last_power_cycle
    }

    /// Record one poll outcome.
    ///
    /// Returns `true` once per sustained breach; the caller then runs
    /// [`power_cycle`](Self::power_cycle).
    pub fn record(&self, link_failed: bool) -> bool {
        let now = Instant::now();
        let mut health = self.health();

        health.outcomes.push_back((now, link_failed));
        while let Some(&(at, _)) = health.outcomes.front() {
            if now.saturating_duration_since(at) <= self.policy.window {
                break;
            }
            health.outcomes.pop_front();
        }

        let rate = health.failure_rate();
        if rate <= self.policy.failure_threshold {
            if health.breach_since.take().is_some() {
                tracing::info!(rate, "Link failure rate back below threshold");
            }
            return false;
        }

        let since = *health.breach_since.get_or_insert_with(|| {
            tracing::warn!(rate, "Link failure rate above threshold");
            now
        });
        if now.saturating_duration_since(since) < self.policy.sustain {
            return false;
        }

        health.outcomes.clear();
        health.breach_since = None;

        if !self.enabled {
            tracing::warn!(rate, "Adapter looks degraded, power-cycling is disabled");
            return false;
        }
        true
    }

    /// Power the adapter off and on, then let it settle.
    ///
    /// Errors are logged; the generation moves regardless so every session
    /// starts from a clean link.
    pub async fn power_cycle(&self) {
        tracing::warn!("Power-cycling the radio adapter");

        if let Err(e) = bounded("adapter power off", self.control.power_off()).await {
            tracing::error!(error = %e, "Adapter power off failed");
        }
        tokio::time::sleep(OFF_PAUSE).await;
        if let Err(e) = bounded("adapter power on", self.control.power_on()).await {
            tracing::error!(error = %e, "Adapter power on failed");
        }
        tokio::time::sleep(self.policy.settle).await;

        {
            let mut health = self.health();
            health.outcomes.clear();
            health.breach_since = None;
            health.last_power_cycle = Some(Instant::now());
        }
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::info!(generation, "Adapter power-cycle done");
    }
}

async fn bounded(
    op: &'static str,
    command: impl std::future::Future<Output = Result<(), LinkError>>,
) -> Result<(), LinkError> {
    tokio::time::timeout(ADAPTER_TIMEOUT, command)
        .await
        .map_err(|_| LinkError::Timeout {
            op,
            after: ADAPTER_TIMEOUT,
        })?
}
