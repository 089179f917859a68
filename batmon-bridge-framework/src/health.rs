//! Bridge health tracking.
//!
//! [`BridgeHealth`] keeps per-device liveness (driven by sampling outcomes)
//! plus a few bridge-wide counters, and can publish a [`HealthSnapshot`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use batmon_common::KeyExprBuilder;
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::publisher::Publisher;

/// Consecutive failures after which a device is reported offline.
const OFFLINE_AFTER_FAILURES: u32 = 3;

/// Bridge health metrics.
#[derive(Debug)]
pub struct BridgeHealth {
    bridge_name: String,
    start_time: Instant,
    devices_total: AtomicU64,
    metrics_published: AtomicU64,
    errors_total: AtomicU64,
    last_cycle_duration_ms: AtomicU64,
    devices: RwLock<HashMap<String, DeviceState>>,
    publisher: Option<Publisher>,
}

#[derive(Debug, Clone)]
struct DeviceState {
    status: DeviceStatus,
    last_seen: i64,
    consecutive_failures: u32,
    last_error: Option<String>,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            status: DeviceStatus::Unknown,
            last_seen: 0,
            consecutive_failures: 0,
            last_error: None,
        }
    }
}

/// Device availability status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    /// Device is responding normally.
    Online,
    /// Device is not responding.
    Offline,
    /// Device failed recently but not often enough to be offline.
    Degraded,
    /// Device has not been sampled yet.
    #[default]
    Unknown,
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceStatus::Online => write!(f, "online"),
            DeviceStatus::Offline => write!(f, "offline"),
            DeviceStatus::Degraded => write!(f, "degraded"),
            DeviceStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Health snapshot for serialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub bridge: String,
    /// "healthy", "degraded" or "error".
    pub status: String,
    pub uptime_secs: u64,
    pub devices_total: u64,
    pub devices_responding: u64,
    pub devices_failed: u64,
    pub last_cycle_duration_ms: u64,
    pub errors_total: u64,
    pub metrics_published: u64,
    pub devices: Vec<DeviceLiveness>,
}

/// Device liveness information for serialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceLiveness {
    pub device: String,
    pub status: DeviceStatus,
    /// Last successful sample (millis since epoch).
    pub last_seen: i64,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl BridgeHealth {
    /// Create a new health tracker.
    pub fn new(bridge_name: impl Into<String>) -> Self {
        Self {
            bridge_name: bridge_name.into(),
            start_time: Instant::now(),
            devices_total: AtomicU64::new(0),
            metrics_published: AtomicU64::new(0),
            errors_total: AtomicU64::new(0),
            last_cycle_duration_ms: AtomicU64::new(0),
            devices: RwLock::new(HashMap::new()),
            publisher: None,
        }
    }

    /// Set the publisher used by [`publish_health`](Self::publish_health).
    pub fn with_publisher(mut self, publisher: Publisher) -> Self {
        self.publisher = Some(publisher);
        self
    }

    // A panicking writer leaves plain counters behind, so the data stays usable.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, DeviceState>> {
        self.devices.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, DeviceState>> {
        self.devices.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set the total number of devices.
    pub fn set_devices_total(&self, count: u64) {
        self.devices_total.store(count, Ordering::SeqCst);
    }

    /// Record a successful sample of a device.
    pub fn record_device_success(&self, device_id: &str) {
        let mut devices = self.write();
        let state = devices.entry(device_id.to_string()).or_default();
        state.status = DeviceStatus::Online;
        state.last_seen = chrono::Utc::now().timestamp_millis();
        state.consecutive_failures = 0;
        state.last_error = None;
    }

    /// Record a failed sample or connection attempt.
    pub fn record_device_failure(&self, device_id: &str, error: &str) {
        {
            let mut devices = self.write();
            let state = devices.entry(device_id.to_string()).or_default();
            state.consecutive_failures = state.consecutive_failures.saturating_add(1);
            state.last_error = Some(error.to_string());
            state.status = if state.consecutive_failures >= OFFLINE_AFTER_FAILURES {
                DeviceStatus::Offline
            } else {
                DeviceStatus::Degraded
            };
        }
        self.errors_total.fetch_add(1, Ordering::SeqCst);
    }

    /// Record that metrics were published.
    pub fn record_metrics_published(&self, count: u64) {
        self.metrics_published.fetch_add(count, Ordering::SeqCst);
    }

    /// Record how long the last sampling cycle took.
    pub fn record_cycle_duration(&self, duration_ms: u64) {
        self.last_cycle_duration_ms
            .store(duration_ms, Ordering::SeqCst);
    }

    /// Get liveness info for a specific device.
    pub fn device_liveness(&self, device_id: &str) -> Option<DeviceLiveness> {
        self.read()
            .get(device_id)
            .map(|state| to_liveness(device_id, state))
    }

    /// Get liveness info for all devices, sorted by device id.
    pub fn all_device_liveness(&self) -> Vec<DeviceLiveness> {
        let mut all: Vec<_> = self
            .read()
            .iter()
            .map(|(id, state)| to_liveness(id, state))
            .collect();
        all.sort_by(|a, b| a.device.cmp(&b.device));
        all
    }

    /// Get a snapshot of current health metrics.
    pub fn snapshot(&self) -> HealthSnapshot {
        let devices = self.all_device_liveness();
        let devices_total = self.devices_total.load(Ordering::SeqCst);

        let mut responding = 0u64;
        let mut failed = 0u64;
        for device in &devices {
            match device.status {
                DeviceStatus::Online | DeviceStatus::Degraded => responding += 1,
                DeviceStatus::Offline => failed += 1,
                DeviceStatus::Unknown => {}
            }
        }

        let status = if failed == 0 {
            "healthy"
        } else if responding > 0 {
            "degraded"
        } else {
            "error"
        };

        HealthSnapshot {
            bridge: self.bridge_name.clone(),
            status: status.to_string(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            devices_total,
            devices_responding: responding,
            devices_failed: failed,
            last_cycle_duration_ms: self.last_cycle_duration_ms.load(Ordering::SeqCst),
            errors_total: self.errors_total.load(Ordering::SeqCst),
            metrics_published: self.metrics_published.load(Ordering::SeqCst),
            devices,
        }
    }

    /// Publish the health snapshot to `{key_prefix}/@/health`.
    ///
    /// Does nothing when no publisher is attached.
    pub async fn publish_health(&self) -> Result<()> {
        let Some(ref publisher) = self.publisher else {
            return Ok(());
        };

        let key = KeyExprBuilder::new(publisher.key_prefix()).health_key();
        publisher.publish_json(&key, &self.snapshot()).await
    }
}

fn to_liveness(device_id: &str, state: &DeviceState) -> DeviceLiveness {
    DeviceLiveness {
        device: device_id.to_string(),
        status: state.status,
        last_seen: state.last_seen,
        consecutive_failures: state.consecutive_failures,
        last_error: state.last_error.clone(),
    }
}
