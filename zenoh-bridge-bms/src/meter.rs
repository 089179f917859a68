//! Energy meters integrated from current and power samples.
//!
//! Positive power means discharging. Meter readings enter the value cache as
//! `meter/<name>` fields and are stored in an optional JSON state file.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::StoreError;
use crate::sample::Sample;

/// Field prefix of meter readings.
pub const METER_PREFIX: &str = "meter";

/// Trapezoidal integrator over time in hours.
///
/// Gaps longer than `max_gap` restart the integration instead of bridging it.
#[derive(Debug, Clone, Default)]
pub struct Integrator {
    reading: f64,
    last: Option<(Instant, f64)>,
}

impl Integrator {
    pub fn restore(reading: f64) -> Self {
        Self {
            reading,
            last: None,
        }
    }

    pub fn add(&mut self, at: Instant, value: f64, max_gap: Duration) {
        if !value.is_finite() {
            return;
        }
        if let Some((t0, v0)) = self.last {
            let dt = at.saturating_duration_since(t0);
            if !dt.is_zero() && dt <= max_gap {
                self.reading += (v0 + value) / 2.0 * dt.as_secs_f64() / 3600.0;
            }
        }
        self.last = Some((at, value));
    }

    pub fn reading(&self) -> f64 {
        self.reading
    }
}

/// Meter readings of one device, as stored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MeterReadings {
    /// Ah
    #[serde(default)]
    pub total_charge: f64,
    /// kWh, net
    #[serde(default)]
    pub total_energy: f64,
    /// kWh
    #[serde(default)]
    pub total_energy_charge: f64,
    /// kWh
    #[serde(default)]
    pub total_energy_discharge: f64,
}

/// Stored meter state, keyed by device address.
pub type MeterState = BTreeMap<String, MeterReadings>;

#[derive(Debug, Default)]
struct DeviceMeters {
    charge: Integrator,
    energy: Integrator,
    energy_charge: Integrator,
    energy_discharge: Integrator,
}

impl DeviceMeters {
    fn restore(r: &MeterReadings) -> Self {
        Self {
            charge: Integrator::restore(r.total_charge),
            energy: Integrator::restore(r.total_energy),
            energy_charge: Integrator::restore(r.total_energy_charge),
            energy_discharge: Integrator::restore(r.total_energy_discharge),
        }
    }

    fn readings(&self) -> MeterReadings {
        MeterReadings {
            total_charge: self.charge.reading(),
            total_energy: self.energy.reading(),
            total_energy_charge: self.energy_charge.reading(),
            total_energy_discharge: self.energy_discharge.reading(),
        }
    }
}

/// Meters of all devices.
#[derive(Debug)]
pub struct MeterBank {
    devices: Mutex<HashMap<String, DeviceMeters>>,
    max_gap: Duration,
}

impl MeterBank {
    pub fn new(max_gap: Duration) -> Self {
        Self {
            devices: Mutex::new(HashMap::new()),
            max_gap,
        }
    }

    /// Start from previously stored readings.
    pub fn with_state(max_gap: Duration, state: &MeterState) -> Self {
        let devices = state
            .iter()
            .map(|(address, r)| (address.clone(), DeviceMeters::restore(r)))
            .collect();
        Self {
            devices: Mutex::new(devices),
            max_gap,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, DeviceMeters>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Feed one poll worth of samples of a single device.
    ///
    /// Returns the updated meter readings as samples, or nothing when the poll
    /// carried neither current nor power.
    pub fn update(&self, samples: &[Sample]) -> Vec<Sample> {
        let field = |name: &str| {
            samples
                .iter()
                .find(|s| s.field == name)
                .and_then(|s| s.value.as_f64().map(|v| (s, v)))
        };
        let current = field("current");
        let power = field("power");

        let Some((base, _)) = current.or(power) else {
            return Vec::new();
        };
        let at = base.acquired_at;

        let mut devices = self.lock();
        let meters = devices.entry(base.address.clone()).or_default();

        if let Some((_, amps)) = current {
            meters.charge.add(at, amps, self.max_gap);
        }
        if let Some((_, watts)) = power {
            let kw = watts * 1e-3;
            meters.energy.add(at, kw, self.max_gap);
            meters.energy_charge.add(at, (-kw).max(0.0), self.max_gap);
            meters.energy_discharge.add(at, kw.max(0.0), self.max_gap);
        }

        let r = meters.readings();
        [
            ("total_charge", r.total_charge, "Ah"),
            ("total_energy", r.total_energy, "kWh"),
            ("total_energy_charge", r.total_energy_charge, "kWh"),
            ("total_energy_discharge", r.total_energy_discharge, "kWh"),
        ]
        .into_iter()
        .map(|(name, value, unit)| Sample {
            address: base.address.clone(),
            field: format!("{METER_PREFIX}/{name}"),
            value: value.into(),
            unit: Some(unit),
            timestamp: base.timestamp,
            acquired_at: at,
        })
        .collect()
    }

    pub fn state(&self) -> MeterState {
        self.lock()
            .iter()
            .map(|(address, m)| (address.clone(), m.readings()))
            .collect()
    }
}

/// JSON file holding [`MeterState`] across restarts.
#[derive(Debug, Clone)]
pub struct MeterStore {
    path: PathBuf,
}

impl MeterStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the state file. A missing file is an empty state.
    pub async fn load(&self) -> Result<MeterState, StoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(MeterState::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Write to a sibling temp file, then rename over the state file.
    pub async fn save(&self, state: &MeterState) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(state)?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

/// Save meter state every `interval` and once more on cancellation.
pub async fn run_store(
    bank: std::sync::Arc<MeterBank>,
    store: MeterStore,
    interval: Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = store.save(&bank.state()).await {
                    tracing::warn!(path = %store.path().display(), error = %e, "Failed to store meters");
                }
            }
        }
    }

    match store.save(&bank.state()).await {
        Ok(()) => tracing::debug!(path = %store.path().display(), "Meters stored"),
        Err(e) => tracing::warn!(path = %store.path().display(), error = %e, "Failed to store meters"),
    }
}
