//! Samples and the per-field adjustments applied to them.

use batmon_common::TelemetryValue;
use tokio::time::Instant;

/// Prefix of per-cell voltage fields, e.g. `cell_voltages/1`.
pub const CELL_VOLTAGES: &str = "cell_voltages";

/// Fields scaled by calibration and flipped by current inversion.
const CURRENT_FIELDS: [&str; 2] = ["current", "power"];

/// One decoded field, before it is tied to a device and a time.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub field: String,
    pub value: TelemetryValue,
    pub unit: Option<&'static str>,
}

impl Reading {
    pub fn new(field: impl Into<String>, value: impl Into<TelemetryValue>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
            unit: None,
        }
    }

    pub fn with_unit(mut self, unit: &'static str) -> Self {
        self.unit = Some(unit);
        self
    }
}

/// An acquired field value. Immutable once produced.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub address: String,
    pub field: String,
    pub value: TelemetryValue,
    pub unit: Option<&'static str>,
    /// Unix epoch millis, carried in payloads.
    pub timestamp: i64,
    /// Monotonic acquisition time, used for staleness.
    pub acquired_at: Instant,
}

impl Sample {
    pub fn from_reading(address: &str, reading: Reading, timestamp: i64, acquired_at: Instant) -> Self {
        Self {
            address: address.to_string(),
            field: reading.field,
            value: reading.value,
            unit: reading.unit,
            timestamp,
            acquired_at,
        }
    }
}

/// Whether a field carries current or power.
pub fn is_current_field(field: &str) -> bool {
    CURRENT_FIELDS.contains(&field)
}

/// Multiply current and power by the device calibration factor.
pub fn apply_calibration(readings: &mut [Reading], factor: f64) {
    if factor == 1.0 {
        return;
    }
    for reading in readings.iter_mut().filter(|r| is_current_field(&r.field)) {
        if let TelemetryValue::Gauge(v) = reading.value {
            reading.value = TelemetryValue::Gauge(v * factor);
        }
    }
}

/// Negate a value without producing `-0`.
pub fn invert(value: f64) -> f64 {
    if value == 0.0 { 0.0 } else { -value }
}

/// Append min, max, delta and average over the per-cell voltages.
pub fn derive_cell_stats(readings: &mut Vec<Reading>) {
    let prefix = format!("{CELL_VOLTAGES}/");
    let cells: Vec<f64> = readings
        .iter()
        .filter(|r| r.field.strip_prefix(&prefix).is_some_and(|i| i.parse::<u32>().is_ok()))
        .filter_map(|r| r.value.as_f64())
        .collect();

    if cells.is_empty() {
        return;
    }

    let min = cells.iter().copied().fold(f64::INFINITY, f64::min);
    let max = cells.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let average = cells.iter().sum::<f64>() / cells.len() as f64;

    for (name, value) in [
        ("min", min),
        ("max", max),
        ("delta", max - min),
        ("average", round3(average)),
    ] {
        readings.push(Reading::new(format!("{prefix}{name}"), value).with_unit("V"));
    }
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}
