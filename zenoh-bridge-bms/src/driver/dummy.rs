//! Simulated BMS for bench runs.
//!
//! Frames are small JSON documents whose values drift slowly with each read.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{Connection, Driver, DriverKind, Frame};
use crate::config::DeviceSpec;
use crate::error::{LinkError, PollError, ProtocolError};
use crate::sample::{CELL_VOLTAGES, Reading};

const NUM_CELLS: usize = 4;
const CAPACITY_AH: f64 = 100.0;

#[derive(Debug, Serialize, Deserialize)]
struct DummyFrame {
    voltage: f64,
    current: f64,
    power: f64,
    soc: f64,
    charge: f64,
    capacity: f64,
    cycles: u64,
    temperatures: Vec<f64>,
    cells: Vec<f64>,
    balancing: bool,
}

impl DummyFrame {
    fn simulate(tick: u64) -> Self {
        let phase = tick as f64 * 0.1;
        let cells: Vec<f64> = (0..NUM_CELLS)
            .map(|i| round(3.3 + 0.004 * i as f64 + 0.02 * phase.sin(), 3))
            .collect();
        let voltage = round(cells.iter().sum(), 2);
        let current = round(12.0 * phase.sin(), 2);
        let soc = round(60.0 + 20.0 * (phase / 4.0).sin(), 1);

        Self {
            voltage,
            current,
            power: round(voltage * current, 1),
            soc,
            charge: round(CAPACITY_AH * soc / 100.0, 2),
            capacity: CAPACITY_AH,
            cycles: 42,
            temperatures: vec![round(21.0 + phase.cos(), 1), round(22.5 + phase.sin(), 1)],
            balancing: current > 10.0,
            cells,
        }
    }
}

fn round(value: f64, digits: i32) -> f64 {
    let scale = 10f64.powi(digits);
    (value * scale).round() / scale
}

/// Driver for the simulated BMS.
#[derive(Debug, Default)]
pub struct DummyDriver;

impl DummyDriver {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Driver for DummyDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Dummy
    }

    async fn connect(&self, device: &DeviceSpec) -> Result<Box<dyn Connection>, LinkError> {
        tracing::debug!(device = %device.name(), "Simulated link opened");
        Ok(Box::new(DummyConnection {
            tick: 0,
            open: true,
        }))
    }

    fn decode(&self, _device: &DeviceSpec, frame: &[u8]) -> Result<Vec<Reading>, ProtocolError> {
        let frame: DummyFrame =
            serde_json::from_slice(frame).map_err(|e| ProtocolError::Decode(e.to_string()))?;

        let mut readings = vec![
            Reading::new("voltage", frame.voltage).with_unit("V"),
            Reading::new("current", frame.current).with_unit("A"),
            Reading::new("power", frame.power).with_unit("W"),
            Reading::new("soc", frame.soc).with_unit("%"),
            Reading::new("charge", frame.charge).with_unit("Ah"),
            Reading::new("capacity", frame.capacity).with_unit("Ah"),
            Reading::new("num_cycles", frame.cycles),
            Reading::new("balancing", frame.balancing),
        ];
        for (i, t) in frame.temperatures.iter().enumerate() {
            readings.push(Reading::new(format!("temperatures/{}", i + 1), *t).with_unit("°C"));
        }
        for (i, v) in frame.cells.iter().enumerate() {
            readings.push(Reading::new(format!("{CELL_VOLTAGES}/{}", i + 1), *v).with_unit("V"));
        }

        Ok(readings)
    }
}

struct DummyConnection {
    tick: u64,
    open: bool,
}

#[async_trait]
impl Connection for DummyConnection {
    async fn read_frame(&mut self) -> Result<Frame, PollError> {
        if !self.open {
            return Err(LinkError::Lost("simulated link closed".into()).into());
        }
        self.tick += 1;
        serde_json::to_vec(&DummyFrame::simulate(self.tick))
            .map_err(|e| ProtocolError::Decode(e.to_string()).into())
    }

    async fn disconnect(&mut self) -> Result<(), LinkError> {
        self.open = false;
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        self.open
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batmon_common::TelemetryValue;

    fn spec() -> DeviceSpec {
        DeviceSpec {
            address: "sim-1".into(),
            kind: DriverKind::Dummy,
            topic: "sim-1".into(),
            alias: None,
            pin: None,
            algorithm: None,
            current_calibration: 1.0,
            debug: false,
        }
    }

    #[tokio::test]
    async fn test_read_and_decode() {
        let driver = DummyDriver::new();
        let mut conn = driver.connect(&spec()).await.unwrap();
        assert!(conn.is_alive().await);

        let frame = conn.read_frame().await.unwrap();
        let readings = driver.decode(&spec(), &frame).unwrap();

        let field = |name: &str| readings.iter().find(|r| r.field == name).unwrap();
        assert_eq!(field("voltage").unit, Some("V"));
        assert!(matches!(field("num_cycles").value, TelemetryValue::Counter(42)));
        assert!(readings.iter().any(|r| r.field == "cell_voltages/4"));
        assert!(readings.iter().any(|r| r.field == "temperatures/2"));
    }

    #[tokio::test]
    async fn test_closed_connection_fails_with_link_error() {
        let driver = DummyDriver::new();
        let mut conn = driver.connect(&spec()).await.unwrap();
        conn.disconnect().await.unwrap();

        assert!(!conn.is_alive().await);
        assert!(conn.read_frame().await.unwrap_err().is_link());
    }

    #[test]
    fn test_garbage_is_protocol_error() {
        let err = DummyDriver::new().decode(&spec(), b"\x01\x03").unwrap_err();
        assert!(matches!(err, ProtocolError::Decode(_)));
    }
}
