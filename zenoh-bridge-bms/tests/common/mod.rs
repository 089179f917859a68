//! Mock driver, bus sink and adapter shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use zenoh_bridge_bms::config::DeviceSpec;
use zenoh_bridge_bms::driver::{Connection, Driver, DriverKind, Frame};
use zenoh_bridge_bms::error::{LinkError, PollError, ProtocolError, PublishError};
use zenoh_bridge_bms::publish::{BusSink, PublishFrame};
use zenoh_bridge_bms::recovery::AdapterControl;
use zenoh_bridge_bms::sample::Reading;
use zenoh_bridge_bms::session::{DeviceSession, SessionPolicy};

/// What a mock device does.
#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    /// Connects and answers every read.
    Healthy,
    /// Answers the first `n` reads, then drops the link and refuses connections.
    DiesAfter(usize),
    /// Every connect fails.
    Unreachable,
    /// Connects, then never answers a read nor a disconnect.
    Hung,
}

/// Per-device call counters.
#[derive(Debug, Default)]
pub struct Stats {
    pub connects: AtomicUsize,
    pub reads: AtomicUsize,
    pub disconnects: AtomicUsize,
    pub reads_in_flight: AtomicUsize,
    pub max_reads_in_flight: AtomicUsize,
}

pub struct MockDriver {
    behaviors: HashMap<String, Behavior>,
    stats: HashMap<String, Arc<Stats>>,
    read_delay: Duration,
    /// Reads in flight across all devices.
    global: Arc<Stats>,
}

impl MockDriver {
    pub fn new(devices: &[(&str, Behavior)]) -> Self {
        Self {
            behaviors: devices.iter().map(|(a, b)| (a.to_string(), *b)).collect(),
            stats: devices
                .iter()
                .map(|(a, _)| (a.to_string(), Arc::new(Stats::default())))
                .collect(),
            read_delay: Duration::ZERO,
            global: Arc::new(Stats::default()),
        }
    }

    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = delay;
        self
    }

    pub fn stats(&self, address: &str) -> Arc<Stats> {
        self.stats[address].clone()
    }

    pub fn global(&self) -> Arc<Stats> {
        self.global.clone()
    }
}

#[async_trait]
impl Driver for MockDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Dummy
    }

    async fn connect(&self, device: &DeviceSpec) -> Result<Box<dyn Connection>, LinkError> {
        let stats = self.stats[&device.address].clone();
        stats.connects.fetch_add(1, Ordering::SeqCst);

        let behavior = self.behaviors[&device.address];
        let refuse = match behavior {
            Behavior::Unreachable => true,
            Behavior::DiesAfter(n) => stats.reads.load(Ordering::SeqCst) >= n,
            Behavior::Healthy | Behavior::Hung => false,
        };
        if refuse {
            return Err(LinkError::Connect(format!("{} out of range", device.address)));
        }

        Ok(Box::new(MockConnection {
            behavior,
            stats,
            global: self.global.clone(),
            read_delay: self.read_delay,
        }))
    }

    fn decode(&self, _device: &DeviceSpec, frame: &[u8]) -> Result<Vec<Reading>, ProtocolError> {
        if frame != b"frame" {
            return Err(ProtocolError::Decode("unexpected frame".into()));
        }
        Ok(vec![
            Reading::new("voltage", 13.2).with_unit("V"),
            Reading::new("current", -4.0).with_unit("A"),
            Reading::new("power", -52.8).with_unit("W"),
            Reading::new("cell_voltages/1", 3.30).with_unit("V"),
            Reading::new("cell_voltages/2", 3.31).with_unit("V"),
        ])
    }
}

struct MockConnection {
    behavior: Behavior,
    stats: Arc<Stats>,
    global: Arc<Stats>,
    read_delay: Duration,
}

fn enter(stats: &Stats) {
    let now = stats.reads_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    stats.max_reads_in_flight.fetch_max(now, Ordering::SeqCst);
}

fn leave(stats: &Stats) {
    stats.reads_in_flight.fetch_sub(1, Ordering::SeqCst);
}

#[async_trait]
impl Connection for MockConnection {
    async fn read_frame(&mut self) -> Result<Frame, PollError> {
        match self.behavior {
            Behavior::Hung => std::future::pending::<()>().await,
            Behavior::DiesAfter(n) if self.stats.reads.load(Ordering::SeqCst) >= n => {
                return Err(LinkError::Lost("out of range".into()).into());
            }
            _ => {}
        }

        enter(&self.stats);
        enter(&self.global);
        tokio::time::sleep(self.read_delay).await;
        leave(&self.global);
        leave(&self.stats);

        self.stats.reads.fetch_add(1, Ordering::SeqCst);
        Ok(b"frame".to_vec())
    }

    async fn disconnect(&mut self) -> Result<(), LinkError> {
        if let Behavior::Hung = self.behavior {
            std::future::pending::<()>().await;
        }
        self.stats.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        true
    }
}

/// Bus sink keeping every frame.
#[derive(Debug, Default)]
pub struct RecordingSink {
    frames: Mutex<Vec<PublishFrame>>,
}

impl RecordingSink {
    pub fn frames(&self) -> Vec<PublishFrame> {
        self.frames.lock().unwrap().clone()
    }

    /// Frames that carried at least one key under `topic`.
    pub fn frames_with(&self, topic: &str) -> usize {
        let needle = format!("/{topic}/");
        self.frames()
            .iter()
            .filter(|f| f.entries.iter().any(|e| e.key.contains(&needle)))
            .count()
    }
}

#[async_trait]
impl BusSink for RecordingSink {
    async fn publish(&self, frame: &PublishFrame) -> Result<(), PublishError> {
        self.frames.lock().unwrap().push(frame.clone());
        Ok(())
    }
}

/// Adapter that only counts power-cycles.
#[derive(Debug, Default)]
pub struct CountingAdapter {
    pub power_offs: AtomicUsize,
    pub power_ons: AtomicUsize,
}

#[async_trait]
impl AdapterControl for CountingAdapter {
    async fn power_off(&self) -> Result<(), LinkError> {
        self.power_offs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn power_on(&self) -> Result<(), LinkError> {
        self.power_ons.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Adapter whose commands never return.
#[derive(Debug, Default)]
pub struct HungAdapter {
    pub calls: AtomicUsize,
}

#[async_trait]
impl AdapterControl for HungAdapter {
    async fn power_off(&self) -> Result<(), LinkError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }

    async fn power_on(&self) -> Result<(), LinkError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }
}

pub fn device(address: &str) -> DeviceSpec {
    DeviceSpec {
        address: address.into(),
        kind: DriverKind::Dummy,
        topic: address.into(),
        alias: None,
        pin: None,
        algorithm: None,
        current_calibration: 1.0,
        debug: false,
    }
}

pub fn sessions(
    driver: &Arc<MockDriver>,
    devices: &[DeviceSpec],
    policy: SessionPolicy,
) -> Vec<DeviceSession> {
    let gate = Arc::new(Semaphore::new(1));
    devices
        .iter()
        .map(|d| {
            let driver: Arc<dyn Driver> = driver.clone();
            DeviceSession::new(d.clone(), driver, policy.clone(), gate.clone())
        })
        .collect()
}
