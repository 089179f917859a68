//! Publish pipeline: cache snapshot to bus, once per publish period.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use batmon_bridge_framework::{BridgeHealth, Publisher};
use batmon_common::{KeyExprBuilder, TelemetryPoint, TelemetryValue, current_timestamp_millis};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::cache::{ValueCache, is_stale};
use crate::config::{DeviceSpec, PayloadMode};
use crate::error::PublishError;
use crate::sample::{invert, is_current_field};
use crate::watchdog::Heartbeat;

/// One field of a publish frame.
#[derive(Debug, Clone)]
pub struct FrameEntry {
    pub key: String,
    pub point: TelemetryPoint,
}

/// Everything published in one tick, in device then field order.
#[derive(Debug, Clone, Default)]
pub struct PublishFrame {
    pub timestamp: i64,
    pub entries: Vec<FrameEntry>,
}

impl PublishFrame {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Outbound bus.
#[async_trait]
pub trait BusSink: Send + Sync + 'static {
    /// Publish every entry of the frame, one message each.
    async fn publish(&self, frame: &PublishFrame) -> Result<(), PublishError>;
}

/// Writes a single frame entry to the bus.
#[async_trait]
pub trait EntryWriter: Send + Sync + 'static {
    async fn write(&self, entry: &FrameEntry) -> Result<(), PublishError>;
}

/// Write every entry of `frame`, one message each.
///
/// A key the bus rejects is logged and skipped so the other devices still go
/// out. The frame fails only when no entry could be written.
pub async fn write_entries(writer: &dyn EntryWriter, frame: &PublishFrame) -> Result<(), PublishError> {
    let mut last_error = None;
    let mut written = 0usize;

    for entry in &frame.entries {
        match writer.write(entry).await {
            Ok(()) => written += 1,
            Err(e) => {
                tracing::warn!(key = %entry.key, error = %e, "Skipping key");
                last_error = Some(e);
            }
        }
    }

    match last_error {
        Some(e) if written == 0 => Err(e),
        _ => Ok(()),
    }
}

/// Zenoh bus sink.
#[derive(Debug, Clone)]
pub struct ZenohSink {
    publisher: Publisher,
    payload: PayloadMode,
}

impl ZenohSink {
    pub fn new(publisher: Publisher, payload: PayloadMode) -> Self {
        Self { publisher, payload }
    }
}

#[async_trait]
impl EntryWriter for ZenohSink {
    async fn write(&self, entry: &FrameEntry) -> Result<(), PublishError> {
        let published = match self.payload {
            PayloadMode::Value => {
                self.publisher
                    .publish_raw(&entry.key, entry.point.value.to_payload_string())
                    .await
            }
            PayloadMode::Point => self.publisher.publish_point(&entry.key, &entry.point).await,
        };
        published.map_err(|e| PublishError::Bus {
            key: entry.key.clone(),
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl BusSink for ZenohSink {
    async fn publish(&self, frame: &PublishFrame) -> Result<(), PublishError> {
        write_entries(self, frame).await
    }
}

/// Reads the value cache and emits frames.
pub struct PublishPipeline {
    cache: Arc<ValueCache>,
    /// Address to configured position and device.
    devices: HashMap<String, (usize, DeviceSpec)>,
    keys: KeyExprBuilder,
    expire_after: Duration,
    keep_alive: bool,
    invert_current: bool,
    sink: Arc<dyn BusSink>,
    health: Option<Arc<BridgeHealth>>,
}

impl PublishPipeline {
    pub fn new(
        cache: Arc<ValueCache>,
        devices: &[DeviceSpec],
        keys: KeyExprBuilder,
        expire_after: Duration,
        sink: Arc<dyn BusSink>,
    ) -> Self {
        Self {
            cache,
            devices: devices
                .iter()
                .enumerate()
                .map(|(i, d)| (d.address.clone(), (i, d.clone())))
                .collect(),
            keys,
            expire_after,
            keep_alive: false,
            invert_current: false,
            sink,
            health: None,
        }
    }

    /// Republish stale values, flagged, instead of omitting them.
    pub fn with_keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_invert_current(mut self, invert_current: bool) -> Self {
        self.invert_current = invert_current;
        self
    }

    /// Count published fields and publish the health snapshot every tick.
    pub fn with_health(mut self, health: Arc<BridgeHealth>) -> Self {
        self.health = Some(health);
        self
    }

    /// Build the frame for `now`.
    ///
    /// Only keys with a successful sample exist in the cache. Stale entries are
    /// left out unless keep-alive is set.
    pub fn build_frame(&self, now: Instant) -> PublishFrame {
        let mut fields: Vec<_> = self
            .cache
            .snapshot()
            .into_iter()
            .filter_map(|entry| {
                let (index, device) = self.devices.get(&entry.sample.address)?;
                let stale = is_stale(&entry, now, self.expire_after);
                if stale && !self.keep_alive {
                    return None;
                }
                Some((*index, device, entry, stale))
            })
            .collect();
        fields.sort_by(|a, b| (a.0, &a.2.sample.field).cmp(&(b.0, &b.2.sample.field)));

        let entries = fields
            .into_iter()
            .map(|(_, device, entry, stale)| {
                let sample = entry.sample;
                let value = match sample.value {
                    TelemetryValue::Gauge(v) if self.invert_current && is_current_field(&sample.field) => {
                        TelemetryValue::Gauge(invert(v))
                    }
                    other => other,
                };

                let mut point = TelemetryPoint::new(device.name(), &sample.field, value)
                    .with_timestamp(sample.timestamp)
                    .with_stale(stale)
                    .with_label("address", &device.address)
                    .with_label("driver", device.kind.as_str());
                if let Some(unit) = sample.unit {
                    point = point.with_unit(unit);
                }

                FrameEntry {
                    key: self.keys.build(&device.topic, &sample.field),
                    point,
                }
            })
            .collect();

        PublishFrame {
            timestamp: current_timestamp_millis(),
            entries,
        }
    }

    /// Build and send one frame. Returns how many fields went out.
    ///
    /// A failed frame is dropped; the next tick carries fresh values.
    pub async fn tick(&self) -> Result<usize, PublishError> {
        let frame = self.build_frame(Instant::now());
        if frame.is_empty() {
            return Ok(0);
        }

        self.sink.publish(&frame).await?;
        if let Some(health) = &self.health {
            health.record_metrics_published(frame.len() as u64);
        }
        Ok(frame.len())
    }

    /// Publish every `period` until cancelled.
    ///
    /// `heartbeat` beats after each frame that reached the bus.
    pub async fn run(self, period: Duration, heartbeat: Heartbeat, token: CancellationToken) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.tick().await {
                Ok(0) => tracing::trace!("Nothing to publish"),
                Ok(n) => {
                    heartbeat.beat();
                    tracing::trace!(fields = n, "Frame published");
                }
                Err(e) => tracing::warn!(error = %e, "Dropping publish frame"),
            }

            if let Some(health) = &self.health
                && let Err(e) = health.publish_health().await
            {
                tracing::debug!(error = %e, "Failed to publish health");
            }
        }

        tracing::debug!("Publish pipeline stopped");
    }
}
