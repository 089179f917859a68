//! Per-device connection lifecycle.
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Sampling -> Connected
//!      ^              |                          |
//!      +--------------+------- on error ---------+
//! any -> Closed (shutdown)
//! ```
//!
//! A failed poll is not retried within the same cycle. The session skips a
//! number of scheduler ticks that doubles with each consecutive failure, up to
//! `max_backoff_cycles`.

use std::sync::Arc;
use std::time::Duration;

use batmon_common::current_timestamp_millis;
use tokio::sync::Semaphore;
use tokio::time::{Instant, timeout};

use crate::config::{BmsConfig, DeviceSpec};
use crate::driver::{Connection, Driver};
use crate::error::{LinkError, PollError};
use crate::sample::{Sample, apply_calibration, derive_cell_stats};

/// Connection state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Sampling,
    /// Terminal, reached only at shutdown.
    Closed,
}

/// Timing and retry knobs shared by all sessions.
#[derive(Debug, Clone)]
pub struct SessionPolicy {
    /// Hold the link open between cycles.
    pub keep_alive: bool,
    /// Bound on one connect or frame read.
    pub io_timeout: Duration,
    /// Bound on disconnect at shutdown.
    pub shutdown_timeout: Duration,
    pub max_backoff_cycles: u32,
    /// Consecutive failures stop counting here.
    pub failure_cap: u32,
}

impl SessionPolicy {
    pub fn from_config(config: &BmsConfig) -> Self {
        Self {
            keep_alive: config.keep_alive,
            io_timeout: config.io_timeout(),
            shutdown_timeout: config.shutdown_timeout(),
            max_backoff_cycles: config.max_backoff_cycles,
            failure_cap: config.failure_cap,
        }
    }

    /// Ticks to skip after `failures` consecutive failures.
    pub fn backoff_cycles(&self, failures: u32) -> u32 {
        if failures == 0 {
            return 0;
        }
        1u32.checked_shl(failures - 1)
            .unwrap_or(u32::MAX)
            .min(self.max_backoff_cycles)
    }
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            keep_alive: false,
            io_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(5),
            max_backoff_cycles: 8,
            failure_cap: 10,
        }
    }
}

/// Result of one poll.
#[derive(Debug)]
pub enum PollOutcome {
    Sampled(Vec<Sample>),
    Failed(PollError),
    /// Skipped because of backoff.
    BackingOff { remaining: u32 },
    Closed,
}

/// One device and its link.
pub struct DeviceSession {
    spec: DeviceSpec,
    driver: Arc<dyn Driver>,
    policy: SessionPolicy,
    connect_gate: Arc<Semaphore>,
    conn: Option<Box<dyn Connection>>,
    state: SessionState,
    last_success: Option<Instant>,
    consecutive_failures: u32,
    skip_cycles: u32,
    generation: u64,
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("device", &self.spec.address)
            .field("state", &self.state)
            .field("consecutive_failures", &self.consecutive_failures)
            .finish()
    }
}

impl DeviceSession {
    /// `connect_gate` limits how many sessions may connect at once.
    pub fn new(
        spec: DeviceSpec,
        driver: Arc<dyn Driver>,
        policy: SessionPolicy,
        connect_gate: Arc<Semaphore>,
    ) -> Self {
        Self {
            spec,
            driver,
            policy,
            connect_gate,
            conn: None,
            state: SessionState::Disconnected,
            last_success: None,
            consecutive_failures: 0,
            skip_cycles: 0,
            generation: 0,
        }
    }

    pub fn spec(&self) -> &DeviceSpec {
        &self.spec
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn last_success(&self) -> Option<Instant> {
        self.last_success
    }

    /// Run one cycle: connect if needed, read, decode.
    ///
    /// `generation` is the adapter generation; when it moved since the last
    /// poll the link is dropped and rebuilt.
    pub async fn poll(&mut self, generation: u64) -> PollOutcome {
        if self.state == SessionState::Closed {
            return PollOutcome::Closed;
        }

        if generation != self.generation {
            self.generation = generation;
            self.reset().await;
        }

        if self.skip_cycles > 0 {
            self.skip_cycles -= 1;
            return PollOutcome::BackingOff {
                remaining: self.skip_cycles,
            };
        }

        match self.sample().await {
            Ok(samples) => {
                self.consecutive_failures = 0;
                self.last_success = Some(Instant::now());
                if !self.policy.keep_alive {
                    self.drop_connection(self.policy.io_timeout).await;
                }
                PollOutcome::Sampled(samples)
            }
            Err(e) => {
                self.drop_connection(self.policy.io_timeout).await;
                self.consecutive_failures =
                    (self.consecutive_failures + 1).min(self.policy.failure_cap);
                self.skip_cycles = self.policy.backoff_cycles(self.consecutive_failures);
                tracing::warn!(
                    device = %self.spec.name(),
                    error = %e,
                    failures = self.consecutive_failures,
                    skip = self.skip_cycles,
                    "Poll failed"
                );
                PollOutcome::Failed(e)
            }
        }
    }

    async fn sample(&mut self) -> Result<Vec<Sample>, PollError> {
        self.ensure_connected().await?;

        let Some(conn) = self.conn.as_mut() else {
            return Err(LinkError::Lost("no connection".into()).into());
        };

        self.state = SessionState::Sampling;
        let frame = timeout(self.policy.io_timeout, conn.read_frame())
            .await
            .map_err(|_| LinkError::Timeout {
                op: "read",
                after: self.policy.io_timeout,
            })??;

        let mut readings = self.driver.decode(&self.spec, &frame)?;
        apply_calibration(&mut readings, self.spec.current_calibration);
        derive_cell_stats(&mut readings);
        self.state = SessionState::Connected;

        let timestamp = current_timestamp_millis();
        let acquired_at = Instant::now();
        Ok(readings
            .into_iter()
            .map(|r| Sample::from_reading(&self.spec.address, r, timestamp, acquired_at))
            .collect())
    }

    async fn ensure_connected(&mut self) -> Result<(), LinkError> {
        if let Some(conn) = self.conn.as_ref() {
            if conn.is_alive().await {
                return Ok(());
            }
            tracing::debug!(device = %self.spec.name(), "Link went away, reconnecting");
            self.drop_connection(self.policy.io_timeout).await;
        }

        self.state = SessionState::Connecting;
        let _permit = self
            .connect_gate
            .acquire()
            .await
            .map_err(|_| LinkError::Adapter("connect gate closed".into()))?;

        let conn = timeout(self.policy.io_timeout, self.driver.connect(&self.spec))
            .await
            .map_err(|_| LinkError::Timeout {
                op: "connect",
                after: self.policy.io_timeout,
            })??;

        tracing::debug!(device = %self.spec.name(), "Connected");
        self.conn = Some(conn);
        self.state = SessionState::Connected;
        Ok(())
    }

    /// Disconnect within `bound`, leaving the session Disconnected.
    async fn drop_connection(&mut self, bound: Duration) {
        if let Some(mut conn) = self.conn.take() {
            match timeout(bound, conn.disconnect()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::debug!(device = %self.spec.name(), error = %e, "Disconnect failed")
                }
                Err(_) => {
                    tracing::warn!(device = %self.spec.name(), "Disconnect timed out")
                }
            }
        }
        if self.state != SessionState::Closed {
            self.state = SessionState::Disconnected;
        }
    }

    /// Forget the link and any backoff, e.g. after an adapter power-cycle.
    pub async fn reset(&mut self) {
        self.drop_connection(self.policy.io_timeout).await;
        self.skip_cycles = 0;
    }

    /// Disconnect within the shutdown bound and enter `Closed`.
    pub async fn close(&mut self) {
        self.drop_connection(self.policy.shutdown_timeout).await;
        self.state = SessionState::Closed;
        tracing::debug!(device = %self.spec.name(), "Session closed");
    }
}
