//! In-process watchdog over the long-running loops.
//!
//! Each loop owns a [`Heartbeat`]. When one has not beaten within the timeout
//! the watchdog raises a fault on the shutdown handle, the bridge stops and
//! exits non-zero so the supervisor starts a fresh process.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use batmon_bridge_framework::ShutdownHandle;
use tokio::time::Instant;

/// Liveness marker of one loop.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    name: Arc<str>,
    origin: Instant,
    /// Millis since `origin` of the last beat.
    last: Arc<AtomicU64>,
}

impl Heartbeat {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn beat(&self) {
        let ms = self.origin.elapsed().as_millis() as u64;
        self.last.store(ms, Ordering::Relaxed);
    }

    /// Time since the last beat.
    pub fn idle(&self, now: Instant) -> Duration {
        let last = self.origin + Duration::from_millis(self.last.load(Ordering::Relaxed));
        now.saturating_duration_since(last)
    }
}

#[derive(Debug)]
pub struct Watchdog {
    timeout: Duration,
    origin: Instant,
    heartbeats: Vec<Heartbeat>,
}

impl Watchdog {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            origin: Instant::now(),
            heartbeats: Vec::new(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Register a loop. It counts as alive from now on.
    pub fn heartbeat(&mut self, name: &str) -> Heartbeat {
        let hb = Heartbeat {
            name: name.into(),
            origin: self.origin,
            last: Arc::new(AtomicU64::new(0)),
        };
        hb.beat();
        self.heartbeats.push(hb.clone());
        hb
    }

    /// Name of the first loop overdue at `now`.
    pub fn overdue(&self, now: Instant) -> Option<&str> {
        self.heartbeats
            .iter()
            .find(|hb| hb.idle(now) > self.timeout)
            .map(Heartbeat::name)
    }

    /// Check the heartbeats until shutdown, raising a fault on the first
    /// overdue loop.
    pub async fn run(self, shutdown: ShutdownHandle) {
        let mut ticker = tokio::time::interval((self.timeout / 4).max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(timeout_s = self.timeout.as_secs(), loops = self.heartbeats.len(), "Watchdog armed");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }

            if let Some(name) = self.overdue(Instant::now()) {
                let reason = format!("watchdog: {name} loop stalled for more than {:?}", self.timeout);
                tracing::error!(%reason, "Stopping the bridge");
                shutdown.trigger_fault(reason);
                return;
            }
        }
    }
}
