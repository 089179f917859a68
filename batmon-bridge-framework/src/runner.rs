//! Bridge runner for lifecycle management.

use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use batmon_common::{Format, connect, init_tracing};

use crate::BridgeArgs;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::publisher::Publisher;
use crate::signals::wait_for_shutdown_signal;
use crate::status::StatusPublisher;

/// Default time workers get to finish after shutdown starts.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// How a bridge run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Stopped on request and every worker finished in time.
    Graceful,
    /// Workers were aborted, by a second signal or because they outlived
    /// the grace period.
    Forced,
    /// A worker requested a stop because of an unrecoverable condition.
    Fault(String),
}

impl RunOutcome {
    /// Process exit code for this outcome.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Graceful => 0,
            RunOutcome::Forced => 1,
            RunOutcome::Fault(_) => 2,
        }
    }
}

/// Cloneable handle that lets workers observe shutdown or request one.
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle {
    token: CancellationToken,
    fault: Arc<OnceLock<String>>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// The underlying cancellation token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Resolves once shutdown has started.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Start a normal shutdown.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Stop the bridge with a fault. The first reason recorded wins.
    pub fn trigger_fault(&self, reason: impl Into<String>) {
        let reason = reason.into();
        if self.fault.set(reason.clone()).is_ok() {
            tracing::error!(reason = %reason, "Fault shutdown requested");
        }
        self.token.cancel();
    }

    /// The fault reason, if one was recorded.
    pub fn fault(&self) -> Option<String> {
        self.fault.get().cloned()
    }
}

/// Bridge runner that manages the lifecycle of a bridge.
///
/// Handles:
/// - Logging initialization
/// - Zenoh connection
/// - Task spawning and bounded shutdown
/// - Status publishing (optional)
///
/// # Example
///
/// ```ignore
/// use batmon_bridge_framework::{BridgeArgs, BridgeConfig, BridgeRunner};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let args = BridgeArgs::parse_with_default("bms.json5");
///     let config = MyBridgeConfig::load(&args.config)?;
///
///     let mut runner = BridgeRunner::new_with_args("bms", config, Some(&args)).await?;
///     let shutdown = runner.shutdown_handle();
///     runner.spawn(async move { shutdown.cancelled().await });
///
///     let outcome = runner.run_with_metadata(None).await?;
///     std::process::exit(outcome.exit_code());
/// }
/// ```
pub struct BridgeRunner<C: BridgeConfig> {
    name: String,
    version: String,
    config: C,
    session: Arc<zenoh::Session>,
    publisher: Publisher,
    status_publisher: Option<StatusPublisher>,
    shutdown: ShutdownHandle,
    grace_period: Duration,
    tasks: Vec<JoinHandle<()>>,
}

impl<C: BridgeConfig> BridgeRunner<C> {
    /// Create a new bridge runner with CLI args for log level override.
    ///
    /// This will:
    /// 1. Initialize logging (CLI level, then the bridge's verbose flag, then config)
    /// 2. Connect to Zenoh
    /// 3. Create the publisher
    pub async fn new_with_args(
        name: impl Into<String>,
        config: C,
        args: Option<&BridgeArgs>,
    ) -> Result<Self> {
        let name = name.into();
        let version = env!("CARGO_PKG_VERSION").to_string();

        let cli_level = args.and_then(|a| a.log_level.as_deref());
        let log_config = config.logging().resolve(cli_level, config.verbose());
        init_tracing(&log_config).map_err(|e| BridgeError::config(e.to_string()))?;

        tracing::info!(bridge = %name, version = %version, "Starting bridge");

        let session = Arc::new(
            connect(config.zenoh())
                .await
                .map_err(|e| BridgeError::ZenohConnection(e.to_string()))?,
        );

        tracing::info!(zid = %session.zid(), "Connected to Zenoh");

        let publisher = Publisher::new(session.clone(), config.key_prefix(), Format::Json);

        Ok(Self {
            name,
            version,
            config,
            session,
            publisher,
            status_publisher: None,
            shutdown: ShutdownHandle::new(),
            grace_period: DEFAULT_GRACE_PERIOD,
            tasks: Vec::new(),
        })
    }

    /// Enable status publishing on startup and shutdown.
    pub fn with_status_publishing(mut self) -> Self {
        self.status_publisher = Some(StatusPublisher::new(
            self.publisher.clone(),
            &self.name,
            &self.version,
        ));
        self
    }

    /// Set a custom serialization format for the publisher.
    pub fn with_format(mut self, format: Format) -> Self {
        self.publisher = Publisher::new(self.session.clone(), self.config.key_prefix(), format);
        if self.status_publisher.is_some() {
            self = self.with_status_publishing();
        }
        self
    }

    /// Set how long workers get to finish once shutdown starts.
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn config(&self) -> &C {
        &self.config
    }

    /// Get a clone of the publisher.
    pub fn publisher(&self) -> Publisher {
        self.publisher.clone()
    }

    /// Get a handle workers use to observe or request shutdown.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Spawn a worker task.
    ///
    /// Workers are expected to return once the shutdown handle is cancelled.
    /// Any still running after the grace period are aborted.
    pub fn spawn<F>(&mut self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.push(tokio::spawn(future));
    }

    /// Run the bridge until a signal arrives or a worker requests shutdown.
    ///
    /// This will:
    /// 1. Publish "running" status (if enabled)
    /// 2. Wait for a termination signal or a shutdown request
    /// 3. Give workers the grace period to finish, aborting stragglers
    ///    (the run then counts as forced)
    /// 4. Publish "offline" or "error" status (if enabled)
    /// 5. Close the Zenoh session
    ///
    /// A second signal during step 3 aborts all workers at once.
    pub async fn run_with_metadata(self, metadata: Option<serde_json::Value>) -> Result<RunOutcome> {
        if let Some(ref status_pub) = self.status_publisher
            && let Err(e) = status_pub.publish_running(metadata).await
        {
            tracing::warn!(error = %e, "Failed to publish running status");
        }

        tracing::info!(
            bridge = %self.name,
            tasks = self.tasks.len(),
            "Bridge running. Press Ctrl+C to stop."
        );

        tokio::select! {
            _ = next_signal() => tracing::info!(bridge = %self.name, "Received shutdown signal"),
            _ = self.shutdown.cancelled() => tracing::info!(bridge = %self.name, "Shutdown requested"),
        }
        self.shutdown.shutdown();

        let drained = drain_workers(self.tasks, self.grace_period, next_signal()).await;
        let outcome = match (self.shutdown.fault(), drained) {
            (_, Drain::Interrupted) => RunOutcome::Forced,
            (Some(reason), _) => RunOutcome::Fault(reason),
            (None, Drain::TimedOut) => RunOutcome::Forced,
            (None, Drain::Finished) => RunOutcome::Graceful,
        };

        if let Some(ref status_pub) = self.status_publisher {
            let published = match &outcome {
                RunOutcome::Fault(reason) => status_pub.publish_error(reason.clone()).await,
                _ => status_pub.publish_offline().await,
            };
            if let Err(e) = published {
                tracing::warn!(error = %e, "Failed to publish final status");
            }
        }

        if let Err(e) = self.session.close().await {
            tracing::warn!(error = %e, "Error closing Zenoh session");
        }

        tracing::info!(bridge = %self.name, exit_code = outcome.exit_code(), "Goodbye!");

        Ok(outcome)
    }
}

/// How the workers ended once shutdown started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Drain {
    Finished,
    /// Still running after the grace period, then aborted.
    TimedOut,
    /// Aborted by a second signal.
    Interrupted,
}

/// Wait up to `grace` for every worker, aborting the rest on timeout or when
/// `interrupt` resolves first.
async fn drain_workers<I>(tasks: Vec<JoinHandle<()>>, grace: Duration, interrupt: I) -> Drain
where
    I: Future<Output = ()>,
{
    let aborts: Vec<_> = tasks.iter().map(|t| t.abort_handle()).collect();
    let join_all = async move {
        for task in tasks {
            if let Err(e) = task.await
                && e.is_panic()
            {
                tracing::error!(error = %e, "Worker panicked");
            }
        }
    };

    let drain = tokio::select! {
        joined = tokio::time::timeout(grace, join_all) => match joined {
            Ok(()) => Drain::Finished,
            Err(_) => {
                tracing::warn!(
                    grace_ms = grace.as_millis() as u64,
                    "Workers did not stop in time, aborting"
                );
                Drain::TimedOut
            }
        },
        _ = interrupt => {
            tracing::warn!("Second signal received, forcing exit");
            Drain::Interrupted
        }
    };

    if drain != Drain::Finished {
        aborts.iter().for_each(|a| a.abort());
    }
    drain
}

/// Wait for a termination signal; never resolves if listeners can't be installed.
async fn next_signal() {
    if let Err(e) = wait_for_shutdown_signal().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signals");
        std::future::pending::<()>().await;
    }
}
