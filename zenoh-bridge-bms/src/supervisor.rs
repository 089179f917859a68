//! Out-of-process respawn loop around the bridge binary.
//!
//! The child is restarted after every exit. Interrupt, terminate and quit are
//! not handled here beyond forwarding: the child gets SIGINT, and is killed
//! when it has not exited within the grace period. On unix the child runs in
//! its own process group, so a terminal Ctrl+C reaches it once, through the
//! supervisor, and not a second time straight from the terminal.

use std::process::ExitStatus;
use std::time::Duration;

use anyhow::Context;
use batmon_bridge_framework::wait_for_shutdown_signal;
use clap::Parser;
use tokio::process::{Child, Command};

/// Command line of `batmon-supervisor`.
#[derive(Parser, Debug, Clone)]
#[command(name = "batmon-supervisor", version, about = "Keep a bridge process running")]
pub struct SupervisorArgs {
    /// Seconds to wait before restarting the child
    #[arg(long, default_value_t = 5.0)]
    pub restart_delay: f64,

    /// Seconds the child gets to exit after SIGINT before it is killed
    #[arg(long, default_value_t = 10.0)]
    pub grace_period: f64,

    /// Stop after this many restarts
    #[arg(long)]
    pub max_restarts: Option<u32>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Program and arguments to run
    #[arg(last = true, required = true)]
    pub command: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Supervisor {
    program: String,
    args: Vec<String>,
    restart_delay: Duration,
    grace_period: Duration,
    max_restarts: Option<u32>,
}

impl Supervisor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            restart_delay: Duration::from_secs(5),
            grace_period: Duration::from_secs(10),
            max_restarts: None,
        }
    }

    pub fn from_args(args: &SupervisorArgs) -> anyhow::Result<Self> {
        let (program, rest) = args
            .command
            .split_first()
            .context("no command to supervise")?;
        anyhow::ensure!(
            args.restart_delay >= 0.0 && args.grace_period >= 0.0,
            "delays must not be negative"
        );

        Ok(Self::new(program.clone(), rest.to_vec())
            .with_restart_delay(Duration::from_secs_f64(args.restart_delay))
            .with_grace_period(Duration::from_secs_f64(args.grace_period))
            .with_max_restarts(args.max_restarts))
    }

    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    pub fn with_max_restarts(mut self, max: Option<u32>) -> Self {
        self.max_restarts = max;
        self
    }

    fn spawn(&self) -> anyhow::Result<Child> {
        let mut command = Command::new(&self.program);
        command.args(&self.args).kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        command
            .spawn()
            .with_context(|| format!("failed to start {}", self.program))
    }

    /// Run the child until a signal arrives or the restart budget is spent.
    ///
    /// Returns the exit code of the last child.
    pub async fn run(&self) -> anyhow::Result<i32> {
        let mut restarts = 0u32;

        loop {
            let mut child = self.spawn()?;
            tracing::info!(program = %self.program, pid = child.id(), restarts, "Child started");

            let status = tokio::select! {
                status = child.wait() => status.context("failed to wait for child")?,
                _ = next_signal() => {
                    tracing::info!("Signal received, stopping child");
                    let status = self.stop(&mut child).await?;
                    return Ok(exit_code(status));
                }
            };

            let code = exit_code(status);
            tracing::warn!(program = %self.program, code, "Child exited");

            if self.max_restarts.is_some_and(|max| restarts >= max) {
                tracing::error!(restarts, "Restart limit reached, giving up");
                return Ok(code);
            }
            restarts += 1;

            tokio::select! {
                _ = tokio::time::sleep(self.restart_delay) => {}
                _ = next_signal() => return Ok(code),
            }
        }
    }

    /// Forward SIGINT, then kill the child once the grace period is over.
    pub async fn stop(&self, child: &mut Child) -> anyhow::Result<ExitStatus> {
        if let Err(e) = interrupt(child).await {
            tracing::warn!(error = %e, "Could not interrupt child");
        }

        match tokio::time::timeout(self.grace_period, child.wait()).await {
            Ok(status) => Ok(status.context("failed to wait for child")?),
            Err(_) => {
                tracing::warn!(
                    grace_ms = self.grace_period.as_millis() as u64,
                    "Child ignored the interrupt, killing it"
                );
                child.kill().await.context("failed to kill child")?;
                Ok(child.wait().await.context("failed to wait for child")?)
            }
        }
    }
}

#[cfg(unix)]
async fn interrupt(child: &Child) -> anyhow::Result<()> {
    let pid = child.id().context("child already reaped")?;
    let status = Command::new("kill")
        .args(["-INT", &pid.to_string()])
        .status()
        .await
        .context("failed to run kill")?;
    anyhow::ensure!(status.success(), "kill -INT {pid} exited with {status}");
    Ok(())
}

#[cfg(not(unix))]
async fn interrupt(child: &mut Child) -> anyhow::Result<()> {
    child.start_kill().context("failed to stop child")
}

/// Wait for a termination signal. Never completes if no listener can be set up.
async fn next_signal() {
    if let Err(e) = wait_for_shutdown_signal().await {
        tracing::error!(error = %e, "Failed to listen for signals");
        std::future::pending::<()>().await;
    }
}

/// Exit code of a child, `128 + signal` when it was killed by a signal.
pub fn exit_code(status: ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    status.code().unwrap_or(1)
}
