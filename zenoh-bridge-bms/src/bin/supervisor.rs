//! Respawn loop for the BMS bridge.
//!
//! ```text
//! batmon-supervisor --restart-delay 5 -- zenoh-bridge-bms --config bms.json5
//! ```

use anyhow::Result;
use batmon_common::{LoggingConfig, init_tracing};
use clap::Parser;

use zenoh_bridge_bms::supervisor::{Supervisor, SupervisorArgs};

#[tokio::main]
async fn main() -> Result<()> {
    let args = SupervisorArgs::parse();

    let logging = LoggingConfig {
        level: args.log_level.clone(),
        ..LoggingConfig::default()
    };
    init_tracing(&logging).map_err(|e| anyhow::anyhow!("Failed to init tracing: {}", e))?;

    let supervisor = Supervisor::from_args(&args)?;
    let code = supervisor.run().await?;

    tracing::info!(code, "Supervisor exiting");
    std::process::exit(code);
}
