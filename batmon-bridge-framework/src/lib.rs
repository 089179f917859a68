//! Batmon Bridge Framework
//!
//! Common abstractions for bridges that sample devices and publish telemetry to Zenoh.
//!
//! # Overview
//!
//! This framework provides:
//! - [`BridgeConfig`] trait for configuration loading and validation
//! - [`BridgeRunner`] for managing bridge lifecycle (startup, signals, bounded shutdown)
//! - [`ShutdownHandle`] so workers can observe shutdown or request a fault stop
//! - [`Publisher`] for publishing telemetry to Zenoh with automatic serialization
//! - [`BridgeArgs`] for common CLI argument parsing
//! - [`BridgeHealth`] for per-device liveness and failure tracking
//!
//! # Example
//!
//! ```ignore
//! use batmon_bridge_framework::{BridgeArgs, BridgeConfig, BridgeRunner};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = BridgeArgs::parse_with_default("mybridge.json5");
//!     let config = MyBridgeConfig::load(&args.config)?;
//!
//!     let mut runner = BridgeRunner::new_with_args("mybridge", config, Some(&args)).await?;
//!     let shutdown = runner.shutdown_handle();
//!     runner.spawn(my_worker(runner.publisher(), shutdown));
//!
//!     let outcome = runner.run_with_metadata(None).await?;
//!     std::process::exit(outcome.exit_code());
//! }
//! ```

mod args;
mod config;
mod error;
mod health;
mod publisher;
mod runner;
mod signals;
mod status;

pub use args::BridgeArgs;
pub use config::BridgeConfig;
pub use error::{BridgeError, Result};
pub use health::{BridgeHealth, DeviceLiveness, DeviceStatus, HealthSnapshot};
pub use publisher::Publisher;
pub use runner::{BridgeRunner, RunOutcome, ShutdownHandle};
pub use signals::wait_for_shutdown_signal;
pub use status::{BridgeStatus, StatusPublisher};

// Re-export commonly used types from batmon-common
pub use batmon_common::{Format, LoggingConfig, TelemetryPoint, TelemetryValue, ZenohConfig};
