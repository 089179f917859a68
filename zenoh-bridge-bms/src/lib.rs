//! Zenoh bridge for battery management systems.
//!
//! This bridge samples BMS devices over their radio link, keeps the last
//! known value of every field and republishes it to Zenoh on a fixed period.
//!
//! # Key Expressions
//!
//! ```text
//! batmon/bms/<device>/<field>
//! batmon/bms/@/status
//! batmon/bms/@/health
//! ```
//!
//! Where:
//! - `<device>` - Device alias, or its address, with unsafe characters replaced
//! - `<field>` - e.g. `voltage`, `current`, `cell_voltages/3`, `meter/total_charge`
//!
//! # Pipeline
//!
//! ```text
//! Scheduler -> DeviceSession (per device) -> ValueCache -> PublishPipeline -> Zenoh
//!     ^                                                          |
//!     +-- AdapterRecoveryManager            Watchdog <-----------+
//! ```

pub mod cache;
pub mod config;
pub mod driver;
pub mod error;
pub mod meter;
pub mod publish;
pub mod recovery;
pub mod sample;
pub mod scheduler;
pub mod session;
pub mod supervisor;
pub mod watchdog;

pub use cache::{CachedValue, ValueCache, is_stale};
pub use config::{BmsBridgeConfig, BmsConfig, DeviceSpec};
pub use driver::{Connection, Driver, DriverKind};
pub use error::{ConfigError, LinkError, PollError, ProtocolError, PublishError};
pub use publish::{BusSink, EntryWriter, PublishFrame, PublishPipeline, ZenohSink};
pub use recovery::{AdapterControl, AdapterRecoveryManager, BluetoothCtl, RecoveryPolicy};
pub use sample::{Reading, Sample};
pub use scheduler::{SamplingMode, Scheduler};
pub use session::{DeviceSession, PollOutcome, SessionPolicy, SessionState};
pub use watchdog::{Heartbeat, Watchdog};
