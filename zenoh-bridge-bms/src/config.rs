//! Configuration for the BMS bridge.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use batmon_bridge_framework::{BridgeConfig, BridgeError, LoggingConfig, ZenohConfig};
use batmon_common::{Format, KEY_PREFIX, sanitize_topic};
use serde::{Deserialize, Serialize};

use crate::driver::DriverKind;
use crate::error::ConfigError;

/// Values are never considered stale sooner than this.
pub const MIN_VALUE_EXPIRY: Duration = Duration::from_secs(20);

/// Lower bound of the watchdog timeout.
pub const MIN_WATCHDOG_TIMEOUT: Duration = Duration::from_secs(300);

/// Lower bound of the meter integration gap.
const MIN_METER_GAP: Duration = Duration::from_secs(600);

/// Complete bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BmsBridgeConfig {
    /// Zenoh connection settings
    #[serde(default)]
    pub zenoh: ZenohConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Sampling and publishing settings
    pub bms: BmsConfig,
}

/// What a published sample carries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadMode {
    /// Plain value as text, e.g. `13.27`.
    #[default]
    Value,
    /// Full telemetry point encoded with `format`.
    Point,
}

/// Sampling, publishing and recovery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BmsConfig {
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    pub devices: Vec<DeviceConfig>,

    #[serde(default)]
    pub concurrent_sampling: bool,

    /// Seconds between sampling rounds.
    #[serde(default = "default_sample_period")]
    pub sample_period: f64,

    /// Seconds between publish ticks. Defaults to `sample_period`.
    #[serde(default)]
    pub publish_period: Option<f64>,

    /// Seconds after which a cached value is stale. Raised to at least two
    /// sample periods, two publish periods and [`MIN_VALUE_EXPIRY`].
    #[serde(default = "default_expire_values_after")]
    pub expire_values_after: f64,

    #[serde(default)]
    pub keep_alive: bool,

    #[serde(default)]
    pub invert_current: bool,

    #[serde(default)]
    pub watchdog: bool,

    #[serde(default)]
    pub bt_power_cycle: bool,

    #[serde(default)]
    pub verbose_log: bool,

    /// Upper bound of concurrent polls in concurrent mode.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// How many sessions may be inside `connect` at once.
    #[serde(default = "default_max_parallel_connects")]
    pub max_parallel_connects: usize,

    /// Seconds allowed for one connect or frame read.
    #[serde(default = "default_io_timeout")]
    pub io_timeout: f64,

    /// Seconds allowed per device to disconnect at shutdown.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: f64,

    #[serde(default = "default_max_backoff_cycles")]
    pub max_backoff_cycles: u32,

    #[serde(default = "default_failure_cap")]
    pub failure_cap: u32,

    #[serde(default)]
    pub payload: PayloadMode,

    #[serde(default)]
    pub format: Format,

    #[serde(default = "default_true")]
    pub publish_health: bool,

    #[serde(default)]
    pub recovery: RecoveryConfig,

    #[serde(default)]
    pub meters: MetersConfig,
}

fn default_key_prefix() -> String {
    KEY_PREFIX.to_string()
}

fn default_sample_period() -> f64 {
    1.0
}

fn default_expire_values_after() -> f64 {
    MIN_VALUE_EXPIRY.as_secs_f64()
}

fn default_max_in_flight() -> usize {
    4
}

fn default_max_parallel_connects() -> usize {
    1
}

fn default_io_timeout() -> f64 {
    10.0
}

fn default_shutdown_timeout() -> f64 {
    5.0
}

fn default_max_backoff_cycles() -> u32 {
    8
}

fn default_failure_cap() -> u32 {
    10
}

fn default_true() -> bool {
    true
}

/// Configuration for a single device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Link-layer address (MAC or advertised name).
    pub address: String,

    /// Driver selector, e.g. "dummy" or "ligen".
    #[serde(rename = "type")]
    pub kind: String,

    /// Display name; also the topic segment.
    #[serde(default)]
    pub alias: Option<String>,

    #[serde(default)]
    pub pin: Option<String>,

    #[serde(default)]
    pub algorithm: Option<String>,

    /// Multiplier for current and power.
    #[serde(default = "default_calibration")]
    pub current_calibration: f64,

    /// Log raw frames of this device.
    #[serde(default)]
    pub debug: bool,
}

fn default_calibration() -> f64 {
    1.0
}

/// Adapter recovery thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Seconds of outcomes kept in the rolling window.
    #[serde(default = "default_window")]
    pub window: f64,

    /// Fraction of link failures above which the adapter counts as degraded.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: f64,

    /// Seconds the rate must stay above threshold before a power-cycle.
    #[serde(default = "default_sustain")]
    pub sustain: f64,

    /// Seconds to wait after powering the adapter back on.
    #[serde(default = "default_settle")]
    pub settle: f64,
}

fn default_window() -> f64 {
    60.0
}

fn default_failure_threshold() -> f64 {
    0.5
}

fn default_sustain() -> f64 {
    30.0
}

fn default_settle() -> f64 {
    2.0
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            window: default_window(),
            failure_threshold: default_failure_threshold(),
            sustain: default_sustain(),
            settle: default_settle(),
        }
    }
}

/// Energy meter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetersConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Where readings survive restarts. Nothing is stored when unset.
    #[serde(default)]
    pub state_file: Option<PathBuf>,

    /// Seconds between state file writes.
    #[serde(default = "default_store_interval")]
    pub store_interval: f64,
}

fn default_store_interval() -> f64 {
    30.0
}

impl Default for MetersConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            state_file: None,
            store_interval: default_store_interval(),
        }
    }
}

/// A device entry that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSpec {
    pub address: String,
    pub kind: DriverKind,
    /// Sanitized topic segment.
    pub topic: String,
    pub alias: Option<String>,
    pub pin: Option<String>,
    pub algorithm: Option<String>,
    pub current_calibration: f64,
    pub debug: bool,
}

impl DeviceSpec {
    /// Display name: alias when set, address otherwise.
    pub fn name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.address)
    }
}

fn secs(value: f64) -> Duration {
    Duration::from_secs_f64(value)
}

impl BmsConfig {
    pub fn sample_period(&self) -> Duration {
        secs(self.sample_period)
    }

    pub fn publish_period(&self) -> Duration {
        secs(self.publish_period.unwrap_or(self.sample_period))
    }

    /// Age after which a cached value is stale.
    ///
    /// Never shorter than two sample or publish periods, nor [`MIN_VALUE_EXPIRY`].
    pub fn effective_expiry(&self) -> Duration {
        secs(self.expire_values_after)
            .max(self.sample_period() * 2)
            .max(self.publish_period() * 2)
            .max(MIN_VALUE_EXPIRY)
    }

    pub fn io_timeout(&self) -> Duration {
        secs(self.io_timeout)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        secs(self.shutdown_timeout)
    }

    /// How long a loop may go without a heartbeat before the watchdog fires.
    pub fn watchdog_timeout(&self) -> Duration {
        (self.sample_period() * 4).max(MIN_WATCHDOG_TIMEOUT)
    }

    /// Longest gap the meters integrate over.
    pub fn meter_max_gap(&self) -> Duration {
        (self.sample_period() * 2).max(MIN_METER_GAP)
    }

    /// Validate device entries one by one.
    ///
    /// Returns the usable devices in configured order, plus one error per
    /// rejected entry.
    pub fn resolve_devices(&self) -> (Vec<DeviceSpec>, Vec<ConfigError>) {
        let mut specs = Vec::new();
        let mut errors = Vec::new();
        let mut seen = HashSet::new();

        for (index, device) in self.devices.iter().enumerate() {
            let address = device.address.trim();
            if address.is_empty() || address.starts_with('#') {
                errors.push(ConfigError::MissingAddress { index });
                continue;
            }

            let kind = match device.kind.parse::<DriverKind>() {
                Ok(kind) => kind,
                Err(_) => {
                    errors.push(ConfigError::UnknownType {
                        address: address.to_string(),
                        kind: device.kind.clone(),
                    });
                    continue;
                }
            };

            if !(device.current_calibration > 0.0) {
                errors.push(ConfigError::InvalidCalibration {
                    address: address.to_string(),
                    value: device.current_calibration,
                });
                continue;
            }

            if !seen.insert(address.to_lowercase()) {
                errors.push(ConfigError::DuplicateAddress {
                    address: address.to_string(),
                });
                continue;
            }

            let alias = device
                .alias
                .as_deref()
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .map(str::to_string);
            let topic = sanitize_topic(alias.as_deref().unwrap_or(address));
            if topic.is_empty() {
                errors.push(ConfigError::InvalidTopic {
                    address: address.to_string(),
                    name: alias.unwrap_or_else(|| address.to_string()),
                });
                continue;
            }

            specs.push(DeviceSpec {
                address: address.to_string(),
                kind,
                topic,
                alias,
                pin: device.pin.clone(),
                algorithm: device.algorithm.clone(),
                current_calibration: device.current_calibration,
                debug: device.debug,
            });
        }

        (specs, errors)
    }
}

impl BridgeConfig for BmsBridgeConfig {
    fn zenoh(&self) -> &ZenohConfig {
        &self.zenoh
    }

    fn logging(&self) -> &LoggingConfig {
        &self.logging
    }

    fn key_prefix(&self) -> &str {
        &self.bms.key_prefix
    }

    fn verbose(&self) -> bool {
        self.bms.verbose_log
    }

    fn validate(&self) -> batmon_bridge_framework::Result<()> {
        let bms = &self.bms;

        if bms.devices.is_empty() {
            return Err(BridgeError::validation(
                "At least one device must be configured",
            ));
        }

        let periods = [
            ("sample_period", Some(bms.sample_period)),
            ("publish_period", bms.publish_period),
            ("expire_values_after", Some(bms.expire_values_after)),
            ("io_timeout", Some(bms.io_timeout)),
            ("shutdown_timeout", Some(bms.shutdown_timeout)),
            ("recovery.window", Some(bms.recovery.window)),
            ("recovery.sustain", Some(bms.recovery.sustain)),
            ("meters.store_interval", Some(bms.meters.store_interval)),
        ];
        for (name, value) in periods {
            if let Some(value) = value
                && !(value > 0.0 && value.is_finite())
            {
                return Err(BridgeError::validation(format!(
                    "{name} must be a positive number of seconds, got {value}"
                )));
            }
        }

        if !(bms.recovery.settle >= 0.0 && bms.recovery.settle.is_finite()) {
            return Err(BridgeError::validation("recovery.settle must be >= 0"));
        }

        let threshold = bms.recovery.failure_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(BridgeError::validation(format!(
                "recovery.failure_threshold must be in (0, 1], got {threshold}"
            )));
        }

        if bms.max_in_flight == 0 {
            return Err(BridgeError::validation("max_in_flight must be >= 1"));
        }

        if bms.max_parallel_connects == 0 {
            return Err(BridgeError::validation("max_parallel_connects must be >= 1"));
        }

        if bms.failure_cap == 0 {
            return Err(BridgeError::validation("failure_cap must be >= 1"));
        }

        if bms.key_prefix.trim_matches('/').is_empty() {
            return Err(BridgeError::validation("key_prefix must not be empty"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> BmsBridgeConfig {
        json5::from_str(json).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = parse(
            r#"{
                bms: { devices: [ { address: "C8:47:8C:00:00:01", type: "dummy" } ] }
            }"#,
        );
        config.validate().unwrap();

        let bms = &config.bms;
        assert_eq!(bms.key_prefix, "batmon/bms");
        assert_eq!(bms.sample_period(), Duration::from_secs(1));
        assert_eq!(bms.publish_period(), bms.sample_period());
        assert_eq!(bms.payload, PayloadMode::Value);
        assert_eq!(bms.format, Format::Json);
        assert!(bms.publish_health);
        assert!(bms.meters.enabled);
        assert_eq!(bms.devices[0].current_calibration, 1.0);
    }

    #[test]
    fn test_effective_expiry() {
        let mut config = parse(
            r#"{ bms: { devices: [ { address: "a", type: "dummy" } ],
                        sample_period: 1.0, publish_period: 2.0, expire_values_after: 5.0 } }"#,
        );
        assert_eq!(config.bms.effective_expiry(), MIN_VALUE_EXPIRY);

        config.bms.expire_values_after = 45.0;
        assert_eq!(config.bms.effective_expiry(), Duration::from_secs(45));

        config.bms.publish_period = Some(30.0);
        assert_eq!(config.bms.effective_expiry(), Duration::from_secs(60));
    }

    #[test]
    fn test_watchdog_and_meter_bounds() {
        let mut config = parse(r#"{ bms: { devices: [ { address: "a", type: "dummy" } ] } }"#);
        assert_eq!(config.bms.watchdog_timeout(), Duration::from_secs(300));
        assert_eq!(config.bms.meter_max_gap(), Duration::from_secs(600));

        config.bms.sample_period = 120.0;
        assert_eq!(config.bms.watchdog_timeout(), Duration::from_secs(480));
        assert_eq!(config.bms.meter_max_gap(), Duration::from_secs(600));
    }

    #[test]
    fn test_bad_devices_are_isolated() {
        let config = parse(
            r##"{
                bms: {
                    devices: [
                        { address: "C8:47:8C:00:00:01", type: "dummy", alias: "House Bank #1" },
                        { address: "# disabled", type: "dummy" },
                        { address: "AA:BB", type: "daly" },
                        { address: "c8:47:8c:00:00:01", type: "ligen" },
                        { address: "DD:EE", type: "ligen", current_calibration: 0 },
                        { address: "van", type: "li-gen" },
                    ]
                }
            }"##,
        );
        config.validate().unwrap();

        let (specs, errors) = config.bms.resolve_devices();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].topic, "House_Bank__1");
        assert_eq!(specs[0].name(), "House Bank #1");
        assert_eq!(specs[1].address, "van");
        assert_eq!(specs[1].kind, DriverKind::Ligen);

        assert_eq!(errors.len(), 4);
        assert!(matches!(errors[0], ConfigError::MissingAddress { index: 1 }));
        assert!(matches!(errors[1], ConfigError::UnknownType { .. }));
        assert!(matches!(errors[2], ConfigError::DuplicateAddress { .. }));
        assert!(matches!(errors[3], ConfigError::InvalidCalibration { .. }));
    }

    #[test]
    fn test_slashes_in_alias_give_valid_topics() {
        let config = parse(
            r#"{
                bms: {
                    devices: [
                        { address: "AA:01", type: "dummy", alias: "rack/" },
                        { address: "AA:02", type: "dummy", alias: "/house" },
                        { address: "AA:03", type: "dummy", alias: "rack//top" },
                        { address: "AA:04", type: "dummy", alias: "//" },
                        { address: "AA:05", type: "dummy" },
                    ]
                }
            }"#,
        );

        let (specs, errors) = config.bms.resolve_devices();
        let topics: Vec<_> = specs.iter().map(|s| s.topic.as_str()).collect();
        assert_eq!(topics, ["rack", "house", "rack/top", "AA_05"]);
        assert_eq!(
            errors,
            [ConfigError::InvalidTopic {
                address: "AA:04".into(),
                name: "//".into(),
            }]
        );
    }

    #[test]
    fn test_topic_falls_back_to_address() {
        let config = parse(r#"{ bms: { devices: [ { address: "C8:47:8C:00:00:01", type: "dummy" } ] } }"#);
        let (specs, _) = config.bms.resolve_devices();
        assert_eq!(specs[0].topic, "C8_47_8C_00_00_01");
    }

    #[test]
    fn test_validate_rejects_globals() {
        let cases = [
            r#"{ bms: { devices: [] } }"#,
            r#"{ bms: { devices: [ { address: "a", type: "dummy" } ], sample_period: 0 } }"#,
            r#"{ bms: { devices: [ { address: "a", type: "dummy" } ], publish_period: -1 } }"#,
            r#"{ bms: { devices: [ { address: "a", type: "dummy" } ], max_in_flight: 0 } }"#,
            r#"{ bms: { devices: [ { address: "a", type: "dummy" } ], max_parallel_connects: 0 } }"#,
            r#"{ bms: { devices: [ { address: "a", type: "dummy" } ], recovery: { failure_threshold: 1.5 } } }"#,
            r#"{ bms: { devices: [ { address: "a", type: "dummy" } ], recovery: { failure_threshold: 0 } } }"#,
        ];

        for case in cases {
            assert!(parse(case).validate().is_err(), "accepted: {case}");
        }
    }

    #[test]
    fn test_load_through_bridge_config() {
        let config = BmsBridgeConfig::parse(
            r#"{
                zenoh: { mode: "client", connect: ["tcp/127.0.0.1:7447"] },
                logging: { level: "warn" },
                bms: {
                    key_prefix: "site/bms",
                    devices: [ { address: "a", type: "dummy" } ],
                    verbose_log: true,
                    payload: "point",
                    format: "cbor",
                }
            }"#,
        )
        .unwrap();

        assert_eq!(config.key_prefix(), "site/bms");
        assert!(config.verbose());
        assert_eq!(config.bms.payload, PayloadMode::Point);
        assert_eq!(config.bms.format, Format::Cbor);
    }
}
