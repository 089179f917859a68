//! Driver contract and the supported device types.
//!
//! A [`Driver`] knows how to open a link to one kind of BMS and how to decode
//! what it reads. Retry, backoff and timeouts belong to the device session.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::DeviceSpec;
use crate::error::{LinkError, PollError, ProtocolError};
use crate::sample::Reading;

pub mod dummy;
pub mod ligen;

pub use dummy::DummyDriver;
pub use ligen::LigenDriver;

/// Raw bytes of one poll, as read from the link.
pub type Frame = Vec<u8>;

/// Connect and decode for one device type.
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    fn kind(&self) -> DriverKind;

    /// Open a link to the device.
    async fn connect(&self, device: &DeviceSpec) -> Result<Box<dyn Connection>, LinkError>;

    /// Turn a frame into readings.
    fn decode(&self, device: &DeviceSpec, frame: &[u8]) -> Result<Vec<Reading>, ProtocolError>;
}

/// An open link to one device.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Read one complete frame.
    async fn read_frame(&mut self) -> Result<Frame, PollError>;

    /// Close the link.
    async fn disconnect(&mut self) -> Result<(), LinkError>;

    /// Whether the link can still be used.
    async fn is_alive(&self) -> bool;
}

/// Supported device types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// Simulated BMS without a radio.
    Dummy,
    /// li-gen LiFePO4 BMS over BLE.
    Ligen,
}

impl DriverKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverKind::Dummy => "dummy",
            DriverKind::Ligen => "ligen",
        }
    }

    /// Create the driver for this kind.
    pub fn driver(&self) -> Arc<dyn Driver> {
        match self {
            DriverKind::Dummy => Arc::new(DummyDriver::new()),
            DriverKind::Ligen => Arc::new(LigenDriver::new()),
        }
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned for an unknown device type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownDriver(pub String);

impl fmt::Display for UnknownDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown device type '{}'", self.0)
    }
}

impl std::error::Error for UnknownDriver {}

impl FromStr for DriverKind {
    type Err = UnknownDriver;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "dummy" => Ok(DriverKind::Dummy),
            "ligen" | "li-gen" => Ok(DriverKind::Ligen),
            _ => Err(UnknownDriver(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kind() {
        assert_eq!("dummy".parse::<DriverKind>(), Ok(DriverKind::Dummy));
        assert_eq!(" Li-Gen ".parse::<DriverKind>(), Ok(DriverKind::Ligen));
        assert!("jk".parse::<DriverKind>().is_err());
    }

    #[test]
    fn test_driver_matches_kind() {
        for kind in [DriverKind::Dummy, DriverKind::Ligen] {
            assert_eq!(kind.driver().kind(), kind);
            assert_eq!(kind.to_string().parse::<DriverKind>(), Ok(kind));
        }
    }
}
