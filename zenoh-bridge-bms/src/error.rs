//! Error taxonomy of the BMS bridge.
//!
//! Link and protocol errors are recovered inside a device session and never
//! stop the scheduler. Only [`LinkError`] feeds the adapter health window.

use std::time::Duration;

use thiserror::Error;

/// Transport or radio failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LinkError {
    #[error("{op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("device not found: {0}")]
    NotFound(String),

    #[error("link lost: {0}")]
    Lost(String),

    #[error("adapter unavailable: {0}")]
    Adapter(String),

    #[error("link not supported: {0}")]
    Unsupported(String),
}

/// Malformed or unexpected payload.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("incomplete frame: {0}")]
    Incomplete(String),

    #[error("invalid frame ({reason}): {frame}")]
    Invalid { reason: &'static str, frame: String },

    #[error("payload too short: expected {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },

    #[error("decode failed: {0}")]
    Decode(String),
}

/// Outcome of a failed poll.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PollError {
    #[error("link: {0}")]
    Link(#[from] LinkError),

    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),
}

impl PollError {
    /// Whether this failure counts against adapter health.
    pub fn is_link(&self) -> bool {
        matches!(self, PollError::Link(_))
    }
}

/// Invalid device entry. Fatal for that device only.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    #[error("device #{index}: address is empty or commented out")]
    MissingAddress { index: usize },

    #[error("device {address}: unknown type '{kind}'")]
    UnknownType { address: String, kind: String },

    #[error("device {address}: duplicate address")]
    DuplicateAddress { address: String },

    #[error("device {address}: current_calibration must be > 0, got {value}")]
    InvalidCalibration { address: String, value: f64 },

    #[error("device {address}: '{name}' gives an empty topic")]
    InvalidTopic { address: String, name: String },
}

/// Bus failure. The frame is dropped.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PublishError {
    #[error("failed to publish {key}: {message}")]
    Bus { key: String, message: String },

    #[error("failed to encode {key}: {message}")]
    Encode { key: String, message: String },
}

/// Meter state file could not be read or written.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("meter state I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("meter state JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_link_errors_count_as_link() {
        let link: PollError = LinkError::Connect("refused".into()).into();
        let proto: PollError = ProtocolError::Decode("bad".into()).into();
        assert!(link.is_link());
        assert!(!proto.is_link());
    }

    #[test]
    fn test_display() {
        let err = PollError::from(LinkError::Timeout {
            op: "connect",
            after: Duration::from_secs(10),
        });
        assert_eq!(err.to_string(), "link: connect timed out after 10s");
    }
}
