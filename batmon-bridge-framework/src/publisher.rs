//! Telemetry publisher for Zenoh.

use std::sync::Arc;

use batmon_common::{Format, TelemetryPoint, encode};

use crate::error::{BridgeError, Result};

/// Publisher for sending telemetry to Zenoh.
///
/// Wraps a Zenoh session and provides convenient methods for publishing
/// [`TelemetryPoint`] values, plain payloads and JSON documents.
#[derive(Clone, Debug)]
pub struct Publisher {
    session: Arc<zenoh::Session>,
    key_prefix: String,
    format: Format,
}

impl Publisher {
    /// Create a new publisher.
    pub fn new(
        session: Arc<zenoh::Session>,
        key_prefix: impl Into<String>,
        format: Format,
    ) -> Self {
        Self {
            session,
            key_prefix: key_prefix.into(),
            format,
        }
    }

    /// Get the key prefix.
    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    /// Get the serialization format.
    pub fn format(&self) -> Format {
        self.format
    }

    /// Build a full key expression from a suffix.
    pub fn build_key(&self, suffix: &str) -> String {
        join_key(&self.key_prefix, suffix)
    }

    /// Publish a telemetry point to a full key, encoded in the publisher's format.
    pub async fn publish_point(&self, key: &str, point: &TelemetryPoint) -> Result<()> {
        let payload =
            encode(point, self.format).map_err(|e| BridgeError::Serialization(e.to_string()))?;
        self.publish_raw(key, payload).await
    }

    /// Publish raw bytes to a full key.
    pub async fn publish_raw(&self, key: &str, payload: impl Into<Vec<u8>>) -> Result<()> {
        self.session
            .put(key, payload.into())
            .await
            .map_err(|e| BridgeError::Publish {
                key: key.to_string(),
                message: e.to_string(),
            })
    }

    /// Publish a JSON value to a full key.
    pub async fn publish_json<T: serde::Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let payload = serde_json::to_vec(value)?;
        self.publish_raw(key, payload).await
    }
}

fn join_key(prefix: &str, suffix: &str) -> String {
    if suffix.is_empty() {
        prefix.to_string()
    } else {
        format!("{}/{}", prefix, suffix)
    }
}
