//! Gateway status reporting.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::Result;
use crate::bus::{Bus, PublishOptions};

/// Gateway status information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeStatus {
    /// Bridge name (e.g., "modbus-gw").
    pub bridge: String,
    /// Bridge version.
    pub version: String,
    /// Current status ("running", "offline", "error").
    pub status: String,
    /// Additional metadata.
    #[serde(flatten)]
    pub metadata: serde_json::Value,
}

impl BridgeStatus {
    fn with_status(bridge: impl Into<String>, version: impl Into<String>, status: &str) -> Self {
        Self {
            bridge: bridge.into(),
            version: version.into(),
            status: status.to_string(),
            metadata: serde_json::Value::Null,
        }
    }

    /// Create a new status with "running" state.
    pub fn running(bridge: impl Into<String>, version: impl Into<String>) -> Self {
        Self::with_status(bridge, version, "running")
    }

    /// Create a status with "offline" state.
    pub fn offline(bridge: impl Into<String>, version: impl Into<String>) -> Self {
        Self::with_status(bridge, version, "offline")
    }

    /// Create a status with "error" state.
    pub fn error(
        bridge: impl Into<String>,
        version: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self::with_status(bridge, version, "error")
            .with_metadata(serde_json::json!({ "error": error.into() }))
    }

    /// Add metadata to the status.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Publish this status as retained JSON on `key`.
    pub async fn publish(&self, bus: &dyn Bus, key: &str) -> Result<()> {
        let payload = serde_json::to_vec(self)?;
        bus.publish(key, payload, PublishOptions::retained(1)).await
    }
}

/// Helper to publish gateway status on startup and shutdown.
pub struct StatusPublisher {
    bus: Arc<dyn Bus>,
    key: String,
    bridge_name: String,
    version: String,
}

impl StatusPublisher {
    /// Create a new status publisher writing to `key`.
    pub fn new(
        bus: Arc<dyn Bus>,
        key: impl Into<String>,
        bridge_name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            bus,
            key: key.into(),
            bridge_name: bridge_name.into(),
            version: version.into(),
        }
    }

    /// Key the status is published on.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Publish "running" status with optional metadata.
    pub async fn publish_running(&self, metadata: Option<serde_json::Value>) -> Result<()> {
        let mut status = BridgeStatus::running(&self.bridge_name, &self.version);
        if let Some(meta) = metadata {
            status = status.with_metadata(meta);
        }
        status.publish(self.bus.as_ref(), &self.key).await
    }

    /// Publish "offline" status.
    pub async fn publish_offline(&self) -> Result<()> {
        BridgeStatus::offline(&self.bridge_name, &self.version)
            .publish(self.bus.as_ref(), &self.key)
            .await
    }

    /// Publish "error" status.
    pub async fn publish_error(&self, error: impl Into<String>) -> Result<()> {
        BridgeStatus::error(&self.bridge_name, &self.version, error)
            .publish(self.bus.as_ref(), &self.key)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryBus;

    #[test]
    fn test_status_running() {
        let status = BridgeStatus::running("modbus-gw", "0.2.0");
        assert_eq!(status.bridge, "modbus-gw");
        assert_eq!(status.status, "running");
    }

    #[test]
    fn test_status_with_metadata() {
        let status = BridgeStatus::running("modbus-gw", "0.2.0").with_metadata(serde_json::json!({
            "devices": ["boiler", "pump"],
            "buses": 2
        }));

        assert_eq!(status.metadata["devices"][0], "boiler");
        assert_eq!(status.metadata["buses"], 2);
    }

    #[test]
    fn test_status_serialization() {
        let status =
            BridgeStatus::running("test", "1.0.0").with_metadata(serde_json::json!({ "count": 5 }));

        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"bridge\":\"test\""));
        assert!(json.contains("\"status\":\"running\""));
        assert!(json.contains("\"count\":5"));
    }

    #[test]
    fn test_status_publisher_retains() {
        tokio_test::block_on(async {
            let bus = Arc::new(MemoryBus::new());
            let publisher = StatusPublisher::new(bus.clone(), "gw/gw01/@/status", "modbus-gw", "0.2.0");

            publisher.publish_running(None).await.unwrap();
            publisher.publish_error("bus down").await.unwrap();
            publisher.publish_offline().await.unwrap();

            let published = bus.published_on("gw/gw01/@/status");
            assert_eq!(published.len(), 3);
            assert!(published.iter().all(|p| p.options.retain));
            assert_eq!(published[1].json().unwrap()["error"], "bus down");
            assert_eq!(published[2].json().unwrap()["status"], "offline");
        });
    }
}
