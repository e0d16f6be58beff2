//! Configuration traits and utilities.

use std::path::Path;

use serde::de::DeserializeOwned;

use crate::error::{BridgeError, Result};
use crate::{LoggingConfig, ZenohConfig};

/// Trait for gateway configuration types.
///
/// Implement this trait for a configuration struct to get loading,
/// validation, and access to the fields the runner needs.
///
/// # Example
///
/// ```ignore
/// use serde::Deserialize;
/// use modbus_gw_framework::{BridgeConfig, ZenohConfig, LoggingConfig};
///
/// #[derive(Debug, Deserialize)]
/// pub struct GatewayConfig {
///     pub zenoh: ZenohConfig,
///     pub logging: LoggingConfig,
///     pub gateway: GatewaySettings,
/// }
///
/// impl BridgeConfig for GatewayConfig {
///     fn zenoh(&self) -> &ZenohConfig {
///         &self.zenoh
///     }
///
///     fn logging(&self) -> &LoggingConfig {
///         &self.logging
///     }
///
///     fn key_prefix(&self) -> String {
///         format!("{}/{}", self.gateway.domain, self.gateway.uid)
///     }
/// }
/// ```
pub trait BridgeConfig: Sized + DeserializeOwned {
    /// Get the Zenoh configuration.
    fn zenoh(&self) -> &ZenohConfig;

    /// Get the logging configuration.
    fn logging(&self) -> &LoggingConfig;

    /// Key prefix under which the gateway reports about itself.
    fn key_prefix(&self) -> String;

    /// Key the gateway status is published on.
    fn status_key(&self) -> String {
        format!("{}/@/status", self.key_prefix())
    }

    /// Validate the configuration.
    ///
    /// Called automatically after loading. Override to add custom validation.
    fn validate(&self) -> Result<()> {
        self.zenoh().validate()?;
        Ok(())
    }

    /// Parse configuration from JSON5 text and validate it.
    fn parse(content: &str) -> Result<Self> {
        let config: Self = modbus_gw_common::parse_config(content)
            .map_err(|e| BridgeError::ConfigParse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file path.
    ///
    /// Supports JSON5 format. Calls [`validate`](Self::validate) after loading.
    fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(BridgeError::ConfigNotFound {
                path: path.display().to_string(),
            });
        }

        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }
}
