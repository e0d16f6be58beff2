//! Runner for the gateway lifecycle.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::signal;
use tokio::task::JoinHandle;

use modbus_gw_common::{LoggingConfig, init_tracing};

use crate::BridgeArgs;
use crate::bus::{Bus, ZenohBus};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::status::StatusPublisher;

type ShutdownHook = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Runner that manages the lifecycle of the gateway process.
///
/// Handles:
/// - Logging initialization
/// - Bus connection
/// - Task spawning and management
/// - Graceful shutdown on Ctrl+C
/// - Status publishing (optional)
///
/// # Example
///
/// ```ignore
/// use modbus_gw_framework::{BridgeArgs, BridgeConfig, BridgeRunner};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let args = BridgeArgs::parse_with_default("gateway.json5");
///     let config = GatewayConfig::load(&args.config)?;
///
///     let mut runner = BridgeRunner::new_with_args("modbus-gw", config, Some(&args))
///         .await?
///         .with_status();
///
///     let bus = runner.bus();
///     runner.spawn(async move {
///         // Worker logic here
///     });
///
///     runner.run().await
/// }
/// ```
pub struct BridgeRunner<C: BridgeConfig> {
    /// Bridge name for logging and status.
    name: String,
    /// Bridge version.
    version: String,
    /// The loaded configuration.
    config: C,
    /// Message bus.
    bus: Arc<dyn Bus>,
    /// Status publisher (optional).
    status_publisher: Option<StatusPublisher>,
    /// Spawned tasks.
    tasks: Vec<JoinHandle<()>>,
    /// Work to run once the shutdown signal arrived, before tasks are aborted.
    shutdown_hooks: Vec<ShutdownHook>,
}

impl<C: BridgeConfig> BridgeRunner<C> {
    /// Create a new runner.
    ///
    /// This will:
    /// 1. Initialize logging based on config
    /// 2. Connect to Zenoh
    pub async fn new(name: impl Into<String>, config: C) -> Result<Self> {
        Self::new_with_args(name, config, None).await
    }

    /// Create a new runner with CLI args for log level override.
    pub async fn new_with_args(
        name: impl Into<String>,
        config: C,
        args: Option<&BridgeArgs>,
    ) -> Result<Self> {
        let name = name.into();

        let log_config = match args.and_then(|args| args.log_level.as_ref()) {
            Some(level) => LoggingConfig {
                level: level.clone(),
                format: config.logging().format,
            },
            None => config.logging().clone(),
        };

        init_tracing(&log_config).map_err(|e| BridgeError::config(e.to_string()))?;

        tracing::info!(bridge = %name, version = env!("CARGO_PKG_VERSION"), "Starting bridge");

        let bus = ZenohBus::connect(config.zenoh()).await?;

        Ok(Self::with_bus(name, config, Arc::new(bus)))
    }

    /// Create a runner over an existing bus. Logging is left untouched.
    pub fn with_bus(name: impl Into<String>, config: C, bus: Arc<dyn Bus>) -> Self {
        Self {
            name: name.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            config,
            bus,
            status_publisher: None,
            tasks: Vec::new(),
            shutdown_hooks: Vec::new(),
        }
    }

    /// Enable status publishing on the configured status key.
    pub fn with_status(mut self) -> Self {
        self.status_publisher = Some(StatusPublisher::new(
            self.bus.clone(),
            self.config.status_key(),
            &self.name,
            &self.version,
        ));
        self
    }

    /// Get the bridge name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the bridge version.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Get a reference to the configuration.
    pub fn config(&self) -> &C {
        &self.config
    }

    /// Get a handle to the bus.
    pub fn bus(&self) -> Arc<dyn Bus> {
        self.bus.clone()
    }

    /// Spawn a worker task.
    ///
    /// The task will be tracked and aborted on shutdown.
    pub fn spawn<F>(&mut self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future);
        self.tasks.push(handle);
    }

    /// Spawn a worker task that returns a Result.
    ///
    /// Errors are logged automatically.
    pub fn spawn_with_error<F, E>(&mut self, name: String, future: F)
    where
        F: Future<Output = std::result::Result<(), E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            if let Err(e) = future.await {
                tracing::error!(worker = %name, error = %e, "Worker failed");
            }
        });
        self.tasks.push(handle);
    }

    /// Register work to run when shutting down, while the bus is still open.
    pub fn on_shutdown<F>(&mut self, hook: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.shutdown_hooks.push(Box::pin(hook));
    }

    /// Run until Ctrl+C is received.
    pub async fn run(self) -> Result<()> {
        self.run_with_metadata(None).await
    }

    /// Run until Ctrl+C with custom status metadata.
    pub async fn run_with_metadata(self, metadata: Option<serde_json::Value>) -> Result<()> {
        self.run_until(
            async {
                if let Err(e) = signal::ctrl_c().await {
                    tracing::error!(error = %e, "Failed to listen for Ctrl+C");
                }
            },
            metadata,
        )
        .await
    }

    /// Run until `stop` resolves.
    ///
    /// This will:
    /// 1. Publish "running" status (if enabled)
    /// 2. Wait for `stop`
    /// 3. Run shutdown hooks in registration order
    /// 4. Abort all spawned tasks
    /// 5. Publish "offline" status (if enabled)
    /// 6. Close the bus
    pub async fn run_until<S>(self, stop: S, metadata: Option<serde_json::Value>) -> Result<()>
    where
        S: Future<Output = ()>,
    {
        if let Some(ref status_pub) = self.status_publisher {
            if let Err(e) = status_pub.publish_running(metadata).await {
                tracing::warn!(error = %e, "Failed to publish running status");
            }
        }

        tracing::info!(
            bridge = %self.name,
            tasks = self.tasks.len(),
            "Bridge running. Press Ctrl+C to stop."
        );

        stop.await;

        tracing::info!(bridge = %self.name, "Received shutdown signal");

        for hook in self.shutdown_hooks {
            hook.await;
        }

        for task in &self.tasks {
            task.abort();
        }

        if let Some(ref status_pub) = self.status_publisher {
            if let Err(e) = status_pub.publish_offline().await {
                tracing::warn!(error = %e, "Failed to publish offline status");
            }
        }

        if let Err(e) = self.bus.close().await {
            tracing::warn!(error = %e, "Error closing bus");
        }

        tracing::info!(bridge = %self.name, "Goodbye!");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use serde::Deserialize;

    use super::*;
    use crate::{MemoryBus, PublishOptions, ZenohConfig};

    #[derive(Debug, Deserialize)]
    struct TestConfig {
        #[serde(default)]
        zenoh: ZenohConfig,
        #[serde(default)]
        logging: LoggingConfig,
    }

    impl BridgeConfig for TestConfig {
        fn zenoh(&self) -> &ZenohConfig {
            &self.zenoh
        }

        fn logging(&self) -> &LoggingConfig {
            &self.logging
        }

        fn key_prefix(&self) -> String {
            "test/gw01".to_string()
        }
    }

    #[tokio::test]
    async fn test_shutdown_sequence() {
        let bus = Arc::new(MemoryBus::new());
        let config = TestConfig::parse("{}").unwrap();
        let mut runner = BridgeRunner::with_bus("test", config, bus.clone()).with_status();

        let hook_bus = runner.bus();
        runner.on_shutdown(async move {
            hook_bus
                .publish("discovery/death", b"dev".to_vec(), PublishOptions::default())
                .await
                .unwrap();
        });

        let worker_done = Arc::new(AtomicBool::new(false));
        let flag = worker_done.clone();
        runner.spawn(async move {
            std::future::pending::<()>().await;
            flag.store(true, Ordering::SeqCst);
        });

        runner.run_until(async {}, None).await.unwrap();

        let topics: Vec<String> = bus.published().into_iter().map(|p| p.topic).collect();
        assert_eq!(
            topics,
            vec!["test/gw01/@/status", "discovery/death", "test/gw01/@/status"]
        );
        assert_eq!(
            bus.last_on("test/gw01/@/status").unwrap().json().unwrap()["status"],
            "offline"
        );
        assert!(!bus.is_connected());
        assert!(!worker_done.load(Ordering::SeqCst));
    }
}
