//! Modbus gateway bridge framework
//!
//! Lifecycle and messaging plumbing shared by the gateway binary and its tests.
//!
//! # Overview
//!
//! This framework provides:
//! - [`BridgeConfig`] trait for configuration loading and validation
//! - [`BridgeRunner`] for managing bridge lifecycle (startup, shutdown, signal handling)
//! - [`Bus`] abstraction over the publish/subscribe network, with a Zenoh
//!   implementation ([`ZenohBus`]) and an in-process one ([`MemoryBus`])
//! - [`BridgeArgs`] for common CLI argument parsing
//! - [`BridgeStatus`] for standardized status reporting
//!
//! # Example
//!
//! ```ignore
//! use modbus_gw_framework::{BridgeArgs, BridgeConfig, BridgeRunner};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = BridgeArgs::parse_with_default("gateway.json5");
//!     let config = MyBridgeConfig::load(&args.config)?;
//!
//!     let mut runner = BridgeRunner::new_with_args("modbus-gw", config, Some(&args)).await?;
//!
//!     // Spawn protocol-specific workers
//!     let bus = runner.bus();
//!     runner.spawn(my_worker(bus));
//!
//!     // Run until Ctrl+C
//!     runner.run().await
//! }
//! ```

mod args;
mod bus;
mod config;
mod error;
mod memory;
mod runner;
mod status;

pub use args::BridgeArgs;
pub use bus::{Bus, BusMessage, PublishOptions, Subscription, ZenohBus};
pub use config::BridgeConfig;
pub use error::{BridgeError, Result};
pub use memory::{MemoryBus, Published};
pub use runner::BridgeRunner;
pub use status::{BridgeStatus, StatusPublisher};

// Re-export commonly used types from modbus-gw-common
pub use modbus_gw_common::{LogFormat, LoggingConfig, ZenohConfig};
