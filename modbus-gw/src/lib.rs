//! Modbus gateway for Zenoh.
//!
//! Polls holding registers over Modbus TCP or RTU, decodes them into named
//! device fields and publishes each device's state as JSON. Commands sent
//! to a device write registers back.
//!
//! # Topics
//!
//! ```text
//! <domain>/<device>            device state (JSON object)
//! <domain>/<device>/<command>  get | set | refresh | command
//! <domain>/<device>/err        last hard error ("" once cleared)
//! <domain>/<gateway>/command   gateway commands (fetchDeviceStates)
//! discovery/...                handshake, alive and death packets
//! ```
//!
//! # Layers
//!
//! - [`transport`] - one serialized, reconnecting connection per bus
//! - [`pool`] - a block of registers refreshed with one read
//! - [`peripheral`] - a typed view onto a slice of a pool
//! - [`device`] - named peripherals published as one state object
//! - [`gateway`] - owns everything above and drives the schedulers

pub mod channel;
pub mod config;
pub mod device;
pub mod discovery;
pub mod gateway;
pub mod mutex;
pub mod peripheral;
pub mod pool;
pub mod schedule;
pub mod simulator;
pub mod transport;

pub use config::GatewayConfig;
pub use device::{Device, DeviceCommand, DeviceState};
pub use gateway::{Gateway, GatewayError, build_transports};
pub use mutex::{COMMAND_PRIORITY, POLL_PRIORITY, PriorityMutex};
pub use peripheral::{Peripheral, Value};
pub use pool::RegisterPool;
pub use simulator::SimulatedBank;
pub use transport::{Transport, TransportError};
