//! Configuration for the Modbus gateway.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use modbus_gw_common::TopicFormat;
use modbus_gw_framework::{BridgeConfig, BridgeError, LoggingConfig, ZenohConfig};

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] json5::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Zenoh connection settings
    #[serde(default)]
    pub zenoh: ZenohConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Gateway identity and timing
    #[serde(default)]
    pub gateway: GatewaySettings,

    /// Physical buses
    pub buses: Vec<BusConfig>,

    /// Register blocks polled together
    #[serde(default)]
    pub pools: Vec<PoolConfig>,

    /// Logical devices
    pub devices: Vec<DeviceConfig>,
}

/// Gateway-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySettings {
    /// Topic root (default: "modbus-gw")
    #[serde(default = "default_domain")]
    pub domain: String,

    /// Gateway uid (default: domain with '/' replaced by '-')
    #[serde(default)]
    pub uid: Option<String>,

    /// How device root topics are built
    #[serde(default)]
    pub topic_format: TopicFormat,

    /// Period of the device error check in milliseconds
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,

    /// Delay between bus reconnection attempts in milliseconds
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,

    /// Log every discovery ping at debug level
    #[serde(default)]
    pub log_discovery_pings: bool,

    /// Presence heartbeat
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
}

fn default_domain() -> String {
    "modbus-gw".to_string()
}

fn default_tick_interval() -> u64 {
    1000
}

fn default_reconnect_delay() -> u64 {
    500
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            domain: default_domain(),
            uid: None,
            topic_format: TopicFormat::default(),
            tick_interval_ms: default_tick_interval(),
            reconnect_delay_ms: default_reconnect_delay(),
            log_discovery_pings: false,
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

impl GatewaySettings {
    /// Effective gateway uid.
    pub fn uid(&self) -> String {
        self.uid
            .clone()
            .unwrap_or_else(|| self.domain.replace('/', "-"))
    }
}

/// Presence heartbeat settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Heartbeat period in milliseconds (0 disables it)
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Advertised liveness timeout in milliseconds
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_ms: u64,
}

fn default_heartbeat_interval() -> u64 {
    500
}

fn default_heartbeat_timeout() -> u64 {
    5000
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            timeout_ms: default_heartbeat_timeout(),
        }
    }
}

/// A physical bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Bus name referenced by pools and registers
    pub name: String,

    /// Connection type and address
    pub connection: ConnectionConfig,

    /// Default operation timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    500
}

/// Connection configuration (TCP, RTU or simulated).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ConnectionConfig {
    /// Modbus TCP connection
    Tcp {
        /// Host address (IP or hostname)
        host: String,
        /// TCP port (default: 502)
        #[serde(default = "default_modbus_port")]
        port: u16,
    },
    /// Modbus RTU (serial) connection
    Rtu {
        /// Serial port path (e.g., "/dev/ttyUSB0" or "COM1")
        port: String,
        /// Baud rate (default: 9600)
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
        /// Data bits (default: 8)
        #[serde(default = "default_data_bits")]
        data_bits: u8,
        /// Parity: "none", "even", or "odd" (default: "none")
        #[serde(default = "default_parity")]
        parity: String,
        /// Stop bits: 1 or 2 (default: 1)
        #[serde(default = "default_stop_bits")]
        stop_bits: u8,
    },
    /// In-memory register bank, for testing without hardware
    Simulated {
        /// Base of the values unset registers read back as
        #[serde(default = "default_seed")]
        seed: u16,
    },
}

fn default_modbus_port() -> u16 {
    502
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_parity() -> String {
    "none".to_string()
}

fn default_stop_bits() -> u8 {
    1
}

fn default_seed() -> u16 {
    60000
}

/// A block of consecutive holding registers polled as one unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Pool name referenced by registers
    pub name: String,

    /// Bus the pool is read through
    pub bus: String,

    /// Modbus unit/slave ID
    #[serde(default = "default_unit")]
    pub unit: u8,

    /// First register address
    #[serde(default)]
    pub offset: u16,

    /// Number of registers (1-125)
    pub length: u16,

    /// Poll interval in milliseconds (0 disables polling)
    #[serde(default = "default_pool_interval")]
    pub interval_ms: u64,

    /// Interval multiplier applied while reads fail
    #[serde(default = "default_dilation")]
    pub interval_dilation: u32,

    /// Read timeout (default: bus timeout)
    #[serde(default)]
    pub read_timeout_ms: Option<u64>,

    /// Write timeout (default: bus timeout)
    #[serde(default)]
    pub write_timeout_ms: Option<u64>,

    /// Retries of a failed operation
    #[serde(default = "default_ttl")]
    pub ttl: u32,
}

fn default_unit() -> u8 {
    1
}

fn default_pool_interval() -> u64 {
    1000
}

fn default_dilation() -> u32 {
    3
}

fn default_ttl() -> u32 {
    3
}

/// Configuration for a logical device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device name (used in topics)
    pub name: String,

    /// Display name
    #[serde(default)]
    pub alias: Option<String>,

    /// Publish state on every update even when nothing changed
    #[serde(default)]
    pub force_update: bool,

    /// Publish state as retained
    #[serde(default)]
    pub retain: bool,

    /// Quality of service for state publications (0-2)
    #[serde(default)]
    pub qos: u8,

    /// Take part in discovery
    #[serde(default = "default_true")]
    pub discovery: bool,

    /// Poll interval for registers bound directly to a bus, in milliseconds
    #[serde(default = "default_check_interval")]
    pub check_interval_ms: u64,

    /// Descriptive metadata used in handshakes
    #[serde(default)]
    pub meta: DeviceMeta,

    /// Registers exposed as state fields
    pub registers: Vec<RegisterConfig>,
}

fn default_true() -> bool {
    true
}

fn default_check_interval() -> u64 {
    1000
}

/// Descriptive metadata for a device.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceMeta {
    #[serde(default)]
    pub uid: Option<String>,
    #[serde(default, rename = "type")]
    pub device_type: Option<String>,
    #[serde(default)]
    pub product: Option<String>,
    #[serde(default)]
    pub vendor: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub room: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub groups: Vec<String>,
    /// Register that represents the device's main on/off state
    #[serde(default)]
    pub state_register: Option<String>,
    /// Free-form fields forwarded in handshakes
    #[serde(default)]
    pub additional: serde_json::Map<String, serde_json::Value>,
}

/// A named register exposed by a device.
///
/// Bound either to a pool field (`pool` + `field`) or directly to a bus
/// address (`bus` + `unit` + `address`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterConfig {
    /// State field name
    pub name: String,

    #[serde(default)]
    pub pool: Option<String>,

    /// Word offset inside the pool
    #[serde(default)]
    pub field: u16,

    #[serde(default)]
    pub bus: Option<String>,

    #[serde(default = "default_unit")]
    pub unit: u8,

    #[serde(default)]
    pub address: u16,

    #[serde(default)]
    pub format: Format,

    #[serde(default)]
    pub endianness: Endianness,

    #[serde(default)]
    pub access: Access,
}

/// Value interpretation of a register window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    Int8,
    Uint8,
    Int16,
    /// Unsigned 16-bit integer (default)
    #[default]
    Uint16,
    /// Signed 32-bit integer (2 registers)
    Int32,
    /// Unsigned 32-bit integer (2 registers)
    Uint32,
    Bool,
    /// Signed 16-bit integer with one implied decimal digit
    Decimal,
}

impl Format {
    /// Number of 16-bit registers a value occupies.
    pub fn words(&self) -> u16 {
        match self {
            Format::Int32 | Format::Uint32 => 2,
            _ => 1,
        }
    }
}

/// Byte order of a register window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endianness {
    #[default]
    #[serde(alias = "be")]
    Big,
    #[serde(alias = "le")]
    Little,
}

/// Allowed directions for a register.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Access {
    #[serde(rename = "R")]
    Read,
    #[serde(rename = "W")]
    Write,
    #[default]
    #[serde(rename = "RW")]
    ReadWrite,
}

impl Access {
    pub fn readable(&self) -> bool {
        matches!(self, Access::Read | Access::ReadWrite)
    }

    pub fn writable(&self) -> bool {
        matches!(self, Access::Write | Access::ReadWrite)
    }
}

/// State keys owned by the gateway itself.
const RESERVED_FIELDS: [&str; 2] = ["error", "_updatedAt"];

/// Largest block a single holding-register read may request.
pub const MAX_POOL_LENGTH: u16 = 125;

impl GatewayConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json5(&content)
    }

    /// Parse and validate configuration from JSON5 text.
    pub fn from_json5(content: &str) -> Result<Self, ConfigError> {
        let config: GatewayConfig = json5::from_str(content)?;
        config.check()?;
        Ok(config)
    }

    /// Find a pool by name.
    pub fn pool(&self, name: &str) -> Option<&PoolConfig> {
        self.pools.iter().find(|p| p.name == name)
    }

    /// Validate the configuration.
    pub fn check(&self) -> Result<(), ConfigError> {
        if self.devices.is_empty() {
            return Err(invalid("At least one device must be configured"));
        }

        let mut buses = HashSet::new();
        for bus in &self.buses {
            if bus.name.is_empty() {
                return Err(invalid("Bus name cannot be empty"));
            }
            if !buses.insert(bus.name.as_str()) {
                return Err(invalid(format!("Duplicate bus '{}'", bus.name)));
            }

            // Validate RTU parity
            if let ConnectionConfig::Rtu { parity, .. } = &bus.connection {
                match parity.to_lowercase().as_str() {
                    "none" | "even" | "odd" => {}
                    _ => {
                        return Err(invalid(format!(
                            "Bus '{}': invalid parity '{}' (use none, even, or odd)",
                            bus.name, parity
                        )));
                    }
                }
            }
        }

        let mut pools = HashSet::new();
        for pool in &self.pools {
            if !pools.insert(pool.name.as_str()) {
                return Err(invalid(format!("Duplicate pool '{}'", pool.name)));
            }
            if !buses.contains(pool.bus.as_str()) {
                return Err(invalid(format!(
                    "Pool '{}': unknown bus '{}'",
                    pool.name, pool.bus
                )));
            }
            if pool.length == 0 || pool.length > MAX_POOL_LENGTH {
                return Err(invalid(format!(
                    "Pool '{}': length must be 1-{}",
                    pool.name, MAX_POOL_LENGTH
                )));
            }
            if pool.interval_dilation == 0 {
                return Err(invalid(format!(
                    "Pool '{}': interval_dilation must be at least 1",
                    pool.name
                )));
            }
        }

        let mut devices = HashSet::new();
        for device in &self.devices {
            if device.name.is_empty() {
                return Err(invalid("Device name cannot be empty"));
            }
            if !devices.insert(device.name.as_str()) {
                return Err(invalid(format!("Duplicate device '{}'", device.name)));
            }
            if device.qos > 2 {
                return Err(invalid(format!(
                    "Device '{}': qos must be 0, 1 or 2",
                    device.name
                )));
            }

            let mut names = HashSet::new();
            for register in &device.registers {
                self.check_register(device, register)?;
                if !names.insert(register.name.as_str()) {
                    return Err(invalid(format!(
                        "Device '{}': duplicate register '{}'",
                        device.name, register.name
                    )));
                }
            }
        }

        Ok(())
    }

    fn check_register(
        &self,
        device: &DeviceConfig,
        register: &RegisterConfig,
    ) -> Result<(), ConfigError> {
        let at = || format!("Device '{}', register '{}'", device.name, register.name);

        if register.name.is_empty() {
            return Err(invalid(format!("Device '{}': register name cannot be empty", device.name)));
        }
        if RESERVED_FIELDS.contains(&register.name.as_str()) {
            return Err(invalid(format!("{}: name is reserved", at())));
        }

        match (&register.pool, &register.bus) {
            (Some(pool), None) => {
                let pool = self
                    .pool(pool)
                    .ok_or_else(|| invalid(format!("{}: unknown pool '{}'", at(), pool)))?;
                let end = u32::from(register.field) + u32::from(register.format.words());
                if end > u32::from(pool.length) {
                    return Err(invalid(format!(
                        "{}: field {} does not fit in pool '{}' (length {})",
                        at(),
                        register.field,
                        pool.name,
                        pool.length
                    )));
                }
            }
            (None, Some(bus)) => {
                if !self.buses.iter().any(|b| &b.name == bus) {
                    return Err(invalid(format!("{}: unknown bus '{}'", at(), bus)));
                }
            }
            _ => {
                return Err(invalid(format!(
                    "{}: must specify exactly one of pool or bus",
                    at()
                )));
            }
        }

        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Validation(message.into())
}

impl BridgeConfig for GatewayConfig {
    fn zenoh(&self) -> &ZenohConfig {
        &self.zenoh
    }

    fn logging(&self) -> &LoggingConfig {
        &self.logging
    }

    fn key_prefix(&self) -> String {
        format!("{}/{}", self.gateway.domain, self.gateway.uid())
    }

    fn validate(&self) -> Result<(), BridgeError> {
        self.zenoh.validate()?;
        self.check()
            .map_err(|e| BridgeError::validation(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        buses: [ { name: "tcp0", connection: { type: "tcp", host: "192.168.1.10" } } ],
        pools: [ { name: "p1", bus: "tcp0", length: 4 } ],
        devices: [
            {
                name: "boiler",
                registers: [
                    { name: "temp", pool: "p1", field: 0, format: "decimal", access: "R" },
                    { name: "total", pool: "p1", field: 2, format: "uint32", endianness: "le" },
                    { name: "power", bus: "tcp0", unit: 2, address: 10 }
                ]
            }
        ]
    }"#;

    #[test]
    fn test_parse_minimal_config() {
        let config = GatewayConfig::from_json5(MINIMAL).unwrap();

        assert_eq!(config.gateway.domain, "modbus-gw");
        assert_eq!(config.gateway.uid(), "modbus-gw");
        assert_eq!(config.gateway.heartbeat.interval_ms, 500);
        assert_eq!(config.buses[0].timeout_ms, 500);

        if let ConnectionConfig::Tcp { host, port } = &config.buses[0].connection {
            assert_eq!(host, "192.168.1.10");
            assert_eq!(*port, 502); // default
        } else {
            panic!("Expected TCP connection");
        }

        let pool = config.pool("p1").unwrap();
        assert_eq!(pool.unit, 1);
        assert_eq!(pool.interval_ms, 1000);
        assert_eq!(pool.interval_dilation, 3);
        assert_eq!(pool.ttl, 3);

        let device = &config.devices[0];
        assert!(device.discovery);
        assert_eq!(device.registers[0].format, Format::Decimal);
        assert_eq!(device.registers[0].access, Access::Read);
        assert_eq!(device.registers[1].endianness, Endianness::Little);
        assert_eq!(device.registers[2].access, Access::ReadWrite);
        assert_eq!(device.registers[2].format, Format::Uint16);
    }

    #[test]
    fn test_parse_rtu_and_simulated() {
        let json = r#"{
            gateway: { domain: "home/cellar", topic_format: "fancy" },
            buses: [
                {
                    name: "rtu0",
                    connection: { type: "rtu", port: "/dev/ttyUSB0", baud_rate: 19200, parity: "even" }
                },
                { name: "sim", connection: { type: "simulated" } }
            ],
            devices: [ { name: "d", registers: [ { name: "x", bus: "sim" } ] } ]
        }"#;

        let config = GatewayConfig::from_json5(json).unwrap();
        assert_eq!(config.gateway.uid(), "home-cellar");
        assert_eq!(config.gateway.topic_format, TopicFormat::Fancy);
        assert_eq!(config.key_prefix(), "home/cellar/home-cellar");

        if let ConnectionConfig::Rtu {
            port,
            baud_rate,
            parity,
            ..
        } = &config.buses[0].connection
        {
            assert_eq!(port, "/dev/ttyUSB0");
            assert_eq!(*baud_rate, 19200);
            assert_eq!(parity, "even");
        } else {
            panic!("Expected RTU connection");
        }
        assert!(matches!(
            config.buses[1].connection,
            ConnectionConfig::Simulated { seed: 60000 }
        ));
    }

    fn rejects(json: &str, needle: &str) {
        match GatewayConfig::from_json5(json) {
            Err(ConfigError::Validation(message)) => {
                assert!(message.contains(needle), "unexpected message: {}", message)
            }
            other => panic!("expected validation error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_validate_empty_devices() {
        rejects(r#"{ buses: [], devices: [] }"#, "At least one device");
    }

    #[test]
    fn test_validate_unknown_bus() {
        rejects(
            r#"{ buses: [], pools: [ { name: "p", bus: "nope", length: 1 } ],
                 devices: [ { name: "d", registers: [] } ] }"#,
            "unknown bus 'nope'",
        );
    }

    #[test]
    fn test_validate_duplicate_pool() {
        rejects(
            r#"{ buses: [ { name: "b", connection: { type: "simulated" } } ],
                 pools: [ { name: "p", bus: "b", length: 1 }, { name: "p", bus: "b", length: 2 } ],
                 devices: [ { name: "d", registers: [] } ] }"#,
            "Duplicate pool 'p'",
        );
    }

    #[test]
    fn test_validate_register_outside_pool() {
        rejects(
            r#"{ buses: [ { name: "b", connection: { type: "simulated" } } ],
                 pools: [ { name: "p", bus: "b", length: 2 } ],
                 devices: [ { name: "d", registers: [ { name: "x", pool: "p", field: 1, format: "int32" } ] } ] }"#,
            "does not fit",
        );
    }

    #[test]
    fn test_validate_register_binding() {
        rejects(
            r#"{ buses: [ { name: "b", connection: { type: "simulated" } } ],
                 pools: [ { name: "p", bus: "b", length: 2 } ],
                 devices: [ { name: "d", registers: [ { name: "x", pool: "p", bus: "b" } ] } ] }"#,
            "exactly one of pool or bus",
        );
    }

    #[test]
    fn test_validate_reserved_name() {
        rejects(
            r#"{ buses: [ { name: "b", connection: { type: "simulated" } } ],
                 devices: [ { name: "d", registers: [ { name: "error", bus: "b" } ] } ] }"#,
            "reserved",
        );
    }

    #[test]
    fn test_validate_parity() {
        rejects(
            r#"{ buses: [ { name: "b", connection: { type: "rtu", port: "/dev/x", parity: "mark" } } ],
                 devices: [ { name: "d", registers: [] } ] }"#,
            "invalid parity",
        );
    }

    #[test]
    fn test_access_and_format_helpers() {
        assert!(Access::Read.readable() && !Access::Read.writable());
        assert!(!Access::Write.readable() && Access::Write.writable());
        assert!(Access::ReadWrite.readable() && Access::ReadWrite.writable());
        assert_eq!(Format::Int32.words(), 2);
        assert_eq!(Format::Decimal.words(), 1);
    }
}
