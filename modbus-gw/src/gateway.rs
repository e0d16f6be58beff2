//! Gateway context: owns every transport, pool and device.
//!
//! Built once at startup from [`GatewayConfig`]. Unknown references and
//! duplicate names fail construction; devices sharing a root topic only
//! produce a warning.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Deserialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use modbus_gw_framework::{BridgeError, Bus, BusMessage};

use crate::channel::ModbusChannel;
use crate::config::{ConnectionConfig, DeviceConfig, GatewayConfig, GatewaySettings, PoolConfig};
use crate::device::{Device, DeviceContext};
use crate::peripheral::Peripheral;
use crate::pool::RegisterPool;
use crate::schedule::{Action, ScheduledTask};
use crate::simulator::SimulatedBank;
use crate::transport::Transport;

/// Startup failures.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Unknown bus '{bus}' referenced by {by}")]
    UnknownBus { bus: String, by: String },
    #[error("Unknown pool '{pool}' referenced by device '{device}'")]
    UnknownPool { pool: String, device: String },
    #[error("Register '{register}' of device '{device}' is bound to neither a pool nor a bus")]
    UnboundRegister { device: String, register: String },
    #[error("Pool '{0}' already exists")]
    DuplicatePool(String),
    #[error("Device '{0}' already exists")]
    DuplicateDevice(String),
    #[error(transparent)]
    Bus(#[from] BridgeError),
}

#[derive(Deserialize)]
struct GatewayCommand {
    #[serde(default)]
    name: String,
}

/// Retry budget of implicit single-register pools.
const IMPLICIT_POOL_TTL: u32 = 3;

/// Open one transport per configured bus.
///
/// Simulated buses get a fresh [`SimulatedBank`] seeded from the config.
pub fn build_transports(config: &GatewayConfig) -> Vec<Arc<Transport>> {
    let reconnect_delay = Duration::from_millis(config.gateway.reconnect_delay_ms);
    config
        .buses
        .iter()
        .map(|bus| {
            let timeout = Duration::from_millis(bus.timeout_ms);
            let channel: Box<dyn crate::channel::RegisterChannel> = match &bus.connection {
                ConnectionConfig::Simulated { seed } => Box::new(SimulatedBank::new(*seed).channel()),
                connection => Box::new(ModbusChannel::new(connection.clone(), timeout)),
            };
            Transport::new(bus.name.clone(), channel, timeout, reconnect_delay)
        })
        .collect()
}

/// The running gateway.
pub struct Gateway {
    settings: GatewaySettings,
    uid: String,
    bus: Arc<dyn Bus>,
    transports: BTreeMap<String, Arc<Transport>>,
    pools: BTreeMap<String, Arc<RegisterPool>>,
    devices: Vec<Arc<Device>>,
    ticker: ScheduledTask,
    heartbeat: ScheduledTask,
    command_listener: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("uid", &self.uid)
            .field("transports", &self.transports.keys().collect::<Vec<_>>())
            .field("pools", &self.pools.keys().collect::<Vec<_>>())
            .field("devices", &self.devices.len())
            .finish_non_exhaustive()
    }
}

impl Gateway {
    /// Wire pools and devices onto `transports`, one per configured bus.
    pub fn new(
        config: &GatewayConfig,
        bus: Arc<dyn Bus>,
        transports: Vec<Arc<Transport>>,
    ) -> Result<Arc<Self>, GatewayError> {
        let settings = config.gateway.clone();
        let uid = settings.uid();
        let transports: BTreeMap<String, Arc<Transport>> = transports
            .into_iter()
            .map(|t| (t.name().to_string(), t))
            .collect();

        let mut pools = BTreeMap::new();
        for pool in &config.pools {
            let transport = transports.get(&pool.bus).ok_or_else(|| GatewayError::UnknownBus {
                bus: pool.bus.clone(),
                by: format!("pool '{}'", pool.name),
            })?;
            if pools.contains_key(&pool.name) {
                return Err(GatewayError::DuplicatePool(pool.name.clone()));
            }
            pools.insert(pool.name.clone(), RegisterPool::new(pool, Arc::clone(transport)));
        }
        info!(pools = pools.len(), "Pools initialized");

        let context = DeviceContext {
            domain: settings.domain.clone(),
            gateway_uid: uid.clone(),
            topic_format: settings.topic_format,
            heartbeat: settings.heartbeat,
            log_discovery_pings: settings.log_discovery_pings,
        };

        let mut devices: Vec<Arc<Device>> = Vec::new();
        for device in &config.devices {
            if devices.iter().any(|d| d.name() == device.name) {
                return Err(GatewayError::DuplicateDevice(device.name.clone()));
            }
            let peripherals = Self::bind_peripherals(device, &transports, &mut pools)?;
            devices.push(Device::new(device, &context, peripherals, Arc::clone(&bus)));
        }
        check_topic_conflicts(&devices);
        info!(devices = devices.len(), "Devices initialized");

        let tick_interval = Duration::from_millis(settings.tick_interval_ms);
        let heartbeat_interval = Duration::from_millis(settings.heartbeat.interval_ms);

        Ok(Arc::new_cyclic(|weak: &Weak<Self>| Self {
            ticker: ScheduledTask::new("gateway:tick", tick_interval, tick_action(weak.clone())),
            heartbeat: ScheduledTask::new(
                "gateway:heartbeat",
                heartbeat_interval,
                heartbeat_action(weak.clone()),
            ),
            settings,
            uid,
            bus,
            transports,
            pools,
            devices,
            command_listener: Mutex::new(None),
        }))
    }

    fn bind_peripherals(
        device: &DeviceConfig,
        transports: &BTreeMap<String, Arc<Transport>>,
        pools: &mut BTreeMap<String, Arc<RegisterPool>>,
    ) -> Result<Vec<Peripheral>, GatewayError> {
        let mut peripherals = Vec::with_capacity(device.registers.len());

        for register in &device.registers {
            match (&register.pool, &register.bus) {
                (Some(pool_name), _) => {
                    let pool = pools.get(pool_name).ok_or_else(|| GatewayError::UnknownPool {
                        pool: pool_name.clone(),
                        device: device.name.clone(),
                    })?;
                    peripherals.push(Peripheral::new(register, Arc::clone(pool), register.field));
                }
                (None, Some(bus)) => {
                    let transport = transports.get(bus).ok_or_else(|| GatewayError::UnknownBus {
                        bus: bus.clone(),
                        by: format!("device '{}'", device.name),
                    })?;
                    let implicit = PoolConfig {
                        name: format!("{}.{}", device.name, register.name),
                        bus: bus.clone(),
                        unit: register.unit,
                        offset: register.address,
                        length: register.format.words(),
                        interval_ms: device.check_interval_ms,
                        interval_dilation: 3,
                        read_timeout_ms: None,
                        write_timeout_ms: None,
                        ttl: IMPLICIT_POOL_TTL,
                    };
                    if pools.contains_key(&implicit.name) {
                        return Err(GatewayError::DuplicatePool(implicit.name));
                    }
                    let pool = RegisterPool::new(&implicit, Arc::clone(transport));
                    pools.insert(implicit.name.clone(), Arc::clone(&pool));
                    peripherals.push(Peripheral::new(register, pool, 0));
                }
                (None, None) => {
                    return Err(GatewayError::UnboundRegister {
                        device: device.name.clone(),
                        register: register.name.clone(),
                    });
                }
            }
        }

        Ok(peripherals)
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    /// Topic of gateway-wide commands.
    pub fn command_topic(&self) -> String {
        format!("{}/{}/command", self.settings.domain, self.uid)
    }

    pub fn devices(&self) -> &[Arc<Device>] {
        &self.devices
    }

    pub fn device(&self, name: &str) -> Option<&Arc<Device>> {
        self.devices.iter().find(|d| d.name() == name)
    }

    pub fn pool(&self, name: &str) -> Option<&Arc<RegisterPool>> {
        self.pools.get(name)
    }

    pub fn pools(&self) -> impl Iterator<Item = &Arc<RegisterPool>> {
        self.pools.values()
    }

    pub fn transport(&self, name: &str) -> Option<&Arc<Transport>> {
        self.transports.get(name)
    }

    /// Connect buses, start polling, listen for commands and introduce every device.
    pub async fn start(self: &Arc<Self>) -> Result<(), GatewayError> {
        info!(domain = %self.settings.domain, uid = %self.uid, "Starting gateway");

        for transport in self.transports.values() {
            // A failed connect leaves the reconnect loop running.
            let _ = transport.connect().await;
        }
        for pool in self.pools.values() {
            pool.start_polling();
        }
        for device in &self.devices {
            device.listen().await?;
        }

        let mut commands = self.bus.subscribe(&self.command_topic()).await?;
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            while let Some(message) = commands.recv().await {
                let Some(gateway) = weak.upgrade() else {
                    break;
                };
                gateway.handle_command(&message).await;
            }
        });
        if let Some(previous) = self.command_listener.lock().replace(handle) {
            previous.abort();
        }

        for device in &self.devices {
            device.introduce().await;
        }
        info!("Introduction sent");

        self.ticker.start();
        self.heartbeat.start();
        info!(
            transports = self.transports.len(),
            pools = self.pools.len(),
            devices = self.devices.len(),
            "Gateway started"
        );
        Ok(())
    }

    /// Handle a message on the gateway command topic.
    pub async fn handle_command(&self, message: &BusMessage) {
        let command: GatewayCommand = match serde_json::from_slice(&message.payload) {
            Ok(command) => command,
            Err(e) => {
                warn!(topic = %message.topic, error = %e, "Malformed gateway command dropped");
                return;
            }
        };

        match command.name.as_str() {
            "fetchDeviceStates" => {
                debug!("Republishing every device state");
                join_all(self.devices.iter().map(|d| d.send_state())).await;
            }
            other => debug!(command = %other, "Unknown gateway command"),
        }
    }

    /// Stop schedulers and listeners, drop queued bus work and announce departure.
    pub async fn shutdown(&self) {
        info!("Shutting down gateway");
        self.ticker.stop();
        self.heartbeat.stop();
        for pool in self.pools.values() {
            pool.stop();
        }
        if let Some(handle) = self.command_listener.lock().take() {
            handle.abort();
        }
        for device in &self.devices {
            device.stop();
        }
        for transport in self.transports.values() {
            transport.cancel_pending();
        }

        if self.bus.is_connected() {
            for device in &self.devices {
                if let Err(e) = device.presence().dead().await {
                    debug!(device = %device.name(), error = %e, "Failed to send death");
                }
            }
        }

        for transport in self.transports.values() {
            transport.close().await;
        }
        info!("Gateway stopped");
    }
}

fn tick_action(gateway: Weak<Gateway>) -> Action {
    Arc::new(move || {
        let gateway = gateway.clone();
        async move {
            if let Some(gateway) = gateway.upgrade() {
                join_all(gateway.devices.iter().map(|d| d.on_tick())).await;
            }
        }
        .boxed()
    })
}

fn heartbeat_action(gateway: Weak<Gateway>) -> Action {
    Arc::new(move || {
        let gateway = gateway.clone();
        async move {
            if let Some(gateway) = gateway.upgrade() {
                join_all(gateway.devices.iter().map(|d| d.heartbeat())).await;
            }
        }
        .boxed()
    })
}

/// Warn about devices publishing on the same root topic.
fn check_topic_conflicts(devices: &[Arc<Device>]) -> usize {
    let mut known: HashMap<&str, &str> = HashMap::new();
    let mut conflicts = 0;

    for device in devices {
        if let Some(other) = known.get(device.root()) {
            warn!(
                device = %device.name(),
                other = %other,
                root = %device.root(),
                "Device root topic conflicts with another device"
            );
            conflicts += 1;
            continue;
        }
        known.insert(device.root(), device.name());
    }

    conflicts
}
