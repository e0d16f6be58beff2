//! Logical devices: state snapshots, commands and presence.
//!
//! A device aggregates peripherals, possibly from several pools, into one
//! JSON state document published on its root topic. Pool updates,
//! commands and the gateway's tick all funnel into [`Device::update`], which
//! publishes only when the snapshot actually changed.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use modbus_gw_common::topic::{TopicFormat, command_of};
use modbus_gw_framework::{BridgeError, Bus, BusMessage, PublishOptions};

use crate::config::{DeviceConfig, DeviceMeta, HeartbeatConfig};
use crate::discovery::{
    CommTopic, Discovery, DiscoveryEvent, HandshakePacket, HandshakeSource, Presence, Silent,
};
use crate::mutex::COMMAND_PRIORITY;
use crate::peripheral::{Peripheral, Value};
use crate::pool::{PoolEvent, RegisterPool};

/// Snapshot of a device's state.
///
/// Serializes flat: one key per readable register plus `error` and
/// `_updatedAt`. Equality ignores the timestamp.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceState {
    #[serde(flatten)]
    pub values: BTreeMap<String, Option<Value>>,
    pub error: Option<String>,
    #[serde(rename = "_updatedAt")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl PartialEq for DeviceState {
    fn eq(&self, other: &Self) -> bool {
        self.values == other.values && self.error == other.error
    }
}

impl DeviceState {
    /// Decoded value of register `name`, if known.
    pub fn value(&self, name: &str) -> Option<Value> {
        self.values.get(name).copied().flatten()
    }
}

/// Result of merging a patch into the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Changed,
    Unchanged,
}

impl UpdateOutcome {
    pub fn changed(self) -> bool {
        self == UpdateOutcome::Changed
    }
}

/// Lifecycle of a device as seen from the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    /// No register value has been read yet.
    Uninitialized,
    Available,
    Unavailable,
}

/// What a `set` command did, register by register.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SetOutcome {
    /// Values as stored after encoding.
    pub written: BTreeMap<String, Value>,
    pub failed: BTreeMap<String, String>,
    /// Unknown or read-only registers.
    pub ignored: Vec<String>,
    /// The device was unavailable and nothing was attempted.
    pub skipped: bool,
}

impl SetOutcome {
    pub fn is_success(&self) -> bool {
        !self.skipped && self.failed.is_empty()
    }
}

/// A command addressed to one device.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCommand {
    /// Publish the current state.
    Get,
    /// Write registers, by name.
    Set(serde_json::Map<String, serde_json::Value>),
    /// Read every readable register now.
    Refresh,
}

#[derive(Deserialize)]
struct CommandEnvelope {
    #[serde(default)]
    name: String,
    #[serde(default)]
    payload: serde_json::Value,
}

impl DeviceCommand {
    /// Parse the command carried on `<root>/<name>`.
    ///
    /// `Ok(None)` for names that are not device commands.
    pub fn parse(name: &str, payload: &[u8]) -> Result<Option<Self>, String> {
        match name {
            "get" => Ok(Some(DeviceCommand::Get)),
            "refresh" => Ok(Some(DeviceCommand::Refresh)),
            "set" => {
                let value: serde_json::Value = serde_json::from_slice(payload)
                    .map_err(|e| format!("Invalid set payload: {}", e))?;
                Self::set_from(value).map(Some)
            }
            "command" => {
                let envelope: CommandEnvelope = serde_json::from_slice(payload)
                    .map_err(|e| format!("Invalid command envelope: {}", e))?;
                match envelope.name.as_str() {
                    "set" => Self::set_from(envelope.payload).map(Some),
                    "command" => Ok(None),
                    other => Self::parse(other, &[]),
                }
            }
            _ => Ok(None),
        }
    }

    fn set_from(value: serde_json::Value) -> Result<Self, String> {
        match value {
            serde_json::Value::Object(map) => Ok(DeviceCommand::Set(map)),
            // Some publishers send the object JSON-encoded as a string.
            serde_json::Value::String(text) => match serde_json::from_str(&text) {
                Ok(serde_json::Value::Object(map)) => Ok(DeviceCommand::Set(map)),
                _ => Err("Set payload must be a JSON object".to_string()),
            },
            _ => Err("Set payload must be a JSON object".to_string()),
        }
    }
}

/// Gateway-wide settings every device needs.
#[derive(Debug, Clone)]
pub struct DeviceContext {
    pub domain: String,
    pub gateway_uid: String,
    pub topic_format: TopicFormat,
    pub heartbeat: HeartbeatConfig,
    pub log_discovery_pings: bool,
}

/// One logical device on the bus.
pub struct Device {
    name: String,
    alias: Option<String>,
    uid: String,
    root: String,
    meta: DeviceMeta,
    context: DeviceContext,
    force_update: bool,
    publish_options: PublishOptions,
    peripherals: Vec<Peripheral>,
    state: RwLock<Arc<DeviceState>>,
    hard_error: RwLock<Option<String>>,
    initialized: AtomicBool,
    was_available: AtomicBool,
    bus: Arc<dyn Bus>,
    presence: Arc<dyn Presence>,
    discovery: Option<Arc<Discovery>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("root", &self.root)
            .field("peripherals", &self.peripherals.len())
            .field("available", &self.available())
            .finish_non_exhaustive()
    }
}

impl Device {
    /// Build a device over already bound peripherals.
    ///
    /// The initial state lists every readable register with a null value.
    pub fn new(
        config: &DeviceConfig,
        context: &DeviceContext,
        peripherals: Vec<Peripheral>,
        bus: Arc<dyn Bus>,
    ) -> Arc<Self> {
        let uid = config.meta.uid.clone().unwrap_or_else(|| config.name.clone());
        let root = context.topic_format.device_root(
            &context.domain,
            &context.gateway_uid,
            &config.name,
            config.alias.as_deref(),
            config.meta.room.as_deref(),
        );

        let device = Arc::new_cyclic(|weak: &std::sync::Weak<Device>| {
            let (presence, discovery) = if config.discovery {
                let source: std::sync::Weak<dyn HandshakeSource> = weak.clone();
                let discovery = Discovery::new(
                    uid.clone(),
                    source,
                    Arc::clone(&bus),
                    context.log_discovery_pings,
                );
                let presence: Arc<dyn Presence> = discovery.clone();
                (presence, Some(discovery))
            } else {
                let presence: Arc<dyn Presence> = Arc::new(Silent::new(uid.clone()));
                (presence, None)
            };

            Self {
                name: config.name.clone(),
                alias: config.alias.clone(),
                uid,
                root,
                meta: config.meta.clone(),
                context: context.clone(),
                force_update: config.force_update,
                publish_options: PublishOptions {
                    retain: config.retain,
                    qos: config.qos,
                },
                peripherals,
                state: RwLock::new(Arc::new(DeviceState::default())),
                hard_error: RwLock::new(None),
                initialized: AtomicBool::new(false),
                was_available: AtomicBool::new(false),
                bus,
                presence,
                discovery,
                tasks: Mutex::new(Vec::new()),
            }
        });

        let initial: Vec<(String, Option<Value>)> = device
            .peripherals
            .iter()
            .filter(|p| p.readable())
            .map(|p| (p.name().to_string(), p.get_current_value()))
            .collect();
        device.update(initial);

        info!(
            device = %device.name,
            root = %device.root,
            peripherals = device.peripherals.len(),
            force_update = device.force_update,
            "Device initialized"
        );
        device
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Topic the state is published on. Commands live one level below.
    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn topic(&self, suffix: &str) -> String {
        format!("{}/{}", self.root, suffix)
    }

    pub fn peripherals(&self) -> &[Peripheral] {
        &self.peripherals
    }

    pub fn peripheral(&self, name: &str) -> Option<&Peripheral> {
        self.peripherals.iter().find(|p| p.name() == name)
    }

    pub fn presence(&self) -> &Arc<dyn Presence> {
        &self.presence
    }

    /// Current snapshot. Snapshots are never modified once handed out.
    pub fn state(&self) -> Arc<DeviceState> {
        Arc::clone(&self.state.read())
    }

    /// Last write or refresh failure, cleared by the next success.
    pub fn hard_error(&self) -> Option<String> {
        self.hard_error.read().clone()
    }

    /// At least one peripheral is reachable and no hard error is pending.
    pub fn available(&self) -> bool {
        let reachable =
            self.peripherals.is_empty() || self.peripherals.iter().any(|p| p.available());
        reachable && self.hard_error.read().is_none()
    }

    pub fn status(&self) -> DeviceStatus {
        if !self.initialized.load(Ordering::SeqCst) {
            DeviceStatus::Uninitialized
        } else if self.available() {
            DeviceStatus::Available
        } else {
            DeviceStatus::Unavailable
        }
    }

    /// Distinct pools behind this device's peripherals.
    pub fn pools(&self) -> Vec<Arc<RegisterPool>> {
        let mut seen = BTreeSet::new();
        self.peripherals
            .iter()
            .filter(|p| seen.insert(p.pool().name().to_string()))
            .map(|p| Arc::clone(p.pool()))
            .collect()
    }

    /// Merge register values into the state.
    ///
    /// Returns [`UpdateOutcome::Unchanged`] without touching the snapshot when
    /// nothing differs, unless the device forces updates.
    pub fn update<I>(&self, patch: I) -> UpdateOutcome
    where
        I: IntoIterator<Item = (String, Option<Value>)>,
    {
        let patch: Vec<_> = patch.into_iter().collect();
        if patch.iter().any(|(_, value)| value.is_some()) {
            self.initialized.store(true, Ordering::SeqCst);
        }
        self.modify(|state| state.values.extend(patch))
    }

    fn modify(&self, apply: impl FnOnce(&mut DeviceState)) -> UpdateOutcome {
        let mut state = self.state.write();
        let mut next = DeviceState::clone(&state);
        apply(&mut next);

        if !self.force_update && next == **state {
            return UpdateOutcome::Unchanged;
        }

        next.updated_at = Some(Utc::now());
        debug!(device = %self.name, "State updated");
        trace!(device = %self.name, state = ?next.values, "State payload");
        *state = Arc::new(next);
        UpdateOutcome::Changed
    }

    /// Pull the current values of every readable peripheral into the state.
    pub fn reconcile(&self) -> UpdateOutcome {
        let values: Vec<(String, Option<Value>)> = self
            .peripherals
            .iter()
            .filter(|p| p.readable())
            .filter_map(|p| p.get_current_value().map(|v| (p.name().to_string(), Some(v))))
            .collect();
        if values.is_empty() {
            return UpdateOutcome::Unchanged;
        }
        self.update(values)
    }

    /// Error text that should currently be in the state.
    fn aggregate_error(&self) -> Option<String> {
        let unavailable: Vec<&str> = self
            .peripherals
            .iter()
            .filter(|p| !p.available())
            .map(|p| p.name())
            .collect();

        let mut parts = Vec::new();
        if !unavailable.is_empty() {
            parts.push(format!("Unavailable: {}", unavailable.join(", ")));
        }
        if let Some(err) = self.hard_error() {
            parts.push(err);
        }

        if parts.is_empty() { None } else { Some(parts.join("; ")) }
    }

    /// Gateway tick: refresh the `error` field and republish if it changed.
    pub async fn on_tick(&self) {
        let error = self.aggregate_error();
        if self.state.read().error == error {
            return;
        }

        if self.modify(|state| state.error = error).changed() {
            self.send_state().await;
        }
    }

    /// Publish the current state on the root topic.
    pub async fn send_state(&self) {
        if !self.bus.is_connected() {
            return;
        }

        let state = self.state();
        let payload = match serde_json::to_vec(&*state) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(device = %self.name, error = %e, "Failed to serialize state");
                return;
            }
        };
        if let Err(e) = self.bus.publish(&self.root, payload, self.publish_options).await {
            warn!(device = %self.name, error = %e, "Failed to publish state");
        }
    }

    /// Ping while available, death otherwise.
    pub async fn send_availability(&self) {
        if !self.bus.is_connected() {
            return;
        }

        let result = if self.available() {
            self.presence.ping().await
        } else {
            self.presence.dead().await
        };
        if let Err(e) = result {
            debug!(device = %self.name, error = %e, "Failed to send availability");
        }
    }

    /// Record a hard error and mirror it on `<root>/err`.
    pub async fn set_error(&self, message: impl Into<String>) {
        let message = message.into();
        *self.hard_error.write() = Some(message.clone());
        self.publish_error(message).await;
    }

    /// Clear the hard error, if any, and publish an empty `<root>/err`.
    pub async fn reset_error(&self) {
        if self.hard_error.write().take().is_none() {
            return;
        }
        self.publish_error(String::new()).await;
    }

    async fn publish_error(&self, message: String) {
        if !self.bus.is_connected() {
            return;
        }
        if let Err(e) = self
            .bus
            .publish(&self.topic("err"), message.into_bytes(), PublishOptions::default())
            .await
        {
            debug!(device = %self.name, error = %e, "Failed to publish error");
        }
    }

    /// Run one command.
    pub async fn execute(&self, command: DeviceCommand) {
        trace!(device = %self.name, ?command, "Command");
        match command {
            DeviceCommand::Get => self.send_state().await,
            DeviceCommand::Set(values) => {
                self.handle_set(&values).await;
            }
            DeviceCommand::Refresh => {
                self.handle_refresh(COMMAND_PRIORITY).await;
            }
        }
    }

    /// Write every addressed writable register concurrently.
    ///
    /// All writes are awaited. Successful ones are merged into the state even
    /// when others failed; failures become the device's hard error.
    pub async fn handle_set(
        &self,
        values: &serde_json::Map<String, serde_json::Value>,
    ) -> SetOutcome {
        let mut outcome = SetOutcome::default();

        if !self.available() {
            info!(device = %self.name, "Can't update state: device is unavailable");
            self.send_availability().await;
            outcome.skipped = true;
            return outcome;
        }

        let mut writes = Vec::new();
        for (name, raw) in values {
            let Some(peripheral) = self.peripheral(name).filter(|p| p.writable()) else {
                outcome.ignored.push(name.clone());
                continue;
            };
            writes.push(async move {
                let result = match Value::from_json(raw) {
                    Some(value) => peripheral
                        .write(value, COMMAND_PRIORITY)
                        .await
                        .map_err(|e| e.to_string()),
                    None => Err(format!("Invalid value {}", raw)),
                };
                (name.clone(), result)
            });
        }

        for (name, result) in join_all(writes).await {
            match result {
                Ok(value) => {
                    outcome.written.insert(name, value);
                }
                Err(err) => {
                    outcome.failed.insert(name, err);
                }
            }
        }

        if outcome.failed.is_empty() {
            self.reset_error().await;
        } else {
            let message = outcome
                .failed
                .iter()
                .map(|(name, err)| format!("{}: {}", name, err))
                .collect::<Vec<_>>()
                .join("; ");
            warn!(device = %self.name, error = %message, "Write failed");
            self.set_error(format!("Write failed: {}", message)).await;
            self.send_availability().await;
        }

        let patch: Vec<(String, Option<Value>)> = outcome
            .written
            .iter()
            .filter(|(name, _)| self.peripheral(name).is_some_and(|p| p.readable()))
            .map(|(name, value)| (name.clone(), Some(*value)))
            .collect();
        if self.update(patch).changed() {
            self.send_state().await;
        }

        outcome
    }

    /// A pool finished a refresh. Once every pool behind the device reads
    /// again, a pending hard error is stale and gets cleared.
    pub async fn on_pool_refreshed(&self) {
        if self.hard_error.read().is_none() {
            return;
        }
        if !self.pools().iter().all(|p| p.available()) {
            return;
        }
        info!(device = %self.name, "Polling succeeded, clearing error");
        self.reset_error().await;
        self.send_availability().await;
    }

    /// Read every readable register and publish if anything changed.
    pub async fn handle_refresh(&self, priority: u32) -> UpdateOutcome {
        let connected = self
            .peripherals
            .iter()
            .any(|p| p.pool().transport().is_connected());
        if !connected {
            return UpdateOutcome::Unchanged;
        }

        let reads = self
            .peripherals
            .iter()
            .filter(|p| p.readable())
            .map(|p| async move { (p.name().to_string(), p.read(priority).await) });

        let mut patch = Vec::new();
        let mut failures = Vec::new();
        for (name, result) in join_all(reads).await {
            match result {
                Ok(value) => patch.push((name, value)),
                Err(err) => failures.push(format!("{}: {}", name, err)),
            }
        }

        if !failures.is_empty() {
            let message = format!("Read failed: {}", failures.join("; "));
            warn!(device = %self.name, error = %message, "Refresh failed");
            self.set_error(message).await;
            if self.bus.is_connected() {
                if let Err(e) = self.presence.dead().await {
                    debug!(device = %self.name, error = %e, "Failed to send death");
                }
            }
            return UpdateOutcome::Unchanged;
        }

        if self.bus.is_connected() {
            if let Err(e) = self.presence.ping().await {
                debug!(device = %self.name, error = %e, "Failed to send ping");
            }
        }
        self.reset_error().await;

        let outcome = self.update(patch);
        if outcome.changed() {
            self.send_state().await;
        }
        outcome
    }

    /// Dispatch a message received under the root topic.
    pub async fn handle_message(&self, message: &BusMessage) {
        let Some(name) = command_of(&self.root, &message.topic) else {
            return;
        };

        match DeviceCommand::parse(name, &message.payload) {
            Ok(Some(command)) => {
                debug!(device = %self.name, command = %name, "Received command");
                self.execute(command).await;
            }
            Ok(None) => {}
            Err(e) => warn!(device = %self.name, topic = %message.topic, error = %e, "Dropped command"),
        }
    }

    /// Announce the device: handshake without reply, then current state.
    pub async fn introduce(&self) {
        let available = self.available();
        self.was_available.store(available, Ordering::SeqCst);
        info!(
            device = %self.name,
            "Presence: device is {}",
            if available { "ONLINE" } else { "OFFLINE" }
        );

        if let Err(e) = self.presence.handshake(false).await {
            warn!(device = %self.name, error = %e, "Handshake failed");
        }
        self.send_state().await;
    }

    /// Heartbeat: log transitions, death once on the falling edge, ping every beat while up.
    pub async fn heartbeat(&self) {
        let available = self.available();
        let was_available = self.was_available.swap(available, Ordering::SeqCst);

        if available && !was_available {
            info!(device = %self.name, "Presence: device is now ONLINE");
        }
        if !available && was_available {
            self.send_availability().await;
            info!(device = %self.name, "Presence: device is now OFFLINE");
        }
        if available {
            self.send_availability().await;
        }
    }

    /// Subscribe to commands, pool events and discovery.
    pub async fn listen(self: &Arc<Self>) -> Result<(), BridgeError> {
        let mut commands = self.bus.subscribe(&self.topic("*")).await?;
        if let Some(discovery) = &self.discovery {
            discovery.listen().await?;
        }

        let mut tasks = Vec::new();

        let weak = Arc::downgrade(self);
        tasks.push(tokio::spawn(async move {
            while let Some(message) = commands.recv().await {
                let Some(device) = weak.upgrade() else {
                    break;
                };
                device.handle_message(&message).await;
            }
        }));

        for pool in self.pools() {
            let mut events = pool.subscribe();
            let weak = Arc::downgrade(self);
            tasks.push(tokio::spawn(async move {
                loop {
                    let refreshed = match events.recv().await {
                        Ok(PoolEvent::Update(_)) | Err(RecvError::Lagged(_)) => false,
                        Ok(PoolEvent::Done { .. }) => true,
                        Ok(PoolEvent::Error(_)) => continue,
                        Err(RecvError::Closed) => break,
                    };
                    let Some(device) = weak.upgrade() else {
                        break;
                    };
                    if refreshed {
                        device.on_pool_refreshed().await;
                    } else if device.reconcile().changed() {
                        device.send_state().await;
                    }
                }
            }));
        }

        let mut presence_events = self.presence.events();
        let name = self.name.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                match presence_events.recv().await {
                    Ok(DiscoveryEvent::Handshake { packet, .. }) => {
                        trace!(device = %name, from = %packet.uid, "Peer handshake");
                    }
                    Ok(DiscoveryEvent::Alive { uid, .. }) => trace!(device = %name, from = %uid, "Peer alive"),
                    Ok(DiscoveryEvent::Death { uid, .. }) => trace!(device = %name, from = %uid, "Peer death"),
                    Ok(DiscoveryEvent::HandshakeSent { .. }) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                }
            }
        }));

        let previous = std::mem::replace(&mut *self.tasks.lock(), tasks);
        for task in previous {
            task.abort();
        }
        debug!(device = %self.name, commands = %self.topic("*"), "Listening");
        Ok(())
    }

    /// Stop every background task started by [`listen`](Self::listen).
    pub fn stop(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        if let Some(discovery) = &self.discovery {
            discovery.stop_listening();
        }
    }

    fn heartbeat_settings(&self) -> (bool, u64) {
        let interval = self.context.heartbeat.interval_ms;
        let timeout = if self.context.heartbeat.timeout_ms > 0 {
            self.context.heartbeat.timeout_ms
        } else {
            interval * 3
        };
        (interval > 0, if interval > 0 { timeout } else { 0 })
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

impl HandshakeSource for Device {
    fn handshake_packet(&self) -> HandshakePacket {
        let (keepalive, keepalive_timeout) = self.heartbeat_settings();
        let firmware = env!("CARGO_PKG_NAME").to_string();
        let firmware_version = env!("CARGO_PKG_VERSION").to_string();

        let transports: Vec<_> = {
            let mut seen = BTreeSet::new();
            self.peripherals
                .iter()
                .map(|p| p.pool().transport())
                .filter(|t| seen.insert(t.name().to_string()))
                .collect()
        };

        let mut tags = self.meta.tags.clone();
        tags.extend(["modbus.device".to_string(), "modbus.gw.device".to_string()]);

        let mut additional = self.meta.additional.clone();
        additional.insert(
            "bus".to_string(),
            serde_json::json!(transports.iter().map(|t| t.name()).collect::<Vec<_>>()),
        );
        additional.insert(
            "connected".to_string(),
            serde_json::json!(transports.iter().all(|t| t.is_connected())),
        );
        additional.insert("registers".to_string(), serde_json::json!(self.peripherals.len()));
        additional.insert(
            "stateRegister".to_string(),
            serde_json::json!(self.meta.state_register.as_deref().unwrap_or("switch")),
        );
        additional.insert(
            "gateway".to_string(),
            serde_json::json!(format!("{} {}", firmware, firmware_version)),
        );

        HandshakePacket {
            version: "1.0".to_string(),
            uid: self.uid.clone(),
            device_type: self
                .meta
                .device_type
                .clone()
                .unwrap_or_else(|| "device/general".to_string()),
            product: self
                .meta
                .product
                .clone()
                .unwrap_or_else(|| "Modbus generic device".to_string()),
            vendor: self.meta.vendor.clone().unwrap_or_else(|| "Unknown".to_string()),
            model: self.meta.model.clone(),
            name: self.meta.name.clone().unwrap_or_else(|| "Modbus device".to_string()),
            alias: self.alias.clone(),
            description: self.meta.description.clone(),
            location: self.meta.room.clone(),
            platform: "modbus".to_string(),
            state_format: "json".to_string(),
            tags,
            features: self.meta.features.clone(),
            firmware,
            firmware_version,
            via: self.context.gateway_uid.clone(),
            keepalive,
            keepalive_timeout,
            available: self.available(),
            groups: self.meta.groups.clone(),
            comm: vec![
                CommTopic {
                    topic: self.root.clone(),
                    kind: "state".to_string(),
                },
                CommTopic {
                    topic: self.topic("set"),
                    kind: "set".to_string(),
                },
                CommTopic {
                    topic: self.topic("get"),
                    kind: "fetch".to_string(),
                },
            ],
            additional,
            thread: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Access, Endianness, Format, PoolConfig, RegisterConfig};
    use crate::mutex::POLL_PRIORITY;
    use crate::simulator::SimulatedBank;
    use crate::transport::{Transport, TransportError};
    use modbus_gw_framework::MemoryBus;
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        bank: Arc<SimulatedBank>,
        transport: Arc<Transport>,
        bus: Arc<MemoryBus>,
        device: Arc<Device>,
    }

    fn context() -> DeviceContext {
        DeviceContext {
            domain: "modbus-gw".to_string(),
            gateway_uid: "gw01".to_string(),
            topic_format: TopicFormat::DeviceUid,
            heartbeat: HeartbeatConfig {
                interval_ms: 500,
                timeout_ms: 5000,
            },
            log_discovery_pings: false,
        }
    }

    fn register(name: &str, field: u16, format: Format, access: Access) -> RegisterConfig {
        RegisterConfig {
            name: name.to_string(),
            pool: Some("p1".to_string()),
            field,
            bus: None,
            unit: 1,
            address: 0,
            format,
            endianness: Endianness::Big,
            access,
        }
    }

    async fn fixture(configure: impl FnOnce(&mut DeviceConfig)) -> Fixture {
        let bank = SimulatedBank::new(0);
        bank.load(1, 0, &[215, 40, 0, 0]);
        let transport = Transport::new(
            "sim0",
            Box::new(bank.channel()),
            Duration::from_millis(500),
            Duration::from_millis(500),
        );
        transport.connect().await.unwrap();
        let pool = RegisterPool::new(
            &PoolConfig {
                name: "p1".to_string(),
                bus: "sim0".to_string(),
                unit: 1,
                offset: 0,
                length: 4,
                interval_ms: 0,
                interval_dilation: 3,
                read_timeout_ms: None,
                write_timeout_ms: None,
                ttl: 0,
            },
            Arc::clone(&transport),
        );

        let registers = vec![
            register("temp", 0, Format::Decimal, Access::Read),
            register("setpoint", 1, Format::Int16, Access::ReadWrite),
            register("relay", 2, Format::Bool, Access::Write),
        ];
        let mut config = DeviceConfig {
            name: "boiler".to_string(),
            alias: Some("Boiler".to_string()),
            force_update: false,
            retain: true,
            qos: 1,
            discovery: true,
            check_interval_ms: 1000,
            meta: DeviceMeta {
                uid: Some("boiler-1".to_string()),
                room: Some("cellar".to_string()),
                tags: vec!["heating".to_string()],
                ..Default::default()
            },
            registers: registers.clone(),
        };
        configure(&mut config);

        let peripherals = registers
            .iter()
            .map(|r| Peripheral::new(r, Arc::clone(&pool), r.field))
            .collect();
        let bus = Arc::new(MemoryBus::new());
        let device = Device::new(&config, &context(), peripherals, bus.clone());

        Fixture {
            bank,
            transport,
            bus,
            device,
        }
    }

    #[tokio::test]
    async fn test_initial_state_lists_readable_registers() {
        let f = fixture(|_| {}).await;
        let state = f.device.state();

        assert_eq!(f.device.root(), "modbus-gw/boiler");
        assert_eq!(f.device.status(), DeviceStatus::Uninitialized);
        assert!(state.updated_at.is_some());

        let json = serde_json::to_value(&*state).unwrap();
        assert_eq!(json["temp"], serde_json::Value::Null);
        assert_eq!(json["setpoint"], serde_json::Value::Null);
        assert_eq!(json["error"], serde_json::Value::Null);
        assert!(json.get("relay").is_none());
        assert!(json.get("_updatedAt").is_some());
    }

    #[tokio::test]
    async fn test_update_unchanged_without_force() {
        let f = fixture(|_| {}).await;

        let patch = || vec![("temp".to_string(), Some(Value::Decimal(21.5)))];
        assert_eq!(f.device.update(patch()), UpdateOutcome::Changed);
        let before = f.device.state();

        assert_eq!(f.device.update(patch()), UpdateOutcome::Unchanged);
        let after = f.device.state();
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(after.updated_at, before.updated_at);
    }

    #[tokio::test]
    async fn test_update_forced_always_changes() {
        let f = fixture(|config| config.force_update = true).await;

        let patch = || vec![("temp".to_string(), Some(Value::Decimal(21.5)))];
        assert_eq!(f.device.update(patch()), UpdateOutcome::Changed);
        let before = f.device.state();
        assert_eq!(f.device.update(patch()), UpdateOutcome::Changed);
        assert!(!Arc::ptr_eq(&before, &f.device.state()));
    }

    #[tokio::test]
    async fn test_get_publishes_unconditionally() {
        let f = fixture(|_| {}).await;

        f.device.execute(DeviceCommand::Get).await;
        f.device.execute(DeviceCommand::Get).await;

        let published = f.bus.published_on("modbus-gw/boiler");
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].options, PublishOptions { retain: true, qos: 1 });
    }

    #[tokio::test]
    async fn test_refresh_reads_and_publishes() {
        let f = fixture(|_| {}).await;

        assert_eq!(f.device.handle_refresh(0).await, UpdateOutcome::Changed);
        assert_eq!(f.device.status(), DeviceStatus::Available);

        let state = f.bus.last_on("modbus-gw/boiler").unwrap().json().unwrap();
        assert_eq!(state["temp"], json!(21.5));
        assert_eq!(state["setpoint"], json!(40));
        assert_eq!(f.bus.last_on("discovery/alive").unwrap().payload, b"boiler-1");
        // One pool behind all registers: one read.
        assert_eq!(f.bank.reads(), 1);

        assert_eq!(f.device.handle_refresh(0).await, UpdateOutcome::Unchanged);
        assert_eq!(f.bus.published_on("modbus-gw/boiler").len(), 1);
    }

    #[tokio::test]
    async fn test_refresh_failure_sets_error_and_death() {
        let f = fixture(|_| {}).await;

        f.bank
            .fail_next_read(TransportError::Exception("ServerDeviceFailure".to_string()));
        assert_eq!(f.device.handle_refresh(0).await, UpdateOutcome::Unchanged);

        let err = f.bus.last_on("modbus-gw/boiler/err").unwrap();
        assert!(String::from_utf8_lossy(&err.payload).starts_with("Read failed"));
        assert_eq!(f.bus.published_on("discovery/death").len(), 1);
        assert!(!f.device.available());

        f.device.handle_refresh(0).await;
        assert_eq!(f.bus.last_on("modbus-gw/boiler/err").unwrap().payload, b"");
        assert!(f.device.available());
    }

    #[tokio::test]
    async fn test_set_writes_and_reports_each_register() {
        let f = fixture(|_| {}).await;
        let values = json!({ "setpoint": 55, "relay": true, "temp": 30, "unknown": 1 });

        let outcome = f.device.handle_set(values.as_object().unwrap()).await;

        assert!(outcome.is_success());
        assert_eq!(outcome.written.get("setpoint"), Some(&Value::Integer(55)));
        assert_eq!(outcome.written.get("relay"), Some(&Value::Bool(true)));
        assert_eq!(outcome.ignored, vec!["temp".to_string(), "unknown".to_string()]);
        assert_eq!(f.bank.get(1, 1), 55);
        assert_eq!(f.bank.get(1, 2), 1);

        let state = f.bus.last_on("modbus-gw/boiler").unwrap().json().unwrap();
        assert_eq!(state["setpoint"], json!(55));
        assert!(state.get("relay").is_none());
    }

    #[tokio::test]
    async fn test_set_partial_failure_keeps_successes() {
        let f = fixture(|_| {}).await;
        f.bank
            .fail_next_write(TransportError::Exception("IllegalDataValue".to_string()));
        let values = json!({ "setpoint": 12, "relay": "bogus" });

        let outcome = f.device.handle_set(values.as_object().unwrap()).await;

        assert!(!outcome.is_success());
        assert_eq!(outcome.failed.len(), 2);
        assert!(outcome.written.is_empty());
        let err = f.bus.last_on("modbus-gw/boiler/err").unwrap();
        assert!(String::from_utf8_lossy(&err.payload).contains("relay"));
        assert!(f.device.hard_error().is_some());

        let outcome = f
            .device
            .handle_set(json!({ "setpoint": 12 }).as_object().unwrap())
            .await;
        assert!(outcome.skipped);
        assert!(f.bus.last_on("discovery/death").is_some());
    }

    #[tokio::test]
    async fn test_set_skipped_while_transport_down() {
        let f = fixture(|_| {}).await;
        f.transport.close().await;

        let outcome = f
            .device
            .handle_set(json!({ "setpoint": 1 }).as_object().unwrap())
            .await;
        assert!(outcome.skipped);
        assert_eq!(f.bank.writes(), 0);
        assert_eq!(f.bus.last_on("discovery/death").unwrap().payload, b"boiler-1");
    }

    #[tokio::test]
    async fn test_successful_poll_clears_write_error() {
        let f = fixture(|_| {}).await;
        let pool = Arc::clone(&f.device.pools()[0]);
        f.bank
            .fail_next_write(TransportError::Exception("IllegalDataValue".to_string()));

        let outcome = f
            .device
            .handle_set(json!({ "setpoint": 12 }).as_object().unwrap())
            .await;
        assert!(!outcome.is_success());
        assert!(!f.device.available());

        pool.refresh(POLL_PRIORITY).await.unwrap();
        f.device.on_pool_refreshed().await;
        assert!(f.device.available());
        assert!(f.device.hard_error().is_none());
        assert_eq!(f.bus.last_on("modbus-gw/boiler/err").unwrap().payload, b"");

        let outcome = f
            .device
            .handle_set(json!({ "setpoint": 12 }).as_object().unwrap())
            .await;
        assert!(!outcome.skipped);
        assert!(outcome.is_success());
        assert_eq!(f.bank.get(1, 1), 12);
    }

    #[tokio::test]
    async fn test_listener_clears_error_only_after_good_read() {
        let f = fixture(|_| {}).await;
        let pool = Arc::clone(&f.device.pools()[0]);
        f.device.listen().await.unwrap();

        f.bank
            .fail_next_write(TransportError::Exception("IllegalDataValue".to_string()));
        f.device
            .handle_set(json!({ "setpoint": 12 }).as_object().unwrap())
            .await;
        assert!(f.device.hard_error().is_some());

        f.bank
            .fail_next_read(TransportError::Exception("ServerDeviceFailure".to_string()));
        assert!(pool.refresh(POLL_PRIORITY).await.is_err());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(f.device.hard_error().is_some());

        pool.refresh(POLL_PRIORITY).await.unwrap();
        for _ in 0..100 {
            if f.device.available() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(f.device.available());

        let outcome = f
            .device
            .handle_set(json!({ "setpoint": 7 }).as_object().unwrap())
            .await;
        assert!(outcome.is_success());
        assert_eq!(f.bank.get(1, 1), 7);
    }

    #[tokio::test]
    async fn test_tick_mirrors_unavailability_into_error() {
        let f = fixture(|_| {}).await;

        f.device.on_tick().await;
        assert!(f.bus.published_on("modbus-gw/boiler").is_empty());

        f.transport.close().await;
        f.device.on_tick().await;
        let state = f.bus.last_on("modbus-gw/boiler").unwrap().json().unwrap();
        assert_eq!(state["error"], json!("Unavailable: temp, setpoint, relay"));

        f.device.on_tick().await;
        assert_eq!(f.bus.published_on("modbus-gw/boiler").len(), 1);
    }

    #[tokio::test]
    async fn test_heartbeat_sends_death_once() {
        let f = fixture(|_| {}).await;
        f.device.introduce().await;
        assert_eq!(f.bus.published_on("discovery/handshake").len(), 1);

        f.device.heartbeat().await;
        f.device.heartbeat().await;
        assert_eq!(f.bus.published_on("discovery/alive").len(), 2);

        f.transport.close().await;
        f.device.heartbeat().await;
        f.device.heartbeat().await;
        assert_eq!(f.bus.published_on("discovery/death").len(), 1);
        assert_eq!(f.bus.published_on("discovery/alive").len(), 2);
    }

    #[tokio::test]
    async fn test_handshake_packet() {
        let f = fixture(|_| {}).await;
        let packet = f.device.handshake_packet();

        assert_eq!(packet.uid, "boiler-1");
        assert_eq!(packet.via, "gw01");
        assert_eq!(packet.location.as_deref(), Some("cellar"));
        assert_eq!(packet.alias.as_deref(), Some("Boiler"));
        assert!(packet.keepalive);
        assert_eq!(packet.keepalive_timeout, 5000);
        assert_eq!(
            packet.tags,
            vec!["heating", "modbus.device", "modbus.gw.device"]
        );
        assert_eq!(packet.comm[0].topic, "modbus-gw/boiler");
        assert_eq!(packet.comm[1].topic, "modbus-gw/boiler/set");
        assert_eq!(packet.additional["bus"], json!(["sim0"]));
        assert_eq!(packet.additional["registers"], json!(3));
        assert_eq!(packet.thread, None);
    }

    #[tokio::test]
    async fn test_opted_out_device_is_silent() {
        let f = fixture(|config| config.discovery = false).await;

        f.device.introduce().await;
        f.device.heartbeat().await;
        assert!(f.bus.published_on("discovery/handshake").is_empty());
        assert!(f.bus.published_on("discovery/alive").is_empty());
        assert_eq!(f.bus.published_on("modbus-gw/boiler").len(), 1);
    }

    #[test]
    fn test_command_parsing() {
        assert_eq!(DeviceCommand::parse("get", b""), Ok(Some(DeviceCommand::Get)));
        assert_eq!(DeviceCommand::parse("err", b"oops"), Ok(None));
        assert!(DeviceCommand::parse("set", b"{broken").is_err());
        assert!(DeviceCommand::parse("set", b"[1,2]").is_err());

        let envelope = br#"{"name":"set","payload":{"setpoint":5}}"#;
        match DeviceCommand::parse("command", envelope) {
            Ok(Some(DeviceCommand::Set(map))) => assert_eq!(map["setpoint"], json!(5)),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            DeviceCommand::parse("command", br#"{"name":"refresh"}"#),
            Ok(Some(DeviceCommand::Refresh))
        );
        assert_eq!(
            DeviceCommand::parse("command", br#"{"name":"command"}"#),
            Ok(None)
        );
        match DeviceCommand::parse("set", br#""{\"setpoint\":7}""#) {
            Ok(Some(DeviceCommand::Set(map))) => assert_eq!(map["setpoint"], json!(7)),
            other => panic!("unexpected {:?}", other),
        }
    }
}
