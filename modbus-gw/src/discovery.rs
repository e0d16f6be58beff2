//! Presence protocol on the `discovery/` topics.
//!
//! Participants announce themselves with a handshake, send `alive` pings
//! while healthy and `death` when leaving. A handshake carrying a `_thread`
//! topic asks every other participant to answer with its own handshake on
//! that topic. Replies never carry a thread, so they are never answered.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use modbus_gw_common::topic::{
    DISCOVERY_PREFIX, alive_topic, death_topic, discovery_patterns, handshake_thread_topic,
    handshake_topic,
};
use modbus_gw_framework::{BridgeError, Bus, BusMessage, PublishOptions};

const EVENT_CAPACITY: usize = 64;

/// Communication endpoint advertised in a handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommTopic {
    pub topic: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Identity and capabilities announced by a participant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HandshakePacket {
    #[serde(rename = "_version")]
    pub version: String,
    pub uid: String,
    #[serde(rename = "type")]
    pub device_type: String,
    pub product: String,
    pub vendor: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    pub platform: String,
    pub state_format: String,
    pub tags: Vec<String>,
    pub features: Vec<String>,
    pub firmware: String,
    pub firmware_version: String,
    pub via: String,
    pub keepalive: bool,
    pub keepalive_timeout: u64,
    pub available: bool,
    pub groups: Vec<String>,
    pub comm: Vec<CommTopic>,
    pub additional: serde_json::Map<String, serde_json::Value>,
    /// Reply topic, present when the sender expects answers.
    #[serde(rename = "_thread", skip_serializing_if = "Option::is_none")]
    pub thread: Option<String>,
}

/// Something discovery can ask for a fresh handshake packet.
pub trait HandshakeSource: Send + Sync {
    fn handshake_packet(&self) -> HandshakePacket;
}

/// What other participants said.
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryEvent {
    Handshake {
        packet: Box<HandshakePacket>,
        at: DateTime<Utc>,
    },
    Alive {
        uid: String,
        at: DateTime<Utc>,
    },
    Death {
        uid: String,
        at: DateTime<Utc>,
    },
    /// Our own handshake went out.
    HandshakeSent {
        packet: Box<HandshakePacket>,
        at: DateTime<Utc>,
    },
}

/// Presence operations a device can rely on.
#[async_trait]
pub trait Presence: Send + Sync {
    fn uid(&self) -> &str;

    async fn ping(&self) -> Result<(), BridgeError>;

    async fn dead(&self) -> Result<(), BridgeError>;

    /// Broadcast a handshake; with `expect_reply`, others answer on our thread topic.
    async fn handshake(&self, expect_reply: bool) -> Result<(), BridgeError>;

    fn events(&self) -> broadcast::Receiver<DiscoveryEvent>;
}

/// Discovery participant bound to one uid.
pub struct Discovery {
    uid: String,
    source: Weak<dyn HandshakeSource>,
    bus: Arc<dyn Bus>,
    events: broadcast::Sender<DiscoveryEvent>,
    log_pings: bool,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Discovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Discovery")
            .field("uid", &self.uid)
            .field("log_pings", &self.log_pings)
            .finish_non_exhaustive()
    }
}

impl Discovery {
    pub fn new(
        uid: impl Into<String>,
        source: Weak<dyn HandshakeSource>,
        bus: Arc<dyn Bus>,
        log_pings: bool,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            uid: uid.into(),
            source,
            bus,
            events,
            log_pings,
            listener: Mutex::new(None),
        })
    }

    /// Subscribe to discovery traffic and handle it on a background task.
    pub async fn listen(self: &Arc<Self>) -> Result<(), BridgeError> {
        let [broadcast_pattern, thread_pattern] = discovery_patterns(&self.uid);
        let mut broadcasts = self.bus.subscribe(&broadcast_pattern).await?;
        let mut threads = self.bus.subscribe(&thread_pattern).await?;
        debug!(uid = %self.uid, "Discovery subscribed");

        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    Some(message) = broadcasts.recv() => message,
                    Some(message) = threads.recv() => message,
                    else => break,
                };
                let Some(discovery) = weak.upgrade() else {
                    break;
                };
                discovery.handle_message(&message).await;
            }
        });

        if let Some(previous) = self.listener.lock().replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    pub fn stop_listening(&self) {
        if let Some(handle) = self.listener.lock().take() {
            handle.abort();
        }
    }

    /// Current packet, without a thread. `None` once the source is gone.
    pub fn packet(&self) -> Option<HandshakePacket> {
        let mut packet = self.source.upgrade()?.handshake_packet();
        packet.thread = None;
        Some(packet)
    }

    /// Process one message from the discovery topics.
    pub async fn handle_message(&self, message: &BusMessage) {
        let mut chunks = message.topic.split('/');
        if chunks.next() != Some(DISCOVERY_PREFIX) {
            return;
        }
        let kind = chunks.next().unwrap_or_default();
        let at = Utc::now();

        match kind {
            "alive" | "death" => {
                let uid = message.payload_str().trim().to_string();
                if uid.is_empty() {
                    warn!(topic = %message.topic, "Discovery message without uid dropped");
                    return;
                }
                if uid == self.uid {
                    return;
                }

                let event = if kind == "alive" {
                    if self.log_pings {
                        debug!(uid = %self.uid, from = %uid, "Keep-alive received");
                    }
                    DiscoveryEvent::Alive { uid, at }
                } else {
                    debug!(uid = %self.uid, from = %uid, "Death received");
                    DiscoveryEvent::Death { uid, at }
                };
                let _ = self.events.send(event);
            }
            "handshake" => {
                let packet: HandshakePacket = match serde_json::from_slice(&message.payload) {
                    Ok(packet) => packet,
                    Err(e) => {
                        warn!(topic = %message.topic, error = %e, "Malformed handshake dropped");
                        return;
                    }
                };
                if packet.uid.is_empty() {
                    warn!(topic = %message.topic, "Handshake without uid dropped");
                    return;
                }
                if packet.uid == self.uid {
                    return;
                }

                debug!(
                    uid = %self.uid,
                    from = %packet.uid,
                    expects_reply = packet.thread.is_some(),
                    "Handshake received"
                );
                let thread = packet.thread.clone();
                let _ = self.events.send(DiscoveryEvent::Handshake {
                    packet: Box::new(packet),
                    at,
                });

                if let Some(thread) = thread {
                    trace!(uid = %self.uid, topic = %thread, "Replying to handshake");
                    if let Err(e) = self.send_handshake(&thread, false).await {
                        warn!(uid = %self.uid, error = %e, "Handshake reply failed");
                    }
                }
            }
            other => debug!(kind = %other, "Unknown discovery message"),
        }
    }

    async fn send_handshake(&self, topic: &str, expect_reply: bool) -> Result<(), BridgeError> {
        let Some(mut packet) = self.packet() else {
            return Ok(());
        };
        if expect_reply {
            packet.thread = Some(handshake_thread_topic(&packet.uid));
        }

        let payload = serde_json::to_vec(&packet)?;
        self.bus
            .publish(topic, payload, PublishOptions::default())
            .await?;
        debug!(uid = %self.uid, topic = %topic, "Handshake sent");

        let _ = self.events.send(DiscoveryEvent::HandshakeSent {
            packet: Box::new(packet),
            at: Utc::now(),
        });
        Ok(())
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        self.stop_listening();
    }
}

#[async_trait]
impl Presence for Discovery {
    fn uid(&self) -> &str {
        &self.uid
    }

    async fn ping(&self) -> Result<(), BridgeError> {
        self.bus
            .publish(&alive_topic(), self.uid.as_bytes().to_vec(), PublishOptions::default())
            .await?;
        if self.log_pings {
            debug!(uid = %self.uid, "Ping sent");
        }
        Ok(())
    }

    async fn dead(&self) -> Result<(), BridgeError> {
        self.bus
            .publish(&death_topic(), self.uid.as_bytes().to_vec(), PublishOptions::default())
            .await?;
        debug!(uid = %self.uid, "Death sent");
        Ok(())
    }

    async fn handshake(&self, expect_reply: bool) -> Result<(), BridgeError> {
        self.send_handshake(&handshake_topic(), expect_reply).await
    }

    fn events(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.events.subscribe()
    }
}

/// Presence for devices that opted out of discovery. Every call succeeds without publishing.
#[derive(Debug)]
pub struct Silent {
    uid: String,
    events: broadcast::Sender<DiscoveryEvent>,
}

impl Silent {
    pub fn new(uid: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(1);
        Self {
            uid: uid.into(),
            events,
        }
    }
}

#[async_trait]
impl Presence for Silent {
    fn uid(&self) -> &str {
        &self.uid
    }

    async fn ping(&self) -> Result<(), BridgeError> {
        Ok(())
    }

    async fn dead(&self) -> Result<(), BridgeError> {
        Ok(())
    }

    async fn handshake(&self, _expect_reply: bool) -> Result<(), BridgeError> {
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.events.subscribe()
    }
}
