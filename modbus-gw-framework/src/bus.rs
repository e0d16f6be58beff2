//! Publish/subscribe bus abstraction and its Zenoh implementation.
//!
//! The gateway only needs three things from the network: publish a payload
//! on a topic, receive every message matching a topic pattern, and know
//! whether the connection is up. [`Bus`] captures exactly that so the
//! engine can run against Zenoh in production and an in-process bus in
//! tests.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use zenoh::Session;
use zenoh::qos::{CongestionControl, Priority};
use zenoh::sample::SampleKind;

use modbus_gw_common::ZenohConfig;

use crate::error::{BridgeError, Result};

/// Capacity of the per-subscription message queue.
pub(crate) const SUBSCRIPTION_CAPACITY: usize = 1024;

/// Delivery options for a publication.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishOptions {
    /// Keep the last payload so late subscribers can still obtain it.
    #[serde(default)]
    pub retain: bool,
    /// Quality of service level (0, 1 or 2).
    #[serde(default)]
    pub qos: u8,
}

impl PublishOptions {
    /// Options for a retained publication.
    pub fn retained(qos: u8) -> Self {
        Self { retain: true, qos }
    }
}

/// A message received from the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    /// Concrete topic the message was published on.
    pub topic: String,
    /// Raw payload.
    pub payload: Vec<u8>,
}

impl BusMessage {
    /// Create a new message.
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    /// Payload as UTF-8 text (lossy).
    pub fn payload_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Stream of messages matching one topic pattern.
///
/// Messages are yielded in the order the bus delivered them. Dropping the
/// subscription stops delivery.
#[derive(Debug)]
pub struct Subscription {
    pattern: String,
    rx: mpsc::Receiver<BusMessage>,
    forwarder: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Wrap a receiving queue, optionally owning the task that feeds it.
    pub fn new(
        pattern: impl Into<String>,
        rx: mpsc::Receiver<BusMessage>,
        forwarder: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            pattern: pattern.into(),
            rx,
            forwarder,
        }
    }

    /// The pattern this subscription was declared with.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Wait for the next message. Returns `None` once the bus side is gone.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }

    /// Take the next message if one is already queued.
    pub fn try_recv(&mut self) -> Option<BusMessage> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}

/// Publish/subscribe message bus.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Publish `payload` on `topic`. Resolves once the bus accepted it.
    async fn publish(&self, topic: &str, payload: Vec<u8>, options: PublishOptions) -> Result<()>;

    /// Subscribe to every topic matching `pattern`.
    async fn subscribe(&self, pattern: &str) -> Result<Subscription>;

    /// Whether the bus connection is currently usable.
    fn is_connected(&self) -> bool;

    /// Close the connection. Further publications fail.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// [`Bus`] backed by a Zenoh session.
///
/// QoS levels map onto Zenoh congestion control: level 0 may drop under
/// congestion, levels 1 and 2 block, and level 2 is also sent at high
/// priority. Retained payloads are cached per key and answered through a
/// queryable declared on that key.
pub struct ZenohBus {
    session: Arc<Session>,
    retained: Arc<RwLock<HashMap<String, Vec<u8>>>>,
    queryables: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl std::fmt::Debug for ZenohBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZenohBus")
            .field("zid", &self.session.zid().to_string())
            .field("retained", &self.retained.read().len())
            .finish_non_exhaustive()
    }
}

impl ZenohBus {
    /// Open a Zenoh session using the provided configuration.
    pub async fn connect(config: &ZenohConfig) -> Result<Self> {
        config.validate()?;

        let mut zenoh_config = zenoh::Config::default();
        zenoh_config
            .insert_json5("mode", &format!("\"{}\"", config.mode))
            .map_err(|e| BridgeError::config(format!("Failed to set mode: {}", e)))?;

        if !config.connect.is_empty() {
            let endpoints = serde_json::to_string(&config.connect)?;
            zenoh_config
                .insert_json5("connect/endpoints", &endpoints)
                .map_err(|e| {
                    BridgeError::config(format!("Failed to set connect endpoints: {}", e))
                })?;
        }

        if !config.listen.is_empty() {
            let endpoints = serde_json::to_string(&config.listen)?;
            zenoh_config
                .insert_json5("listen/endpoints", &endpoints)
                .map_err(|e| {
                    BridgeError::config(format!("Failed to set listen endpoints: {}", e))
                })?;
        }

        tracing::info!(
            mode = %config.mode,
            connect = ?config.connect,
            listen = ?config.listen,
            "Connecting to Zenoh"
        );

        let session = zenoh::open(zenoh_config)
            .await
            .map_err(|e| BridgeError::ZenohConnection(e.to_string()))?;

        tracing::info!(zid = %session.zid(), "Connected to Zenoh");

        Ok(Self::from_session(Arc::new(session)))
    }

    /// Wrap an already opened session.
    pub fn from_session(session: Arc<Session>) -> Self {
        Self {
            session,
            retained: Arc::new(RwLock::new(HashMap::new())),
            queryables: Mutex::new(HashMap::new()),
        }
    }

    /// Get a reference to the Zenoh session.
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Remember `payload` as the retained value of `key` and make sure a
    /// queryable answers for it.
    async fn retain(&self, key: &str, payload: Vec<u8>) -> Result<()> {
        self.retained.write().insert(key.to_string(), payload);

        if self.queryables.lock().contains_key(key) {
            return Ok(());
        }

        let queryable = self
            .session
            .declare_queryable(key)
            .await
            .map_err(|e| BridgeError::publish(key, format!("Failed to declare queryable: {}", e)))?;

        let retained = Arc::clone(&self.retained);
        let owned_key = key.to_string();
        let task = tokio::spawn(async move {
            while let Ok(query) = queryable.recv_async().await {
                let payload = retained.read().get(&owned_key).cloned();
                if let Some(payload) = payload {
                    if let Err(e) = query.reply(owned_key.as_str(), payload).await {
                        tracing::warn!(key = %owned_key, error = %e, "Failed to answer retained query");
                    }
                }
            }
        });

        let mut queryables = self.queryables.lock();
        if queryables.contains_key(key) {
            task.abort();
        } else {
            queryables.insert(key.to_string(), task);
            tracing::debug!(key = %key, "Declared retained queryable");
        }

        Ok(())
    }
}

#[async_trait]
impl Bus for ZenohBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>, options: PublishOptions) -> Result<()> {
        if options.retain {
            self.retain(topic, payload.clone()).await?;
        }

        let congestion = if options.qos == 0 {
            CongestionControl::Drop
        } else {
            CongestionControl::Block
        };
        let priority = if options.qos >= 2 {
            Priority::DataHigh
        } else {
            Priority::Data
        };

        self.session
            .put(topic, payload)
            .congestion_control(congestion)
            .priority(priority)
            .await
            .map_err(|e| BridgeError::publish(topic, e.to_string()))
    }

    async fn subscribe(&self, pattern: &str) -> Result<Subscription> {
        let subscriber = self
            .session
            .declare_subscriber(pattern)
            .await
            .map_err(|e| BridgeError::Subscribe {
                pattern: pattern.to_string(),
                message: e.to_string(),
            })?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        let forwarder = tokio::spawn(async move {
            while let Ok(sample) = subscriber.recv_async().await {
                if sample.kind() == SampleKind::Delete {
                    continue;
                }
                let message = BusMessage::new(
                    sample.key_expr().as_str(),
                    sample.payload().to_bytes().into_owned(),
                );
                if tx.send(message).await.is_err() {
                    break;
                }
            }
        });

        tracing::debug!(pattern = %pattern, "Subscribed");
        Ok(Subscription::new(pattern, rx, Some(forwarder)))
    }

    fn is_connected(&self) -> bool {
        !self.session.is_closed()
    }

    async fn close(&self) -> Result<()> {
        for (_, task) in self.queryables.lock().drain() {
            task.abort();
        }
        self.session
            .close()
            .await
            .map_err(|e| BridgeError::ZenohSession(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_options_default() {
        let options = PublishOptions::default();
        assert!(!options.retain);
        assert_eq!(options.qos, 0);

        let retained = PublishOptions::retained(1);
        assert!(retained.retain);
        assert_eq!(retained.qos, 1);
    }

    #[test]
    fn test_message_payload_str() {
        let message = BusMessage::new("discovery/alive", b"boiler-1".to_vec());
        assert_eq!(message.payload_str(), "boiler-1");
    }

    #[test]
    fn test_subscription_yields_in_order() {
        let (tx, rx) = mpsc::channel(4);
        let mut subscription = Subscription::new("a/*", rx, None);
        tx.try_send(BusMessage::new("a/1", "x")).unwrap();
        tx.try_send(BusMessage::new("a/2", "y")).unwrap();

        assert_eq!(subscription.pattern(), "a/*");
        assert_eq!(subscription.try_recv().unwrap().topic, "a/1");
        assert_eq!(subscription.try_recv().unwrap().topic, "a/2");
        assert!(subscription.try_recv().is_none());
    }
}
