//! In-process [`Bus`] used by tests and offline runs.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use modbus_gw_common::topic_matches;

use crate::bus::{Bus, BusMessage, PublishOptions, SUBSCRIPTION_CAPACITY, Subscription};
use crate::error::{BridgeError, Result};

/// A publication recorded by [`MemoryBus`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub topic: String,
    pub payload: Vec<u8>,
    pub options: PublishOptions,
}

impl Published {
    /// Payload decoded as JSON, if it is JSON.
    pub fn json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.payload).ok()
    }
}

#[derive(Default)]
struct Inner {
    published: Vec<Published>,
    subscribers: Vec<(String, mpsc::Sender<BusMessage>)>,
    retained: BTreeMap<String, Vec<u8>>,
}

/// Message bus living entirely in memory.
///
/// Every publication is recorded and delivered to matching subscribers in
/// publication order. Retained payloads are replayed to new subscribers.
pub struct MemoryBus {
    inner: Mutex<Inner>,
    connected: AtomicBool,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            connected: AtomicBool::new(true),
        }
    }

    /// Simulate the connection going up or down.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Every publication so far, oldest first.
    pub fn published(&self) -> Vec<Published> {
        self.inner.lock().published.clone()
    }

    /// Publications on exactly `topic`, oldest first.
    pub fn published_on(&self, topic: &str) -> Vec<Published> {
        self.inner
            .lock()
            .published
            .iter()
            .filter(|p| p.topic == topic)
            .cloned()
            .collect()
    }

    /// Most recent publication on `topic`.
    pub fn last_on(&self, topic: &str) -> Option<Published> {
        self.inner
            .lock()
            .published
            .iter()
            .rev()
            .find(|p| p.topic == topic)
            .cloned()
    }

    /// Retained payload for `topic`.
    pub fn retained(&self, topic: &str) -> Option<Vec<u8>> {
        self.inner.lock().retained.get(topic).cloned()
    }

    /// Forget recorded publications. Retained payloads are kept.
    pub fn clear(&self) {
        self.inner.lock().published.clear();
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.subscribers.retain(|(_, tx)| !tx.is_closed());
        inner.subscribers.len()
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>, options: PublishOptions) -> Result<()> {
        if !self.is_connected() {
            return Err(BridgeError::Disconnected);
        }

        let mut inner = self.inner.lock();
        if options.retain {
            inner.retained.insert(topic.to_string(), payload.clone());
        }

        inner.subscribers.retain(|(pattern, tx)| {
            if tx.is_closed() {
                return false;
            }
            if topic_matches(pattern, topic) {
                if let Err(mpsc::error::TrySendError::Full(_)) =
                    tx.try_send(BusMessage::new(topic, payload.clone()))
                {
                    tracing::warn!(pattern = %pattern, topic = %topic, "Subscriber queue full, message dropped");
                }
            }
            true
        });

        inner.published.push(Published {
            topic: topic.to_string(),
            payload,
            options,
        });
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);

        let mut inner = self.inner.lock();
        for (topic, payload) in &inner.retained {
            if topic_matches(pattern, topic) {
                let _ = tx.try_send(BusMessage::new(topic.as_str(), payload.clone()));
            }
        }
        inner.subscribers.push((pattern.to_string(), tx));

        Ok(Subscription::new(pattern, rx, None))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        self.set_connected(false);
        self.inner.lock().subscribers.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_reaches_matching_subscribers_in_order() {
        tokio_test::block_on(async {
            let bus = MemoryBus::new();
            let mut devices = bus.subscribe("gw/boiler/*").await.unwrap();
            let mut everything = bus.subscribe("**").await.unwrap();

            for topic in ["gw/boiler/set", "gw/pump/set", "gw/boiler/get"] {
                bus.publish(topic, b"{}".to_vec(), PublishOptions::default())
                    .await
                    .unwrap();
            }

            assert_eq!(devices.try_recv().unwrap().topic, "gw/boiler/set");
            assert_eq!(devices.try_recv().unwrap().topic, "gw/boiler/get");
            assert!(devices.try_recv().is_none());

            assert_eq!(everything.try_recv().unwrap().topic, "gw/boiler/set");
            assert_eq!(everything.try_recv().unwrap().topic, "gw/pump/set");
            assert_eq!(bus.published().len(), 3);
        });
    }

    #[test]
    fn test_retained_replayed_to_late_subscriber() {
        tokio_test::block_on(async {
            let bus = MemoryBus::new();
            bus.publish("gw/boiler", b"{\"t\":1}".to_vec(), PublishOptions::retained(1))
                .await
                .unwrap();
            bus.publish("gw/pump", b"{}".to_vec(), PublishOptions::default())
                .await
                .unwrap();

            let mut late = bus.subscribe("gw/*").await.unwrap();
            let message = late.try_recv().unwrap();
            assert_eq!(message.topic, "gw/boiler");
            assert_eq!(message.payload_str(), "{\"t\":1}");
            assert!(late.try_recv().is_none());
        });
    }

    #[test]
    fn test_disconnected_publish_fails() {
        tokio_test::block_on(async {
            let bus = MemoryBus::new();
            bus.set_connected(false);
            let result = bus
                .publish("gw/boiler", Vec::new(), PublishOptions::default())
                .await;
            assert!(matches!(result, Err(BridgeError::Disconnected)));
            assert!(bus.published().is_empty());
        });
    }

    #[test]
    fn test_dropped_subscription_is_pruned() {
        tokio_test::block_on(async {
            let bus = MemoryBus::new();
            let subscription = bus.subscribe("a/*").await.unwrap();
            assert_eq!(bus.subscriber_count(), 1);
            drop(subscription);
            assert_eq!(bus.subscriber_count(), 0);
        });
    }

    #[test]
    fn test_published_json() {
        tokio_test::block_on(async {
            let bus = MemoryBus::new();
            bus.publish("a", br#"{"x":2}"#.to_vec(), PublishOptions::default())
                .await
                .unwrap();
            let last = bus.last_on("a").unwrap();
            assert_eq!(last.json().unwrap()["x"], 2);
        });
    }
}
