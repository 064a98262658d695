/*!
Mock bus for development without a broker

Records every publish so tests can assert on topics and payloads, and can be
switched offline to simulate a lost session. Disconnecting leaves it offline.
*/

use anyhow::Result;
use async_trait::async_trait;
use ntcb_core::bus::{BusError, BusHealth, BusLink, Publisher};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct MockMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

impl MockMessage {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

#[derive(Clone, Default)]
pub struct MockBus {
    published_messages: Arc<Mutex<Vec<MockMessage>>>,
    offline: Arc<AtomicBool>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// While offline every publish fails with [`BusError::Closed`].
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }

    pub fn get_published_messages(&self) -> Vec<MockMessage> {
        self.published_messages.lock().clone()
    }

    pub fn find_messages_by_topic(&self, topic: &str) -> Vec<MockMessage> {
        self.published_messages
            .lock()
            .iter()
            .filter(|msg| msg.topic == topic)
            .cloned()
            .collect()
    }

    pub fn count(&self, topic: &str) -> usize {
        self.find_messages_by_topic(topic).len()
    }

    /// Parses every message of a topic, in publish order.
    pub fn json_messages<T>(&self, topic: &str) -> Result<Vec<T>>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        self.find_messages_by_topic(topic)
            .iter()
            .map(|m| serde_json::from_slice(&m.payload).map_err(Into::into))
            .collect()
    }

    pub fn get_last_json_message<T>(&self, topic: &str) -> Result<Option<T>>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        match self.find_messages_by_topic(topic).last() {
            Some(last) => Ok(Some(serde_json::from_slice(&last.payload)?)),
            None => Ok(None),
        }
    }

    /// Polls until `count` messages were published on `topic`.
    pub async fn wait_for_messages(&self, topic: &str, count: usize, timeout: Duration) -> Result<Vec<MockMessage>> {
        let start = std::time::Instant::now();
        loop {
            let found = self.find_messages_by_topic(topic);
            if found.len() >= count {
                return Ok(found);
            }
            if start.elapsed() >= timeout {
                anyhow::bail!("expected {count} message(s) on {topic}, got {} within {timeout:?}", found.len());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Fails if `secret` appears in any payload published so far.
    pub fn assert_secret_absent(&self, secret: &str) {
        for msg in self.get_published_messages() {
            assert!(
                !msg.text().contains(secret),
                "secret leaked on {}: {}",
                msg.topic,
                msg.text()
            );
        }
    }
}

#[async_trait]
impl Publisher for MockBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>, retained: bool) -> Result<(), BusError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        let message = MockMessage { topic: topic.to_string(), payload, retain: retained };
        tracing::debug!("[mock] published to {}: {} bytes", message.topic, message.payload.len());
        self.published_messages.lock().push(message);
        Ok(())
    }
}

#[async_trait]
impl BusLink for MockBus {
    fn health(&self) -> BusHealth {
        BusHealth::default()
    }

    async fn disconnect(&self, _drain: Duration) {
        tracing::debug!("[mock] disconnected");
        self.set_offline(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ntcb_core::bus::publish_json;

    #[tokio::test]
    async fn test_mock_records_publishes() {
        let bus = MockBus::new();
        bus.publish("test/topic", b"hello".to_vec(), false).await.unwrap();
        publish_json(&bus, "json/topic", &serde_json::json!({"number": 42})).await.unwrap();

        assert_eq!(bus.get_published_messages().len(), 2);
        assert_eq!(bus.find_messages_by_topic("test/topic")[0].payload, b"hello");
        let parsed: Option<serde_json::Value> = bus.get_last_json_message("json/topic").unwrap();
        assert_eq!(parsed.unwrap()["number"], 42);
    }

    #[tokio::test]
    async fn test_offline_mock_rejects() {
        let bus = MockBus::new();
        bus.set_offline(true);
        assert!(matches!(bus.publish("t", vec![], false).await, Err(BusError::Closed)));
        bus.set_offline(false);
        assert!(bus.publish("t", vec![], false).await.is_ok());
    }

    #[tokio::test]
    async fn test_wait_for_messages_times_out() {
        let bus = MockBus::new();
        let err = bus.wait_for_messages("never", 1, Duration::from_millis(30)).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_disconnect_closes_the_mock() {
        let bus = MockBus::new();
        bus.disconnect(Duration::ZERO).await;
        assert!(bus.is_offline());
        assert!(matches!(bus.publish("t", vec![], false).await, Err(BusError::Closed)));
    }
}
