use super::{topic_matches, Transport, TransportMessage};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::warn;

const SUBSCRIPTION_BUFFER: usize = 1024;

/// In-process transport.
///
/// Delivery is synchronous with `publish`, so subscribers observe messages in
/// publish order. Every published message is also kept in a history for
/// inspection.
#[derive(Default)]
pub struct MemoryTransport {
    subscribers: Mutex<Vec<(String, mpsc::Sender<TransportMessage>)>>,
    history: Mutex<Vec<TransportMessage>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every message published so far, oldest first.
    pub fn published(&self) -> Vec<TransportMessage> {
        self.history.lock().unwrap().clone()
    }

    /// Published messages whose topic matches `pattern`.
    pub fn published_matching(&self, pattern: &str) -> Vec<TransportMessage> {
        self.history
            .lock()
            .unwrap()
            .iter()
            .filter(|m| topic_matches(pattern, &m.topic))
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.history.lock().unwrap().clear();
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn publish(&self, topic: &str, payload: &Value) -> Result<()> {
        let message = TransportMessage {
            topic: topic.to_string(),
            payload: payload.clone(),
        };
        self.history.lock().unwrap().push(message.clone());

        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|(_, tx)| !tx.is_closed());
        for (pattern, tx) in subscribers.iter() {
            if topic_matches(pattern, topic) {
                if let Err(e) = tx.try_send(message.clone()) {
                    warn!(topic = %topic, error = %e, "Subscriber lagging, message dropped");
                }
            }
        }
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<mpsc::Receiver<TransportMessage>> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.subscribers
            .lock()
            .unwrap()
            .push((pattern.to_string(), tx));
        Ok(rx)
    }
}
