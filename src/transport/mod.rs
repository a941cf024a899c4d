//! Pub/sub transport for control-plane traffic.
//!
//! Topics are `/`-separated with MQTT-style wildcards in subscriptions:
//! `+` matches exactly one segment, `#` matches the remainder.

mod memory;
mod nats;

pub use memory::MemoryTransport;
pub use nats::{NatsConfig, NatsTransport};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

/// A message received from a subscription.
#[derive(Clone, Debug, PartialEq)]
pub struct TransportMessage {
    pub topic: String,
    pub payload: Value,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish a JSON payload on a concrete topic.
    async fn publish(&self, topic: &str, payload: &Value) -> Result<()>;

    /// Subscribe to a topic pattern. Messages arrive on the returned channel
    /// until it is dropped.
    async fn subscribe(&self, pattern: &str) -> Result<mpsc::Receiver<TransportMessage>>;
}

/// Joins topic segments, skipping empty ones.
pub fn topic(segments: &[&str]) -> String {
    segments
        .iter()
        .filter(|s| !s.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("/")
}

/// True if `topic` matches `pattern`.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut pattern_segments = pattern.split('/');
    let mut topic_segments = topic.split('/');
    loop {
        match (pattern_segments.next(), topic_segments.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(p), Some(t)) if p == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Last segment of a topic (`.../action/produce` -> `produce`).
pub fn topic_suffix(topic: &str) -> &str {
    topic.rsplit('/').next().unwrap_or(topic)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_matches_wildcards() {
        assert!(topic_matches("conduit/+/action/+", "conduit/t1/action/produce"));
        assert!(!topic_matches("conduit/+/action/+", "conduit/t1/action"));
        assert!(!topic_matches("conduit/+/action/+", "conduit/t1/x/action/produce"));
        assert!(topic_matches("conduit/#", "conduit/t1/ConsumerConfiguration/s1/state"));
        assert!(topic_matches("a/b", "a/b"));
        assert!(!topic_matches("a/b", "a/c"));
    }

    #[test]
    fn test_topic_join_and_suffix() {
        assert_eq!(topic(&["conduit", "", "action", "request"]), "conduit/action/request");
        assert_eq!(topic_suffix("conduit/t1/action/request"), "request");
        assert_eq!(topic_suffix("single"), "single");
    }
}
