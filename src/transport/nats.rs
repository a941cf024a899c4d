use super::{Transport, TransportMessage};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// NATS configuration
#[derive(Clone, Debug, Deserialize)]
pub struct NatsConfig {
    pub url: String,
    /// Buffer size of each subscription channel
    #[serde(default = "default_subscription_buffer")]
    pub subscription_buffer: usize,
}

fn default_subscription_buffer() -> usize {
    1024
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: std::env::var("NATS_URL").unwrap_or_else(|_| "nats://localhost:4222".to_string()),
            subscription_buffer: default_subscription_buffer(),
        }
    }
}

/// Core NATS pub/sub transport.
///
/// Topic `a/+/c/#` maps to subject `a.*.c.>`; segments must not contain dots.
#[derive(Clone)]
pub struct NatsTransport {
    client: async_nats::Client,
    config: NatsConfig,
}

impl NatsTransport {
    /// Connect to NATS
    pub async fn connect(config: NatsConfig) -> Result<Self> {
        info!("Connecting to NATS at {}", config.url);

        let client = async_nats::connect(&config.url)
            .await
            .context("Failed to connect to NATS")?;

        Ok(Self { client, config })
    }

    /// Get underlying NATS client
    pub fn client(&self) -> &async_nats::Client {
        &self.client
    }
}

#[async_trait]
impl Transport for NatsTransport {
    async fn publish(&self, topic: &str, payload: &Value) -> Result<()> {
        let subject = topic_to_subject(topic);
        let bytes = serde_json::to_vec(payload).context("Failed to serialize payload to JSON")?;

        debug!(subject = %subject, bytes = bytes.len(), "Publishing to NATS");

        self.client
            .publish(subject.clone(), bytes.into())
            .await
            .context(format!("Failed to publish to subject '{}'", subject))?;

        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<mpsc::Receiver<TransportMessage>> {
        let subject = topic_to_subject(pattern);
        let mut subscriber = self
            .client
            .subscribe(subject.clone())
            .await
            .context(format!("Failed to subscribe to subject '{}'", subject))?;

        info!(subject = %subject, "Subscribed to NATS subject");

        let (tx, rx) = mpsc::channel(self.config.subscription_buffer);
        tokio::spawn(async move {
            while let Some(msg) = subscriber.next().await {
                let payload: Value = match serde_json::from_slice(&msg.payload) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(subject = %msg.subject, error = %e, "Dropping non-JSON message");
                        continue;
                    }
                };
                let message = TransportMessage {
                    topic: subject_to_topic(&msg.subject.to_string()),
                    payload,
                };
                if tx.send(message).await.is_err() {
                    break;
                }
            }
            debug!(subject = %subject, "NATS subscription closed");
        });

        Ok(rx)
    }
}

pub(crate) fn topic_to_subject(topic: &str) -> String {
    topic
        .split('/')
        .map(|segment| match segment {
            "+" => "*",
            "#" => ">",
            other => other,
        })
        .collect::<Vec<_>>()
        .join(".")
}

pub(crate) fn subject_to_topic(subject: &str) -> String {
    subject.replace('.', "/")
}
