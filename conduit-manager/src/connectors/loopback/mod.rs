pub mod config;

use crate::provider::{CommandFailure, InstanceEvent, InstanceEvents, Provider, StreamInstance};
use anyhow::Result;
use async_trait::async_trait;
use conduit::model::{ProviderConfig, StreamConfig};
use conduit::transport::topic_matches;
use conduit::DeepConfig;
use dashmap::DashMap;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;

use self::config::{
    functions, CHANNEL_CAPACITY, DEFAULT_FILTER, DEFAULT_TOPIC, PROVIDER_ID, PROVIDER_NAME,
};

#[derive(Clone, Debug)]
struct Frame {
    topic: String,
    message: Value,
}

/// In-process provider: producers on a connector feed every consumer on the
/// same connector. Used for local runs and smoke tests.
pub struct LoopbackProvider {
    channels: Arc<DashMap<String, broadcast::Sender<Frame>>>,
}

impl LoopbackProvider {
    pub fn new() -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
        }
    }

    fn channel(&self, connector_id: &str) -> broadcast::Sender<Frame> {
        self.channels
            .entry(connector_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

impl Default for LoopbackProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for LoopbackProvider {
    fn config(&self) -> ProviderConfig {
        let mut definition = Map::new();
        definition.insert(
            "description".to_string(),
            json!("Delivers produced messages to consumers of the same connector"),
        );
        ProviderConfig {
            id: PROVIDER_ID.to_string(),
            name: PROVIDER_NAME.to_string(),
            disabled: false,
            functions: functions(),
            definition,
        }
    }

    async fn provide(
        &self,
        config: DeepConfig,
        events: InstanceEvents,
    ) -> Result<Arc<dyn StreamInstance>> {
        let stream = config
            .stream
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("loopback only provides streams"))?;
        Ok(Arc::new(LoopbackStream {
            id: stream.id.clone(),
            consumer: config.is_consumer(),
            topic: Mutex::new(topic_setting(stream)),
            sender: self.channel(&config.connector.id),
            events,
            forwarder: Mutex::new(None),
            produced: AtomicU64::new(0),
            consumed: Arc::new(AtomicU64::new(0)),
        }))
    }

    fn validate_consumer(&self, config: &StreamConfig) -> Result<()> {
        validate_topic(config)
    }

    fn validate_producer(&self, config: &StreamConfig) -> Result<()> {
        validate_topic(config)
    }
}

fn validate_topic(config: &StreamConfig) -> Result<()> {
    match config.settings.get("topic") {
        None | Some(Value::String(_)) => Ok(()),
        Some(other) => anyhow::bail!("'topic' must be a string, got {}", other),
    }
}

fn topic_setting(stream: &StreamConfig) -> Option<String> {
    stream
        .settings
        .get("topic")
        .and_then(Value::as_str)
        .map(str::to_string)
}

struct LoopbackStream {
    id: String,
    consumer: bool,
    /// Subscription filter for consumers, publish topic for producers.
    topic: Mutex<Option<String>>,
    sender: broadcast::Sender<Frame>,
    events: InstanceEvents,
    forwarder: Mutex<Option<JoinHandle<()>>>,
    produced: AtomicU64,
    consumed: Arc<AtomicU64>,
}

impl LoopbackStream {
    fn topic(&self) -> Option<String> {
        self.topic.lock().map(|t| t.clone()).unwrap_or_default()
    }

    fn send(&self, payload: Value) {
        let (topic, message) = match payload {
            Value::Object(mut map) if map.contains_key("message") => {
                let topic = map
                    .remove("topic")
                    .and_then(|t| t.as_str().map(str::to_string));
                (topic, map.remove("message").unwrap_or(Value::Null))
            }
            other => (None, other),
        };
        let topic = topic
            .or_else(|| self.topic())
            .unwrap_or_else(|| DEFAULT_TOPIC.to_string());

        self.produced.fetch_add(1, Ordering::Relaxed);
        // No receivers is not an error for a loopback
        let receivers = self.sender.send(Frame { topic, message }).unwrap_or(0);
        debug!(stream_id = %self.id, receivers, "Loopback frame sent");
    }
}

#[async_trait]
impl StreamInstance for LoopbackStream {
    fn id(&self) -> &str {
        &self.id
    }

    async fn connect(&self) -> Result<()> {
        if self.consumer {
            let filter = self.topic().unwrap_or_else(|| DEFAULT_FILTER.to_string());
            let mut rx = self.sender.subscribe();
            let events = self.events.clone();
            let consumed = Arc::clone(&self.consumed);
            let handle = tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(frame) => {
                            if !topic_matches(&filter, &frame.topic) {
                                continue;
                            }
                            consumed.fetch_add(1, Ordering::Relaxed);
                            if !events.message(frame.topic, frame.message) {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            events.emit(InstanceEvent::Warning(json!({ "lagged": skipped })));
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            });
            if let Ok(mut forwarder) = self.forwarder.lock() {
                if let Some(previous) = forwarder.replace(handle) {
                    previous.abort();
                }
            }
        }
        self.events.ready();
        self.events.connect();
        Ok(())
    }

    async fn dispose(&self) -> Result<()> {
        if let Ok(mut forwarder) = self.forwarder.lock() {
            if let Some(handle) = forwarder.take() {
                handle.abort();
            }
        }
        self.events.emit(InstanceEvent::Disposed(json!({})));
        Ok(())
    }

    async fn produce(&self, payload: Value) -> Result<()> {
        if self.consumer {
            anyhow::bail!("stream '{}' is a consumer", self.id);
        }
        self.send(payload);
        Ok(())
    }

    async fn respond(&self, payload: Value) -> Result<()> {
        self.send(payload);
        Ok(())
    }

    async fn request(&self, payload: Value) -> Result<Value> {
        Ok(json!({ "echo": payload }))
    }

    async fn update(&self, config: &DeepConfig) -> Result<()> {
        if let (Some(stream), Ok(mut topic)) = (&config.stream, self.topic.lock()) {
            *topic = topic_setting(stream);
        }
        Ok(())
    }

    async fn command(&self, cmd_id: &str, _value: Value) -> Result<Value, CommandFailure> {
        match cmd_id {
            "ping" => Ok(json!({ "pong": true, "streamId": self.id })),
            "stats" => Ok(json!({
                "produced": self.produced.load(Ordering::Relaxed),
                "consumed": self.consumed.load(Ordering::Relaxed),
            })),
            _ => Err(CommandFailure::Unsupported),
        }
    }
}
