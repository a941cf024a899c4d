//! Provider plugin interface.
//!
//! A provider implements one wire protocol. Given a resolved [`DeepConfig`]
//! it creates a [`StreamInstance`] that owns the actual connection. Instances
//! report lifecycle changes and consumed data through [`InstanceEvents`];
//! the manager never polls them.

use anyhow::Result;
use async_trait::async_trait;
use conduit::model::{ConnectorConfig, ProviderConfig, StreamConfig};
use conduit::{DeepConfig, StreamEventType};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Everything a stream instance can report about itself.
#[derive(Clone, Debug, PartialEq)]
pub enum InstanceEvent {
    Test(Value),
    Ready(Value),
    Connect(Value),
    Error(Value),
    Warning(Value),
    Feedback(Value),
    Disposed(Value),
    /// Data consumed from the remote system.
    Message { topic: String, message: Value },
    /// Request to merge `$set` fields into the instance's own configuration.
    Persist(Map<String, Value>),
}

impl InstanceEvent {
    /// Lifecycle signal and payload, `None` for data and persistence events.
    pub fn signal(&self) -> Option<(StreamEventType, &Value)> {
        match self {
            InstanceEvent::Test(p) => Some((StreamEventType::Test, p)),
            InstanceEvent::Ready(p) => Some((StreamEventType::Ready, p)),
            InstanceEvent::Connect(p) => Some((StreamEventType::Connect, p)),
            InstanceEvent::Error(p) => Some((StreamEventType::Error, p)),
            InstanceEvent::Warning(p) => Some((StreamEventType::Warning, p)),
            InstanceEvent::Feedback(p) => Some((StreamEventType::Feedback, p)),
            InstanceEvent::Disposed(p) => Some((StreamEventType::Dispose, p)),
            InstanceEvent::Message { .. } | InstanceEvent::Persist(_) => None,
        }
    }
}

/// Sending half handed to a provider when it creates an instance.
#[derive(Clone, Debug)]
pub struct InstanceEvents {
    tx: mpsc::UnboundedSender<InstanceEvent>,
}

impl InstanceEvents {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<InstanceEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Returns false once the instance has been detached.
    pub fn emit(&self, event: InstanceEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn ready(&self) -> bool {
        self.emit(InstanceEvent::Ready(Value::Object(Map::new())))
    }

    pub fn connect(&self) -> bool {
        self.emit(InstanceEvent::Connect(Value::Object(Map::new())))
    }

    pub fn error(&self, payload: Value) -> bool {
        self.emit(InstanceEvent::Error(payload))
    }

    pub fn message(&self, topic: impl Into<String>, message: Value) -> bool {
        self.emit(InstanceEvent::Message {
            topic: topic.into(),
            message,
        })
    }

    pub fn persist(&self, set: Map<String, Value>) -> bool {
        self.emit(InstanceEvent::Persist(set))
    }
}

/// Why an instance refused a custom command.
#[derive(Clone, Debug, PartialEq)]
pub enum CommandFailure {
    /// No function with that id.
    Unsupported,
    Failed(String),
}

impl fmt::Display for CommandFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandFailure::Unsupported => f.write_str("unsupported command"),
            CommandFailure::Failed(message) => f.write_str(message),
        }
    }
}

/// A live consumer or producer.
#[async_trait]
pub trait StreamInstance: Send + Sync {
    fn id(&self) -> &str;

    /// Opens the underlying connection.
    async fn connect(&self) -> Result<()>;

    /// Closes the connection. Called exactly once per instance.
    async fn dispose(&self) -> Result<()>;

    async fn produce(&self, _payload: Value) -> Result<()> {
        anyhow::bail!("stream '{}' does not produce", self.id())
    }

    async fn respond(&self, _payload: Value) -> Result<()> {
        anyhow::bail!("stream '{}' does not respond", self.id())
    }

    async fn request(&self, _payload: Value) -> Result<Value> {
        anyhow::bail!("stream '{}' does not handle requests", self.id())
    }

    /// Applies a configuration change without reconnecting.
    async fn update(&self, _config: &DeepConfig) -> Result<()> {
        Ok(())
    }

    async fn command(&self, _cmd_id: &str, _value: Value) -> Result<Value, CommandFailure> {
        Err(CommandFailure::Unsupported)
    }
}

/// Provider-level report, not tied to a stream.
#[derive(Clone, Debug, PartialEq)]
pub enum ProviderNotice {
    Error(Value),
    Notification(Value),
}

/// Sending half handed to a provider when it is defined.
#[derive(Clone, Debug)]
pub struct ProviderNotices {
    tx: mpsc::UnboundedSender<ProviderNotice>,
}

impl ProviderNotices {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProviderNotice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn error(&self, payload: Value) -> bool {
        self.tx.send(ProviderNotice::Error(payload)).is_ok()
    }

    pub fn notification(&self, payload: Value) -> bool {
        self.tx.send(ProviderNotice::Notification(payload)).is_ok()
    }
}

/// Protocol plugin.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Definition registered as the provider's configuration.
    fn config(&self) -> ProviderConfig;

    /// Receives the channel for provider-level errors and notifications.
    fn bind(&self, _notices: ProviderNotices) {}

    /// Creates (but does not connect) an instance for a stream.
    async fn provide(
        &self,
        config: DeepConfig,
        events: InstanceEvents,
    ) -> Result<Arc<dyn StreamInstance>>;

    fn validate_connector(&self, _config: &ConnectorConfig) -> Result<()> {
        Ok(())
    }

    fn validate_consumer(&self, _config: &StreamConfig) -> Result<()> {
        Ok(())
    }

    fn validate_producer(&self, _config: &StreamConfig) -> Result<()> {
        Ok(())
    }
}
