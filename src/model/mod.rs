//! Configuration documents managed by Conduit.
//!
//! Four kinds of configuration form a hierarchy:
//!
//! ```text
//! ProviderConfiguration            (plugin implementing a wire protocol)
//!          ↓ providerId
//! ConnectorConfiguration           (shared endpoint: host, credentials)
//!          ↓ connector.id
//! ConsumerConfiguration | ProducerConfiguration   (streams)
//! ```
//!
//! Documents are stored as JSON with a `className` discriminator. Provider-,
//! connector- and stream-specific fields are kept verbatim in `settings`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

mod patch;

pub use patch::{ConfigPatch, ConnectorPatch, PatchError, StreamPatch};

/// Discriminates the four configuration kinds by their stored class name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConfigKind {
    #[serde(rename = "ProviderConfiguration")]
    Provider,
    #[serde(rename = "ConnectorConfiguration")]
    Connector,
    #[serde(rename = "ConsumerConfiguration")]
    Consumer,
    #[serde(rename = "ProducerConfiguration")]
    Producer,
}

impl ConfigKind {
    pub fn class_name(&self) -> &'static str {
        match self {
            ConfigKind::Provider => "ProviderConfiguration",
            ConfigKind::Connector => "ConnectorConfiguration",
            ConfigKind::Consumer => "ConsumerConfiguration",
            ConfigKind::Producer => "ProducerConfiguration",
        }
    }

    pub fn from_class_name(class_name: &str) -> Option<Self> {
        match class_name {
            "ProviderConfiguration" => Some(ConfigKind::Provider),
            "ConnectorConfiguration" => Some(ConfigKind::Connector),
            "ConsumerConfiguration" => Some(ConfigKind::Consumer),
            "ProducerConfiguration" => Some(ConfigKind::Producer),
            _ => None,
        }
    }

    /// True for Consumer and Producer.
    pub fn is_stream(&self) -> bool {
        matches!(self, ConfigKind::Consumer | ConfigKind::Producer)
    }
}

impl fmt::Display for ConfigKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.class_name())
    }
}

/// Configuration declared by a provider plugin.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub disabled: bool,
    /// Function definitions (custom commands, schemas) exposed to clients.
    #[serde(default)]
    pub functions: Vec<Value>,
    #[serde(flatten)]
    pub definition: Map<String, Value>,
}

/// A reusable network endpoint shared by several streams.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConnectorConfig {
    pub id: String,
    pub name: String,
    #[serde(rename = "scopeId", default)]
    pub scope_id: String,
    #[serde(rename = "providerId")]
    pub provider_id: String,
    #[serde(default)]
    pub disabled: bool,
    #[serde(flatten)]
    pub settings: Map<String, Value>,
}

/// Reference from a stream to its connector.
///
/// Older documents carry `_id`, newer ones `id`; both are kept equal once
/// normalized.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectorRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub object_id: Option<String>,
}

impl ConnectorRef {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            id: Some(id.clone()),
            object_id: Some(id),
        }
    }

    /// Returns the referenced connector id, preferring `id` over `_id`.
    pub fn resolve(&self) -> Option<&str> {
        self.id
            .as_deref()
            .filter(|s| !s.is_empty())
            .or_else(|| self.object_id.as_deref().filter(|s| !s.is_empty()))
    }

    /// Copies whichever field is set into the other one.
    pub fn normalize(&mut self) {
        if let Some(id) = self.resolve().map(str::to_string) {
            self.id = Some(id.clone());
            self.object_id = Some(id);
        }
    }
}

/// Consumer or Producer configuration. The kind lives on [`Configuration`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub id: String,
    pub name: String,
    #[serde(rename = "scopeId", default)]
    pub scope_id: String,
    #[serde(default)]
    pub connector: ConnectorRef,
    #[serde(default)]
    pub disabled: bool,
    #[serde(flatten)]
    pub settings: Map<String, Value>,
}

impl StreamConfig {
    pub fn connector_id(&self) -> Option<&str> {
        self.connector.resolve()
    }
}

/// Any stored configuration document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "className")]
pub enum Configuration {
    #[serde(rename = "ProviderConfiguration")]
    Provider(ProviderConfig),
    #[serde(rename = "ConnectorConfiguration")]
    Connector(ConnectorConfig),
    #[serde(rename = "ConsumerConfiguration")]
    Consumer(StreamConfig),
    #[serde(rename = "ProducerConfiguration")]
    Producer(StreamConfig),
}

impl Configuration {
    pub fn kind(&self) -> ConfigKind {
        match self {
            Configuration::Provider(_) => ConfigKind::Provider,
            Configuration::Connector(_) => ConfigKind::Connector,
            Configuration::Consumer(_) => ConfigKind::Consumer,
            Configuration::Producer(_) => ConfigKind::Producer,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Configuration::Provider(c) => &c.id,
            Configuration::Connector(c) => &c.id,
            Configuration::Consumer(c) | Configuration::Producer(c) => &c.id,
        }
    }

    pub fn set_id(&mut self, id: String) {
        match self {
            Configuration::Provider(c) => c.id = id,
            Configuration::Connector(c) => c.id = id,
            Configuration::Consumer(c) | Configuration::Producer(c) => c.id = id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Configuration::Provider(c) => &c.name,
            Configuration::Connector(c) => &c.name,
            Configuration::Consumer(c) | Configuration::Producer(c) => &c.name,
        }
    }

    pub fn name_mut(&mut self) -> &mut String {
        match self {
            Configuration::Provider(c) => &mut c.name,
            Configuration::Connector(c) => &mut c.name,
            Configuration::Consumer(c) | Configuration::Producer(c) => &mut c.name,
        }
    }

    /// Providers have no scope; they are shared by every tenant.
    pub fn scope_id(&self) -> &str {
        match self {
            Configuration::Provider(_) => "",
            Configuration::Connector(c) => &c.scope_id,
            Configuration::Consumer(c) | Configuration::Producer(c) => &c.scope_id,
        }
    }

    pub fn disabled(&self) -> bool {
        match self {
            Configuration::Provider(c) => c.disabled,
            Configuration::Connector(c) => c.disabled,
            Configuration::Consumer(c) | Configuration::Producer(c) => c.disabled,
        }
    }

    pub fn as_stream(&self) -> Option<&StreamConfig> {
        match self {
            Configuration::Consumer(c) | Configuration::Producer(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_stream_mut(&mut self) -> Option<&mut StreamConfig> {
        match self {
            Configuration::Consumer(c) | Configuration::Producer(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_connector(&self) -> Option<&ConnectorConfig> {
        match self {
            Configuration::Connector(c) => Some(c),
            _ => None,
        }
    }

    /// Connector id referenced by a stream, `None` for every other kind.
    pub fn connector_id(&self) -> Option<&str> {
        self.as_stream().and_then(StreamConfig::connector_id)
    }

    /// Trims surrounding whitespace from the name. Returns true if it changed.
    pub fn trim_name(&mut self) -> bool {
        let name = self.name_mut();
        let trimmed = name.trim();
        if trimmed.len() == name.len() {
            return false;
        }
        *name = trimmed.to_string();
        true
    }
}

/// A stream or connector with its ancestors inlined.
///
/// Computed on demand from the registry, never persisted.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DeepConfig {
    #[serde(rename = "className")]
    pub kind: ConfigKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<StreamConfig>,
    pub connector: ConnectorConfig,
    pub provider: ProviderConfig,
}

impl DeepConfig {
    /// Id of the leaf configuration (stream id, or connector id for connectors).
    pub fn id(&self) -> &str {
        match &self.stream {
            Some(stream) => &stream.id,
            None => &self.connector.id,
        }
    }

    pub fn name(&self) -> &str {
        match &self.stream {
            Some(stream) => &stream.name,
            None => &self.connector.name,
        }
    }

    pub fn scope_id(&self) -> &str {
        match &self.stream {
            Some(stream) => &stream.scope_id,
            None => &self.connector.scope_id,
        }
    }

    pub fn is_consumer(&self) -> bool {
        self.kind == ConfigKind::Consumer
    }

    /// A disabled connector or provider keeps every dependent stream down.
    pub fn is_inactive(&self) -> bool {
        self.connector.disabled || self.provider.disabled
    }
}
