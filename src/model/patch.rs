//! Typed partial updates (`{id, $set: {...}}` requests).
//!
//! Every field is optional; only present fields are applied. Unknown keys land
//! in `settings` and are merged key by key, a `null` value removing the key.

use super::{Configuration, ConnectorConfig, ConnectorRef, StreamConfig};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectorPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "scopeId", default, skip_serializing_if = "Option::is_none")]
    pub scope_id: Option<String>,
    #[serde(rename = "providerId", default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled: Option<bool>,
    #[serde(flatten)]
    pub settings: Map<String, Value>,
}

impl ConnectorPatch {
    pub fn apply(&self, target: &mut ConnectorConfig) {
        if let Some(name) = &self.name {
            target.name = name.clone();
        }
        if let Some(scope_id) = &self.scope_id {
            target.scope_id = scope_id.clone();
        }
        if let Some(provider_id) = &self.provider_id {
            target.provider_id = provider_id.clone();
        }
        if let Some(disabled) = self.disabled {
            target.disabled = disabled;
        }
        merge_settings(&mut target.settings, &self.settings);
    }

    pub fn touches_disabled(&self) -> bool {
        self.disabled.is_some()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "scopeId", default, skip_serializing_if = "Option::is_none")]
    pub scope_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connector: Option<ConnectorRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled: Option<bool>,
    #[serde(flatten)]
    pub settings: Map<String, Value>,
}

impl StreamPatch {
    pub fn apply(&self, target: &mut StreamConfig) {
        if let Some(name) = &self.name {
            target.name = name.clone();
        }
        if let Some(scope_id) = &self.scope_id {
            target.scope_id = scope_id.clone();
        }
        if let Some(connector) = &self.connector {
            let mut connector = connector.clone();
            connector.normalize();
            target.connector = connector;
        }
        if let Some(disabled) = self.disabled {
            target.disabled = disabled;
        }
        merge_settings(&mut target.settings, &self.settings);
    }

    /// Keeps `connector.id` and `connector._id` consistent.
    pub fn normalize_connector(&mut self) {
        if let Some(connector) = self.connector.as_mut() {
            connector.normalize();
        }
    }

    /// True when the patch points the stream at a different connector.
    pub fn changes_connector(&self, current: &StreamConfig) -> bool {
        match self.connector.as_ref().and_then(ConnectorRef::resolve) {
            Some(id) => current.connector_id() != Some(id),
            None => false,
        }
    }
}

/// Patch for one configuration kind. Providers are immutable once loaded.
#[derive(Clone, Debug, PartialEq)]
pub enum ConfigPatch {
    Connector(ConnectorPatch),
    Stream(StreamPatch),
}

impl ConfigPatch {
    pub fn name(&self) -> Option<&str> {
        match self {
            ConfigPatch::Connector(p) => p.name.as_deref(),
            ConfigPatch::Stream(p) => p.name.as_deref(),
        }
    }

    /// Trims the patched name. Returns true if it changed.
    pub fn trim_name(&mut self) -> bool {
        let name = match self {
            ConfigPatch::Connector(p) => p.name.as_mut(),
            ConfigPatch::Stream(p) => p.name.as_mut(),
        };
        match name {
            Some(name) if name.trim().len() != name.len() => {
                *name = name.trim().to_string();
                true
            }
            _ => false,
        }
    }

    pub fn apply(&self, target: &mut Configuration) -> Result<(), PatchError> {
        match (self, target) {
            (ConfigPatch::Connector(patch), Configuration::Connector(config)) => {
                patch.apply(config);
                Ok(())
            }
            (ConfigPatch::Stream(patch), Configuration::Consumer(config))
            | (ConfigPatch::Stream(patch), Configuration::Producer(config)) => {
                patch.apply(config);
                Ok(())
            }
            (_, target) => Err(PatchError::KindMismatch {
                id: target.id().to_string(),
                class_name: target.kind().class_name(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PatchError {
    KindMismatch { id: String, class_name: &'static str },
}

impl fmt::Display for PatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatchError::KindMismatch { id, class_name } => {
                write!(f, "patch does not apply to {} '{}'", class_name, id)
            }
        }
    }
}

impl std::error::Error for PatchError {}

fn merge_settings(target: &mut Map<String, Value>, patch: &Map<String, Value>) {
    for (key, value) in patch {
        if value.is_null() {
            target.remove(key);
        } else {
            target.insert(key.clone(), value.clone());
        }
    }
}
