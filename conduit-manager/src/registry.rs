//! In-memory index of configurations.
//!
//! Holds one map per configuration kind. A configuration is only indexed
//! when its reference chain is complete at load time: connectors need an
//! indexed provider, streams an indexed connector.

use crate::error::ManagerError;
use anyhow::{Context, Result};
use conduit::model::{ConnectorConfig, ProviderConfig, StreamConfig};
use conduit::storage::ConfigRepository;
use conduit::{ConfigKind, Configuration, DeepConfig};
use std::collections::BTreeMap;
use std::sync::RwLock;
use tracing::{info, warn};

#[derive(Default)]
struct Indices {
    providers: BTreeMap<String, ProviderConfig>,
    connectors: BTreeMap<String, ConnectorConfig>,
    consumers: BTreeMap<String, StreamConfig>,
    producers: BTreeMap<String, StreamConfig>,
}

impl Indices {
    fn get(&self, id: &str) -> Option<Configuration> {
        if let Some(c) = self.providers.get(id) {
            return Some(Configuration::Provider(c.clone()));
        }
        if let Some(c) = self.connectors.get(id) {
            return Some(Configuration::Connector(c.clone()));
        }
        if let Some(c) = self.consumers.get(id) {
            return Some(Configuration::Consumer(c.clone()));
        }
        self.producers
            .get(id)
            .map(|c| Configuration::Producer(c.clone()))
    }

    fn remove(&mut self, id: &str) -> Option<Configuration> {
        if let Some(c) = self.providers.remove(id) {
            return Some(Configuration::Provider(c));
        }
        if let Some(c) = self.connectors.remove(id) {
            return Some(Configuration::Connector(c));
        }
        if let Some(c) = self.consumers.remove(id) {
            return Some(Configuration::Consumer(c));
        }
        self.producers.remove(id).map(Configuration::Producer)
    }

    fn insert(&mut self, config: Configuration) {
        match config {
            Configuration::Provider(c) => {
                self.providers.insert(c.id.clone(), c);
            }
            Configuration::Connector(c) => {
                self.connectors.insert(c.id.clone(), c);
            }
            Configuration::Consumer(c) => {
                self.consumers.insert(c.id.clone(), c);
            }
            Configuration::Producer(c) => {
                self.producers.insert(c.id.clone(), c);
            }
        }
    }

    fn streams(&self) -> impl Iterator<Item = Configuration> + '_ {
        self.consumers
            .values()
            .cloned()
            .map(Configuration::Consumer)
            .chain(self.producers.values().cloned().map(Configuration::Producer))
    }

    fn resolve(&self, config: &Configuration) -> Result<DeepConfig, ManagerError> {
        let (stream, connector_id) = match config {
            Configuration::Provider(c) => {
                return Err(ManagerError::Unresolvable {
                    config_id: c.id.clone(),
                })
            }
            Configuration::Connector(c) => (None, c.id.clone()),
            Configuration::Consumer(c) | Configuration::Producer(c) => {
                let connector_id =
                    c.connector_id()
                        .ok_or_else(|| ManagerError::MissingConnector {
                            config_id: c.id.clone(),
                            connector_id: None,
                        })?;
                (Some(c.clone()), connector_id.to_string())
            }
        };

        let connector = self.connectors.get(&connector_id).cloned().ok_or_else(|| {
            ManagerError::MissingConnector {
                config_id: config.id().to_string(),
                connector_id: Some(connector_id.clone()),
            }
        })?;
        let provider = self
            .providers
            .get(&connector.provider_id)
            .cloned()
            .ok_or_else(|| ManagerError::InvalidProvider {
                config_id: config.id().to_string(),
                provider_id: connector.provider_id.clone(),
            })?;

        Ok(DeepConfig {
            kind: config.kind(),
            stream,
            connector,
            provider,
        })
    }
}

/// Shared configuration index.
///
/// Every read returns owned snapshots; `load_all` swaps the whole index at
/// once so readers never observe a half-loaded state.
#[derive(Default)]
pub struct ConfigurationRegistry {
    indices: RwLock<Indices>,
}

impl ConfigurationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces connectors and streams with the repository contents.
    ///
    /// Providers registered by the loader are kept. Returns the accepted
    /// configurations.
    pub async fn load_all(&self, repository: &dyn ConfigRepository) -> Result<Vec<Configuration>> {
        let configs = repository
            .find_all_configurations()
            .await
            .context("Failed to load configurations")?;
        Ok(self.index_all(configs))
    }

    /// Indexes `configs` over the currently registered providers.
    ///
    /// Connectors whose provider is unknown and streams whose connector was
    /// not accepted are skipped with a warning.
    pub fn index_all(&self, configs: Vec<Configuration>) -> Vec<Configuration> {
        let mut next = Indices {
            providers: self.read().providers.clone(),
            ..Indices::default()
        };

        let mut connectors = Vec::new();
        let mut streams = Vec::new();
        for config in configs {
            match config {
                Configuration::Provider(_) => next.insert(config),
                Configuration::Connector(_) => connectors.push(config),
                _ => streams.push(config),
            }
        }

        for connector in connectors {
            match next.resolve(&connector) {
                Ok(_) => next.insert(connector),
                Err(e) => warn!(config_id = %connector.id(), error = %e, "Skipping connector"),
            }
        }
        for stream in streams {
            let known = stream
                .connector_id()
                .is_some_and(|id| next.connectors.contains_key(id));
            if known {
                next.insert(stream);
            } else {
                warn!(
                    config_id = %stream.id(),
                    connector_id = ?stream.connector_id(),
                    "Skipping stream with unknown connector"
                );
            }
        }

        let accepted: Vec<Configuration> = next
            .providers
            .values()
            .cloned()
            .map(Configuration::Provider)
            .chain(next.connectors.values().cloned().map(Configuration::Connector))
            .chain(next.streams())
            .collect();

        info!(
            providers = next.providers.len(),
            connectors = next.connectors.len(),
            consumers = next.consumers.len(),
            producers = next.producers.len(),
            "Configuration registry loaded"
        );

        *self.write() = next;
        accepted
    }

    /// Inserts or replaces a configuration.
    pub fn upsert(&self, config: Configuration) {
        let mut indices = self.write();
        indices.remove(config.id());
        indices.insert(config);
    }

    pub fn remove(&self, id: &str) -> Option<Configuration> {
        self.write().remove(id)
    }

    pub fn get(&self, id: &str) -> Option<Configuration> {
        self.read().get(id)
    }

    pub fn provider(&self, id: &str) -> Option<ProviderConfig> {
        self.read().providers.get(id).cloned()
    }

    pub fn connector(&self, id: &str) -> Option<ConnectorConfig> {
        self.read().connectors.get(id).cloned()
    }

    /// Consumer or producer by id.
    pub fn stream(&self, id: &str) -> Option<Configuration> {
        self.read().get(id).filter(|c| c.kind().is_stream())
    }

    pub fn providers(&self) -> Vec<ProviderConfig> {
        self.read().providers.values().cloned().collect()
    }

    /// Stream configurations of one kind, ordered by id.
    pub fn streams_of_kind(&self, kind: ConfigKind) -> Vec<Configuration> {
        let indices = self.read();
        match kind {
            ConfigKind::Consumer => indices
                .consumers
                .values()
                .cloned()
                .map(Configuration::Consumer)
                .collect(),
            ConfigKind::Producer => indices
                .producers
                .values()
                .cloned()
                .map(Configuration::Producer)
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Every stream referencing `connector_id`, disabled ones included.
    pub fn streams_for_connector(&self, connector_id: &str) -> Vec<Configuration> {
        self.read()
            .streams()
            .filter(|c| c.connector_id() == Some(connector_id))
            .collect()
    }

    /// Resolves a connector or stream to its deep form.
    pub fn resolve_deep(&self, config: &Configuration) -> Result<DeepConfig, ManagerError> {
        self.read().resolve(config)
    }

    /// Deep configs of the streams using `connector_id`.
    ///
    /// Streams with a broken chain are left out; disabled ones are left out
    /// unless `include_disabled`.
    pub fn active_streams_for_connector(
        &self,
        connector_id: &str,
        include_disabled: bool,
    ) -> Vec<DeepConfig> {
        let indices = self.read();
        indices
            .streams()
            .filter(|c| c.connector_id() == Some(connector_id))
            .filter(|c| include_disabled || !c.disabled())
            .filter_map(|c| indices.resolve(&c).ok())
            .collect()
    }

    /// Stable partition placing every connector before every stream.
    /// Providers go first.
    pub fn order_for_reload(&self, configs: Vec<Configuration>) -> Vec<Configuration> {
        let mut ordered = configs;
        ordered.sort_by_key(|c| match c.kind() {
            ConfigKind::Provider => 0,
            ConfigKind::Connector => 1,
            ConfigKind::Consumer | ConfigKind::Producer => 2,
        });
        ordered
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Indices> {
        self.indices.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Indices> {
        self.indices.write().unwrap_or_else(|e| e.into_inner())
    }
}
