//! Provider loading.
//!
//! Providers are compiled in and looked up by id in a [`ProviderCatalog`].
//! Defining a provider instantiates it, registers its configuration with
//! the registry and forwards its provider-level notices to the publisher.

use crate::connectors::loopback::LoopbackProvider;
use crate::error::{ManagerError, NoticeCode};
use crate::provider::{Provider, ProviderNotice, ProviderNotices};
use crate::publisher::{EntityInfo, LifecycleEventPublisher, Notice};
use crate::registry::ConfigurationRegistry;
use anyhow::Result;
use conduit::{Configuration, DeepConfig};
use dashmap::DashMap;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

pub type ProviderFactory = Arc<dyn Fn() -> Result<Arc<dyn Provider>> + Send + Sync>;

/// Known provider factories by id.
#[derive(Clone, Default)]
pub struct ProviderCatalog {
    factories: BTreeMap<String, ProviderFactory>,
}

impl ProviderCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog with every provider shipped in this crate.
    pub fn builtin() -> Self {
        let mut catalog = Self::new();
        catalog.register("loopback", || {
            Ok(Arc::new(LoopbackProvider::new()) as Arc<dyn Provider>)
        });
        catalog
    }

    pub fn register<F>(&mut self, id: impl Into<String>, factory: F)
    where
        F: Fn() -> Result<Arc<dyn Provider>> + Send + Sync + 'static,
    {
        self.factories.insert(id.into(), Arc::new(factory));
    }

    pub fn contains(&self, id: &str) -> bool {
        self.factories.contains_key(id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    fn get(&self, id: &str) -> Option<ProviderFactory> {
        self.factories.get(id).cloned()
    }
}

pub struct ProviderLoader {
    catalog: ProviderCatalog,
    registry: Arc<ConfigurationRegistry>,
    publisher: LifecycleEventPublisher,
    providers: DashMap<String, Arc<dyn Provider>>,
}

impl ProviderLoader {
    pub fn new(
        catalog: ProviderCatalog,
        registry: Arc<ConfigurationRegistry>,
        publisher: LifecycleEventPublisher,
    ) -> Self {
        Self {
            catalog,
            registry,
            publisher,
            providers: DashMap::new(),
        }
    }

    /// Defines every listed provider. A failing provider is reported and
    /// skipped; the rest still load. Returns how many were defined.
    pub async fn define_providers(&self, ids: &[String]) -> usize {
        let mut defined = 0;
        for id in ids {
            match self.define_provider(id) {
                Ok(()) => defined += 1,
                Err(e) => {
                    warn!(provider_id = %id, error = %e, "Provider not defined");
                    self.publisher
                        .error(&EntityInfo::unknown(id), e.code(), &e.to_string())
                        .await;
                }
            }
        }
        info!(defined, requested = ids.len(), "Providers defined");
        defined
    }

    fn define_provider(&self, id: &str) -> Result<(), ManagerError> {
        let factory = self.catalog.get(id).ok_or_else(|| ManagerError::ProviderLoad {
            provider_id: id.to_string(),
            cause: "unknown provider".to_string(),
        })?;
        let provider = factory().map_err(|e| ManagerError::ProviderLoad {
            provider_id: id.to_string(),
            cause: e.to_string(),
        })?;

        let mut config = provider.config();
        if config.id != id {
            warn!(provider_id = %id, declared = %config.id, "Provider declares a different id");
            config.id = id.to_string();
        }

        let (notices, rx) = ProviderNotices::channel();
        provider.bind(notices);
        self.forward_notices(EntityInfo::provider(&config), rx);

        self.registry.upsert(Configuration::Provider(config));
        self.providers.insert(id.to_string(), provider);
        info!(provider_id = %id, "Provider defined");
        Ok(())
    }

    fn forward_notices(
        &self,
        entity: EntityInfo,
        mut rx: tokio::sync::mpsc::UnboundedReceiver<ProviderNotice>,
    ) {
        let publisher = self.publisher.clone();
        tokio::spawn(async move {
            while let Some(notice) = rx.recv().await {
                match notice {
                    ProviderNotice::Error(payload) => {
                        publisher
                            .error(&entity, NoticeCode::ProviderError, &cause_of(&payload))
                            .await
                    }
                    ProviderNotice::Notification(payload) => {
                        let mut notice =
                            Notice::new(NoticeCode::ProviderNotification, cause_of(&payload));
                        if let Value::Object(details) = payload {
                            notice.details = details;
                        }
                        publisher.notification(&entity, &notice).await
                    }
                }
            }
        });
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(id).map(|p| Arc::clone(p.value()))
    }

    pub fn is_defined(&self, id: &str) -> bool {
        self.providers.contains_key(id)
    }

    /// Function definitions of every defined provider, tagged with `providerId`.
    pub fn function_catalog(&self) -> Vec<Value> {
        let mut providers: Vec<_> = self
            .registry
            .providers()
            .into_iter()
            .filter(|p| self.is_defined(&p.id))
            .collect();
        providers.sort_by(|a, b| a.id.cmp(&b.id));

        providers
            .into_iter()
            .flat_map(|p| {
                let provider_id = p.id.clone();
                p.functions.into_iter().map(move |mut function| {
                    if let Value::Object(map) = &mut function {
                        map.insert("providerId".to_string(), json!(provider_id));
                    }
                    function
                })
            })
            .collect()
    }

    /// Runs the owning provider's validation for a connector or stream.
    ///
    /// Configurations whose provider cannot be determined pass; they will not
    /// be activated anyway.
    pub fn validate(&self, config: &Configuration) -> Result<()> {
        let provider_id = match config {
            Configuration::Provider(_) => return Ok(()),
            Configuration::Connector(c) => Some(c.provider_id.clone()),
            Configuration::Consumer(s) | Configuration::Producer(s) => s
                .connector_id()
                .and_then(|id| self.registry.connector(id))
                .map(|c| c.provider_id),
        };
        let Some(provider) = provider_id.and_then(|id| self.get(&id)) else {
            return Ok(());
        };

        match config {
            Configuration::Connector(c) => provider.validate_connector(c),
            Configuration::Consumer(s) => provider.validate_consumer(s),
            Configuration::Producer(s) => provider.validate_producer(s),
            Configuration::Provider(_) => Ok(()),
        }
    }

    pub fn provider_for(&self, config: &DeepConfig) -> Option<Arc<dyn Provider>> {
        self.get(&config.provider.id)
    }
}

fn cause_of(payload: &Value) -> String {
    match payload {
        Value::String(s) => s.clone(),
        Value::Object(map) => map
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| payload.to_string()),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit::transport::MemoryTransport;

    fn loader() -> (ProviderLoader, Arc<ConfigurationRegistry>, Arc<MemoryTransport>) {
        let transport = Arc::new(MemoryTransport::new());
        let registry = Arc::new(ConfigurationRegistry::new());
        let publisher = LifecycleEventPublisher::new(transport.clone(), "conduit");
        let loader = ProviderLoader::new(ProviderCatalog::builtin(), Arc::clone(&registry), publisher);
        (loader, registry, transport)
    }

    #[tokio::test]
    async fn test_unknown_provider_is_reported_and_skipped() {
        let (loader, registry, transport) = loader();

        let defined = loader
            .define_providers(&["loopback".to_string(), "kafka".to_string()])
            .await;

        assert_eq!(defined, 1);
        assert!(loader.get("loopback").is_some());
        assert!(loader.get("kafka").is_none());
        assert!(registry.provider("loopback").is_some());

        let errors = transport.published_matching("conduit/#");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].payload["event"]["data"]["kind"], "DEFINE_PROVIDER");
    }

    #[tokio::test]
    async fn test_function_catalog_tags_provider() {
        let (loader, _, _) = loader();
        loader.define_providers(&["loopback".to_string()]).await;

        let functions = loader.function_catalog();
        assert!(!functions.is_empty());
        assert!(functions.iter().all(|f| f["providerId"] == "loopback"));
        assert!(functions.iter().any(|f| f["name"] == "ping"));
    }

    #[test]
    fn test_cause_of() {
        assert_eq!(cause_of(&json!("boom")), "boom");
        assert_eq!(cause_of(&json!({"message": "down"})), "down");
        assert_eq!(cause_of(&json!(3)), "3");
    }
}
