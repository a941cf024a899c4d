// Shared fixtures for orchestrator integration tests

#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use conduit::backpressure::LocalQueue;
use conduit::config::FanoutConfig;
use conduit::model::{ConnectorConfig, ConnectorRef, ProviderConfig, StreamConfig};
use conduit::storage::{ConfigRepository, SqliteConfigRepository};
use conduit::transport::MemoryTransport;
use conduit::{Configuration, DeepConfig};
use conduit_manager::{
    CommandFailure, ConfigurationRegistry, ConnectorOrchestrator, FanoutMonitor, InstanceEvents,
    LifecycleEventPublisher, Provider, ProviderCatalog, ProviderLoader, StreamInstance,
};
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const PROVIDER_ID: &str = "mock";

/// Records every call made on mock instances, by stream id.
#[derive(Default)]
pub struct CallLog {
    provides: Mutex<Vec<String>>,
    connects: Mutex<Vec<String>>,
    disposes: Mutex<Vec<String>>,
    updates: Mutex<Vec<DeepConfig>>,
    events: Mutex<HashMap<String, InstanceEvents>>,
}

impl CallLog {
    fn count(list: &Mutex<Vec<String>>, id: &str) -> usize {
        list.lock().unwrap().iter().filter(|s| *s == id).count()
    }

    pub fn provides(&self, id: &str) -> usize {
        Self::count(&self.provides, id)
    }

    pub fn connects(&self, id: &str) -> usize {
        Self::count(&self.connects, id)
    }

    pub fn disposes(&self, id: &str) -> usize {
        Self::count(&self.disposes, id)
    }

    pub fn updates(&self) -> Vec<DeepConfig> {
        self.updates.lock().unwrap().clone()
    }

    /// Event sender of the most recent instance for `id`.
    pub fn events(&self, id: &str) -> InstanceEvents {
        self.events.lock().unwrap().get(id).cloned().unwrap()
    }
}

#[derive(Default)]
pub struct MockProvider {
    pub log: Arc<CallLog>,
    /// Stream ids whose provide call fails
    pub refuse: HashSet<String>,
    /// Stream ids whose `echo` command fails
    pub failing_commands: HashSet<String>,
}

#[async_trait]
impl Provider for MockProvider {
    fn config(&self) -> ProviderConfig {
        ProviderConfig {
            id: PROVIDER_ID.to_string(),
            name: "Mock".to_string(),
            disabled: false,
            functions: vec![json!({"name": "echo"})],
            definition: Map::new(),
        }
    }

    async fn provide(
        &self,
        config: DeepConfig,
        events: InstanceEvents,
    ) -> Result<Arc<dyn StreamInstance>> {
        let id = config.id().to_string();
        self.log.provides.lock().unwrap().push(id.clone());
        if self.refuse.contains(&id) {
            anyhow::bail!("mock refuses '{}'", id);
        }
        self.log
            .events
            .lock()
            .unwrap()
            .insert(id.clone(), events.clone());
        Ok(Arc::new(MockInstance {
            fail_commands: self.failing_commands.contains(&id),
            id,
            log: Arc::clone(&self.log),
            events,
        }))
    }
}

pub struct MockInstance {
    id: String,
    log: Arc<CallLog>,
    events: InstanceEvents,
    fail_commands: bool,
}

#[async_trait]
impl StreamInstance for MockInstance {
    fn id(&self) -> &str {
        &self.id
    }

    async fn connect(&self) -> Result<()> {
        self.log.connects.lock().unwrap().push(self.id.clone());
        self.events.ready();
        Ok(())
    }

    async fn dispose(&self) -> Result<()> {
        self.log.disposes.lock().unwrap().push(self.id.clone());
        Ok(())
    }

    async fn update(&self, config: &DeepConfig) -> Result<()> {
        self.log.updates.lock().unwrap().push(config.clone());
        Ok(())
    }

    async fn command(&self, cmd_id: &str, value: Value) -> Result<Value, CommandFailure> {
        match cmd_id {
            "echo" if self.fail_commands => Err(CommandFailure::Failed(format!(
                "echo failed on {}",
                self.id
            ))),
            "echo" => Ok(json!({ "streamId": self.id, "value": value })),
            _ => Err(CommandFailure::Unsupported),
        }
    }
}

pub struct TestManager {
    pub orchestrator: Arc<ConnectorOrchestrator>,
    pub repository: Arc<SqliteConfigRepository>,
    pub transport: Arc<MemoryTransport>,
    pub queue: Arc<LocalQueue>,
    pub log: Arc<CallLog>,
}

pub async fn create_test_manager(configs: Vec<Configuration>) -> TestManager {
    create_test_manager_with(MockProvider::default(), FanoutConfig::default(), configs).await
}

/// Stores `configs`, wires the manager over in-process transport and queue,
/// and runs the initial full reload.
pub async fn create_test_manager_with(
    provider: MockProvider,
    fanout: FanoutConfig,
    configs: Vec<Configuration>,
) -> TestManager {
    let repository = Arc::new(SqliteConfigRepository::new(":memory:").unwrap());
    for config in &configs {
        repository.save_configuration(config).await.unwrap();
    }

    let log = Arc::clone(&provider.log);
    let provider: Arc<dyn Provider> = Arc::new(provider);
    let mut catalog = ProviderCatalog::new();
    catalog.register(PROVIDER_ID, move || Ok(Arc::clone(&provider)));

    let transport = Arc::new(MemoryTransport::new());
    let queue = Arc::new(LocalQueue::new(fanout.clone().into()));
    let registry = Arc::new(ConfigurationRegistry::new());
    let publisher = LifecycleEventPublisher::new(transport.clone(), "conduit");
    let (monitor, persist_rx) = FanoutMonitor::new(publisher.clone(), queue.clone(), fanout);
    let loader = Arc::new(ProviderLoader::new(
        catalog,
        Arc::clone(&registry),
        publisher.clone(),
    ));
    let orchestrator = Arc::new(ConnectorOrchestrator::new(
        registry,
        repository.clone(),
        loader,
        Arc::new(monitor),
        publisher,
        vec![PROVIDER_ID.to_string()],
    ));
    orchestrator.spawn_persist_worker(persist_rx);
    orchestrator.reload_all(None).await.unwrap();

    TestManager {
        orchestrator,
        repository,
        transport,
        queue,
        log,
    }
}

pub fn connector(id: &str) -> Configuration {
    connector_for(id, PROVIDER_ID)
}

pub fn connector_for(id: &str, provider_id: &str) -> Configuration {
    Configuration::Connector(ConnectorConfig {
        id: id.to_string(),
        name: format!("{} connector", id),
        scope_id: "t1".to_string(),
        provider_id: provider_id.to_string(),
        disabled: false,
        settings: Map::new(),
    })
}

fn stream(id: &str, connector_id: &str) -> StreamConfig {
    StreamConfig {
        id: id.to_string(),
        name: format!("{} stream", id),
        scope_id: "t1".to_string(),
        connector: ConnectorRef::new(connector_id),
        disabled: false,
        settings: Map::new(),
    }
}

pub fn consumer(id: &str, connector_id: &str) -> Configuration {
    Configuration::Consumer(stream(id, connector_id))
}

pub fn producer(id: &str, connector_id: &str) -> Configuration {
    Configuration::Producer(stream(id, connector_id))
}

pub fn disabled(mut config: Configuration) -> Configuration {
    match &mut config {
        Configuration::Connector(c) => c.disabled = true,
        Configuration::Consumer(s) | Configuration::Producer(s) => s.disabled = true,
        Configuration::Provider(p) => p.disabled = true,
    }
    config
}

/// Polls `check` until it holds or a second has passed.
pub async fn eventually<F: Fn() -> bool>(check: F) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}
