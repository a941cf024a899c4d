//! Connector orchestrator - Coordinates the stream instance lifecycle.
//!
//! Every mutating path for an id runs under that id's lock, so at most one
//! instance is ever live per stream id. When a connector and its streams are
//! both involved the connector lock is taken first.

use crate::command::{CommandError, CommandRequest, Reply, SaveRequest};
use crate::error::{ManagerError, NoticeCode};
use crate::loader::ProviderLoader;
use crate::monitor::{FanoutMonitor, PersistRequest};
use crate::provider::{CommandFailure, InstanceEvents, StreamInstance};
use crate::publisher::{EntityInfo, LifecycleEventPublisher, Notice};
use crate::registry::ConfigurationRegistry;
use anyhow::{Context, Result};
use conduit::model::{ConfigPatch, ConnectorPatch, StreamPatch};
use conduit::storage::ConfigRepository;
use conduit::{ConfigKind, Configuration, DeepConfig};
use dashmap::DashMap;
use futures::future::join_all;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Fields a `$set` patch may never touch.
const RESERVED_FIELDS: &[&str] = &["id", "_id", "className"];

pub struct ConnectorOrchestrator {
    registry: Arc<ConfigurationRegistry>,
    repository: Arc<dyn ConfigRepository>,
    loader: Arc<ProviderLoader>,
    monitor: Arc<FanoutMonitor>,
    publisher: LifecycleEventPublisher,
    /// Provider ids defined on the first full reload
    provider_ids: Vec<String>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    providers_defined: AtomicBool,
}

impl ConnectorOrchestrator {
    pub fn new(
        registry: Arc<ConfigurationRegistry>,
        repository: Arc<dyn ConfigRepository>,
        loader: Arc<ProviderLoader>,
        monitor: Arc<FanoutMonitor>,
        publisher: LifecycleEventPublisher,
        provider_ids: Vec<String>,
    ) -> Self {
        Self {
            registry,
            repository,
            loader,
            monitor,
            publisher,
            provider_ids,
            locks: DashMap::new(),
            providers_defined: AtomicBool::new(false),
        }
    }

    pub fn registry(&self) -> &Arc<ConfigurationRegistry> {
        &self.registry
    }

    pub fn monitor(&self) -> &Arc<FanoutMonitor> {
        &self.monitor
    }

    /// Live instance for a stream id.
    pub fn instance(&self, id: &str) -> Option<Arc<dyn StreamInstance>> {
        self.monitor.get(id)
    }

    /// Number of ids with a lock entry.
    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }

    async fn lock(&self, id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Reloads everything, or only the listed ids.
    ///
    /// A full reload disposes every instance, defines providers (first call
    /// only), re-indexes storage, publishes the function catalog and starts
    /// every enabled stream. Returns the number of instances started.
    pub async fn reload_all(&self, only_ids: Option<&[String]>) -> Result<usize> {
        if let Some(ids) = only_ids {
            return self.reload_selected(ids).await;
        }

        info!("Full reload");
        self.dispose_all().await;

        if !self.providers_defined.swap(true, Ordering::SeqCst) {
            self.loader.define_providers(&self.provider_ids).await;
        }

        self.registry
            .load_all(self.repository.as_ref())
            .await
            .context("Failed to index configurations")?;
        self.publisher
            .catalog(&self.loader.function_catalog())
            .await;

        let started = self.load_streams().await;
        info!(started, "Full reload complete");
        Ok(started)
    }

    async fn reload_selected(&self, ids: &[String]) -> Result<usize> {
        let accepted = self.registry.load_all(self.repository.as_ref()).await?;
        let selected: Vec<Configuration> = accepted
            .into_iter()
            .filter(|c| ids.iter().any(|id| id == c.id()))
            .collect();

        let connectors: Vec<&str> = selected
            .iter()
            .filter(|c| c.kind() == ConfigKind::Connector)
            .map(Configuration::id)
            .collect();
        // Streams of a selected connector are reloaded with it
        let mut ordered: Vec<String> = self
            .registry
            .order_for_reload(selected.clone())
            .iter()
            .filter(|c| !c.connector_id().is_some_and(|id| connectors.contains(&id)))
            .map(|c| c.id().to_string())
            .collect();
        // Ids that did not survive indexing still get their instances torn down
        for id in ids {
            if !selected.iter().any(|c| c.id() == id) && !ordered.contains(id) {
                ordered.push(id.clone());
            }
        }

        let mut started = 0;
        for id in &ordered {
            started += self.reload_stream(id).await?;
        }
        Ok(started)
    }

    /// Starts every enabled stream in the registry, consumers first.
    ///
    /// Failures are reported per stream and never stop the batch.
    pub async fn load_streams(&self) -> usize {
        let mut started = 0;
        for kind in [ConfigKind::Consumer, ConfigKind::Producer] {
            for config in self.registry.streams_of_kind(kind) {
                if config.disabled() {
                    continue;
                }
                let _guard = self.lock(config.id()).await;
                match self.load_stream_locked(&config).await {
                    Ok(Some(_)) => started += 1,
                    Ok(None) => {}
                    Err(e) => self.report(&config, &e).await,
                }
            }
        }
        started
    }

    /// Creates, attaches and connects the instance for a stream.
    ///
    /// Returns `Ok(None)` when the chain is inactive or the provider could
    /// not provide; the latter is reported as `PROVIDE_NOT_POSSIBLE`.
    pub async fn load_stream(
        &self,
        config: &Configuration,
    ) -> Result<Option<Arc<dyn StreamInstance>>, ManagerError> {
        let _guard = self.lock(config.id()).await;
        self.load_stream_locked(config).await
    }

    async fn load_stream_locked(
        &self,
        config: &Configuration,
    ) -> Result<Option<Arc<dyn StreamInstance>>, ManagerError> {
        let deep = self.registry.resolve_deep(config)?;
        if deep.stream.is_none() {
            return Err(ManagerError::Unresolvable {
                config_id: config.id().to_string(),
            });
        }
        if deep.is_inactive() {
            debug!(stream_id = %deep.id(), "Connector or provider disabled, not loading");
            return Ok(None);
        }
        let provider =
            self.loader
                .provider_for(&deep)
                .ok_or_else(|| ManagerError::InvalidProvider {
                    config_id: deep.id().to_string(),
                    provider_id: deep.provider.id.clone(),
                })?;

        self.dispose_instance(deep.id()).await;

        let (events, rx) = InstanceEvents::channel();
        let instance = match provider.provide(deep.clone(), events).await {
            Ok(instance) => instance,
            Err(e) => {
                self.report_provide_failure(&deep, &e.to_string()).await;
                return Ok(None);
            }
        };

        self.monitor
            .attach(Arc::clone(&instance), deep.clone(), rx)
            .await;
        if let Err(e) = instance.connect().await {
            self.report_provide_failure(&deep, &e.to_string()).await;
            self.dispose_instance(deep.id()).await;
            return Ok(None);
        }

        info!(
            stream_id = %deep.id(),
            class_name = %deep.kind,
            provider_id = %deep.provider.id,
            "Stream loaded"
        );
        Ok(Some(instance))
    }

    /// Reloads a connector's dependents or a single stream from storage.
    ///
    /// Returns the number of instances started. Unknown ids only tear down
    /// whatever might still be running under them.
    pub async fn reload_stream(&self, id: &str) -> Result<usize> {
        let stored = self.repository.find_configuration_by_id(id).await?;
        match stored {
            Some(Configuration::Connector(connector)) => {
                let _guard = self.lock(id).await;
                self.registry.upsert(Configuration::Connector(connector));
                self.reload_dependents_locked(id).await
            }
            Some(Configuration::Provider(_)) => Ok(0),
            Some(_) | None => {
                let _guard = self.lock(id).await;
                self.reload_stream_locked(id).await
            }
        }
    }

    async fn reload_stream_locked(&self, id: &str) -> Result<usize> {
        self.dispose_instance(id).await;

        let Some(config) = self.repository.find_configuration_by_id(id).await? else {
            if let Some(stale) = self.registry.get(id) {
                if stale.kind().is_stream() {
                    self.registry.remove(id);
                }
            }
            return Ok(0);
        };
        if !config.kind().is_stream() {
            return Ok(0);
        }

        self.registry.upsert(config.clone());
        if config.disabled() {
            debug!(stream_id = %id, "Stream disabled, not loading");
            return Ok(0);
        }

        match self.load_stream_locked(&config).await {
            Ok(Some(_)) => Ok(1),
            Ok(None) => Ok(0),
            Err(e) => {
                self.report(&config, &e).await;
                Ok(0)
            }
        }
    }

    /// Caller holds the connector lock.
    async fn reload_dependents_locked(&self, connector_id: &str) -> Result<usize> {
        let mut started = 0;
        for stream in self.registry.streams_for_connector(connector_id) {
            let _guard = self.lock(stream.id()).await;
            started += self.reload_stream_locked(stream.id()).await?;
        }
        Ok(started)
    }

    /// Applies a patch to a stream without reconnecting it.
    pub async fn update_stream(&self, id: &str, patch: StreamPatch) -> Result<Configuration> {
        let _guard = self.lock(id).await;
        self.update_stream_locked(id, patch).await
    }

    async fn update_stream_locked(&self, id: &str, patch: StreamPatch) -> Result<Configuration> {
        let updated = self
            .repository
            .update_configuration(id, &ConfigPatch::Stream(patch))
            .await?;
        self.registry.upsert(updated.clone());

        if let Some(instance) = self.monitor.get(id) {
            match self.registry.resolve_deep(&updated) {
                Ok(deep) => self.apply_update(instance.as_ref(), deep).await,
                Err(e) => warn!(stream_id = %id, error = %e, "Updated stream no longer resolves"),
            }
        }
        Ok(updated)
    }

    /// Applies a patch to a connector and reloads its dependents.
    pub async fn update_connector(
        &self,
        id: &str,
        patch: ConnectorPatch,
    ) -> Result<Configuration> {
        let _guard = self.lock(id).await;
        self.update_connector_locked(id, patch).await
    }

    async fn update_connector_locked(
        &self,
        id: &str,
        patch: ConnectorPatch,
    ) -> Result<Configuration> {
        let touches_disabled = patch.touches_disabled();
        let updated = self
            .repository
            .update_configuration(id, &ConfigPatch::Connector(patch))
            .await?;
        self.registry.upsert(updated.clone());

        for stream in self.registry.streams_for_connector(id) {
            let Some(instance) = self.monitor.get(stream.id()) else {
                continue;
            };
            if let Ok(deep) = self.registry.resolve_deep(&stream) {
                self.apply_update(instance.as_ref(), deep).await;
            }
        }

        if touches_disabled {
            self.publisher.config_update(&updated).await;
        }
        self.reload_dependents_locked(id).await?;
        Ok(updated)
    }

    async fn apply_update(&self, instance: &dyn StreamInstance, deep: DeepConfig) {
        if let Err(e) = instance.update(&deep).await {
            warn!(stream_id = %deep.id(), error = %e, "Instance update failed");
        }
        self.monitor.refresh_config(deep);
    }

    /// Inserts a new configuration or applies a `$set` patch.
    ///
    /// Never fails: errors come back as `{error}` and are also published as
    /// a `SAVE_FAILED` popup.
    pub async fn save_configuration(&self, request: SaveRequest) -> Reply {
        let (id, outcome) = match request {
            SaveRequest::Insert(config) => {
                let id = config.id().to_string();
                (id, self.insert_configuration(config).await)
            }
            SaveRequest::Patch { id, set } => {
                let outcome = self.patch_configuration(&id, set).await;
                (id, outcome)
            }
        };

        match outcome {
            Ok(config) => match serde_json::to_value(&config) {
                Ok(value) => Reply::ok(value),
                Err(e) => Reply::err(e),
            },
            Err(e) => {
                let message = format!("{:#}", e);
                warn!(config_id = %id, error = %message, "Save failed");
                let entity = match self.registry.get(&id) {
                    Some(config) => EntityInfo::from_config(&config),
                    None => EntityInfo::unknown(&id),
                };
                self.publisher
                    .notification(&entity, &Notice::popup(NoticeCode::SaveFailed, &message))
                    .await;
                Reply::err(message)
            }
        }
    }

    async fn insert_configuration(&self, mut config: Configuration) -> Result<Configuration> {
        if config.id().is_empty() {
            config.set_id(uuid::Uuid::new_v4().to_string());
        }
        if let Some(stream) = config.as_stream_mut() {
            stream.connector.normalize();
        }
        if config.trim_name() {
            self.notify_name_trimmed(&EntityInfo::from_config(&config), config.name())
                .await;
        }
        self.loader
            .validate(&config)
            .with_context(|| format!("Invalid {}", config.kind()))?;

        let id = config.id().to_string();
        {
            let _guard = self.lock(&id).await;
            self.repository
                .save_configuration(&config)
                .await
                .map_err(|e| ManagerError::ConfigSave(format!("{:#}", e)))?;
            self.registry.upsert(config.clone());
        }
        self.publisher.config_update(&config).await;
        info!(config_id = %id, class_name = %config.kind(), "Configuration created");

        self.reload_stream(&id).await?;
        Ok(config)
    }

    async fn patch_configuration(
        &self,
        id: &str,
        mut set: Map<String, Value>,
    ) -> Result<Configuration> {
        for field in RESERVED_FIELDS {
            set.remove(*field);
        }

        let _guard = self.lock(id).await;
        let existing = match self.registry.get(id) {
            Some(config) => config,
            None => self
                .repository
                .find_configuration_by_id(id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("Configuration '{}' not found", id))?,
        };

        let mut patch = match &existing {
            Configuration::Connector(_) => {
                ConfigPatch::Connector(serde_json::from_value(Value::Object(set))?)
            }
            Configuration::Consumer(_) | Configuration::Producer(_) => {
                nest_connector_paths(&mut set);
                ConfigPatch::Stream(serde_json::from_value(Value::Object(set))?)
            }
            Configuration::Provider(_) => {
                anyhow::bail!("Provider configuration '{}' is read-only", id)
            }
        };
        if patch.trim_name() {
            let name = patch.name().unwrap_or_default().to_string();
            self.notify_name_trimmed(&EntityInfo::from_config(&existing), &name)
                .await;
        }

        match patch {
            ConfigPatch::Connector(patch) => {
                let announce = !patch.touches_disabled();
                let updated = self.update_connector_locked(id, patch).await?;
                if announce {
                    self.publisher.config_update(&updated).await;
                }
                Ok(updated)
            }
            ConfigPatch::Stream(mut patch) => {
                patch.normalize_connector();
                let reload = patch.disabled.is_some()
                    || existing
                        .as_stream()
                        .is_some_and(|current| patch.changes_connector(current));
                let updated = self.update_stream_locked(id, patch).await?;
                self.publisher.config_update(&updated).await;
                if reload {
                    self.reload_stream_locked(id).await?;
                }
                Ok(updated)
            }
        }
    }

    async fn notify_name_trimmed(&self, entity: &EntityInfo, name: &str) {
        let mut notice = Notice::popup(
            NoticeCode::NameTrimmed,
            format!("Name trimmed to '{}'", name),
        );
        notice.details.insert("name".to_string(), json!(name));
        self.publisher.notification(entity, &notice).await;
    }

    /// Deletes a configuration. A connector's running dependents are disposed
    /// but their configurations are kept. Returns whether anything was live.
    pub async fn delete_configuration(&self, id: &str) -> Result<bool> {
        let _guard = self.lock(id).await;
        let config = match self.registry.get(id) {
            Some(config) => Some(config),
            None => self.repository.find_configuration_by_id(id).await?,
        };

        let mut had_instance = false;
        if let Some(Configuration::Connector(_)) = &config {
            for stream in self.registry.streams_for_connector(id) {
                let _stream_guard = self.lock(stream.id()).await;
                had_instance |= self.dispose_instance(stream.id()).await;
            }
        }
        had_instance |= self.dispose_instance(id).await;
        self.monitor.clear_status(id);

        self.registry.remove(id);
        let deleted = self.repository.delete_configuration(id).await?;
        if let Some(config) = &config {
            self.publisher.config_delete(config, had_instance).await;
        }
        info!(config_id = %id, deleted, had_instance, "Configuration deleted");

        // Only our guard and the map hold the lock when nobody is waiting on it
        self.locks
            .remove_if(id, |_, lock| Arc::strong_count(lock) <= 2);
        Ok(had_instance)
    }

    /// Runs a custom command on a stream, or on every enabled stream of a
    /// connector. Failures are returned, never raised.
    pub async fn execute_command(&self, command: CommandRequest) -> Reply {
        if command.cmd_type != "custom" {
            return Reply::err(CommandError::CmdFuncInvalidType);
        }

        if ConfigKind::from_class_name(&command.class_name) != Some(ConfigKind::Connector) {
            return self
                .invoke(&command.stream_id, &command.cmd_id, command.value)
                .await
                .into();
        }

        let streams = self
            .registry
            .active_streams_for_connector(&command.stream_id, false);
        let cmd_id = command.cmd_id.as_str();
        let calls = streams.iter().map(|deep| {
            let value = command.value.clone();
            async move {
                let result = self.invoke(deep.id(), cmd_id, value).await;
                (deep, result)
            }
        });

        let mut results = Vec::new();
        for (deep, result) in join_all(calls).await {
            match result {
                Ok(value) => results.push(json!({ "streamId": deep.id(), "result": value })),
                Err(e) => {
                    warn!(stream_id = %deep.id(), cmd_id = %cmd_id, error = %e, "Command failed");
                    self.publisher
                        .error(
                            &EntityInfo::from_deep(deep),
                            NoticeCode::CommandFailed,
                            &e.to_string(),
                        )
                        .await;
                    results.push(json!({ "streamId": deep.id(), "error": e.to_string() }));
                }
            }
        }
        Reply::ok(Value::Array(results))
    }

    async fn invoke(&self, stream_id: &str, cmd_id: &str, value: Value) -> Result<Value, CommandError> {
        let instance = self.monitor.get(stream_id).ok_or(CommandError::NoStream)?;
        instance
            .command(cmd_id, value)
            .await
            .map_err(|failure| match failure {
                CommandFailure::Unsupported => CommandError::CmdFuncInvalid,
                CommandFailure::Failed(message) => CommandError::Failed(message),
            })
    }

    /// Detaches and disposes the instance for `id`. Returns false if none was live.
    async fn dispose_instance(&self, id: &str) -> bool {
        let Some(instance) = self.monitor.detach(id).await else {
            return false;
        };
        if let Err(e) = instance.dispose().await {
            warn!(stream_id = %id, error = %e, "Dispose failed");
        }
        true
    }

    /// Disposes every live instance.
    pub async fn dispose_all(&self) -> usize {
        let mut disposed = 0;
        for id in self.monitor.ids() {
            let _guard = self.lock(&id).await;
            if self.dispose_instance(&id).await {
                disposed += 1;
            }
        }
        if disposed > 0 {
            info!(disposed, "Instances disposed");
        }
        disposed
    }

    /// Applies instance persistence requests as `$set` patches.
    pub fn spawn_persist_worker(
        self: &Arc<Self>,
        mut requests: mpsc::UnboundedReceiver<PersistRequest>,
    ) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(request) = requests.recv().await {
                let id = request.config_id.clone();
                let reply = orchestrator
                    .save_configuration(SaveRequest::Patch {
                        id: request.config_id,
                        set: request.set,
                    })
                    .await;
                if let Some(error) = reply.error {
                    warn!(config_id = %id, error = %error, "Persist failed");
                }
            }
        })
    }

    async fn report(&self, config: &Configuration, error: &ManagerError) {
        warn!(config_id = %config.id(), error = %error, "Stream not loaded");
        self.publisher
            .error(&EntityInfo::from_config(config), error.code(), &error.to_string())
            .await;
    }

    async fn report_provide_failure(&self, deep: &DeepConfig, cause: &str) {
        let error = ManagerError::Provide {
            stream_id: deep.id().to_string(),
            cause: cause.to_string(),
        };
        warn!(stream_id = %deep.id(), error = %error, "Provide not possible");
        self.publisher
            .notification(
                &EntityInfo::from_deep(deep),
                &Notice::new(error.code(), error.to_string()),
            )
            .await;
    }
}

/// Moves `connector.id` / `connector._id` dotted keys into a nested
/// `connector` object so they patch the reference instead of settings.
fn nest_connector_paths(set: &mut Map<String, Value>) {
    let id = set.remove("connector.id");
    let object_id = set.remove("connector._id");
    if id.is_none() && object_id.is_none() {
        return;
    }

    let mut connector = match set.remove("connector") {
        Some(Value::Object(existing)) => existing,
        _ => Map::new(),
    };
    if let Some(id) = id {
        connector.insert("id".to_string(), id);
    }
    if let Some(object_id) = object_id {
        connector.insert("_id".to_string(), object_id);
    }
    set.insert("connector".to_string(), Value::Object(connector));
}
