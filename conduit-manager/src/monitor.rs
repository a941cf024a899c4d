//! Live instance tracking and fan-out.
//!
//! The monitor owns the table of running stream instances. For each one it
//! runs a listener task that turns [`InstanceEvent`]s into published state,
//! consumed messages into credit-limited inbox deliveries, and persistence
//! requests into [`PersistRequest`]s for the orchestrator.
//!
//! It also serves the control plane: `{prefix}/+/action/+` messages are
//! routed to the addressed instance (`produce`, `respond`, `request`) or to
//! the queue (`ack`).

use crate::provider::{InstanceEvent, StreamInstance};
use crate::publisher::{EntityInfo, LifecycleEventPublisher};
use anyhow::Result;
use conduit::backpressure::{inbox_key, subscribers_key, BackpressureQueue};
use conduit::config::FanoutConfig;
use conduit::event::encode_message;
use conduit::transport::{topic, topic_suffix, TransportMessage};
use conduit::{ConnectionState, DeepConfig, StreamEventType};
use dashmap::DashMap;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Last lifecycle signal seen for an id.
#[derive(Clone, Debug, PartialEq)]
pub struct StatusEntry {
    pub signal: StreamEventType,
    pub payload: Value,
}

/// Connection state implied by the last signal. Unknown ids are disconnected.
pub fn derive_state(signal: Option<StreamEventType>) -> ConnectionState {
    match signal {
        Some(
            StreamEventType::Ready
            | StreamEventType::Connect
            | StreamEventType::Warning
            | StreamEventType::Feedback,
        ) => ConnectionState::Connected,
        _ => ConnectionState::Disconnected,
    }
}

/// Latest signal per stream and connector id.
#[derive(Default)]
pub struct StatusMap {
    entries: Mutex<HashMap<String, StatusEntry>>,
}

impl StatusMap {
    pub fn get(&self, id: &str) -> Option<StatusEntry> {
        self.lock().get(id).cloned()
    }

    pub fn set(&self, id: &str, entry: StatusEntry) {
        self.lock().insert(id.to_string(), entry);
    }

    pub fn remove(&self, id: &str) -> Option<StatusEntry> {
        self.lock().remove(id)
    }

    pub fn derive(&self, id: &str) -> ConnectionState {
        derive_state(self.get(id).map(|e| e.signal))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, StatusEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Instance asks to merge `set` into its stored configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct PersistRequest {
    pub config_id: String,
    pub set: Map<String, Value>,
}

/// Control action queued for one instance.
enum Action {
    Produce(Value),
    Respond(Value),
}

struct Tracked {
    instance: Arc<dyn StreamInstance>,
    config: DeepConfig,
    generation: u64,
    listener: JoinHandle<()>,
    /// Runs `actions` in arrival order, one at a time
    worker: JoinHandle<()>,
    actions: mpsc::UnboundedSender<Action>,
}

pub struct FanoutMonitor {
    instances: DashMap<String, Tracked>,
    generations: AtomicU64,
    status: StatusMap,
    publisher: LifecycleEventPublisher,
    queue: Arc<dyn BackpressureQueue>,
    fanout: FanoutConfig,
    persist_tx: mpsc::UnboundedSender<PersistRequest>,
}

impl FanoutMonitor {
    pub fn new(
        publisher: LifecycleEventPublisher,
        queue: Arc<dyn BackpressureQueue>,
        fanout: FanoutConfig,
    ) -> (Self, mpsc::UnboundedReceiver<PersistRequest>) {
        let (persist_tx, persist_rx) = mpsc::unbounded_channel();
        let monitor = Self {
            instances: DashMap::new(),
            generations: AtomicU64::new(0),
            status: StatusMap::default(),
            publisher,
            queue,
            fanout,
            persist_tx,
        };
        (monitor, persist_rx)
    }

    /// Starts tracking an instance and listening to its events.
    ///
    /// A previous instance under the same id is detached and disposed first.
    pub async fn attach(
        self: &Arc<Self>,
        instance: Arc<dyn StreamInstance>,
        config: DeepConfig,
        mut events: mpsc::UnboundedReceiver<InstanceEvent>,
    ) {
        let id = config.id().to_string();
        if let Some(previous) = self.detach(&id).await {
            warn!(stream_id = %id, "Replacing a live instance");
            if let Err(e) = previous.dispose().await {
                warn!(stream_id = %id, error = %e, "Dispose failed");
            }
        }

        let generation = self.generations.fetch_add(1, Ordering::Relaxed);

        // Events wait until the instance is in the table
        let (start_tx, start_rx) = oneshot::channel::<()>();
        let monitor = Arc::clone(self);
        let stream_id = id.clone();
        let listener = tokio::spawn(async move {
            if start_rx.await.is_err() {
                return;
            }
            while let Some(event) = events.recv().await {
                let disposed = matches!(event, InstanceEvent::Disposed(_));
                monitor.handle_event(&stream_id, event).await;
                if disposed {
                    monitor.forget_disposed(&stream_id, generation);
                    break;
                }
            }
        });

        let (actions, action_rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_actions(id.clone(), Arc::clone(&instance), action_rx));

        self.instances.insert(
            id.clone(),
            Tracked {
                instance,
                config,
                generation,
                listener,
                worker,
                actions,
            },
        );
        let _ = start_tx.send(());
        debug!(stream_id = %id, "Instance attached");
    }

    /// Stops tracking an instance and publishes its dispose state.
    ///
    /// Returns the instance so the caller can dispose it; `None` if nothing
    /// was running under `id`.
    pub async fn detach(&self, id: &str) -> Option<Arc<dyn StreamInstance>> {
        let (_, tracked) = self.instances.remove(id)?;
        tracked.listener.abort();
        tracked.worker.abort();
        self.on_lifecycle(&tracked.config, StreamEventType::Dispose, &json!({}))
            .await;
        debug!(stream_id = %id, "Instance detached");
        Some(tracked.instance)
    }

    /// Drops an instance that disposed itself. Its dispose state is already
    /// published; a newer instance under the same id is left alone.
    fn forget_disposed(&self, id: &str, generation: u64) {
        if let Some((_, tracked)) = self
            .instances
            .remove_if(id, |_, t| t.generation == generation)
        {
            tracked.worker.abort();
            info!(stream_id = %id, "Instance disposed itself, no longer tracked");
        }
    }

    /// Forgets the last signal recorded for `id`.
    pub fn clear_status(&self, id: &str) {
        self.status.remove(id);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn StreamInstance>> {
        self.instances.get(id).map(|t| Arc::clone(&t.instance))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.instances.contains_key(id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.instances.iter().map(|t| t.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn config(&self, id: &str) -> Option<DeepConfig> {
        self.instances.get(id).map(|t| t.config.clone())
    }

    /// Replaces the config seen by the listener after an in-place update.
    pub fn refresh_config(&self, config: DeepConfig) {
        if let Some(mut tracked) = self.instances.get_mut(config.id()) {
            tracked.config = config;
        }
    }

    pub fn status(&self, id: &str) -> Option<StatusEntry> {
        self.status.get(id)
    }

    pub fn connection_state(&self, id: &str) -> ConnectionState {
        self.status.derive(id)
    }

    async fn handle_event(&self, stream_id: &str, event: InstanceEvent) {
        // Snapshot so no map guard is held across awaits
        let Some(config) = self.config(stream_id) else {
            return;
        };

        if let Some((signal, payload)) = event.signal() {
            self.on_lifecycle(&config, signal, payload).await;
            return;
        }

        match event {
            InstanceEvent::Message { topic, message } => {
                if config.is_consumer() {
                    self.on_message(&config, &topic, message).await;
                } else {
                    debug!(stream_id = %stream_id, "Ignoring message from a producer");
                }
            }
            InstanceEvent::Persist(set) => {
                let request = PersistRequest {
                    config_id: stream_id.to_string(),
                    set,
                };
                if self.persist_tx.send(request).is_err() {
                    warn!(stream_id = %stream_id, "Persist worker gone, request dropped");
                }
            }
            _ => {}
        }
    }

    async fn on_lifecycle(&self, config: &DeepConfig, signal: StreamEventType, payload: &Value) {
        let entry = StatusEntry {
            signal,
            payload: payload.clone(),
        };
        self.status.set(config.id(), entry.clone());
        if config.stream.is_some() {
            self.status.set(&config.connector.id, entry);
        }

        let entity = EntityInfo::from_deep(config);
        self.publisher
            .state(&entity, signal, derive_state(Some(signal)), payload)
            .await;

        // Errors and disposals also surface on the owning connector
        if config.stream.is_some()
            && matches!(signal, StreamEventType::Error | StreamEventType::Dispose)
        {
            let connector = EntityInfo::connector_of(config);
            self.publisher
                .state(
                    &connector,
                    signal,
                    self.status.derive(&config.connector.id),
                    payload,
                )
                .await;
        }
    }

    /// Encodes a consumed message and offers it to every subscriber inbox.
    async fn on_message(&self, config: &DeepConfig, message_topic: &str, message: Value) {
        let encoded = match encode_message(
            config.id(),
            config.scope_id(),
            message_topic,
            message,
            self.fanout.max_message_bytes,
        ) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(stream_id = %config.id(), error = %e, "Failed to encode message");
                return;
            }
        };
        if encoded.substituted {
            warn!(
                stream_id = %config.id(),
                size = encoded.original_size,
                max_size = self.fanout.max_message_bytes,
                "Message too large, substituted"
            );
        }

        let key = subscribers_key(config.id(), config.scope_id());
        match self.queue.queue_all(&key, &encoded.payload).await {
            Ok(report) => debug!(
                stream_id = %config.id(),
                published = report.published,
                buffered = report.buffered,
                dropped = report.dropped,
                "Message fanned out"
            ),
            Err(e) => warn!(stream_id = %config.id(), error = %e, "Fan-out failed"),
        }
    }

    /// Serves control-plane actions until the subscription closes.
    pub async fn run_control_loop(self: Arc<Self>) -> Result<()> {
        let transport = self.publisher.transport();
        let pattern = topic(&[self.publisher.prefix(), "+", "action", "+"]);
        let mut rx = transport.subscribe(&pattern).await?;
        info!(pattern = %pattern, "Control loop listening");

        while let Some(message) = rx.recv().await {
            self.handle_control(message).await;
        }
        info!("Control loop stopped");
        Ok(())
    }

    pub async fn handle_control(&self, message: TransportMessage) {
        let action = topic_suffix(&message.topic).to_string();
        let Value::Object(mut body) = message.payload else {
            warn!(topic = %message.topic, "Control message is not an object");
            return;
        };

        match action.as_str() {
            "ack" => {
                let Some(inbox_id) = body.get("inboxId").and_then(Value::as_str) else {
                    warn!(topic = %message.topic, "Ack without inboxId");
                    return;
                };
                if let Err(e) = self.queue.ack(&inbox_key(inbox_id)).await {
                    warn!(inbox_id = %inbox_id, error = %e, "Ack failed");
                }
                return;
            }
            "response" => return,
            _ => {}
        }

        let Some(stream_id) = body
            .remove("streamId")
            .and_then(|v| v.as_str().map(str::to_string))
        else {
            warn!(topic = %message.topic, "Control message without streamId");
            return;
        };
        let Some((instance, actions)) = self
            .instances
            .get(&stream_id)
            .map(|t| (Arc::clone(&t.instance), t.actions.clone()))
        else {
            warn!(stream_id = %stream_id, action = %action, "NO_STREAM");
            return;
        };
        let payload = Value::Object(body);

        // Produce and respond queue on the instance's worker, request gets its own task
        match action.as_str() {
            "produce" => {
                if actions.send(Action::Produce(payload)).is_err() {
                    warn!(stream_id = %stream_id, "Instance worker gone, produce dropped");
                }
            }
            "respond" => {
                if actions.send(Action::Respond(payload)).is_err() {
                    warn!(stream_id = %stream_id, "Instance worker gone, respond dropped");
                }
            }
            "request" => {
                let response_topic = response_topic(&message.topic);
                let publisher = self.publisher.clone();
                tokio::spawn(async move {
                    let request_id = payload.get("requestId").cloned();
                    let mut response = json!({ "streamId": stream_id });
                    if let Some(request_id) = request_id {
                        response["requestId"] = request_id;
                    }
                    match instance.request(payload).await {
                        Ok(result) => response["result"] = result,
                        Err(e) => {
                            warn!(stream_id = %stream_id, error = %e, "Request failed");
                            response["error"] = json!(e.to_string());
                        }
                    }
                    publisher.publish_raw(&response_topic, &response).await;
                });
            }
            other => debug!(action = %other, "Unknown control action"),
        }
    }
}

async fn run_actions(
    stream_id: String,
    instance: Arc<dyn StreamInstance>,
    mut actions: mpsc::UnboundedReceiver<Action>,
) {
    while let Some(action) = actions.recv().await {
        match action {
            Action::Produce(payload) => {
                if let Err(e) = instance.produce(payload).await {
                    warn!(stream_id = %stream_id, error = %e, "Produce failed");
                }
            }
            Action::Respond(payload) => {
                if let Err(e) = instance.respond(payload).await {
                    warn!(stream_id = %stream_id, error = %e, "Respond failed");
                }
            }
        }
    }
}

/// `.../action/request` -> `.../action/response`
fn response_topic(request_topic: &str) -> String {
    match request_topic.rsplit_once('/') {
        Some((base, _)) => format!("{}/response", base),
        None => "response".to_string(),
    }
}
