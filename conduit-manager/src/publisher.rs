//! Lifecycle event publishing.
//!
//! Every event is a control envelope published on
//! `{prefix}/{scopeId}/{className}/{id}/{suffix}` where suffix is one of
//! `error`, `notification`, `update`, `delete` or `state`. Publish failures
//! are logged and swallowed.

use crate::error::NoticeCode;
use conduit::event::control_event;
use conduit::model::ProviderConfig;
use conduit::transport::{topic, Transport};
use conduit::{ConnectionState, Configuration, DeepConfig, StreamEventType, StreamRef};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, warn};

/// Identity of the entity an event is about.
#[derive(Clone, Debug, PartialEq)]
pub struct EntityInfo {
    pub id: String,
    pub name: String,
    pub scope_id: String,
    pub class_name: String,
}

impl EntityInfo {
    pub fn from_config(config: &Configuration) -> Self {
        Self {
            id: config.id().to_string(),
            name: config.name().to_string(),
            scope_id: config.scope_id().to_string(),
            class_name: config.kind().class_name().to_string(),
        }
    }

    pub fn from_deep(config: &DeepConfig) -> Self {
        Self {
            id: config.id().to_string(),
            name: config.name().to_string(),
            scope_id: config.scope_id().to_string(),
            class_name: config.kind.class_name().to_string(),
        }
    }

    /// The connector a deep config hangs off.
    pub fn connector_of(config: &DeepConfig) -> Self {
        Self {
            id: config.connector.id.clone(),
            name: config.connector.name.clone(),
            scope_id: config.connector.scope_id.clone(),
            class_name: conduit::ConfigKind::Connector.class_name().to_string(),
        }
    }

    pub fn provider(config: &ProviderConfig) -> Self {
        Self {
            id: config.id.clone(),
            name: config.name.clone(),
            scope_id: String::new(),
            class_name: conduit::ConfigKind::Provider.class_name().to_string(),
        }
    }

    /// Entity known only by id, e.g. a save that never resolved.
    pub fn unknown(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: String::new(),
            scope_id: String::new(),
            class_name: String::new(),
        }
    }

    fn stream_ref(&self) -> StreamRef {
        StreamRef::new(&self.id, &self.name)
    }
}

/// A user-facing notification.
#[derive(Clone, Debug, PartialEq)]
pub struct Notice {
    pub code: NoticeCode,
    pub message: String,
    /// Ask clients to surface it immediately.
    pub popup: bool,
    pub details: Map<String, Value>,
}

impl Notice {
    pub fn new(code: NoticeCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            popup: false,
            details: Map::new(),
        }
    }

    pub fn popup(code: NoticeCode, message: impl Into<String>) -> Self {
        Self {
            popup: true,
            ..Self::new(code, message)
        }
    }
}

#[derive(Clone)]
pub struct LifecycleEventPublisher {
    transport: Arc<dyn Transport>,
    prefix: String,
}

impl LifecycleEventPublisher {
    pub fn new(transport: Arc<dyn Transport>, prefix: impl Into<String>) -> Self {
        Self {
            transport,
            prefix: prefix.into(),
        }
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.transport)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// `{prefix}/{scope}/{className}/{id}/{suffix}`; empty segments are skipped.
    pub fn entity_topic(&self, entity: &EntityInfo, suffix: &str) -> String {
        topic(&[
            &self.prefix,
            &entity.scope_id,
            &entity.class_name,
            &entity.id,
            suffix,
        ])
    }

    pub async fn error(&self, entity: &EntityInfo, code: NoticeCode, cause: &str) {
        let mut payload = Map::new();
        payload.insert("kind".to_string(), json!(code));
        payload.insert("cause".to_string(), json!(cause));
        payload.insert("className".to_string(), json!(entity.class_name));
        self.emit(entity, "error", StreamEventType::Error, payload)
            .await;
    }

    pub async fn notification(&self, entity: &EntityInfo, notice: &Notice) {
        let mut payload = notice.details.clone();
        payload.insert("code".to_string(), json!(notice.code));
        payload.insert("message".to_string(), json!(notice.message));
        payload.insert("popup".to_string(), json!(notice.popup));
        self.emit(
            entity,
            "notification",
            StreamEventType::Notification,
            payload,
        )
        .await;
    }

    /// Announces a saved configuration.
    pub async fn config_update(&self, config: &Configuration) {
        let mut payload = Map::new();
        payload.insert("config".to_string(), json!(config));
        self.emit(
            &EntityInfo::from_config(config),
            "update",
            StreamEventType::Update,
            payload,
        )
        .await;
    }

    /// Announces a deleted configuration and whether an instance was running.
    pub async fn config_delete(&self, config: &Configuration, had_instance: bool) {
        let mut payload = Map::new();
        payload.insert("hadInstance".to_string(), json!(had_instance));
        self.emit(
            &EntityInfo::from_config(config),
            "delete",
            StreamEventType::Delete,
            payload,
        )
        .await;
    }

    /// Lifecycle signal with the derived connection state.
    pub async fn state(
        &self,
        entity: &EntityInfo,
        signal: StreamEventType,
        state: ConnectionState,
        detail: &Value,
    ) {
        let mut payload = Map::new();
        payload.insert("scope".to_string(), json!(entity.scope_id));
        payload.insert("id".to_string(), json!(entity.id));
        payload.insert("name".to_string(), json!(entity.name));
        payload.insert("className".to_string(), json!(entity.class_name));
        payload.insert("type".to_string(), json!(signal));
        payload.insert("state".to_string(), json!(state));
        let has_detail = match detail {
            Value::Null => false,
            Value::Object(o) => !o.is_empty(),
            _ => true,
        };
        if has_detail {
            payload.insert("detail".to_string(), detail.clone());
        }
        self.emit(entity, "state", signal, payload).await;
    }

    /// Publishes the merged function definitions of every loaded provider.
    pub async fn catalog(&self, functions: &[Value]) {
        let topic = topic(&[&self.prefix, "catalog"]);
        self.publish_raw(&topic, &json!({ "functions": functions }))
            .await;
    }

    pub async fn publish_raw(&self, topic: &str, payload: &Value) {
        match self.transport.publish(topic, payload).await {
            Ok(()) => debug!(topic = %topic, "Published"),
            Err(e) => warn!(topic = %topic, error = %e, "Publish failed"),
        }
    }

    async fn emit(
        &self,
        entity: &EntityInfo,
        suffix: &str,
        event_type: StreamEventType,
        payload: Map<String, Value>,
    ) {
        let topic = self.entity_topic(entity, suffix);
        let envelope = control_event(event_type, &entity.stream_ref(), payload);
        self.publish_raw(&topic, &envelope).await;
    }
}
