use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};


/// Error code carried by a substituted oversize message.
pub const MESSAGE_TOO_LARGE: &str = "MESSAGE_TOO_LARGE";

/// Kind of a published control event (`streamEventType`).
///
/// The first seven mirror what a stream instance reports about itself; the
/// rest are raised by the manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamEventType {
    Test,
    Ready,
    Connect,
    Error,
    Warning,
    Feedback,
    Dispose,
    Notification,
    Update,
    Delete,
}

impl StreamEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamEventType::Test => "test",
            StreamEventType::Ready => "ready",
            StreamEventType::Connect => "connect",
            StreamEventType::Error => "error",
            StreamEventType::Warning => "warning",
            StreamEventType::Feedback => "feedback",
            StreamEventType::Dispose => "dispose",
            StreamEventType::Notification => "notification",
            StreamEventType::Update => "update",
            StreamEventType::Delete => "delete",
        }
    }
}

/// Aggregate connection state published alongside lifecycle events.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// Identifies the entity an event is about.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamRef {
    pub id: String,
    pub name: String,
}

impl StreamRef {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Builds the canonical control envelope:
///
/// ```json
/// {"type": "event",
///  "event": {"type": "CONTROL_EVENT", "streamEventType": "...",
///            "data": {"timestamp": 0, "stream": {"id": "...", "name": "..."}, ...}}}
/// ```
///
/// `payload` keys are merged into `data`; `timestamp` and `stream` always win.
pub fn control_event(
    stream_event_type: StreamEventType,
    stream: &StreamRef,
    payload: Map<String, Value>,
) -> Value {
    let mut data = payload;
    data.insert("timestamp".to_string(), json!(Utc::now().timestamp_millis()));
    data.insert("stream".to_string(), json!(stream));

    json!({
        "type": "event",
        "event": {
            "type": "CONTROL_EVENT",
            "streamEventType": stream_event_type,
            "data": Value::Object(data),
        }
    })
}

/// Payload delivered to subscriber inboxes for every consumed message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(rename = "streamId")]
    pub stream_id: String,
    #[serde(rename = "scopeId")]
    pub scope_id: String,
    pub topic: String,
    pub timestamp: i64,
    pub message: Value,
}

impl MessageEnvelope {
    pub fn new(stream_id: &str, scope_id: &str, topic: &str, message: Value) -> Self {
        Self {
            msg_type: "message".to_string(),
            stream_id: stream_id.to_string(),
            scope_id: scope_id.to_string(),
            topic: topic.to_string(),
            timestamp: Utc::now().timestamp_millis(),
            message,
        }
    }
}

/// Serialized fan-out payload.
#[derive(Clone, Debug, PartialEq)]
pub struct EncodedMessage {
    pub payload: String,
    /// True when the original message was replaced by the oversize error.
    pub substituted: bool,
    /// Serialized size of the original envelope.
    pub original_size: usize,
}

/// Serializes a consumed message for fan-out.
///
/// A message whose envelope exceeds `max_bytes` is never delivered verbatim:
/// its `message` is replaced by `{"error": "MESSAGE_TOO_LARGE", "size", "maxSize"}`
/// inside an envelope of the same shape. If that is still too large the
/// topic is emptied (`topicTruncated: true`), and failing that only
/// `{"error"}` is kept. The last form is the smallest envelope there is; a
/// `max_bytes` below its size cannot be met.
pub fn encode_message(
    stream_id: &str,
    scope_id: &str,
    topic: &str,
    message: Value,
    max_bytes: usize,
) -> serde_json::Result<EncodedMessage> {
    let mut envelope = MessageEnvelope::new(stream_id, scope_id, topic, message);
    let payload = serde_json::to_string(&envelope)?;
    let original_size = payload.len();
    if original_size <= max_bytes {
        return Ok(EncodedMessage {
            payload,
            substituted: false,
            original_size,
        });
    }

    envelope.message = json!({
        "error": MESSAGE_TOO_LARGE,
        "size": original_size,
        "maxSize": max_bytes,
    });
    let mut payload = serde_json::to_string(&envelope)?;

    if payload.len() > max_bytes {
        envelope.topic.clear();
        envelope.message["topicTruncated"] = json!(true);
        payload = serde_json::to_string(&envelope)?;
    }
    if payload.len() > max_bytes {
        envelope.message = json!({ "error": MESSAGE_TOO_LARGE });
        payload = serde_json::to_string(&envelope)?;
    }

    Ok(EncodedMessage {
        payload,
        substituted: true,
        original_size,
    })
}
