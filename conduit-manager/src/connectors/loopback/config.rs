use serde_json::{json, Value};

pub const PROVIDER_ID: &str = "loopback";
pub const PROVIDER_NAME: &str = "Loopback";

/// Topic used by producers when neither the payload nor the stream sets one.
pub const DEFAULT_TOPIC: &str = "loopback";

/// Consumers without a `topic` setting receive everything.
pub const DEFAULT_FILTER: &str = "#";

/// Frames buffered per connector before slow consumers start lagging.
pub const CHANNEL_CAPACITY: usize = 256;

/// Custom commands exposed to clients.
pub fn functions() -> Vec<Value> {
    vec![
        json!({
            "name": "ping",
            "description": "Round-trip check against the stream instance"
        }),
        json!({
            "name": "stats",
            "description": "Number of messages produced and consumed by the instance"
        }),
    ]
}
