use serde::{Deserialize, Serialize};

/// Fan-out and backpressure limits.
///
/// Read from the `[fanout]` TOML section, then overridden by environment
/// variables so deployments can tune them without editing the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanoutConfig {
    /// Unacknowledged deliveries allowed per inbox before buffering.
    #[serde(default = "default_max_pending")]
    pub max_pending: u64,
    /// Overflow buffer length per inbox; further messages are dropped.
    #[serde(default = "default_max_queue_len")]
    pub max_queue_len: u64,
    /// Serialized message size above which the payload is substituted.
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
}

fn default_max_pending() -> u64 {
    20
}

fn default_max_queue_len() -> u64 {
    10_000
}

fn default_max_message_bytes() -> usize {
    100_000
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            max_pending: default_max_pending(),
            max_queue_len: default_max_queue_len(),
            max_message_bytes: default_max_message_bytes(),
        }
    }
}

impl FanoutConfig {
    /// Build from env vars, falling back to defaults.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Applies `CONDUIT_MAX_PENDING`, `CONDUIT_MAX_QUEUE_LEN` and
    /// `CONDUIT_MAX_MESSAGE_BYTES` when set and parseable.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var("CONDUIT_MAX_PENDING") {
            if let Ok(n) = v.parse::<u64>() {
                self.max_pending = n;
            }
        }
        if let Ok(v) = std::env::var("CONDUIT_MAX_QUEUE_LEN") {
            if let Ok(n) = v.parse::<u64>() {
                self.max_queue_len = n;
            }
        }
        if let Ok(v) = std::env::var("CONDUIT_MAX_MESSAGE_BYTES") {
            if let Ok(n) = v.parse::<usize>() {
                self.max_message_bytes = n;
            }
        }
        self
    }
}
