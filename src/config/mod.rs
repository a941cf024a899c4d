pub mod fanout;
pub use fanout::FanoutConfig;

use serde::Deserialize;

// Re-export existing config types
pub use crate::backpressure::RedisConfig;
pub use crate::transport::NatsConfig;

/// Complete Conduit configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ConduitConfig {
    #[serde(default)]
    pub nats: NatsConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub fanout: FanoutConfig,
    #[serde(default)]
    pub topics: TopicConfig,
    /// Provider plugin ids to define at startup
    #[serde(default = "default_providers")]
    pub providers: Vec<String>,
}

fn default_providers() -> Vec<String> {
    vec!["loopback".to_string()]
}

/// Configuration storage
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// SQLite database path (`:memory:` for a throwaway store)
    #[serde(default = "default_storage_path")]
    pub path: String,
}

fn default_storage_path() -> String {
    "conduit.db".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
        }
    }
}

/// Topic layout for control-plane traffic
#[derive(Debug, Clone, Deserialize)]
pub struct TopicConfig {
    /// Root segment of every published topic
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

fn default_prefix() -> String {
    "conduit".to_string()
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
        }
    }
}

impl Default for ConduitConfig {
    fn default() -> Self {
        Self {
            nats: NatsConfig::default(),
            redis: RedisConfig::default(),
            storage: StorageConfig::default(),
            fanout: FanoutConfig::default(),
            topics: TopicConfig::default(),
            providers: default_providers(),
        }
    }
}

/// Load configuration from TOML file
pub fn load_config(path: &str) -> Result<ConduitConfig, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    let config: ConduitConfig = toml::from_str(&contents)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ConduitConfig::default();
        assert_eq!(config.fanout.max_pending, 20);
        assert_eq!(config.fanout.max_queue_len, 10_000);
        assert_eq!(config.fanout.max_message_bytes, 100_000);
        assert_eq!(config.topics.prefix, "conduit");
        assert_eq!(config.storage.path, "conduit.db");
        assert_eq!(config.providers, vec!["loopback".to_string()]);
    }

    #[test]
    fn test_config_deserialization() {
        let toml = r#"
            providers = ["loopback", "mqtt"]

            [nats]
            url = "nats://example.com:4222"

            [redis]
            url = "redis://cache:6379"

            [storage]
            path = "/var/lib/conduit/config.db"

            [fanout]
            max_pending = 5
            max_queue_len = 100
            max_message_bytes = 2048

            [topics]
            prefix = "edge"
        "#;

        let config: ConduitConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.nats.url, "nats://example.com:4222");
        assert_eq!(config.redis.url, "redis://cache:6379");
        assert_eq!(config.storage.path, "/var/lib/conduit/config.db");
        assert_eq!(config.fanout.max_pending, 5);
        assert_eq!(config.fanout.max_queue_len, 100);
        assert_eq!(config.fanout.max_message_bytes, 2048);
        assert_eq!(config.topics.prefix, "edge");
        assert_eq!(config.providers.len(), 2);
    }

    #[test]
    fn test_partial_config() {
        // Test that missing sections use defaults
        let toml = r#"
            [fanout]
            max_pending = 3
        "#;

        let config: ConduitConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.fanout.max_pending, 3);
        assert_eq!(config.fanout.max_queue_len, 10_000); // Default
        assert_eq!(config.topics.prefix, "conduit"); // Default
    }
}
