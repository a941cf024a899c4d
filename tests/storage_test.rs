// Integration tests for file-backed configuration storage and config loading

use conduit::config::load_config;
use conduit::model::{ConfigPatch, ConnectorConfig, ConnectorRef, StreamConfig, StreamPatch};
use conduit::storage::{ConfigRepository, SqliteConfigRepository};
use conduit::{ConfigKind, Configuration};
use serde_json::{json, Map};
use std::io::Write;

fn connector(id: &str) -> Configuration {
    Configuration::Connector(ConnectorConfig {
        id: id.to_string(),
        name: format!("{} broker", id),
        scope_id: "tenant-a".to_string(),
        provider_id: "loopback".to_string(),
        disabled: false,
        settings: Map::new(),
    })
}

fn consumer(id: &str, connector_id: &str) -> Configuration {
    Configuration::Consumer(StreamConfig {
        id: id.to_string(),
        name: format!("{} consumer", id),
        scope_id: "tenant-a".to_string(),
        connector: ConnectorRef::new(connector_id),
        disabled: false,
        settings: Map::new(),
    })
}

/// Saved and patched documents survive reopening the database file.
#[tokio::test]
async fn test_documents_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("conduit.db");

    {
        let store = SqliteConfigRepository::new(&path).unwrap();
        store.save_configuration(&connector("c1")).await.unwrap();
        store.save_configuration(&consumer("s1", "c1")).await.unwrap();

        let mut settings = Map::new();
        settings.insert("offset".to_string(), json!(7));
        let patch = ConfigPatch::Stream(StreamPatch {
            settings,
            ..Default::default()
        });
        store.update_configuration("s1", &patch).await.unwrap();
    }

    let store = SqliteConfigRepository::new(&path).unwrap();
    let all = store.find_all_configurations().await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].id(), "c1");

    let s1 = store.find_configuration_by_id("s1").await.unwrap().unwrap();
    assert_eq!(s1.as_stream().unwrap().settings["offset"], 7);
    assert_eq!(
        store.find_streams_by_connector("c1").await.unwrap().len(),
        1
    );
}

/// Kind lookups separate consumers from producers sharing a connector.
#[tokio::test]
async fn test_kind_lookup_after_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("conduit.db");

    {
        let store = SqliteConfigRepository::new(&path).unwrap();
        store.save_configuration(&connector("c1")).await.unwrap();
        store.save_configuration(&consumer("s1", "c1")).await.unwrap();
        let producer = match consumer("p1", "c1") {
            Configuration::Consumer(stream) => Configuration::Producer(stream),
            other => other,
        };
        store.save_configuration(&producer).await.unwrap();
    }

    let store = SqliteConfigRepository::new(&path).unwrap();
    let producers = store
        .find_configurations_by_kind(ConfigKind::Producer)
        .await
        .unwrap();
    assert_eq!(producers.len(), 1);
    assert_eq!(producers[0].id(), "p1");
    assert_eq!(store.find_streams_by_connector("c1").await.unwrap().len(), 2);
}

/// A deleted connector stays deleted; its streams remain.
#[tokio::test]
async fn test_delete_is_durable() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("conduit.db");

    {
        let store = SqliteConfigRepository::new(&path).unwrap();
        store.save_configuration(&connector("c1")).await.unwrap();
        store.save_configuration(&consumer("s1", "c1")).await.unwrap();
        assert!(store.delete_configuration("c1").await.unwrap());
    }

    let store = SqliteConfigRepository::new(&path).unwrap();
    assert!(store.find_configuration_by_id("c1").await.unwrap().is_none());
    assert!(store.find_configuration_by_id("s1").await.unwrap().is_some());
}

/// Service configuration loads from a TOML file, with defaults filled in.
#[test]
fn test_load_config_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
providers = ["loopback"]

[storage]
path = ":memory:"

[fanout]
max_pending = 2
"#
    )
    .unwrap();

    let config = load_config(file.path().to_str().unwrap()).unwrap();
    assert_eq!(config.storage.path, ":memory:");
    assert_eq!(config.fanout.max_pending, 2);
    assert_eq!(config.fanout.max_queue_len, 10_000);
    assert_eq!(config.topics.prefix, "conduit");
}

/// A missing file is an error, not a silent default.
#[test]
fn test_load_config_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.toml");
    assert!(load_config(path.to_str().unwrap()).is_err());
}
