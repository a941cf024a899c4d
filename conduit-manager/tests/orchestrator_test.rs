// Integration tests for the stream lifecycle: reload, save, delete, commands

mod common;

use common::*;
use conduit::config::FanoutConfig;
use conduit::storage::ConfigRepository;
use conduit::Configuration;
use conduit_manager::{CommandRequest, SaveRequest};
use serde_json::{json, Map, Value};
use std::collections::HashSet;

fn command(stream_id: &str, class_name: &str, cmd_id: &str) -> CommandRequest {
    CommandRequest {
        cmd_type: "custom".to_string(),
        stream_id: stream_id.to_string(),
        class_name: class_name.to_string(),
        cmd_id: cmd_id.to_string(),
        value: json!({"n": 1}),
    }
}

fn patch(id: &str, set: Value) -> SaveRequest {
    let Value::Object(set) = set else {
        panic!("patch body must be an object")
    };
    SaveRequest::Patch {
        id: id.to_string(),
        set,
    }
}

/// Full reload starts every enabled stream exactly once.
#[tokio::test]
async fn test_full_reload_starts_enabled_streams() {
    let m = create_test_manager(vec![
        connector("c1"),
        consumer("s1", "c1"),
        producer("p1", "c1"),
        disabled(consumer("s2", "c1")),
    ])
    .await;

    let monitor = m.orchestrator.monitor();
    assert_eq!(monitor.len(), 2);
    assert!(monitor.contains("s1"));
    assert!(monitor.contains("p1"));
    assert!(!monitor.contains("s2"));
    assert_eq!(m.log.provides("s1"), 1);
    assert_eq!(m.log.connects("p1"), 1);
    assert_eq!(m.log.provides("s2"), 0);

    let catalog = m.transport.published_matching("conduit/catalog");
    assert_eq!(catalog.len(), 1);
    assert_eq!(catalog[0].payload["functions"][0]["providerId"], "mock");
}

/// A second full reload replaces instances without leaking any.
#[tokio::test]
async fn test_second_full_reload_disposes_before_loading() {
    let m = create_test_manager(vec![connector("c1"), consumer("s1", "c1")]).await;

    m.orchestrator.reload_all(None).await.unwrap();

    assert_eq!(m.log.provides("s1"), 2);
    assert_eq!(m.log.disposes("s1"), 1);
    assert_eq!(m.orchestrator.monitor().len(), 1);
}

/// Saving a new consumer causes one load and one connect.
#[tokio::test]
async fn test_save_new_consumer_loads_once() {
    let m = create_test_manager(vec![connector("c1")]).await;

    let reply = m
        .orchestrator
        .save_configuration(SaveRequest::Insert(consumer("s9", "c1")))
        .await;

    assert!(reply.is_ok(), "{:?}", reply);
    assert_eq!(m.log.provides("s9"), 1);
    assert_eq!(m.log.connects("s9"), 1);
    assert!(m.orchestrator.instance("s9").is_some());
    assert!(m.repository.find_configuration_by_id("s9").await.unwrap().is_some());
    assert_eq!(
        m.transport
            .published_matching("conduit/t1/ConsumerConfiguration/s9/update")
            .len(),
        1
    );
}

/// Inserting without an id assigns one.
#[tokio::test]
async fn test_insert_assigns_id_and_trims_name() {
    let m = create_test_manager(vec![connector("c1")]).await;
    let mut config = consumer("", "c1");
    *config.name_mut() = "  padded  ".to_string();

    let reply = m
        .orchestrator
        .save_configuration(SaveRequest::Insert(config))
        .await;

    let saved: Configuration = serde_json::from_value(reply.result.unwrap()).unwrap();
    assert!(!saved.id().is_empty());
    assert_eq!(saved.name(), "padded");
    let trimmed = m.transport.published_matching("conduit/+/+/+/notification");
    assert_eq!(trimmed[0].payload["event"]["data"]["code"], "NAME_TRIMMED");
}

/// Saving a duplicate id is reported, not raised.
#[tokio::test]
async fn test_save_failure_returns_error_and_popup() {
    let m = create_test_manager(vec![connector("c1"), consumer("s1", "c1")]).await;

    let reply = m
        .orchestrator
        .save_configuration(SaveRequest::Insert(consumer("s1", "c1")))
        .await;

    assert!(reply.error.is_some());
    let notices = m
        .transport
        .published_matching("conduit/t1/ConsumerConfiguration/s1/notification");
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].payload["event"]["data"]["code"], "SAVE_FAILED");
    assert_eq!(notices[0].payload["event"]["data"]["popup"], true);
    // The running instance is untouched
    assert_eq!(m.log.provides("s1"), 1);
}

/// Deleting a connector disposes its streams but keeps their configurations.
#[tokio::test]
async fn test_delete_connector_disposes_dependents() {
    let m = create_test_manager(vec![
        connector("c1"),
        consumer("s1", "c1"),
        producer("p1", "c1"),
    ])
    .await;

    let had_instance = m.orchestrator.delete_configuration("c1").await.unwrap();

    assert!(had_instance);
    assert_eq!(m.log.disposes("s1"), 1);
    assert_eq!(m.log.disposes("p1"), 1);
    assert!(m.orchestrator.monitor().is_empty());
    assert!(m.repository.find_configuration_by_id("c1").await.unwrap().is_none());
    assert!(m.repository.find_configuration_by_id("s1").await.unwrap().is_some());

    let deleted = m
        .transport
        .published_matching("conduit/t1/ConnectorConfiguration/c1/delete");
    assert_eq!(deleted.len(), 1);
    assert_eq!(deleted[0].payload["event"]["data"]["hadInstance"], true);
    assert!(m.orchestrator.monitor().status("c1").is_none());
}

/// Deleting a stream disposes it once.
#[tokio::test]
async fn test_delete_stream() {
    let m = create_test_manager(vec![connector("c1"), consumer("s1", "c1")]).await;

    assert!(m.orchestrator.delete_configuration("s1").await.unwrap());
    assert!(!m.orchestrator.delete_configuration("s1").await.unwrap());
    assert_eq!(m.log.disposes("s1"), 1);
    assert!(m.orchestrator.registry().get("s1").is_none());
    // Nothing is kept around for a deleted id
    assert_eq!(m.orchestrator.lock_count(), 0);
    assert!(m.orchestrator.monitor().status("s1").is_none());
}

/// A connector command reaches every enabled stream; one failure does not
/// stop the others.
#[tokio::test]
async fn test_connector_command_fans_out_and_reports_failures() {
    let provider = MockProvider {
        failing_commands: HashSet::from(["s2".to_string()]),
        ..MockProvider::default()
    };
    let m = create_test_manager_with(
        provider,
        FanoutConfig::default(),
        vec![
            connector("c1"),
            consumer("s1", "c1"),
            consumer("s2", "c1"),
            disabled(consumer("s3", "c1")),
        ],
    )
    .await;

    let reply = m
        .orchestrator
        .execute_command(command("c1", "ConnectorConfiguration", "echo"))
        .await;

    let results = reply.result.unwrap();
    let results = results.as_array().unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0]["streamId"], "s1");
    assert_eq!(results[0]["result"]["value"]["n"], 1);
    assert_eq!(results[1]["streamId"], "s2");
    assert_eq!(results[1]["error"], "echo failed on s2");

    let errors = m
        .transport
        .published_matching("conduit/t1/ConsumerConfiguration/s2/error");
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].payload["event"]["data"]["kind"], "COMMAND_FAILED");
}

/// Command errors come back as codes.
#[tokio::test]
async fn test_command_error_codes() {
    let m = create_test_manager(vec![connector("c1"), consumer("s1", "c1")]).await;

    let reply = m
        .orchestrator
        .execute_command(command("nope", "ConsumerConfiguration", "echo"))
        .await;
    assert_eq!(reply.error.as_deref(), Some("NO_STREAM"));

    let reply = m
        .orchestrator
        .execute_command(command("s1", "ConsumerConfiguration", "reboot"))
        .await;
    assert_eq!(reply.error.as_deref(), Some("CMD_FUNC_INVALID"));

    let mut builtin = command("s1", "ConsumerConfiguration", "echo");
    builtin.cmd_type = "builtin".to_string();
    let reply = m.orchestrator.execute_command(builtin).await;
    assert_eq!(reply.error.as_deref(), Some("CMD_FUNC_INVALID_TYPE"));

    let reply = m
        .orchestrator
        .execute_command(command("s1", "ConsumerConfiguration", "echo"))
        .await;
    assert_eq!(reply.result.unwrap()["streamId"], "s1");
}

/// Concurrent reloads of one stream never leave two live instances.
#[tokio::test]
async fn test_concurrent_reloads_keep_single_instance() {
    let m = create_test_manager(vec![connector("c1"), consumer("s1", "c1")]).await;
    let o = &m.orchestrator;

    let (a, b, c) = tokio::join!(
        o.reload_stream("s1"),
        o.reload_stream("s1"),
        o.reload_stream("s1")
    );
    assert_eq!(a.unwrap() + b.unwrap() + c.unwrap(), 3);

    assert_eq!(m.log.provides("s1"), 4);
    assert_eq!(m.log.disposes("s1"), 3);
    assert_eq!(o.monitor().len(), 1);
}

/// Reloading a connector reloads its dependents.
#[tokio::test]
async fn test_reload_connector_reloads_dependents() {
    let m = create_test_manager(vec![
        connector("c1"),
        consumer("s1", "c1"),
        producer("p1", "c1"),
        connector("c2"),
        consumer("s2", "c2"),
    ])
    .await;

    let started = m.orchestrator.reload_stream("c1").await.unwrap();

    assert_eq!(started, 2);
    assert_eq!(m.log.provides("s1"), 2);
    assert_eq!(m.log.provides("p1"), 2);
    assert_eq!(m.log.provides("s2"), 1);
}

/// Selective reload handles connectors before streams and skips duplicates.
#[tokio::test]
async fn test_selective_reload() {
    let m = create_test_manager(vec![
        connector("c1"),
        consumer("s1", "c1"),
        connector("c2"),
        consumer("s2", "c2"),
    ])
    .await;

    let ids = vec!["s1".to_string(), "c1".to_string(), "s2".to_string()];
    let started = m.orchestrator.reload_all(Some(&ids)).await.unwrap();

    assert_eq!(started, 2);
    assert_eq!(m.log.provides("s1"), 2);
    assert_eq!(m.log.provides("s2"), 2);
}

/// Disabling a connector stops its streams; enabling brings them back.
#[tokio::test]
async fn test_connector_disable_and_enable() {
    let m = create_test_manager(vec![
        connector("c1"),
        consumer("s1", "c1"),
        producer("p1", "c1"),
    ])
    .await;

    let reply = m
        .orchestrator
        .save_configuration(patch("c1", json!({"disabled": true})))
        .await;
    assert!(reply.is_ok(), "{:?}", reply);
    assert!(m.orchestrator.monitor().is_empty());
    assert_eq!(m.log.disposes("s1"), 1);

    let updates = m
        .transport
        .published_matching("conduit/t1/ConnectorConfiguration/c1/update");
    assert_eq!(updates.len(), 1);

    m.orchestrator
        .save_configuration(patch("c1", json!({"disabled": false})))
        .await;
    assert_eq!(m.orchestrator.monitor().len(), 2);
    assert_eq!(m.log.provides("s1"), 2);
}

/// Connector settings reach running streams through update.
#[tokio::test]
async fn test_connector_patch_updates_dependents() {
    let m = create_test_manager(vec![connector("c1"), consumer("s1", "c1")]).await;

    m.orchestrator
        .save_configuration(patch("c1", json!({"host": "broker.local"})))
        .await;

    let updates = m.log.updates();
    assert!(updates
        .iter()
        .any(|d| d.connector.settings.get("host") == Some(&json!("broker.local"))));
}

/// A stream patch that keeps the connector updates the instance in place.
#[tokio::test]
async fn test_stream_patch_updates_in_place() {
    let m = create_test_manager(vec![connector("c1"), consumer("s1", "c1")]).await;

    let reply = m
        .orchestrator
        .save_configuration(patch(
            "s1",
            json!({"id": "hijack", "className": "ProducerConfiguration", "name": " renamed ", "topic": "a/b"}),
        ))
        .await;

    let saved: Configuration = serde_json::from_value(reply.result.unwrap()).unwrap();
    assert_eq!(saved.id(), "s1");
    assert!(matches!(saved, Configuration::Consumer(_)));
    assert_eq!(saved.name(), "renamed");
    assert_eq!(m.log.provides("s1"), 1);
    assert_eq!(m.log.updates().len(), 1);
    assert_eq!(
        m.log.updates()[0].stream.as_ref().unwrap().settings["topic"],
        "a/b"
    );
}

/// Moving a stream to another connector reloads it.
#[tokio::test]
async fn test_stream_connector_change_reloads() {
    let m = create_test_manager(vec![
        connector("c1"),
        connector("c2"),
        consumer("s1", "c1"),
    ])
    .await;

    m.orchestrator
        .save_configuration(patch("s1", json!({"connector": {"_id": "c2"}})))
        .await;

    assert_eq!(m.log.provides("s1"), 2);
    assert_eq!(m.log.disposes("s1"), 1);
    let stored = m.repository.find_configuration_by_id("s1").await.unwrap().unwrap();
    let stream = stored.as_stream().unwrap();
    assert_eq!(stream.connector.id.as_deref(), Some("c2"));
    assert_eq!(stream.connector.object_id.as_deref(), Some("c2"));
}

/// Dotted `connector.id` / `connector._id` keys move the stream too.
#[tokio::test]
async fn test_stream_connector_change_with_dotted_paths() {
    let m = create_test_manager(vec![
        connector("c1"),
        connector("c2"),
        connector("c3"),
        consumer("s1", "c1"),
    ])
    .await;

    let reply = m
        .orchestrator
        .save_configuration(patch("s1", json!({"connector.id": "c2"})))
        .await;
    assert!(reply.is_ok(), "{:?}", reply);

    assert_eq!(m.log.provides("s1"), 2);
    let stored = m.repository.find_configuration_by_id("s1").await.unwrap().unwrap();
    let stream = stored.as_stream().unwrap();
    assert_eq!(stream.connector_id(), Some("c2"));
    assert_eq!(stream.connector.object_id.as_deref(), Some("c2"));
    assert!(stream.settings.get("connector.id").is_none());

    m.orchestrator
        .save_configuration(patch("s1", json!({"connector._id": "c3"})))
        .await;
    let stored = m.repository.find_configuration_by_id("s1").await.unwrap().unwrap();
    assert_eq!(stored.connector_id(), Some("c3"));
    assert_eq!(m.log.provides("s1"), 3);
}

/// A provider that cannot provide is reported; siblings still start.
#[tokio::test]
async fn test_provide_failure_is_isolated() {
    let provider = MockProvider {
        refuse: HashSet::from(["s1".to_string()]),
        ..MockProvider::default()
    };
    let m = create_test_manager_with(
        provider,
        FanoutConfig::default(),
        vec![connector("c1"), consumer("s1", "c1"), consumer("s2", "c1")],
    )
    .await;

    assert!(!m.orchestrator.monitor().contains("s1"));
    assert!(m.orchestrator.monitor().contains("s2"));

    let notices = m
        .transport
        .published_matching("conduit/t1/ConsumerConfiguration/s1/notification");
    assert_eq!(
        notices[0].payload["event"]["data"]["code"],
        "PROVIDE_NOT_POSSIBLE"
    );
}

/// Streams under an unknown provider never start.
#[tokio::test]
async fn test_unknown_provider_chain_is_skipped() {
    let m = create_test_manager(vec![
        connector_for("c1", "kafka"),
        consumer("s1", "c1"),
        connector("c2"),
        consumer("s2", "c2"),
    ])
    .await;

    assert!(!m.orchestrator.monitor().contains("s1"));
    assert!(m.orchestrator.monitor().contains("s2"));
    assert!(m.orchestrator.registry().get("c1").is_none());
}

/// Instance persistence requests are merged into storage.
#[tokio::test]
async fn test_persist_request_updates_storage() {
    let m = create_test_manager(vec![connector("c1"), consumer("s1", "c1")]).await;

    let mut set = Map::new();
    set.insert("offset".to_string(), json!(42));
    m.log.events("s1").persist(set);

    let registry = m.orchestrator.registry().clone();
    eventually(|| {
        registry
            .get("s1")
            .and_then(|c| c.as_stream().and_then(|s| s.settings.get("offset").cloned()))
            == Some(json!(42))
    })
    .await;
    let stored = m.repository.find_configuration_by_id("s1").await.unwrap().unwrap();
    assert_eq!(stored.as_stream().unwrap().settings["offset"], 42);
    assert_eq!(m.log.provides("s1"), 1);
}

/// A stream error shows up on the connector's state topic.
#[tokio::test]
async fn test_stream_error_propagates_to_connector_state() {
    let m = create_test_manager(vec![connector("c1"), consumer("s1", "c1")]).await;

    m.log.events("s1").error(json!({"message": "lost"}));

    let transport = m.transport.clone();
    eventually(|| {
        transport
            .published_matching("conduit/t1/ConnectorConfiguration/c1/state")
            .iter()
            .any(|msg| msg.payload["event"]["streamEventType"] == "error")
    })
    .await;
    assert_eq!(
        m.orchestrator.monitor().connection_state("c1"),
        conduit::ConnectionState::Disconnected
    );
}

/// Consumed messages reach subscriber inboxes, oversize ones substituted.
#[tokio::test]
async fn test_consumed_messages_reach_inboxes() {
    let fanout = FanoutConfig {
        max_message_bytes: 256,
        ..FanoutConfig::default()
    };
    let m = create_test_manager_with(
        MockProvider::default(),
        fanout,
        vec![connector("c1"), consumer("s1", "c1")],
    )
    .await;
    m.queue
        .add_subscriber(&conduit::backpressure::subscribers_key("s1", "t1"), "A");
    let mut deliveries = m.queue.deliveries();

    let events = m.log.events("s1");
    events.message("small", json!("ok"));
    events.message("big", json!("y".repeat(1000)));

    let first = deliveries.recv().await.unwrap();
    let second = deliveries.recv().await.unwrap();
    let first: Value = serde_json::from_str(&first.payload).unwrap();
    let second: Value = serde_json::from_str(&second.payload).unwrap();
    assert_eq!(first["message"], "ok");
    assert_eq!(second["topic"], "big");
    assert_eq!(second["message"]["error"], "MESSAGE_TOO_LARGE");
}

/// Dispose-all leaves nothing running.
#[tokio::test]
async fn test_dispose_all() {
    let m = create_test_manager(vec![
        connector("c1"),
        consumer("s1", "c1"),
        producer("p1", "c1"),
    ])
    .await;

    assert_eq!(m.orchestrator.dispose_all().await, 2);
    assert!(m.orchestrator.monitor().is_empty());
    assert_eq!(m.log.disposes("s1"), 1);
    assert_eq!(m.log.disposes("p1"), 1);
}
