use anyhow::{Context, Result};
use conduit::backpressure::RedisQueue;
use conduit::config::{load_config, ConduitConfig};
use conduit::storage::SqliteConfigRepository;
use conduit::transport::NatsTransport;
use conduit_manager::{
    ConfigurationRegistry, ConnectorOrchestrator, FanoutMonitor, LifecycleEventPublisher,
    ProviderCatalog, ProviderLoader,
};
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "conduit_manager=info,conduit=info".into()),
        )
        .init();

    info!("Conduit Manager starting...");

    let mut config = match std::env::var("CONDUIT_CONFIG") {
        Ok(path) => load_config(&path)
            .map_err(|e| anyhow::anyhow!("{}", e))
            .with_context(|| format!("Failed to load configuration from {}", path))?,
        Err(_) => ConduitConfig::default(),
    };
    config.fanout = config.fanout.with_env_overrides();

    info!(
        nats_url = %config.nats.url,
        redis_url = %config.redis.url,
        storage = %config.storage.path,
        prefix = %config.topics.prefix,
        max_pending = config.fanout.max_pending,
        max_queue_len = config.fanout.max_queue_len,
        max_message_bytes = config.fanout.max_message_bytes,
        "Configuration loaded"
    );

    let repository = Arc::new(
        SqliteConfigRepository::new(&config.storage.path)
            .context("Failed to open configuration store")?,
    );
    info!("Configuration store initialized");

    let transport = Arc::new(
        NatsTransport::connect(config.nats.clone())
            .await
            .context("Failed to connect to NATS")?,
    );
    info!("Connected to NATS");

    let queue = Arc::new(
        RedisQueue::new(&config.redis, config.fanout.clone().into())
            .context("Failed to create Redis pool")?,
    );

    let registry = Arc::new(ConfigurationRegistry::new());
    let publisher = LifecycleEventPublisher::new(transport, config.topics.prefix.clone());
    let (monitor, persist_rx) =
        FanoutMonitor::new(publisher.clone(), queue, config.fanout.clone());
    let monitor = Arc::new(monitor);
    let loader = Arc::new(ProviderLoader::new(
        ProviderCatalog::builtin(),
        Arc::clone(&registry),
        publisher.clone(),
    ));

    let orchestrator = Arc::new(ConnectorOrchestrator::new(
        registry,
        repository,
        loader,
        Arc::clone(&monitor),
        publisher,
        config.providers.clone(),
    ));
    let persist_worker = orchestrator.spawn_persist_worker(persist_rx);

    let control_loop = tokio::spawn(async move {
        if let Err(e) = monitor.run_control_loop().await {
            error!(error = %e, "Control loop failed");
        }
    });

    let started = orchestrator
        .reload_all(None)
        .await
        .context("Initial load failed")?;
    info!(started, "Conduit Manager running");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    control_loop.abort();
    orchestrator.dispose_all().await;
    persist_worker.abort();

    info!("Conduit Manager stopped");
    Ok(())
}
