use anyhow::Context;
use event_bus::consumer_retry::RetryConfig;
use event_bus::{EventBus, InMemoryBus, NatsBus};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use notifications_rs::config::{BusType, Config};
use notifications_rs::http::{router, AppState};
use notifications_rs::listener::{AudienceListener, InMemoryConnections, ListenerCapabilities};
use notifications_rs::metrics::Metrics;
use notifications_rs::orchestrator::{BlockedEventTypes, OrchestratorRegistry};
use notifications_rs::outbox::{
    commit_hook, Outbox, OutboxPublisher, PublisherConfig, RetentionJob,
};
use notifications_rs::repos::{
    PgNotificationStore, PgOutboxStore, PgProcessedEvents, PgRecipientDirectory,
};
use notifications_rs::{db, models::Audience};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::from_env().context("invalid configuration")?;
    init_tracing(config.log_json);

    tracing::info!(bus = ?config.bus_type, "Starting notifications module");

    let pool = db::init_pool(&config.database_url, &config.pool)
        .await
        .context("failed to connect to Postgres")?;
    db::migrate(&pool).await.context("failed to run migrations")?;

    let bus: Arc<dyn EventBus> = match config.bus_type {
        BusType::InMemory => {
            tracing::warn!("Using in-memory bus; events do not leave this process");
            Arc::new(InMemoryBus::with_max_deliver(config.listener_max_deliveries))
        }
        BusType::Nats => {
            let client = async_nats::connect(&config.nats_url)
                .await
                .with_context(|| format!("failed to connect to NATS at {}", config.nats_url))?;
            Arc::new(NatsBus::new(client).with_max_deliver(config.listener_max_deliveries))
        }
    };

    let metrics = Metrics::new().context("failed to register metrics")?;
    let outbox_store = Arc::new(PgOutboxStore::new(pool.clone()));
    let blocked = Arc::new(BlockedEventTypes::new(
        config.blocked_event_types.iter().cloned(),
    ));
    let registry = OrchestratorRegistry::standard();
    let connections = Arc::new(InMemoryConnections::new());

    // Declare every queue before anything publishes so nothing is dropped
    for audience in Audience::ALL {
        bus.declare_queue(&audience.queue())
            .await
            .with_context(|| format!("failed to declare queue for {}", audience))?;
    }

    for audience in registry.audiences() {
        let Some(orchestrator) = registry.get(audience) else {
            continue;
        };
        let listener = Arc::new(AudienceListener::new(ListenerCapabilities {
            orchestrator,
            directory: Arc::new(PgRecipientDirectory::new(pool.clone())),
            ledger: Arc::new(PgProcessedEvents::new(pool.clone())),
            notifications: Arc::new(PgNotificationStore::new(pool.clone())),
            connections: connections.clone(),
            metrics: metrics.clone(),
            blocked: blocked.clone(),
        }));
        let queue = listener.queue();
        listener.spawn(bus.clone(), queue);
    }

    // Appends through this outbox wake the publisher without waiting for a sweep
    let (hook, committed) = commit_hook();
    let outbox = Outbox::new(outbox_store.clone()).with_commit_hook(hook);
    let publisher = OutboxPublisher::new(
        outbox_store.clone(),
        bus.clone(),
        metrics.clone(),
        PublisherConfig {
            batch_size: config.outbox_batch_size,
            max_attempts: config.outbox_max_attempts,
            sweep_interval: config.outbox_sweep_interval,
            backoff: RetryConfig {
                max_attempts: u32::try_from(config.outbox_max_attempts).unwrap_or(u32::MAX),
                initial_backoff: config.outbox_backoff_initial,
                max_backoff: config.outbox_backoff_max,
            },
        },
    );
    tokio::spawn(publisher.run(committed));

    let retention = RetentionJob::new(
        outbox_store,
        metrics.clone(),
        config.outbox_retention_days,
        config.outbox_retention_interval,
        config.outbox_max_attempts,
    );
    tokio::spawn(retention.run());

    let app = router(AppState { metrics, outbox });

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    tracing::info!(%addr, "Notifications module listening");

    axum::serve(listener, app).await.context("server failed")?;

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());

    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
