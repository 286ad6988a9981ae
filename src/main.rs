use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use vehicle_sentinel::app_state::AppState;
use vehicle_sentinel::config::AppConfig;
use vehicle_sentinel::db;
use vehicle_sentinel::routes;
use vehicle_sentinel::services::aggregator::{self, AggregationEngine, EngineSettings};
use vehicle_sentinel::services::bus::{
    GroupStart, MessageBus, RedisStreamBus, AGGREGATOR_GROUP, RESULTS_TOPIC,
};
use vehicle_sentinel::services::identity::AssetUrls;
use vehicle_sentinel::services::live::{LiveFeed, DEFAULT_BROADCAST_CAPACITY, DEFAULT_QUEUE_CAPACITY};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!(location = %config.server.location, "Initializing aggregator");

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);
    describe_metrics();

    tracing::info!("Connecting to PostgreSQL database");
    let db_pool = db::init_pool(&config.db.database_url())
        .await
        .expect("Failed to connect to database");

    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    tracing::info!("Connecting to Redis");
    let bus = Arc::new(
        RedisStreamBus::new(&config.bus.redis_url()).expect("Failed to initialize Redis client"),
    );
    // The orchestrator normally creates the group; standalone runs need it too.
    bus.create_group(RESULTS_TOPIC, AGGREGATOR_GROUP, GroupStart::Beginning, true)
        .await
        .expect("Failed to create aggregator consumer group");

    let (live, fan_out) = LiveFeed::spawn(DEFAULT_QUEUE_CAPACITY, DEFAULT_BROADCAST_CAPACITY);
    let state = AppState::new(db_pool.clone(), bus.clone(), live.clone());

    let shutdown = CancellationToken::new();
    let engine = AggregationEngine::new(
        bus,
        db_pool,
        live.publisher(),
        AssetUrls::new(&config.server.static_base_url),
        EngineSettings {
            consumer: config.server.aggregator_consumer.clone(),
            pending_ttl: Duration::from_secs(config.server.pending_job_ttl_secs),
            ..EngineSettings::default()
        },
    );
    let engine_task = tokio::spawn(engine.run(shutdown.clone()));

    let app = routes::router(state, prometheus_handle);

    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.server.bind_addr);

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            server_shutdown.cancel();
        })
        .await
        .expect("Server error");

    shutdown.cancel();
    if let Err(e) = engine_task.await {
        tracing::error!(error = %e, "Aggregation engine task failed");
    }
    fan_out.abort();
    tracing::info!("Aggregator stopped");
}

fn describe_metrics() {
    metrics::describe_counter!(
        aggregator::RESULTS_RECEIVED,
        "Worker results consumed from the results topic"
    );
    metrics::describe_counter!(
        aggregator::JOBS_COMPLETED,
        "Jobs persisted for the first time"
    );
    metrics::describe_counter!(
        aggregator::JOBS_EVICTED,
        "Incomplete jobs dropped after the retention window"
    );
    metrics::describe_counter!(
        aggregator::UNPERSISTED_EVICTED,
        "Completed jobs dropped after every persist attempt failed"
    );
    metrics::describe_counter!(
        aggregator::PERSIST_FAILURES,
        "Completed jobs that failed to persist"
    );
    metrics::describe_counter!(
        aggregator::LIVE_UPDATES_DROPPED,
        "Completed records not handed to the live feed"
    );
    metrics::describe_counter!(
        aggregator::LATE_DUPLICATES,
        "Results received for jobs already completed"
    );
    metrics::describe_gauge!(
        aggregator::PENDING_JOBS,
        "Jobs waiting on at least one worker"
    );
    metrics::describe_histogram!(
        aggregator::JOB_ASSEMBLY_SECONDS,
        "Seconds from first result to completion"
    );
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
