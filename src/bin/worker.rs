use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use vehicle_sentinel::config::WorkerConfig;
use vehicle_sentinel::services::bus::{GroupStart, MessageBus, RedisStreamBus, JOBS_TOPIC};
use vehicle_sentinel::services::recognition::{CommandRecognizer, RecognitionWorker};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = WorkerConfig::from_env().expect("Failed to load configuration");
    let role = config.worker.worker_role;

    tracing::info!(role = %role, "Starting recognition worker");

    let recognizer = CommandRecognizer::from_command(
        &config.worker.recognizer_cmd,
        Duration::from_secs(config.worker.recognizer_timeout_secs),
    )
    .expect("Invalid recognizer command");

    let bus = Arc::new(
        RedisStreamBus::new(&config.bus.redis_url()).expect("Failed to initialize Redis client"),
    );
    bus.create_group(JOBS_TOPIC, role.consumer_group(), GroupStart::Beginning, true)
        .await
        .expect("Failed to create worker consumer group");

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for Ctrl+C");
                return;
            }
            shutdown.cancel();
        }
    });
    #[cfg(unix)]
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            use tokio::signal::unix::{signal, SignalKind};
            if let Ok(mut term) = signal(SignalKind::terminate()) {
                term.recv().await;
                shutdown.cancel();
            }
        }
    });

    tracing::info!("Worker ready, starting job processing loop");
    RecognitionWorker::new(bus, recognizer, role, config.worker.consumer())
        .run(shutdown)
        .await;
}
