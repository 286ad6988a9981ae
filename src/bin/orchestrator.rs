use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use vehicle_sentinel::config::OrchestratorConfig;
use vehicle_sentinel::fleet::{FleetOrchestrator, FleetPlan};
use vehicle_sentinel::services::bus::{MessageBus, RedisStreamBus};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Fail fast before anything is spawned.
    let config = OrchestratorConfig::from_env().expect("Failed to load configuration");

    tracing::info!(
        location = %config.fleet.location,
        rtsp_stream = %config.fleet.rtsp_stream,
        "Starting fleet orchestrator"
    );

    let bin_dir = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("."));
    let plan = FleetPlan::from_config(&config, &bin_dir).expect("Invalid fleet plan");

    let bus = Arc::new(
        RedisStreamBus::new(&config.bus.redis_url()).expect("Failed to initialize Redis client"),
    );
    bus.ping().await.expect("Redis is not reachable");

    let orchestrator = FleetOrchestrator::new(bus, plan);

    let interrupt = CancellationToken::new();
    tokio::spawn({
        let interrupt = interrupt.clone();
        async move {
            wait_for_signal().await;
            tracing::info!("Interrupt received, shutting down");
            interrupt.cancel();
        }
    });

    let code = match orchestrator.run(interrupt).await {
        Ok(exit) => {
            tracing::info!(exit = ?exit, "Fleet stopped");
            exit.exit_code()
        }
        Err(e) => {
            tracing::error!(error = %e, "Fleet failed");
            1
        }
    };
    std::process::exit(code);
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable, listening for Ctrl+C only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
