use std::time::Duration;
use tracing_subscriber::EnvFilter;

use vehicle_sentinel::config::MonitorConfig;
use vehicle_sentinel::fleet::topology::consumer_groups;
use vehicle_sentinel::services::bus::RedisStreamBus;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = MonitorConfig::from_env().expect("Failed to load configuration");
    let bus = RedisStreamBus::new(&config.bus.redis_url()).expect("Failed to initialize Redis client");
    let mut ticker =
        tokio::time::interval(Duration::from_secs(config.monitor.monitor_interval_secs));

    tracing::info!("Stream monitor started");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => report(&bus).await,
        }
    }
    tracing::info!("Stream monitor stopped");
}

async fn report(bus: &RedisStreamBus) {
    for (topic, groups) in consumer_groups() {
        let length = match bus.stream_len(topic).await {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(topic, error = %e, "Failed to read stream length");
                continue;
            }
        };
        for group in groups {
            match bus.pending_count(topic, group).await {
                Ok(pending) => tracing::info!(topic, group, length, pending, "Stream status"),
                Err(e) => tracing::warn!(topic, group, error = %e, "Failed to read pending count"),
            }
        }
    }
}
