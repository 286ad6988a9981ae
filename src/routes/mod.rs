pub mod health;
pub mod live;
pub mod metrics;
pub mod system;
pub mod vehicles;

use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::app_state::AppState;

/// Every HTTP route the aggregator serves.
pub fn router(state: AppState, prometheus: Arc<PrometheusHandle>) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/internal/system-ready", post(system::mark_system_ready))
        .route("/api/system/status", get(system::system_status))
        .route("/api/vehicles", get(vehicles::list_vehicles))
        .route("/api/vehicles/{vehicle_id}", get(vehicles::get_vehicle))
        .route("/ws/vehicles", get(live::vehicle_updates))
        .with_state(state)
        .route(
            "/metrics",
            get(metrics::prometheus_metrics).with_state(prometheus),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
