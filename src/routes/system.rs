use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::app_state::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct SystemStatus {
    pub ready: bool,
}

/// POST /internal/system-ready — called by the orchestrator once ingestion
/// is live. Idempotent.
pub async fn mark_system_ready(State(state): State<AppState>) -> Json<SystemStatus> {
    if state.readiness.mark_ready() {
        tracing::info!("System marked ready, admitting live subscribers");
    } else {
        tracing::debug!("System already ready");
    }
    Json(SystemStatus { ready: true })
}

/// GET /api/system/status
pub async fn system_status(State(state): State<AppState>) -> Json<SystemStatus> {
    Json(SystemStatus {
        ready: state.readiness.is_ready(),
    })
}
