use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;

use crate::app_state::AppState;
use crate::db::queries;
use crate::models::vehicle::VehicleRecord;

const DEFAULT_LIMIT: i64 = 100;
const MAX_LIMIT: i64 = 1000;

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub limit: Option<i64>,
}

/// GET /api/vehicles — most recent sightings first.
pub async fn list_vehicles(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<VehicleRecord>>, StatusCode> {
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    queries::list_recent_vehicles(&state.db, limit)
        .await
        .map(Json)
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to list vehicles");
            StatusCode::INTERNAL_SERVER_ERROR
        })
}

/// GET /api/vehicles/{vehicle_id}
pub async fn get_vehicle(
    State(state): State<AppState>,
    Path(vehicle_id): Path<String>,
) -> Result<Json<VehicleRecord>, StatusCode> {
    match queries::get_vehicle(&state.db, &vehicle_id).await {
        Ok(Some(vehicle)) => Ok(Json(vehicle)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!(vehicle_id, error = %e, "Failed to load vehicle");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
