use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use crate::models::vehicle::VehicleRecord;

/// Insert a completed vehicle. Returns `false` when a row with the same
/// `vehicle_id` already exists; the existing row is left untouched.
pub async fn insert_vehicle(pool: &PgPool, record: &VehicleRecord) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        INSERT INTO vehicles (vehicle_id, vehicle_type, keyframe_url, plate_url,
                              color, color_hex, vehicle_number, model, location, timestamp, status)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, COALESCE($10, CURRENT_TIMESTAMP), $11)
        ON CONFLICT (vehicle_id) DO NOTHING
        "#,
    )
    .bind(&record.vehicle_id)
    .bind(&record.vehicle_type)
    .bind(&record.keyframe_url)
    .bind(&record.plate_url)
    .bind(&record.color)
    .bind(&record.color_hex)
    .bind(&record.vehicle_number)
    .bind(&record.model)
    .bind(&record.location)
    .bind(record.timestamp)
    .bind(&record.status)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Get a vehicle by its durable id
pub async fn get_vehicle(
    pool: &PgPool,
    vehicle_id: &str,
) -> Result<Option<VehicleRecord>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT vehicle_id, vehicle_type, keyframe_url, plate_url, color, color_hex,
               vehicle_number, model, location, timestamp, status
        FROM vehicles
        WHERE vehicle_id = $1
        "#,
    )
    .bind(vehicle_id)
    .fetch_optional(pool)
    .await?;

    row.map(|r| vehicle_from_row(&r)).transpose()
}

/// Most recent sightings, newest first
pub async fn list_recent_vehicles(
    pool: &PgPool,
    limit: i64,
) -> Result<Vec<VehicleRecord>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT vehicle_id, vehicle_type, keyframe_url, plate_url, color, color_hex,
               vehicle_number, model, location, timestamp, status
        FROM vehicles
        ORDER BY timestamp DESC
        LIMIT $1
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.iter().map(vehicle_from_row).collect()
}

fn vehicle_from_row(r: &PgRow) -> Result<VehicleRecord, sqlx::Error> {
    let text = |column: &str| -> Result<String, sqlx::Error> {
        Ok(r.try_get::<Option<String>, _>(column)?.unwrap_or_default())
    };

    Ok(VehicleRecord {
        vehicle_id: r.try_get("vehicle_id")?,
        vehicle_type: r.try_get("vehicle_type")?,
        keyframe_url: text("keyframe_url")?,
        plate_url: text("plate_url")?,
        color: text("color")?,
        color_hex: text("color_hex")?,
        vehicle_number: text("vehicle_number")?,
        model: text("model")?,
        location: text("location")?,
        timestamp: r.try_get("timestamp")?,
        status: text("status")?,
    })
}
