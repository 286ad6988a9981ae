use async_trait::async_trait;
use sqlx::PgPool;
use std::sync::Arc;

use super::queries;
use crate::models::vehicle::VehicleRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A record with this vehicle id was persisted earlier.
    AlreadyPresent,
}

/// Write contract the aggregation engine persists completed records through.
#[async_trait]
pub trait VehicleStore: Send + Sync {
    async fn insert_vehicle(&self, record: &VehicleRecord) -> Result<InsertOutcome, StoreError>;
}

#[async_trait]
impl VehicleStore for PgPool {
    async fn insert_vehicle(&self, record: &VehicleRecord) -> Result<InsertOutcome, StoreError> {
        let inserted = queries::insert_vehicle(self, record).await?;
        Ok(if inserted {
            InsertOutcome::Inserted
        } else {
            InsertOutcome::AlreadyPresent
        })
    }
}

#[async_trait]
impl<S: VehicleStore + ?Sized> VehicleStore for Arc<S> {
    async fn insert_vehicle(&self, record: &VehicleRecord) -> Result<InsertOutcome, StoreError> {
        (**self).insert_vehicle(record).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}
