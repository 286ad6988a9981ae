//! Shared fixtures for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use vehicle_sentinel::db::{InsertOutcome, StoreError, VehicleStore};
use vehicle_sentinel::models::job::JobMessage;
use vehicle_sentinel::models::vehicle::VehicleRecord;
use vehicle_sentinel::services::aggregator::{AggregationEngine, EngineSettings};
use vehicle_sentinel::services::bus::{GroupStart, InMemoryBus, MessageBus, AGGREGATOR_GROUP, RESULTS_TOPIC};
use vehicle_sentinel::services::identity::AssetUrls;
use vehicle_sentinel::services::live::LiveFeed;

pub const STATIC_BASE: &str = "http://localhost:8000/static";

/// Insert-once store that keeps rows in memory.
#[derive(Default)]
pub struct RecordingStore {
    rows: Mutex<Vec<VehicleRecord>>,
}

impl RecordingStore {
    pub fn rows(&self) -> Vec<VehicleRecord> {
        self.rows.lock().unwrap().clone()
    }
}

#[async_trait]
impl VehicleStore for RecordingStore {
    async fn insert_vehicle(&self, record: &VehicleRecord) -> Result<InsertOutcome, StoreError> {
        let mut rows = self.rows.lock().unwrap();
        if rows.iter().any(|r| r.vehicle_id == record.vehicle_id) {
            return Ok(InsertOutcome::AlreadyPresent);
        }
        rows.push(record.clone());
        Ok(InsertOutcome::Inserted)
    }
}

/// Store that is always down.
pub struct FailingStore;

#[async_trait]
impl VehicleStore for FailingStore {
    async fn insert_vehicle(&self, _record: &VehicleRecord) -> Result<InsertOutcome, StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }
}

pub fn job(job_id: &str, vehicle_id: &str) -> JobMessage {
    JobMessage {
        job_id: job_id.to_string(),
        vehicle_id: vehicle_id.to_string(),
        vehicle_type: job_id.split('_').next().unwrap_or_default().to_string(),
        frame_path: None,
        frame_url: None,
        plate_path: None,
        plate_url: None,
        timestamp: None,
        location: None,
    }
}

pub fn fast_settings() -> EngineSettings {
    EngineSettings {
        block: Duration::from_millis(20),
        retry_backoff: Duration::from_millis(20),
        ..EngineSettings::default()
    }
}

pub struct Harness<S> {
    pub bus: Arc<InMemoryBus>,
    pub store: Arc<S>,
    pub feed: LiveFeed,
    pub engine: AggregationEngine<InMemoryBus, Arc<S>>,
}

pub async fn harness<S: VehicleStore + 'static>(store: S) -> Harness<S> {
    let bus = Arc::new(InMemoryBus::new());
    bus.create_group(RESULTS_TOPIC, AGGREGATOR_GROUP, GroupStart::Beginning, true)
        .await
        .unwrap();
    let store = Arc::new(store);
    let (feed, _fan_out) = LiveFeed::spawn(64, 64);
    let engine = AggregationEngine::new(
        bus.clone(),
        store.clone(),
        feed.publisher(),
        AssetUrls::new(STATIC_BASE),
        fast_settings(),
    );
    Harness {
        bus,
        store,
        feed,
        engine,
    }
}
