//! Result aggregation engine.
//!
//! Consumes worker results from the results topic, joins them per job, and
//! on completion persists the vehicle record, hands it to the live feed,
//! publishes a completion ack and forgets the job. Runs as a single
//! consumer; the tracker it owns is never shared.
//!
//! On startup and after any bus failure the engine first drains results
//! delivered to its consumer but never acked, then resumes with new ones.

use chrono::Local;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::db::{InsertOutcome, StoreError, VehicleStore};
use crate::models::job::{expected_workers, vehicle_type_of};
use crate::models::result::{CompletionAck, WorkerResult, WorkerStatus};
use crate::models::vehicle::VehicleRecord;
use crate::services::bus::{
    self, BusError, BusMessage, MessageBus, StreamMessage, AGGREGATOR_GROUP, BATCH_SIZE,
    BLOCK_TIME, RESULTS_TOPIC,
};
use crate::services::identity::AssetUrls;
use crate::services::live::LiveFeedPublisher;
use crate::services::tracker::{JobMetadata, JobTracker};

pub const RESULTS_RECEIVED: &str = "aggregator_results_received_total";
pub const JOBS_COMPLETED: &str = "aggregator_jobs_completed_total";
pub const JOBS_EVICTED: &str = "aggregator_jobs_evicted_total";
pub const UNPERSISTED_EVICTED: &str = "aggregator_unpersisted_jobs_evicted_total";
pub const PERSIST_FAILURES: &str = "aggregator_persist_failures_total";
pub const LIVE_UPDATES_DROPPED: &str = "aggregator_live_updates_dropped_total";
pub const LATE_DUPLICATES: &str = "aggregator_late_duplicates_total";
pub const PENDING_JOBS: &str = "aggregator_pending_jobs";
pub const JOB_ASSEMBLY_SECONDS: &str = "aggregator_job_assembly_seconds";

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Consumer name within the aggregator group.
    pub consumer: String,
    pub batch_size: usize,
    pub block: Duration,
    /// Pause after a failed bus read before trying again.
    pub retry_backoff: Duration,
    /// Pending jobs older than this are evicted.
    pub pending_ttl: Duration,
    pub sweep_interval: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            consumer: "aggregator_1".to_string(),
            batch_size: BATCH_SIZE,
            block: BLOCK_TIME,
            retry_backoff: Duration::from_secs(1),
            pending_ttl: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

/// What applying one worker result did.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Still waiting on other workers.
    Accumulating { received: usize, expected: usize },
    /// Persisted for the first time and handed to the live feed.
    Completed(VehicleRecord),
    /// The store already held this vehicle; nothing was broadcast.
    AlreadyPersisted,
    /// A result for a job completed earlier; ignored.
    LateDuplicate,
}

/// Why the retention sweep dropped a pending job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eviction {
    /// At least one expected worker never reported.
    Incomplete,
    /// Every expected worker reported but the record was never written.
    Unpersisted,
}

pub struct AggregationEngine<B, S> {
    bus: Arc<B>,
    store: S,
    live: LiveFeedPublisher,
    urls: AssetUrls,
    tracker: JobTracker,
    settings: EngineSettings,
    last_sweep: Instant,
    /// Unacked deliveries to this consumer are read before new entries.
    replaying: bool,
}

impl<B, S> AggregationEngine<B, S>
where
    B: MessageBus + 'static,
    S: VehicleStore,
{
    pub fn new(
        bus: Arc<B>,
        store: S,
        live: LiveFeedPublisher,
        urls: AssetUrls,
        settings: EngineSettings,
    ) -> Self {
        Self {
            bus,
            store,
            live,
            urls,
            tracker: JobTracker::new(settings.pending_ttl),
            settings,
            last_sweep: Instant::now(),
            replaying: true,
        }
    }

    pub fn tracker(&self) -> &JobTracker {
        &self.tracker
    }

    /// Consume until `shutdown` fires. Cancellation is observed between
    /// batches, so a message is never abandoned half-processed.
    pub async fn run(mut self, shutdown: CancellationToken) {
        tracing::info!(consumer = %self.settings.consumer, "Aggregator started");

        while !shutdown.is_cancelled() {
            match self.poll_once().await {
                Ok(n) if n > 0 => tracing::trace!(messages = n, "Processed batch"),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "Bus read failed, retrying");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.settings.retry_backoff) => {}
                    }
                }
            }
            self.sweep_if_due().await;
        }

        tracing::info!(pending = self.tracker.len(), "Aggregator stopped");
    }

    /// Read one batch and process it. Every delivered message is acked
    /// whether or not its processing succeeded. A bus failure switches the
    /// next read back to unacked deliveries.
    pub async fn poll_once(&mut self) -> Result<usize, BusError> {
        let processed = self.process_batch().await;
        if processed.is_err() {
            self.replaying = true;
        }
        processed
    }

    async fn next_batch(&mut self) -> Result<Vec<BusMessage>, BusError> {
        if self.replaying {
            let pending = self
                .bus
                .read_pending(
                    RESULTS_TOPIC,
                    AGGREGATOR_GROUP,
                    &self.settings.consumer,
                    self.settings.batch_size,
                )
                .await?;
            if !pending.is_empty() {
                tracing::info!(messages = pending.len(), "Replaying unacknowledged results");
                return Ok(pending);
            }
            self.replaying = false;
        }

        self.bus
            .read_group(
                RESULTS_TOPIC,
                AGGREGATOR_GROUP,
                &self.settings.consumer,
                self.settings.batch_size,
                self.settings.block,
            )
            .await
    }

    async fn process_batch(&mut self) -> Result<usize, BusError> {
        let batch = self.next_batch().await?;

        for message in &batch {
            if let Err(e) = self.handle_message(message).await {
                e.report(&message.id);
            }
            if let Err(e) = self.bus.ack(RESULTS_TOPIC, AGGREGATOR_GROUP, &message.id).await {
                tracing::warn!(message_id = %message.id, error = %e, "Failed to ack result");
            }
        }
        Ok(batch.len())
    }

    pub async fn handle_message(&mut self, message: &BusMessage) -> Result<Outcome, EngineError> {
        let result = WorkerResult::from_fields(&message.fields)?;
        self.apply(result).await
    }

    /// Apply one worker result to its job, completing the job if this was
    /// the last expected result.
    pub async fn apply(&mut self, result: WorkerResult) -> Result<Outcome, EngineError> {
        metrics::counter!(RESULTS_RECEIVED).increment(1);
        tracing::info!(
            job_id = %result.job_id,
            worker = %result.worker,
            result = %result.result,
            "Received result"
        );

        if self.tracker.was_completed(&result.job_id) {
            metrics::counter!(LATE_DUPLICATES).increment(1);
            tracing::debug!(job_id = %result.job_id, worker = %result.worker, "Result for completed job ignored");
            return Ok(Outcome::LateDuplicate);
        }

        // Failed workers still fill their slot.
        if result.status == WorkerStatus::Error {
            tracing::warn!(
                job_id = %result.job_id,
                worker = %result.worker,
                error = result.error.as_deref().unwrap_or(""),
                "Worker reported an error"
            );
        }

        let today = Local::now().date_naive();
        let urls = &self.urls;
        let job = self
            .tracker
            .entry_or_create(&result.job_id, || JobMetadata::resolve(&result, urls, today));
        if job.metadata.vehicle_id.is_empty() && !result.vehicle_id.is_empty() {
            job.metadata = JobMetadata::resolve(&result, urls, today);
        }
        job.record(&result.worker, &result.result);

        let vehicle_type = vehicle_type_of(&result.job_id);
        let expected = expected_workers(vehicle_type);
        if !job.is_satisfied(expected) {
            let received = job.received().len();
            metrics::gauge!(PENDING_JOBS).set(self.tracker.len() as f64);
            return Ok(Outcome::Accumulating {
                received,
                expected: expected.len(),
            });
        }

        tracing::info!(job_id = %result.job_id, received = ?job.received(), "All results received");
        let record = job.assemble(vehicle_type);
        let age = job.age();
        self.complete(&result.job_id, record, age).await
    }

    async fn complete(
        &mut self,
        job_id: &str,
        record: VehicleRecord,
        age: Duration,
    ) -> Result<Outcome, EngineError> {
        let inserted = match self.store.insert_vehicle(&record).await {
            Ok(inserted) => inserted,
            Err(source) => {
                if let Some(job) = self.tracker.get_mut(job_id) {
                    job.note_persist_failure();
                }
                return Err(EngineError::Persist {
                    job_id: job_id.to_string(),
                    source,
                });
            }
        };

        let outcome = match inserted {
            InsertOutcome::Inserted => {
                tracing::info!(job_id, vehicle_id = %record.vehicle_id, "Saved to database");
                metrics::counter!(JOBS_COMPLETED).increment(1);
                metrics::histogram!(JOB_ASSEMBLY_SECONDS).record(age.as_secs_f64());

                if let Err(e) = self.live.publish(record.clone()) {
                    metrics::counter!(LIVE_UPDATES_DROPPED).increment(1);
                    tracing::warn!(job_id, error = %e, "Live update dropped");
                }
                Outcome::Completed(record)
            }
            InsertOutcome::AlreadyPresent => {
                tracing::warn!(job_id, vehicle_id = %record.vehicle_id, "Vehicle already persisted, not broadcasting");
                Outcome::AlreadyPersisted
            }
        };

        if let Err(e) = bus::publish_message(&*self.bus, &CompletionAck::completed(job_id)).await {
            tracing::warn!(job_id, error = %e, "Failed to publish completion ack");
        }

        self.tracker.finish(job_id);
        metrics::gauge!(PENDING_JOBS).set(self.tracker.len() as f64);
        Ok(outcome)
    }

    async fn sweep_if_due(&mut self) {
        if self.last_sweep.elapsed() >= self.settings.sweep_interval {
            self.retry_unpersisted().await;
            self.sweep_expired();
        }
    }

    /// Try again to persist jobs whose record failed to write. Returns how
    /// many completed now.
    pub async fn retry_unpersisted(&mut self) -> usize {
        let mut completed = 0;
        for job_id in self.tracker.awaiting_persist() {
            let Some(job) = self.tracker.get(&job_id) else {
                continue;
            };
            let record = job.assemble(vehicle_type_of(&job_id));
            let age = job.age();
            match self.complete(&job_id, record, age).await {
                Ok(_) => completed += 1,
                Err(e) => {
                    metrics::counter!(PERSIST_FAILURES).increment(1);
                    tracing::warn!(job_id = %job_id, error = %e, "Persist retry failed");
                }
            }
        }
        completed
    }

    /// Evict pending jobs past the retention window.
    pub fn sweep_expired(&mut self) -> Vec<(String, Eviction)> {
        self.last_sweep = Instant::now();
        let evicted = self.tracker.evict_expired();

        let mut report = Vec::with_capacity(evicted.len());
        for e in evicted {
            let cause = if e.job.persist_failures() > 0 {
                metrics::counter!(UNPERSISTED_EVICTED).increment(1);
                tracing::error!(
                    job_id = %e.job_id,
                    vehicle_id = %e.job.metadata.vehicle_id,
                    attempts = e.job.persist_failures(),
                    age_secs = e.job.age().as_secs(),
                    "Evicting completed job, persist never succeeded"
                );
                Eviction::Unpersisted
            } else {
                let missing: Vec<&'static str> = e
                    .job
                    .missing(expected_workers(vehicle_type_of(&e.job_id)))
                    .into_iter()
                    .map(<&'static str>::from)
                    .collect();
                metrics::counter!(JOBS_EVICTED).increment(1);
                tracing::warn!(
                    job_id = %e.job_id,
                    vehicle_id = %e.job.metadata.vehicle_id,
                    missing = ?missing,
                    age_secs = e.job.age().as_secs(),
                    "Evicting job that never completed"
                );
                Eviction::Incomplete
            };
            report.push((e.job_id, cause));
        }

        if !report.is_empty() {
            metrics::gauge!(PENDING_JOBS).set(self.tracker.len() as f64);
        }
        report
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Malformed result message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Failed to persist job {job_id}: {source}")]
    Persist {
        job_id: String,
        #[source]
        source: StoreError,
    },
}

impl EngineError {
    /// Log according to the per-kind policy. A malformed message is dropped;
    /// a persistence failure keeps the job pending so a later result for it
    /// retries completion.
    fn report(&self, message_id: &str) {
        match self {
            EngineError::Malformed(e) => {
                tracing::warn!(message_id, error = %e, "Dropping malformed result");
            }
            EngineError::Persist { job_id, source } => {
                metrics::counter!(PERSIST_FAILURES).increment(1);
                tracing::error!(message_id, job_id = %job_id, error = %source, "Failed to persist completed job");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::bus::{GroupStart, InMemoryBus};
    use crate::services::live::LiveFeed;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryStore {
        rows: Mutex<Vec<VehicleRecord>>,
        fail: Mutex<bool>,
    }

    #[async_trait]
    impl VehicleStore for MemoryStore {
        async fn insert_vehicle(&self, record: &VehicleRecord) -> Result<InsertOutcome, StoreError> {
            if *self.fail.lock().unwrap() {
                return Err(StoreError::Unavailable("down".into()));
            }
            let mut rows = self.rows.lock().unwrap();
            if rows.iter().any(|r| r.vehicle_id == record.vehicle_id) {
                return Ok(InsertOutcome::AlreadyPresent);
            }
            rows.push(record.clone());
            Ok(InsertOutcome::Inserted)
        }
    }

    const VEHICLE_ID: &str = "ab12cd34_20240101_120000_car_SITE1";

    async fn engine(
        settings: EngineSettings,
    ) -> (
        AggregationEngine<InMemoryBus, Arc<MemoryStore>>,
        Arc<InMemoryBus>,
        Arc<MemoryStore>,
        LiveFeed,
    ) {
        let bus = Arc::new(InMemoryBus::new());
        bus.create_group(RESULTS_TOPIC, AGGREGATOR_GROUP, GroupStart::Beginning, true)
            .await
            .unwrap();
        let store = Arc::new(MemoryStore::default());
        let (feed, _task) = LiveFeed::spawn(16, 16);
        let engine = AggregationEngine::new(
            bus.clone(),
            store.clone(),
            feed.publisher(),
            AssetUrls::new("http://localhost:8000/static"),
            settings,
        );
        (engine, bus, store, feed)
    }

    #[tokio::test]
    async fn test_car_completes_after_three_workers() {
        let (mut engine, bus, store, _feed) = engine(EngineSettings::default()).await;

        let first = engine
            .apply(WorkerResult::ok("car_17_ab12cd34", VEHICLE_ID, "logo", "Toyota"))
            .await
            .unwrap();
        assert_eq!(first, Outcome::Accumulating { received: 1, expected: 3 });
        engine
            .apply(WorkerResult::ok("car_17_ab12cd34", VEHICLE_ID, "color", "blue|#0000FF"))
            .await
            .unwrap();
        let last = engine
            .apply(WorkerResult::ok("car_17_ab12cd34", VEHICLE_ID, "ocr", "KA01AB1234"))
            .await
            .unwrap();

        let Outcome::Completed(record) = last else {
            panic!("expected completion, got {last:?}");
        };
        assert_eq!(record.vehicle_number, "KA01AB1234");
        assert_eq!(record.color, "blue");
        assert_eq!(record.color_hex, "#0000FF");
        assert_eq!(record.model, "Toyota");
        assert_eq!(record.location, "SITE1");
        assert_eq!(record.vehicle_type, "car");
        assert!(engine.tracker().is_empty());
        assert_eq!(store.rows.lock().unwrap().len(), 1);

        let acks = bus.entries(crate::services::bus::ACK_TOPIC);
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].fields["job_id"], "car_17_ab12cd34");
        assert_eq!(acks[0].fields["status"], "completed");
    }

    #[tokio::test]
    async fn test_non_car_completes_on_plate_alone() {
        let (mut engine, _bus, store, _feed) = engine(EngineSettings::default()).await;
        let outcome = engine
            .apply(WorkerResult::ok("bus_4_ffee0011", "x_20240101_120000_bus_DEPOT", "ocr", "KL07"))
            .await
            .unwrap();
        assert!(matches!(outcome, Outcome::Completed(_)));
        let rows = store.rows.lock().unwrap();
        assert_eq!(rows[0].color, "unknown");
        assert_eq!(rows[0].model, "");
    }

    #[tokio::test]
    async fn test_error_result_fills_slot() {
        let (mut engine, _bus, store, _feed) = engine(EngineSettings::default()).await;
        let outcome = engine
            .apply(WorkerResult::failed("truck_9_aa", "x_20240101_120000_truck_S", "ocr", "boom"))
            .await
            .unwrap();
        assert!(matches!(outcome, Outcome::Completed(_)));
        assert_eq!(store.rows.lock().unwrap()[0].vehicle_number, "");
    }

    #[tokio::test]
    async fn test_late_duplicate_does_not_complete_again() {
        let (mut engine, _bus, store, _feed) = engine(EngineSettings::default()).await;
        let job = WorkerResult::ok("bike_2_cc", "x_20240101_120000_bike_S", "ocr", "KL01");
        engine.apply(job.clone()).await.unwrap();
        let again = engine.apply(job).await.unwrap();
        assert_eq!(again, Outcome::LateDuplicate);
        assert_eq!(store.rows.lock().unwrap().len(), 1);
        assert!(engine.tracker().is_empty());
    }

    #[tokio::test]
    async fn test_persist_failure_keeps_job_pending() {
        let (mut engine, bus, store, _feed) = engine(EngineSettings::default()).await;
        *store.fail.lock().unwrap() = true;

        let err = engine
            .apply(WorkerResult::ok("auto_1_dd", "x_20240101_120000_auto_S", "ocr", "KL02"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Persist { .. }));
        assert_eq!(engine.tracker().len(), 1);
        assert!(bus.entries(crate::services::bus::ACK_TOPIC).is_empty());

        *store.fail.lock().unwrap() = false;
        let retried = engine
            .apply(WorkerResult::ok("auto_1_dd", "x_20240101_120000_auto_S", "ocr", "KL02"))
            .await
            .unwrap();
        assert!(matches!(retried, Outcome::Completed(_)));
    }

    #[tokio::test]
    async fn test_poll_acks_malformed_and_valid_messages() {
        let (mut engine, bus, store, _feed) = engine(EngineSettings {
            block: Duration::from_millis(10),
            ..EngineSettings::default()
        })
        .await;

        bus.publish(RESULTS_TOPIC, &[("worker".to_string(), "ocr".to_string())])
            .await
            .unwrap();
        bus::publish_message(
            &*bus,
            &WorkerResult::ok("bus_1_ab", "x_20240101_120000_bus_S", "ocr", "KL03"),
        )
        .await
        .unwrap();

        assert_eq!(engine.poll_once().await.unwrap(), 2);
        assert_eq!(bus.pending_count(RESULTS_TOPIC, AGGREGATOR_GROUP), 0);
        assert_eq!(store.rows.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_evicts_stale_jobs() {
        let (mut engine, _bus, _store, _feed) = engine(EngineSettings {
            pending_ttl: Duration::ZERO,
            ..EngineSettings::default()
        })
        .await;
        engine
            .apply(WorkerResult::ok("car_5_ee", VEHICLE_ID, "ocr", "KA05"))
            .await
            .unwrap();
        assert_eq!(
            engine.sweep_expired(),
            vec![("car_5_ee".to_string(), Eviction::Incomplete)]
        );
        assert!(engine.tracker().is_empty());
    }

    #[tokio::test]
    async fn test_vehicle_id_adopted_when_first_result_lacked_it() {
        let (mut engine, _bus, store, _feed) = engine(EngineSettings::default()).await;
        engine
            .apply(WorkerResult::failed("car_6_ff", "", "logo", "no logo"))
            .await
            .unwrap();
        engine
            .apply(WorkerResult::ok("car_6_ff", VEHICLE_ID, "color", "red|#FF0000"))
            .await
            .unwrap();
        engine
            .apply(WorkerResult::ok("car_6_ff", VEHICLE_ID, "ocr", "KA06"))
            .await
            .unwrap();
        let rows = store.rows.lock().unwrap();
        assert_eq!(rows[0].vehicle_id, VEHICLE_ID);
        assert_eq!(rows[0].location, "SITE1");
    }

    #[tokio::test]
    async fn test_sweep_retries_failed_persist() {
        let (mut engine, bus, store, feed) = engine(EngineSettings::default()).await;
        let mut updates = feed.subscribe();
        *store.fail.lock().unwrap() = true;

        engine
            .apply(WorkerResult::ok("auto_7_aa", "x_20240101_120000_auto_S", "ocr", "KL07"))
            .await
            .unwrap_err();
        assert_eq!(engine.retry_unpersisted().await, 0);
        assert_eq!(engine.tracker().len(), 1);

        // No further result arrives; the retry alone completes the job.
        *store.fail.lock().unwrap() = false;
        assert_eq!(engine.retry_unpersisted().await, 1);
        assert!(engine.tracker().is_empty());
        assert_eq!(store.rows.lock().unwrap().len(), 1);
        assert_eq!(bus.entries(crate::services::bus::ACK_TOPIC).len(), 1);

        let json = tokio::time::timeout(Duration::from_secs(1), updates.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(json.contains("KL07"));
    }

    #[tokio::test]
    async fn test_sweep_tells_unpersisted_from_incomplete() {
        let (mut engine, _bus, store, _feed) = engine(EngineSettings {
            pending_ttl: Duration::ZERO,
            ..EngineSettings::default()
        })
        .await;
        *store.fail.lock().unwrap() = true;

        engine
            .apply(WorkerResult::ok("bike_8_bb", "x_20240101_120000_bike_S", "ocr", "KL08"))
            .await
            .unwrap_err();
        engine
            .apply(WorkerResult::ok("car_9_cc", VEHICLE_ID, "color", "red|#FF0000"))
            .await
            .unwrap();

        let mut evicted = engine.sweep_expired();
        evicted.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            evicted,
            vec![
                ("bike_8_bb".to_string(), Eviction::Unpersisted),
                ("car_9_cc".to_string(), Eviction::Incomplete),
            ]
        );
        assert!(engine.tracker().is_empty());
    }

    #[tokio::test]
    async fn test_unacked_results_replayed_after_restart() {
        let (_first, bus, store, feed) = engine(EngineSettings::default()).await;
        bus::publish_message(
            &*bus,
            &WorkerResult::ok("truck_3_dd", "x_20240101_120000_truck_S", "ocr", "TN03"),
        )
        .await
        .unwrap();

        // Delivered to this consumer, which then dies before acking.
        let delivered = bus
            .read_group(RESULTS_TOPIC, AGGREGATOR_GROUP, "aggregator_1", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(delivered.len(), 1);

        let mut restarted = AggregationEngine::new(
            bus.clone(),
            store.clone(),
            feed.publisher(),
            AssetUrls::new("http://localhost:8000/static"),
            EngineSettings {
                block: Duration::from_millis(10),
                ..EngineSettings::default()
            },
        );
        assert_eq!(restarted.poll_once().await.unwrap(), 1);
        assert_eq!(bus.pending_count(RESULTS_TOPIC, AGGREGATOR_GROUP), 0);
        assert_eq!(store.rows.lock().unwrap()[0].vehicle_number, "TN03");

        // Nothing left to replay; back to new entries.
        assert_eq!(restarted.poll_once().await.unwrap(), 0);
    }
}
