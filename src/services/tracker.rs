//! Per-job accumulation of worker results.
//!
//! Owned by exactly one aggregation engine; no internal locking.

use chrono::{NaiveDate, NaiveDateTime};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use crate::models::job::WorkerKind;
use crate::models::result::WorkerResult;
use crate::models::vehicle::{ColorReading, VehicleRecord};
use crate::services::identity::{self, AssetUrls};

/// Completed job ids remembered to drop late duplicate results.
pub const COMPLETED_MEMORY: usize = 10_000;

/// Job fields captured when the first result for a job arrives.
#[derive(Debug, Clone, PartialEq)]
pub struct JobMetadata {
    pub vehicle_id: String,
    pub location: String,
    pub timestamp: Option<NaiveDateTime>,
    pub keyframe_url: String,
    pub plate_url: String,
}

impl JobMetadata {
    /// Resolve metadata from a result, preferring explicitly supplied values
    /// and otherwise deriving them from the vehicle id.
    pub fn resolve(result: &WorkerResult, urls: &AssetUrls, today: NaiveDate) -> Self {
        let vehicle_id = result.vehicle_id.clone();
        let location = non_empty(&result.location)
            .unwrap_or_else(|| identity::extract_location(&vehicle_id));
        let keyframe_url = non_empty(&result.frame_url)
            .unwrap_or_else(|| urls.keyframe(&vehicle_id, &location, today));
        let plate_url = non_empty(&result.plate_url)
            .unwrap_or_else(|| urls.plate(&vehicle_id, &location, today));

        Self {
            timestamp: identity::extract_timestamp(&vehicle_id),
            vehicle_id,
            location,
            keyframe_url,
            plate_url,
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_deref().filter(|v| !v.trim().is_empty()).map(str::to_string)
}

#[derive(Debug)]
pub struct PendingJob {
    pub metadata: JobMetadata,
    results: HashMap<String, String>,
    first_seen: Instant,
    persist_failures: u32,
}

impl PendingJob {
    fn new(metadata: JobMetadata) -> Self {
        Self {
            metadata,
            results: HashMap::new(),
            first_seen: Instant::now(),
            persist_failures: 0,
        }
    }

    /// Last write wins per worker, so a redelivered result is harmless.
    pub fn record(&mut self, worker: &str, result: &str) {
        self.results.insert(worker.to_string(), result.to_string());
    }

    pub fn result(&self, worker: WorkerKind) -> Option<&str> {
        self.results.get(AsRef::<str>::as_ref(&worker)).map(String::as_str)
    }

    pub fn received(&self) -> Vec<&str> {
        let mut workers: Vec<&str> = self.results.keys().map(String::as_str).collect();
        workers.sort_unstable();
        workers
    }

    pub fn is_satisfied(&self, expected: &[WorkerKind]) -> bool {
        expected.iter().all(|w| self.results.contains_key(AsRef::<str>::as_ref(w)))
    }

    pub fn missing(&self, expected: &[WorkerKind]) -> Vec<WorkerKind> {
        expected
            .iter()
            .copied()
            .filter(|w| !self.results.contains_key(AsRef::<str>::as_ref(w)))
            .collect()
    }

    pub fn age(&self) -> Duration {
        self.first_seen.elapsed()
    }

    /// The job completed but its record could not be written.
    pub fn note_persist_failure(&mut self) {
        self.persist_failures += 1;
    }

    pub fn persist_failures(&self) -> u32 {
        self.persist_failures
    }

    /// Build the persisted record from the accumulated results.
    pub fn assemble(&self, vehicle_type: &str) -> VehicleRecord {
        let color = ColorReading::parse(self.result(WorkerKind::Color).unwrap_or("unknown|#000000"));
        VehicleRecord {
            vehicle_id: self.metadata.vehicle_id.clone(),
            vehicle_type: vehicle_type.to_string(),
            keyframe_url: self.metadata.keyframe_url.clone(),
            plate_url: self.metadata.plate_url.clone(),
            color: color.name,
            color_hex: color.hex,
            vehicle_number: self.result(WorkerKind::Ocr).unwrap_or_default().to_string(),
            model: self.result(WorkerKind::Logo).unwrap_or_default().to_string(),
            location: self.metadata.location.clone(),
            timestamp: self.metadata.timestamp,
            status: "completed".to_string(),
        }
    }
}

/// A pending job dropped by the retention sweep.
#[derive(Debug)]
pub struct EvictedJob {
    pub job_id: String,
    pub job: PendingJob,
}

#[derive(Debug)]
pub struct JobTracker {
    pending: HashMap<String, PendingJob>,
    completed: HashSet<String>,
    completed_order: VecDeque<String>,
    completed_capacity: usize,
    ttl: Duration,
}

impl JobTracker {
    pub fn new(ttl: Duration) -> Self {
        Self::with_completed_capacity(ttl, COMPLETED_MEMORY)
    }

    pub fn with_completed_capacity(ttl: Duration, completed_capacity: usize) -> Self {
        Self {
            pending: HashMap::new(),
            completed: HashSet::new(),
            completed_order: VecDeque::new(),
            completed_capacity,
            ttl,
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn get(&self, job_id: &str) -> Option<&PendingJob> {
        self.pending.get(job_id)
    }

    pub fn get_mut(&mut self, job_id: &str) -> Option<&mut PendingJob> {
        self.pending.get_mut(job_id)
    }

    /// Complete jobs still waiting for their record to be written.
    pub fn awaiting_persist(&self) -> Vec<String> {
        self.pending
            .iter()
            .filter(|(_, job)| job.persist_failures > 0)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn was_completed(&self, job_id: &str) -> bool {
        self.completed.contains(job_id)
    }

    /// Pending record for `job_id`, created from `metadata` on first sight.
    pub fn entry_or_create(
        &mut self,
        job_id: &str,
        metadata: impl FnOnce() -> JobMetadata,
    ) -> &mut PendingJob {
        self.pending
            .entry(job_id.to_string())
            .or_insert_with(|| PendingJob::new(metadata()))
    }

    /// Remove a completed job and remember its id.
    pub fn finish(&mut self, job_id: &str) -> Option<PendingJob> {
        let job = self.pending.remove(job_id)?;
        if self.completed_capacity > 0 && self.completed.insert(job_id.to_string()) {
            self.completed_order.push_back(job_id.to_string());
            while self.completed_order.len() > self.completed_capacity {
                if let Some(oldest) = self.completed_order.pop_front() {
                    self.completed.remove(&oldest);
                }
            }
        }
        Some(job)
    }

    /// Drop pending jobs older than the retention window.
    pub fn evict_expired(&mut self) -> Vec<EvictedJob> {
        let ttl = self.ttl;
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, job)| job.age() >= ttl)
            .map(|(id, _)| id.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|job_id| {
                self.pending
                    .remove(&job_id)
                    .map(|job| EvictedJob { job_id, job })
            })
            .collect()
    }
}
