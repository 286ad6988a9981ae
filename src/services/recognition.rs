//! Recognition worker protocol: take a job from the role's consumer group,
//! run the recognizer on it, publish exactly one result, ack.
//!
//! A job is acked only after its result is on the bus. Jobs left unacked by
//! a crash or a failed publish are read again before any new job.

use async_trait::async_trait;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::models::job::{vehicle_type_of, JobMessage, WorkerKind};
use crate::models::result::WorkerResult;
use crate::services::bus::{self, BusError, BusMessage, MessageBus, StreamMessage, JOBS_TOPIC};

/// Black-box recognition model.
#[async_trait]
pub trait Recognizer: Send + Sync {
    async fn recognize(&self, job: &JobMessage) -> Result<String, RecognizerError>;
}

/// Runs an external command as `<program> <args..> <frame_path> <plate_path>`
/// and takes its trimmed stdout as the result.
#[derive(Debug, Clone)]
pub struct CommandRecognizer {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandRecognizer {
    pub fn from_command(command: &str, timeout: Duration) -> Result<Self, RecognizerError> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next().ok_or(RecognizerError::EmptyCommand)?;
        Ok(Self {
            program,
            args: parts.collect(),
            timeout,
        })
    }
}

#[async_trait]
impl Recognizer for CommandRecognizer {
    async fn recognize(&self, job: &JobMessage) -> Result<String, RecognizerError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(job.frame_path.as_deref().unwrap_or_default())
            .arg(job.plate_path.as_deref().unwrap_or_default())
            .env("JOB_ID", &job.job_id)
            .env("VEHICLE_ID", &job.vehicle_id)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| RecognizerError::Timeout(self.timeout))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RecognizerError::Failed {
                code: output.status.code(),
                stderr: stderr.lines().take(5).collect::<Vec<_>>().join("\n"),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

pub struct RecognitionWorker<B, R> {
    bus: Arc<B>,
    recognizer: R,
    kind: WorkerKind,
    consumer: String,
    block: Duration,
    retry_backoff: Duration,
    replaying: AtomicBool,
}

impl<B, R> RecognitionWorker<B, R>
where
    B: MessageBus + 'static,
    R: Recognizer,
{
    pub fn new(bus: Arc<B>, recognizer: R, kind: WorkerKind, consumer: impl Into<String>) -> Self {
        Self {
            bus,
            recognizer,
            kind,
            consumer: consumer.into(),
            block: bus::BLOCK_TIME,
            retry_backoff: Duration::from_secs(1),
            replaying: AtomicBool::new(true),
        }
    }

    pub fn with_block(mut self, block: Duration) -> Self {
        self.block = block;
        self
    }

    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(role = %self.kind, consumer = %self.consumer, "Worker started");
        while !shutdown.is_cancelled() {
            if let Err(e) = self.poll_once().await {
                tracing::warn!(role = %self.kind, error = %e, "Bus error, retrying");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.retry_backoff) => {}
                }
            }
        }
        tracing::info!(role = %self.kind, "Worker stopped");
    }

    /// Handle at most one job. Returns how many jobs were read.
    pub async fn poll_once(&self) -> Result<usize, BusError> {
        let processed = self.process_next().await;
        if processed.is_err() {
            self.replaying.store(true, Ordering::Relaxed);
        }
        processed
    }

    async fn next_job(&self) -> Result<Vec<BusMessage>, BusError> {
        let group = self.kind.consumer_group();
        if self.replaying.load(Ordering::Relaxed) {
            let pending = self
                .bus
                .read_pending(JOBS_TOPIC, group, &self.consumer, 1)
                .await?;
            if !pending.is_empty() {
                tracing::info!(role = %self.kind, message_id = %pending[0].id, "Replaying unacknowledged job");
                return Ok(pending);
            }
            self.replaying.store(false, Ordering::Relaxed);
        }
        self.bus
            .read_group(JOBS_TOPIC, group, &self.consumer, 1, self.block)
            .await
    }

    async fn process_next(&self) -> Result<usize, BusError> {
        let group = self.kind.consumer_group();
        let batch = self.next_job().await?;

        for message in &batch {
            // A result that never made it onto the bus leaves the job pending.
            self.handle_job(message).await?;
            self.bus.ack(JOBS_TOPIC, group, &message.id).await?;
        }
        Ok(batch.len())
    }

    /// Produce and publish the result for one job, or `None` when the job
    /// is malformed or not this role's responsibility.
    pub async fn handle_job(&self, message: &BusMessage) -> Result<Option<WorkerResult>, BusError> {
        let job = match JobMessage::from_fields(&message.fields) {
            Ok(job) => job,
            Err(e) => {
                tracing::warn!(message_id = %message.id, error = %e, "Dropping malformed job");
                return Ok(None);
            }
        };

        let vehicle_type = if job.vehicle_type.is_empty() {
            vehicle_type_of(&job.job_id)
        } else {
            job.vehicle_type.as_str()
        };
        if !self.kind.handles(vehicle_type) {
            tracing::debug!(job_id = %job.job_id, vehicle_type, "Not handled by this role");
            return Ok(None);
        }

        tracing::info!(job_id = %job.job_id, role = %self.kind, "Processing job");
        let worker: &'static str = self.kind.into();
        let mut result = match self.recognizer.recognize(&job).await {
            Ok(text) => WorkerResult::ok(&job.job_id, &job.vehicle_id, worker, &text),
            Err(e) => {
                tracing::warn!(job_id = %job.job_id, error = %e, "Recognition failed");
                WorkerResult::failed(&job.job_id, &job.vehicle_id, worker, &e.to_string())
            }
        };
        result.location = job.location.clone();
        result.frame_url = job.frame_url.clone();
        result.plate_url = job.plate_url.clone();

        bus::publish_message(&*self.bus, &result).await?;
        tracing::info!(job_id = %job.job_id, result = %result.result, "Published result");
        Ok(Some(result))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RecognizerError {
    #[error("Recognizer command is empty")]
    EmptyCommand,

    #[error("Failed to run recognizer: {0}")]
    Io(#[from] std::io::Error),

    #[error("Recognizer timed out after {0:?}")]
    Timeout(Duration),

    #[error("Recognizer exited with {code:?}: {stderr}")]
    Failed { code: Option<i32>, stderr: String },
}
