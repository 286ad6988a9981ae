use serde::{Deserialize, Serialize};

/// Outcome reported by a recognition worker.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    #[default]
    Ok,
    Error,
}

/// One worker's output for one job, as carried on the results topic.
///
/// `worker` stays a plain string: unknown roles are stored alongside the
/// known ones and simply never count toward completion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerResult {
    pub job_id: String,
    pub worker: String,
    #[serde(default)]
    pub result: String,
    #[serde(default)]
    pub vehicle_id: String,
    #[serde(default)]
    pub status: WorkerStatus,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub frame_url: Option<String>,
    #[serde(default)]
    pub plate_url: Option<String>,
}

impl WorkerResult {
    pub fn ok(job_id: &str, vehicle_id: &str, worker: &str, result: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            worker: worker.to_string(),
            result: result.to_string(),
            vehicle_id: vehicle_id.to_string(),
            status: WorkerStatus::Ok,
            error: None,
            location: None,
            frame_url: None,
            plate_url: None,
        }
    }

    pub fn failed(job_id: &str, vehicle_id: &str, worker: &str, error: &str) -> Self {
        Self {
            status: WorkerStatus::Error,
            error: Some(error.to_string()),
            ..Self::ok(job_id, vehicle_id, worker, "")
        }
    }
}

/// Published on the completion topic once a job has been persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompletionAck {
    pub job_id: String,
    pub status: String,
}

impl CompletionAck {
    pub fn completed(job_id: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            status: "completed".to_string(),
        }
    }
}
