//! Typed schemas for bus entries.
//!
//! Entries are flat string maps on the wire. Each topic gets a serde struct;
//! required fields fail decoding when absent, optional ones default.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;

use super::{BusError, ACK_TOPIC, JOBS_TOPIC, RESULTS_TOPIC};
use crate::models::job::JobMessage;
use crate::models::result::{CompletionAck, WorkerResult};

pub trait StreamMessage: Serialize + DeserializeOwned {
    const TOPIC: &'static str;

    /// Flatten into field pairs. `None` fields are omitted.
    fn to_fields(&self) -> Result<Vec<(String, String)>, BusError> {
        let Value::Object(map) = serde_json::to_value(self)? else {
            return Err(BusError::NotAFieldMap);
        };
        Ok(map
            .into_iter()
            .filter_map(|(k, v)| match v {
                Value::Null => None,
                Value::String(s) => Some((k, s)),
                other => Some((k, other.to_string())),
            })
            .collect())
    }

    fn from_fields(fields: &HashMap<String, String>) -> Result<Self, serde_json::Error> {
        let map: Map<String, Value> = fields
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        serde_json::from_value(Value::Object(map))
    }
}

impl StreamMessage for JobMessage {
    const TOPIC: &'static str = JOBS_TOPIC;
}

impl StreamMessage for WorkerResult {
    const TOPIC: &'static str = RESULTS_TOPIC;
}

impl StreamMessage for CompletionAck {
    const TOPIC: &'static str = ACK_TOPIC;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::result::WorkerStatus;

    fn fields(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_worker_result_optional_fields_default() {
        let decoded = WorkerResult::from_fields(&fields(&[
            ("job_id", "bus_3_ff00aa11"),
            ("worker", "ocr"),
        ]))
        .unwrap();
        assert_eq!(decoded.result, "");
        assert_eq!(decoded.vehicle_id, "");
        assert_eq!(decoded.status, WorkerStatus::Ok);
        assert!(decoded.location.is_none());
    }

    #[test]
    fn test_worker_result_requires_job_id() {
        assert!(WorkerResult::from_fields(&fields(&[("worker", "ocr")])).is_err());
    }

    #[test]
    fn test_error_status_decoded() {
        let decoded = WorkerResult::from_fields(&fields(&[
            ("job_id", "car_1_x"),
            ("worker", "logo"),
            ("status", "error"),
            ("error", "model crashed"),
        ]))
        .unwrap();
        assert_eq!(decoded.status, WorkerStatus::Error);
        assert_eq!(decoded.error.as_deref(), Some("model crashed"));
    }

    #[test]
    fn test_none_fields_are_omitted() {
        let encoded = WorkerResult::ok("car_1_x", "vid", "ocr", "KA01").to_fields().unwrap();
        let keys: Vec<&str> = encoded.iter().map(|(k, _)| k.as_str()).collect();
        assert!(keys.contains(&"status"));
        assert!(!keys.contains(&"error"));
        assert!(!keys.contains(&"location"));
        assert!(encoded.contains(&("status".to_string(), "ok".to_string())));
    }
}
