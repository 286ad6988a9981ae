use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString, IntoStaticStr};

/// Vehicle classes emitted by the detection stage.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, AsRefStr, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum VehicleType {
    Car,
    Motorcycle,
    Bus,
    Truck,
    Auto,
    Bike,
}

/// Recognition worker roles. The string form is the `worker` field on the
/// results topic and the key in a pending job's result map.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, AsRefStr, IntoStaticStr,
    PartialEq, Eq, Hash,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum WorkerKind {
    Ocr,
    Color,
    Logo,
}

impl WorkerKind {
    pub const ALL: [WorkerKind; 3] = [WorkerKind::Ocr, WorkerKind::Color, WorkerKind::Logo];

    /// Consumer group this role reads the jobs topic under.
    pub fn consumer_group(&self) -> &'static str {
        match self {
            WorkerKind::Ocr => "ocr_workers",
            WorkerKind::Color => "color_workers",
            WorkerKind::Logo => "logo_workers",
        }
    }

    /// Whether this role is responsible for the given vehicle type token.
    pub fn handles(&self, vehicle_type: &str) -> bool {
        expected_workers(vehicle_type).contains(self)
    }
}

const CAR_WORKERS: &[WorkerKind] = &[WorkerKind::Ocr, WorkerKind::Color, WorkerKind::Logo];
const PLATE_ONLY: &[WorkerKind] = &[WorkerKind::Ocr];

/// Workers that must report before a job of this vehicle type is complete.
///
/// Cars need plate, color and logo. Every other type, including tokens that
/// are not a known [`VehicleType`], needs the plate reading only.
pub fn expected_workers(vehicle_type: &str) -> &'static [WorkerKind] {
    match vehicle_type.parse::<VehicleType>() {
        Ok(VehicleType::Car) => CAR_WORKERS,
        _ => PLATE_ONLY,
    }
}

/// Vehicle type token of a job id (`<vehicle_type>_<track_id>_<short_uuid>`).
pub fn vehicle_type_of(job_id: &str) -> &str {
    job_id.split('_').next().unwrap_or_default()
}

/// A detection job as published on the jobs topic by the ingestion stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobMessage {
    pub job_id: String,
    pub vehicle_id: String,
    pub vehicle_type: String,
    #[serde(default)]
    pub frame_path: Option<String>,
    #[serde(default)]
    pub frame_url: Option<String>,
    #[serde(default)]
    pub plate_path: Option<String>,
    #[serde(default)]
    pub plate_url: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
}
