use strum::{AsRefStr, Display, EnumString};

use crate::models::job::WorkerKind;

/// Every process the orchestrator supervises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum FleetRole {
    Ocr,
    Color,
    Logo,
    Aggregator,
    Monitor,
    Ingestion,
}

impl FleetRole {
    /// Dependencies first: workers, then the aggregator they feed, then the
    /// monitor, then the ingestion stage that produces work.
    pub const STARTUP_ORDER: [FleetRole; 6] = [
        FleetRole::Ocr,
        FleetRole::Color,
        FleetRole::Logo,
        FleetRole::Aggregator,
        FleetRole::Monitor,
        FleetRole::Ingestion,
    ];

    pub const SHUTDOWN_ORDER: [FleetRole; 6] = [
        FleetRole::Ingestion,
        FleetRole::Monitor,
        FleetRole::Aggregator,
        FleetRole::Logo,
        FleetRole::Color,
        FleetRole::Ocr,
    ];

    /// Label attached to relayed output.
    pub fn label(&self) -> &'static str {
        match self {
            FleetRole::Ocr => "ocr_worker",
            FleetRole::Color => "color_worker",
            FleetRole::Logo => "logo_worker",
            FleetRole::Aggregator => "aggregator",
            FleetRole::Monitor => "monitor",
            FleetRole::Ingestion => "ingestion",
        }
    }

    pub fn shutdown_rank(&self) -> usize {
        Self::SHUTDOWN_ORDER
            .iter()
            .position(|r| r == self)
            .unwrap_or(Self::SHUTDOWN_ORDER.len())
    }

    pub fn worker(&self) -> Option<WorkerKind> {
        match self {
            FleetRole::Ocr => Some(WorkerKind::Ocr),
            FleetRole::Color => Some(WorkerKind::Color),
            FleetRole::Logo => Some(WorkerKind::Logo),
            _ => None,
        }
    }
}

impl From<WorkerKind> for FleetRole {
    fn from(kind: WorkerKind) -> Self {
        match kind {
            WorkerKind::Ocr => FleetRole::Ocr,
            WorkerKind::Color => FleetRole::Color,
            WorkerKind::Logo => FleetRole::Logo,
        }
    }
}
