//! Process supervision for the recognition fleet.

pub mod orchestrator;
pub mod process;
pub mod roles;
pub mod topology;

pub use orchestrator::{FleetError, FleetExit, FleetOrchestrator, FleetPlan, FleetTiming, ShutdownReport};
pub use process::{ManagedProcess, ProcessError, ProcessSpec, ProcessState, StopOutcome};
pub use roles::FleetRole;
