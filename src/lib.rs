//! Vehicle Sentinel job coordination.
//!
//! Recognition workers report partial results for each detected vehicle on a
//! Redis stream; the aggregation engine joins them into one persisted record
//! per sighting and fans it out to live subscribers. The fleet orchestrator
//! starts, watches and stops every process of the pipeline.

pub mod app_state;
pub mod config;
pub mod db;
pub mod fleet;
pub mod models;
pub mod routes;
pub mod services;
