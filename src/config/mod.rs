use garde::Validate;
use serde::Deserialize;

use crate::models::job::WorkerKind;

/// Redis connection parameters shared by every binary.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct BusSettings {
    #[serde(default = "default_redis_host")]
    #[garde(custom(not_blank))]
    pub redis_host: String,

    #[serde(default = "default_redis_port")]
    #[garde(range(min = 1))]
    pub redis_port: u16,

    /// Logical database index.
    #[serde(default)]
    #[garde(skip)]
    pub redis_db: u32,
}

impl BusSettings {
    pub fn redis_url(&self) -> String {
        format!(
            "redis://{}:{}/{}",
            self.redis_host, self.redis_port, self.redis_db
        )
    }

    /// Variables handed to child processes so they reach the same bus.
    pub fn to_env(&self) -> Vec<(String, String)> {
        vec![
            ("REDIS_HOST".to_string(), self.redis_host.clone()),
            ("REDIS_PORT".to_string(), self.redis_port.to_string()),
            ("REDIS_DB".to_string(), self.redis_db.to_string()),
        ]
    }
}

/// PostgreSQL connection parameters.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct DatabaseSettings {
    #[garde(custom(not_blank))]
    pub db_host: String,

    #[serde(default = "default_db_port")]
    #[garde(range(min = 1))]
    pub db_port: u16,

    #[garde(custom(not_blank))]
    pub db_name: String,

    #[garde(custom(not_blank))]
    pub db_user: String,

    #[garde(custom(not_blank))]
    pub db_pass: String,
}

impl DatabaseSettings {
    pub fn database_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.db_user, self.db_pass, self.db_host, self.db_port, self.db_name
        )
    }

    pub fn to_env(&self) -> Vec<(String, String)> {
        vec![
            ("DB_HOST".to_string(), self.db_host.clone()),
            ("DB_PORT".to_string(), self.db_port.to_string()),
            ("DB_NAME".to_string(), self.db_name.clone()),
            ("DB_USER".to_string(), self.db_user.clone()),
            ("DB_PASS".to_string(), self.db_pass.clone()),
        ]
    }
}

/// Aggregator server settings.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ServerSettings {
    /// Server bind address (e.g., "0.0.0.0:8000").
    #[serde(default = "default_bind_addr")]
    #[garde(custom(not_blank))]
    pub bind_addr: String,

    /// Site label of this deployment.
    #[serde(default = "default_location")]
    #[garde(custom(not_blank))]
    pub location: String,

    /// Base URL keyframe and plate images are served from.
    #[serde(default = "default_static_base_url")]
    #[garde(custom(not_blank))]
    pub static_base_url: String,

    #[serde(default = "default_aggregator_consumer")]
    #[garde(custom(not_blank))]
    pub aggregator_consumer: String,

    /// Seconds a job may wait for its remaining workers before eviction.
    #[serde(default = "default_pending_job_ttl_secs")]
    #[garde(range(min = 1))]
    pub pending_job_ttl_secs: u64,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerSettings,
    pub bus: BusSettings,
    pub db: DatabaseSettings,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config = Self {
            server: envy::from_env()?,
            bus: envy::from_env()?,
            db: envy::from_env()?,
        };
        config.server.validate()?;
        config.bus.validate()?;
        config.db.validate()?;
        Ok(config)
    }
}

/// Fleet supervision settings. Command lines are split on whitespace.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct FleetSettings {
    #[serde(default = "default_location")]
    #[garde(custom(not_blank))]
    pub location: String,

    /// Upstream video source handed to ingestion and the aggregator.
    #[garde(custom(not_blank))]
    pub rtsp_stream: String,

    /// Base URL of the aggregator, used for the readiness handshake.
    #[serde(default = "default_aggregator_url")]
    #[garde(custom(not_blank))]
    pub aggregator_url: String,

    #[garde(custom(not_blank))]
    pub ingest_cmd: String,

    /// Overrides for the sibling binaries the fleet runs by default.
    #[serde(default)]
    #[garde(skip)]
    pub worker_cmd: Option<String>,
    #[serde(default)]
    #[garde(skip)]
    pub aggregator_cmd: Option<String>,
    #[serde(default)]
    #[garde(skip)]
    pub monitor_cmd: Option<String>,

    /// Recognizer commands forwarded to each worker as `RECOGNIZER_CMD`.
    #[serde(default)]
    #[garde(skip)]
    pub ocr_recognizer_cmd: Option<String>,
    #[serde(default)]
    #[garde(skip)]
    pub color_recognizer_cmd: Option<String>,
    #[serde(default)]
    #[garde(skip)]
    pub logo_recognizer_cmd: Option<String>,

    #[serde(default = "default_liveness_interval_secs")]
    #[garde(range(min = 1))]
    pub liveness_interval_secs: u64,

    #[serde(default = "default_shutdown_grace_secs")]
    #[garde(range(min = 1))]
    pub shutdown_grace_secs: u64,

    #[serde(default = "default_kill_wait_secs")]
    #[garde(range(min = 1))]
    pub kill_wait_secs: u64,
}

impl FleetSettings {
    pub fn recognizer_cmd(&self, kind: WorkerKind) -> Option<&str> {
        match kind {
            WorkerKind::Ocr => self.ocr_recognizer_cmd.as_deref(),
            WorkerKind::Color => self.color_recognizer_cmd.as_deref(),
            WorkerKind::Logo => self.logo_recognizer_cmd.as_deref(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub fleet: FleetSettings,
    pub bus: BusSettings,
    pub db: DatabaseSettings,
}

impl OrchestratorConfig {
    /// Load and validate everything the fleet needs. Called before any
    /// connection is opened or process spawned.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config = Self {
            fleet: envy::from_env()?,
            bus: envy::from_env()?,
            db: envy::from_env()?,
        };
        config.fleet.validate()?;
        config.bus.validate()?;
        config.db.validate()?;
        Ok(config)
    }
}

/// Recognition worker settings.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct WorkerSettings {
    #[garde(skip)]
    pub worker_role: WorkerKind,

    /// Invoked as `<cmd> <frame_path> <plate_path>`; stdout is the result.
    #[garde(custom(not_blank))]
    pub recognizer_cmd: String,

    #[serde(default = "default_recognizer_timeout_secs")]
    #[garde(range(min = 1))]
    pub recognizer_timeout_secs: u64,

    /// Consumer name within the role's group; defaults to `<role>_worker_1`.
    #[serde(default)]
    #[garde(skip)]
    pub worker_consumer: Option<String>,
}

impl WorkerSettings {
    pub fn consumer(&self) -> String {
        self.worker_consumer
            .clone()
            .unwrap_or_else(|| format!("{}_worker_1", self.worker_role))
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker: WorkerSettings,
    pub bus: BusSettings,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config = Self {
            worker: envy::from_env()?,
            bus: envy::from_env()?,
        };
        config.worker.validate()?;
        config.bus.validate()?;
        Ok(config)
    }
}

/// Settings for the stream monitor.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct MonitorSettings {
    #[serde(default = "default_monitor_interval_secs")]
    #[garde(range(min = 1))]
    pub monitor_interval_secs: u64,
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub monitor: MonitorSettings,
    pub bus: BusSettings,
}

impl MonitorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config = Self {
            monitor: envy::from_env()?,
            bus: envy::from_env()?,
        };
        config.monitor.validate()?;
        config.bus.validate()?;
        Ok(config)
    }
}

fn not_blank(value: &str, _ctx: &()) -> garde::Result {
    if value.trim().is_empty() {
        return Err(garde::Error::new("must not be empty"));
    }
    Ok(())
}

fn default_bind_addr() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_location() -> String {
    "DEFAULT_LOCATION".to_string()
}

fn default_static_base_url() -> String {
    "http://localhost:8000/static".to_string()
}

fn default_aggregator_consumer() -> String {
    "aggregator_1".to_string()
}

fn default_aggregator_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_redis_host() -> String {
    "localhost".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_db_port() -> u16 {
    5432
}

fn default_pending_job_ttl_secs() -> u64 {
    600
}

fn default_liveness_interval_secs() -> u64 {
    10
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

fn default_kill_wait_secs() -> u64 {
    5
}

fn default_recognizer_timeout_secs() -> u64 {
    60
}

fn default_monitor_interval_secs() -> u64 {
    5
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read environment: {0}")]
    Env(#[from] envy::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(#[from] garde::Report),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_bus_defaults() {
        let bus: BusSettings = envy::from_iter(Vec::new()).unwrap();
        assert_eq!(bus.redis_url(), "redis://localhost:6379/0");
        assert!(bus.validate().is_ok());
    }

    #[test]
    fn test_database_url() {
        let db: DatabaseSettings = envy::from_iter(vars(&[
            ("DB_HOST", "db"),
            ("DB_NAME", "sentinel"),
            ("DB_USER", "app"),
            ("DB_PASS", "secret"),
        ]))
        .unwrap();
        assert_eq!(db.database_url(), "postgres://app:secret@db:5432/sentinel");
    }

    #[test]
    fn test_database_requires_credentials() {
        let result = envy::from_iter::<_, DatabaseSettings>(vars(&[("DB_HOST", "db")]));
        assert!(result.is_err());
    }

    #[test]
    fn test_blank_stream_rejected() {
        let fleet: FleetSettings = envy::from_iter(vars(&[
            ("RTSP_STREAM", "   "),
            ("INGEST_CMD", "ingest"),
        ]))
        .unwrap();
        assert!(fleet.validate().is_err());
    }

    #[test]
    fn test_fleet_defaults() {
        let fleet: FleetSettings = envy::from_iter(vars(&[
            ("RTSP_STREAM", "rtsp://cam/1"),
            ("INGEST_CMD", "ingest --camera 1"),
            ("COLOR_RECOGNIZER_CMD", "detect-color"),
        ]))
        .unwrap();
        assert!(fleet.validate().is_ok());
        assert_eq!(fleet.location, "DEFAULT_LOCATION");
        assert_eq!(fleet.liveness_interval_secs, 10);
        assert_eq!(fleet.recognizer_cmd(WorkerKind::Color), Some("detect-color"));
        assert_eq!(fleet.recognizer_cmd(WorkerKind::Ocr), None);
    }

    #[test]
    fn test_worker_role_and_consumer() {
        let worker: WorkerSettings = envy::from_iter(vars(&[
            ("WORKER_ROLE", "logo"),
            ("RECOGNIZER_CMD", "detect-logo"),
        ]))
        .unwrap();
        assert_eq!(worker.worker_role, WorkerKind::Logo);
        assert_eq!(worker.consumer(), "logo_worker_1");
        assert_eq!(worker.recognizer_timeout_secs, 60);
    }
}
