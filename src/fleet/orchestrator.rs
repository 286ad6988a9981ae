//! Fleet supervisor: topology reset, paced startup, readiness handshake,
//! liveness polling and ordered escalating shutdown.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::process::{ManagedProcess, ProcessError, ProcessSpec, ProcessState, StopOutcome};
use super::roles::FleetRole;
use super::topology::reset_topology;
use crate::config::OrchestratorConfig;
use crate::services::bus::{BusError, MessageBus};

/// Startup pacing and shutdown bounds.
#[derive(Debug, Clone)]
pub struct FleetTiming {
    /// Pause between consecutive workers.
    pub worker_stagger: Duration,
    pub before_aggregator: Duration,
    pub before_monitor: Duration,
    pub before_ingestion: Duration,
    /// How long ingestion must survive before it counts as started.
    pub ingestion_settle: Duration,
    pub liveness_interval: Duration,
    pub shutdown_grace: Duration,
    pub kill_wait: Duration,
    pub handshake_timeout: Duration,
}

impl Default for FleetTiming {
    fn default() -> Self {
        Self {
            worker_stagger: Duration::from_secs(1),
            before_aggregator: Duration::from_secs(2),
            before_monitor: Duration::from_secs(1),
            before_ingestion: Duration::from_secs(3),
            ingestion_settle: Duration::from_secs(4),
            liveness_interval: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(10),
            kill_wait: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

impl FleetTiming {
    fn delay_before(&self, role: FleetRole) -> Duration {
        match role {
            FleetRole::Ocr => Duration::ZERO,
            FleetRole::Color | FleetRole::Logo => self.worker_stagger,
            FleetRole::Aggregator => self.worker_stagger + self.before_aggregator,
            FleetRole::Monitor => self.before_monitor,
            FleetRole::Ingestion => self.before_ingestion,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FleetPlan {
    pub processes: Vec<ProcessSpec>,
    pub timing: FleetTiming,
    /// Readiness endpoint on the aggregator; no handshake when unset.
    pub ready_url: Option<String>,
}

impl FleetPlan {
    pub fn spec(&self, role: FleetRole) -> Option<&ProcessSpec> {
        self.processes.iter().find(|s| s.role == role)
    }

    /// Build the production plan. Workers, aggregator and monitor default to
    /// the sibling binaries in `bin_dir`.
    pub fn from_config(config: &OrchestratorConfig, bin_dir: &Path) -> Result<Self, FleetError> {
        let fleet = &config.fleet;
        let sibling = |name: &str| bin_dir.join(name).to_string_lossy().into_owned();
        let bus_env = config.bus.to_env();
        let site_env = vec![
            ("LOCATION".to_string(), fleet.location.clone()),
            ("RTSP_STREAM".to_string(), fleet.rtsp_stream.clone()),
        ];

        let worker_cmd = fleet.worker_cmd.clone().unwrap_or_else(|| sibling("worker"));
        let mut processes = Vec::with_capacity(FleetRole::STARTUP_ORDER.len());
        for role in FleetRole::STARTUP_ORDER {
            let spec = match role.worker() {
                Some(kind) => {
                    let mut env = vec![("WORKER_ROLE".to_string(), kind.to_string())];
                    if let Some(cmd) = fleet.recognizer_cmd(kind) {
                        env.push(("RECOGNIZER_CMD".to_string(), cmd.to_string()));
                    }
                    ProcessSpec::from_command(role, &worker_cmd)?
                        .with_env(bus_env.clone())
                        .with_env(env)
                }
                None if role == FleetRole::Aggregator => {
                    let cmd = fleet
                        .aggregator_cmd
                        .clone()
                        .unwrap_or_else(|| sibling("aggregator"));
                    ProcessSpec::from_command(role, &cmd)?
                        .with_env(bus_env.clone())
                        .with_env(site_env.clone())
                        .with_env(config.db.to_env())
                }
                None if role == FleetRole::Monitor => {
                    let cmd = fleet
                        .monitor_cmd
                        .clone()
                        .unwrap_or_else(|| sibling("monitor"));
                    ProcessSpec::from_command(role, &cmd)?.with_env(bus_env.clone())
                }
                None => ProcessSpec::from_command(role, &fleet.ingest_cmd)?
                    .with_env(bus_env.clone())
                    .with_env(site_env.clone()),
            };
            processes.push(spec);
        }

        Ok(Self {
            processes,
            timing: FleetTiming {
                liveness_interval: Duration::from_secs(fleet.liveness_interval_secs),
                shutdown_grace: Duration::from_secs(fleet.shutdown_grace_secs),
                kill_wait: Duration::from_secs(fleet.kill_wait_secs),
                ..FleetTiming::default()
            },
            ready_url: Some(format!(
                "{}/internal/system-ready",
                fleet.aggregator_url.trim_end_matches('/')
            )),
        })
    }
}

/// Why the fleet stopped running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FleetExit {
    /// Ingestion died; fatal for the whole system.
    IngestionDied,
    /// Some other process died. There is no respawn.
    ProcessDied(Vec<FleetRole>),
    Interrupted,
}

impl FleetExit {
    pub fn exit_code(&self) -> i32 {
        match self {
            FleetExit::Interrupted => 0,
            FleetExit::IngestionDied | FleetExit::ProcessDied(_) => 1,
        }
    }
}

#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// In the order processes were stopped.
    pub stopped: Vec<(FleetRole, StopOutcome)>,
    pub errors: Vec<(FleetRole, String)>,
}

enum Startup {
    Complete,
    Interrupted,
}

pub struct FleetOrchestrator<B: ?Sized> {
    bus: Arc<B>,
    plan: FleetPlan,
    processes: Mutex<Vec<ManagedProcess>>,
    shutdown_started: Mutex<bool>,
    /// Cancelled as soon as a shutdown begins, from whichever caller.
    stopping: CancellationToken,
    http: reqwest::Client,
}

impl<B: MessageBus + ?Sized> FleetOrchestrator<B> {
    pub fn new(bus: Arc<B>, plan: FleetPlan) -> Self {
        Self {
            bus,
            plan,
            processes: Mutex::new(Vec::new()),
            shutdown_started: Mutex::new(false),
            stopping: CancellationToken::new(),
            http: reqwest::Client::new(),
        }
    }

    /// Reset the bus, start every process, supervise until something dies
    /// or `interrupt` fires, then shut everything down.
    pub async fn run(&self, interrupt: CancellationToken) -> Result<FleetExit, FleetError> {
        reset_topology(&*self.bus).await?;

        let exit = match self.start_fleet(&interrupt).await {
            Ok(Startup::Complete) => {
                self.signal_ready().await;
                self.watch(&interrupt).await
            }
            Ok(Startup::Interrupted) => {
                tracing::info!("Startup interrupted");
                FleetExit::Interrupted
            }
            Err(e) => {
                tracing::error!(error = %e, "Startup failed, stopping started processes");
                self.shutdown().await;
                return Err(e);
            }
        };

        self.shutdown().await;
        Ok(exit)
    }

    async fn start_fleet(&self, interrupt: &CancellationToken) -> Result<Startup, FleetError> {
        for role in FleetRole::STARTUP_ORDER {
            if !self.pause(self.plan.timing.delay_before(role), interrupt).await {
                return Ok(Startup::Interrupted);
            }
            let spec = self.plan.spec(role).ok_or(FleetError::MissingRole(role))?;
            let mut process = ManagedProcess::spawn(spec)?;
            tracing::info!(process = role.label(), pid = process.pid(), "Started");

            let mut processes = self.processes.lock().await;
            if self.stopping.is_cancelled() {
                // Shutdown already ran without this one.
                drop(processes);
                let timing = &self.plan.timing;
                if let Err(e) = process.terminate(timing.shutdown_grace, timing.kill_wait).await {
                    tracing::error!(process = role.label(), error = %e, "Failed to stop");
                }
                return Ok(Startup::Interrupted);
            }
            processes.push(process);
        }

        if !self.pause(self.plan.timing.ingestion_settle, interrupt).await {
            return Ok(Startup::Interrupted);
        }
        if !self.is_alive(FleetRole::Ingestion).await {
            return Err(FleetError::IngestionExited);
        }

        // Everything that survived the settle period is now running.
        for p in self.processes.lock().await.iter_mut() {
            p.poll();
        }
        Ok(Startup::Complete)
    }

    /// Tell the aggregator the system is live. Failure is only logged.
    pub async fn signal_ready(&self) -> bool {
        let Some(url) = &self.plan.ready_url else {
            return false;
        };
        match self
            .http
            .post(url)
            .timeout(self.plan.timing.handshake_timeout)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => {
                tracing::info!("Signaled aggregator: system ready");
                true
            }
            Ok(resp) => {
                tracing::warn!(status = %resp.status(), "Aggregator rejected readiness signal");
                false
            }
            Err(e) => {
                tracing::warn!(error = %e, "Could not signal aggregator readiness");
                false
            }
        }
    }

    /// Poll liveness until a process dies or `interrupt` fires.
    pub async fn watch(&self, interrupt: &CancellationToken) -> FleetExit {
        tracing::info!("Fleet running");
        loop {
            let dead = self.dead_roles().await;
            if dead.contains(&FleetRole::Ingestion) {
                tracing::error!("Ingestion died, shutting down the fleet");
                return FleetExit::IngestionDied;
            }
            if !dead.is_empty() {
                let labels: Vec<&str> = dead.iter().map(FleetRole::label).collect();
                tracing::error!(dead = ?labels, "Processes died");
                return FleetExit::ProcessDied(dead);
            }

            if !self.pause(self.plan.timing.liveness_interval, interrupt).await {
                return FleetExit::Interrupted;
            }
            let (alive, total) = self.counts().await;
            tracing::info!(alive, total, "Fleet status");
        }
    }

    /// Like the free `pause`, also cut short by a shutdown started elsewhere.
    async fn pause(&self, duration: Duration, interrupt: &CancellationToken) -> bool {
        tokio::select! {
            _ = self.stopping.cancelled() => false,
            resumed = pause(duration, interrupt) => resumed && !self.stopping.is_cancelled(),
        }
    }

    async fn dead_roles(&self) -> Vec<FleetRole> {
        let mut processes = self.processes.lock().await;
        let mut dead = Vec::new();
        for p in processes.iter_mut() {
            if p.poll() == ProcessState::Failed {
                dead.push(p.role());
            }
        }
        dead
    }

    async fn is_alive(&self, role: FleetRole) -> bool {
        let mut processes = self.processes.lock().await;
        processes
            .iter_mut()
            .find(|p| p.role() == role)
            .is_some_and(|p| p.is_alive())
    }

    async fn counts(&self) -> (usize, usize) {
        let mut processes = self.processes.lock().await;
        let total = processes.len();
        let mut alive = 0;
        for p in processes.iter_mut() {
            if p.is_alive() {
                alive += 1;
            }
        }
        (alive, total)
    }

    pub async fn alive_count(&self) -> usize {
        self.counts().await.0
    }

    pub async fn states(&self) -> Vec<(FleetRole, ProcessState)> {
        let processes = self.processes.lock().await;
        processes.iter().map(|p| (p.role(), p.state())).collect()
    }

    /// Stop every process in shutdown order. Only the first call does
    /// anything; concurrent and later calls return `None`.
    pub async fn shutdown(&self) -> Option<ShutdownReport> {
        let mut started = self.shutdown_started.lock().await;
        if *started {
            tracing::debug!("Shutdown already performed");
            return None;
        }
        *started = true;
        self.stopping.cancel();

        tracing::info!("Stopping all processes");
        let timing = &self.plan.timing;
        let mut processes = self.processes.lock().await;
        processes.sort_by_key(|p| p.role().shutdown_rank());

        let mut report = ShutdownReport::default();
        for p in processes.iter_mut() {
            let role = p.role();
            match p.terminate(timing.shutdown_grace, timing.kill_wait).await {
                Ok(outcome) => {
                    tracing::info!(process = role.label(), pid = p.pid(), outcome = ?outcome, "Stopped");
                    report.stopped.push((role, outcome));
                }
                Err(e) => {
                    tracing::error!(process = role.label(), pid = p.pid(), error = %e, "Failed to stop");
                    report.errors.push((role, e.to_string()));
                }
            }
        }

        tracing::info!(stopped = report.stopped.len(), errors = report.errors.len(), "All processes stopped");
        Some(report)
    }
}

/// Sleep unless interrupted first; returns `false` on interrupt.
async fn pause(duration: Duration, interrupt: &CancellationToken) -> bool {
    if duration.is_zero() {
        return !interrupt.is_cancelled();
    }
    tokio::select! {
        _ = interrupt.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error("Bus topology reset failed: {0}")]
    Bus(#[from] BusError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("No process configured for {0}")]
    MissingRole(FleetRole),

    #[error("Ingestion exited during startup")]
    IngestionExited,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BusSettings, DatabaseSettings, FleetSettings};

    fn config() -> OrchestratorConfig {
        OrchestratorConfig {
            fleet: FleetSettings {
                location: "GATE_2".into(),
                rtsp_stream: "rtsp://cam/2".into(),
                aggregator_url: "http://aggregator:8000/".into(),
                ingest_cmd: "ingest --fps 5".into(),
                worker_cmd: None,
                aggregator_cmd: None,
                monitor_cmd: Some("python3 monitor.py".into()),
                ocr_recognizer_cmd: Some("read-plate".into()),
                color_recognizer_cmd: None,
                logo_recognizer_cmd: None,
                liveness_interval_secs: 7,
                shutdown_grace_secs: 3,
                kill_wait_secs: 2,
            },
            bus: BusSettings {
                redis_host: "redis".into(),
                redis_port: 6379,
                redis_db: 1,
            },
            db: DatabaseSettings {
                db_host: "db".into(),
                db_port: 5432,
                db_name: "sentinel".into(),
                db_user: "app".into(),
                db_pass: "secret".into(),
            },
        }
    }

    fn env_of<'a>(spec: &'a ProcessSpec, key: &str) -> Option<&'a str> {
        spec.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn test_plan_from_config() {
        let plan = FleetPlan::from_config(&config(), Path::new("/opt/sentinel/bin")).unwrap();

        let roles: Vec<FleetRole> = plan.processes.iter().map(|s| s.role).collect();
        assert_eq!(roles, FleetRole::STARTUP_ORDER.to_vec());
        assert_eq!(
            plan.ready_url.as_deref(),
            Some("http://aggregator:8000/internal/system-ready")
        );
        assert_eq!(plan.timing.liveness_interval, Duration::from_secs(7));
        assert_eq!(plan.timing.ingestion_settle, Duration::from_secs(4));

        let ocr = plan.spec(FleetRole::Ocr).unwrap();
        assert_eq!(ocr.program, "/opt/sentinel/bin/worker");
        assert_eq!(env_of(ocr, "WORKER_ROLE"), Some("ocr"));
        assert_eq!(env_of(ocr, "RECOGNIZER_CMD"), Some("read-plate"));
        assert_eq!(env_of(ocr, "REDIS_DB"), Some("1"));
        assert_eq!(env_of(plan.spec(FleetRole::Color).unwrap(), "RECOGNIZER_CMD"), None);

        let aggregator = plan.spec(FleetRole::Aggregator).unwrap();
        assert_eq!(env_of(aggregator, "DB_PASS"), Some("secret"));
        assert_eq!(env_of(aggregator, "LOCATION"), Some("GATE_2"));

        let monitor = plan.spec(FleetRole::Monitor).unwrap();
        assert_eq!(monitor.program, "python3");
        assert_eq!(monitor.args, vec!["monitor.py"]);

        let ingestion = plan.spec(FleetRole::Ingestion).unwrap();
        assert_eq!(ingestion.program, "ingest");
        assert_eq!(env_of(ingestion, "RTSP_STREAM"), Some("rtsp://cam/2"));
    }

    #[test]
    fn test_startup_pacing() {
        let timing = FleetTiming::default();
        assert_eq!(timing.delay_before(FleetRole::Ocr), Duration::ZERO);
        assert_eq!(timing.delay_before(FleetRole::Logo), Duration::from_secs(1));
        assert_eq!(timing.delay_before(FleetRole::Aggregator), Duration::from_secs(3));
        assert_eq!(timing.delay_before(FleetRole::Ingestion), Duration::from_secs(3));
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(FleetExit::Interrupted.exit_code(), 0);
        assert_eq!(FleetExit::IngestionDied.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_pause_interrupted() {
        let token = CancellationToken::new();
        token.cancel();
        assert!(!pause(Duration::from_secs(30), &token).await);
        assert!(!pause(Duration::ZERO, &token).await);
    }
}
