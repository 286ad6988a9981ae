//! Fleet supervision with real child processes.

#![cfg(unix)]

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use vehicle_sentinel::fleet::{
    FleetError, FleetExit, FleetOrchestrator, FleetPlan, FleetRole, FleetTiming, ProcessSpec,
    ProcessState, StopOutcome,
};
use vehicle_sentinel::services::bus::{InMemoryBus, AGGREGATOR_GROUP, RESULTS_TOPIC};

fn shell(role: FleetRole, script: &str) -> ProcessSpec {
    ProcessSpec {
        role,
        program: "sh".to_string(),
        args: vec!["-c".to_string(), script.to_string()],
        env: Vec::new(),
    }
}

fn quick_timing() -> FleetTiming {
    FleetTiming {
        worker_stagger: Duration::from_millis(10),
        before_aggregator: Duration::from_millis(10),
        before_monitor: Duration::from_millis(10),
        before_ingestion: Duration::from_millis(10),
        ingestion_settle: Duration::from_millis(300),
        liveness_interval: Duration::from_millis(100),
        shutdown_grace: Duration::from_millis(500),
        kill_wait: Duration::from_secs(2),
        handshake_timeout: Duration::from_millis(200),
    }
}

/// All six roles running `sleep`, with overrides per role.
fn plan(overrides: &[(FleetRole, &str)]) -> FleetPlan {
    let processes = FleetRole::STARTUP_ORDER
        .iter()
        .map(|&role| {
            let script = overrides
                .iter()
                .find(|(r, _)| *r == role)
                .map_or("exec sleep 30", |(_, s)| *s);
            shell(role, script)
        })
        .collect();
    FleetPlan {
        processes,
        timing: quick_timing(),
        ready_url: None,
    }
}

fn orchestrator(plan: FleetPlan) -> (Arc<FleetOrchestrator<InMemoryBus>>, Arc<InMemoryBus>) {
    let bus = Arc::new(InMemoryBus::new());
    (Arc::new(FleetOrchestrator::new(bus.clone(), plan)), bus)
}

async fn wait_until_running(fleet: &FleetOrchestrator<InMemoryBus>, count: usize) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let running = fleet
                .states()
                .await
                .iter()
                .filter(|(_, s)| *s == ProcessState::Running)
                .count();
            if running == count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("fleet did not start");
}

#[tokio::test]
async fn test_interrupt_stops_everything_in_reverse_order() {
    // The aggregator ignores SIGTERM and must be killed.
    let (fleet, bus) = orchestrator(plan(&[(
        FleetRole::Aggregator,
        "trap '' TERM; exec sleep 30",
    )]));
    let interrupt = CancellationToken::new();

    let run = tokio::spawn({
        let fleet = fleet.clone();
        let interrupt = interrupt.clone();
        async move { fleet.run(interrupt).await }
    });

    wait_until_running(&fleet, 6).await;
    assert!(bus.has_group(RESULTS_TOPIC, AGGREGATOR_GROUP));
    assert_eq!(fleet.alive_count().await, 6);

    let started = Instant::now();
    interrupt.cancel();
    let exit = run.await.unwrap().unwrap();

    assert_eq!(exit, FleetExit::Interrupted);
    assert_eq!(fleet.alive_count().await, 0);
    // Grace for the stuck process plus kill wait, with slack.
    assert!(started.elapsed() < Duration::from_secs(5));

    let states = fleet.states().await;
    let order: Vec<FleetRole> = states.iter().map(|(r, _)| *r).collect();
    assert_eq!(order, FleetRole::SHUTDOWN_ORDER.to_vec());
    assert!(states.iter().all(|(_, s)| *s == ProcessState::Stopped));

    // Already shut down by `run`.
    assert!(fleet.shutdown().await.is_none());
}

#[tokio::test]
async fn test_shutdown_report_escalates_stuck_process() {
    let (fleet, _bus) = orchestrator(plan(&[(
        FleetRole::Logo,
        "trap '' TERM; exec sleep 30",
    )]));
    let interrupt = CancellationToken::new();
    let run = tokio::spawn({
        let fleet = fleet.clone();
        let interrupt = interrupt.clone();
        async move { fleet.run(interrupt).await }
    });
    wait_until_running(&fleet, 6).await;

    // Direct shutdown while the liveness loop is still polling; the loop's
    // own shutdown then collapses into this one.
    let report = fleet.shutdown().await.expect("first shutdown runs");
    let roles: Vec<FleetRole> = report.stopped.iter().map(|(r, _)| *r).collect();
    assert_eq!(roles, FleetRole::SHUTDOWN_ORDER.to_vec());
    assert!(report.errors.is_empty());
    for (role, outcome) in &report.stopped {
        let expected = if *role == FleetRole::Logo {
            StopOutcome::Killed
        } else {
            StopOutcome::Graceful
        };
        assert_eq!(*outcome, expected, "{role}");
    }

    // The liveness loop notices the shutdown instead of polling on.
    let exit = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("run did not finish")
        .unwrap()
        .unwrap();
    assert_eq!(exit, FleetExit::Interrupted);
    assert_eq!(fleet.alive_count().await, 0);
}

#[tokio::test]
async fn test_ingestion_death_shuts_down_fleet() {
    // Survives the settle period, then dies.
    let (fleet, _bus) = orchestrator(plan(&[(FleetRole::Ingestion, "sleep 1")]));

    let exit = tokio::time::timeout(Duration::from_secs(15), fleet.run(CancellationToken::new()))
        .await
        .expect("liveness loop kept polling")
        .unwrap();

    assert_eq!(exit, FleetExit::IngestionDied);
    assert_eq!(exit.exit_code(), 1);
    assert_eq!(fleet.alive_count().await, 0);
}

#[tokio::test]
async fn test_worker_death_ends_supervision() {
    let (fleet, _bus) = orchestrator(plan(&[(FleetRole::Color, "sleep 1")]));

    let exit = tokio::time::timeout(Duration::from_secs(15), fleet.run(CancellationToken::new()))
        .await
        .expect("liveness loop kept polling")
        .unwrap();

    assert_eq!(exit, FleetExit::ProcessDied(vec![FleetRole::Color]));
    assert_eq!(fleet.alive_count().await, 0);
}

#[tokio::test]
async fn test_startup_aborts_when_ingestion_exits_early() {
    let (fleet, _bus) = orchestrator(plan(&[(FleetRole::Ingestion, "exit 3")]));

    let err = fleet.run(CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, FleetError::IngestionExited));
    assert_eq!(fleet.alive_count().await, 0);
}

#[tokio::test]
async fn test_spawn_failure_stops_started_processes() {
    let mut plan = plan(&[]);
    for spec in plan.processes.iter_mut() {
        if spec.role == FleetRole::Aggregator {
            spec.program = "/nonexistent/aggregator".to_string();
            spec.args.clear();
        }
    }
    let (fleet, _bus) = orchestrator(plan);

    let err = fleet.run(CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, FleetError::Process(_)));
    let states = fleet.states().await;
    assert_eq!(states.len(), 3, "only the workers were started");
    assert_eq!(fleet.alive_count().await, 0);
}

#[tokio::test]
async fn test_interrupt_during_startup() {
    let mut plan = plan(&[]);
    plan.timing.before_ingestion = Duration::from_secs(30);
    let (fleet, _bus) = orchestrator(plan);
    let interrupt = CancellationToken::new();

    let run = tokio::spawn({
        let fleet = fleet.clone();
        let interrupt = interrupt.clone();
        async move { fleet.run(interrupt).await }
    });
    wait_until_running_or_started(&fleet, 5).await;
    interrupt.cancel();

    let exit = tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .expect("startup was not interrupted")
        .unwrap()
        .unwrap();
    assert_eq!(exit, FleetExit::Interrupted);
    assert_eq!(fleet.alive_count().await, 0);
}

async fn wait_until_running_or_started(fleet: &FleetOrchestrator<InMemoryBus>, count: usize) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while fleet.states().await.len() < count {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("processes were not started");
}
