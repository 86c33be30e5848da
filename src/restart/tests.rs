use super::*;
use crate::config::{ProbeConfig, SupervisorConfig};
use crate::health::{ProbeOutcome, ProbeResult};
use crate::state::new_shared_states;
use std::collections::BTreeMap;
use tokio::sync::mpsc::Receiver;

fn svc(id: &str, deps: &[&str], max_failures: u32) -> ServiceConfig {
    ServiceConfig {
        identifier: id.to_string(),
        display_name: None,
        command: vec!["/bin/true".to_string()],
        working_directory: None,
        environment: Default::default(),
        port: None,
        probe: ProbeConfig::default(),
        dependencies: deps.iter().map(|d| d.to_string()).collect(),
        reload_on: vec!["src".to_string()],
        max_consecutive_failures: max_failures,
        restart_base_delay_ms: 50,
        restart_max_delay_ms: 400,
        graceful_stop_ms: 1000,
    }
}

fn controller_with(
    services: Vec<ServiceConfig>,
) -> (RestartController, Receiver<Signal>, watch::Sender<bool>) {
    let mut watch_rules = BTreeMap::new();
    watch_rules.insert("src".to_string(), vec!["src/**/*".to_string()]);
    let config = SupervisorConfig {
        services,
        watch_rules,
    };
    let registry = Arc::new(ServiceRegistry::load(config).unwrap());
    let states = new_shared_states(registry.identifiers());
    let events = Arc::new(EventLog::in_memory(64));
    let (tx, rx) = mpsc::channel(64);
    let manager = Arc::new(ProcessManager::new(tx.clone()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let controller = RestartController::new(
        registry,
        states,
        events,
        manager,
        tx,
        shutdown_rx,
        None,
    );
    (controller, rx, shutdown_tx)
}

fn set_phase(controller: &RestartController, id: &str, phase: Phase, generation: u64) {
    let mut states = controller.states.write();
    let state = states.get_mut(id).unwrap();
    state.phase = phase;
    state.generation = generation;
}

fn phase_of(controller: &RestartController, id: &str) -> Phase {
    controller.states.read()[id].phase
}

fn failures_of(controller: &RestartController, id: &str) -> u32 {
    controller.states.read()[id].consecutive_failures
}

fn exited(service: &str, generation: u64, output: &str) -> Signal {
    Signal::Exited {
        service: service.to_string(),
        generation,
        exit: ExitInfo {
            code: Some(1),
            signal: None,
            wall_time: Duration::from_millis(10),
        },
        output: output.to_string(),
    }
}

fn probe_ok(service: &str) -> Signal {
    Signal::Probe {
        service: service.to_string(),
        result: ProbeResult {
            ts: Utc::now(),
            outcome: ProbeOutcome::Ok,
            latency: Duration::ZERO,
        },
    }
}

#[test]
fn backoff_doubles_then_caps() {
    let desc = svc("api", &[], 5);
    assert_eq!(backoff(&desc, 1), Duration::from_millis(50));
    assert_eq!(backoff(&desc, 2), Duration::from_millis(100));
    assert_eq!(backoff(&desc, 3), Duration::from_millis(200));
    assert_eq!(backoff(&desc, 4), Duration::from_millis(400));
    assert_eq!(backoff(&desc, 5), Duration::from_millis(400));
    assert_eq!(backoff(&desc, 50), Duration::from_millis(400));
}

#[test]
fn backoff_survives_extreme_inputs() {
    let mut desc = svc("api", &[], 5);
    desc.restart_base_delay_ms = u64::MAX / 2;
    desc.restart_max_delay_ms = u64::MAX;
    assert_eq!(backoff(&desc, u32::MAX), Duration::from_millis(u64::MAX));
}

#[test]
fn tail_keeps_short_strings_whole() {
    assert_eq!(tail("hello\n", 100), "hello");
    assert_eq!(tail("", 100), "");
}

#[test]
fn tail_trims_to_char_boundary() {
    let s = "xééé";
    let trimmed = tail(s, 3);
    assert!(trimmed.len() <= 3);
    assert!(s.ends_with(&trimmed));
}

#[tokio::test(start_paused = true)]
async fn exit_moves_through_unhealthy_to_restarting() {
    let (mut controller, mut rx, _shutdown) = controller_with(vec![svc("api", &[], 3)]);
    set_phase(&controller, "api", Phase::Starting, 3);

    controller.handle(exited("api", 3, "boom")).await.unwrap();

    assert_eq!(phase_of(&controller, "api"), Phase::Restarting);
    assert_eq!(failures_of(&controller, "api"), 1);

    let events = controller.events.recent();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].to, Phase::Unhealthy);
    assert_eq!(events[0].cause, Cause::ProcessExit);
    assert!(events[0].detail.contains("boom"));
    assert_eq!(events[1].to, Phase::Restarting);

    // The backoff timer must come due as a restart request.
    match rx.recv().await {
        Some(Signal::RestartDue { service }) => assert_eq!(service, "api"),
        other => panic!("expected RestartDue, got {:?}", other),
    }
}

#[tokio::test]
async fn exit_at_failure_limit_is_terminal() {
    let (mut controller, _rx, _shutdown) = controller_with(vec![svc("api", &[], 2)]);
    set_phase(&controller, "api", Phase::Starting, 1);
    controller.states.write().get_mut("api").unwrap().consecutive_failures = 1;

    controller.handle(exited("api", 1, "")).await.unwrap();

    assert_eq!(phase_of(&controller, "api"), Phase::Failed);
    let events = controller.events.recent();
    let last = events.last().unwrap();
    assert_eq!(last.to, Phase::Failed);
    assert_eq!(last.cause, Cause::MaxRetriesExceeded);
}

#[tokio::test]
async fn stale_generation_exit_is_ignored() {
    let (mut controller, _rx, _shutdown) = controller_with(vec![svc("api", &[], 3)]);
    set_phase(&controller, "api", Phase::Healthy, 5);

    controller.handle(exited("api", 4, "")).await.unwrap();

    assert_eq!(phase_of(&controller, "api"), Phase::Healthy);
    assert_eq!(failures_of(&controller, "api"), 0);
    assert!(controller.events.is_empty());
}

#[tokio::test]
async fn dependency_outage_cascades_without_charging_dependents() {
    let (mut controller, _rx, _shutdown) =
        controller_with(vec![svc("db", &[], 3), svc("api", &["db"], 3)]);
    set_phase(&controller, "db", Phase::Healthy, 2);
    set_phase(&controller, "api", Phase::Healthy, 7);

    controller.handle(exited("db", 2, "")).await.unwrap();

    assert_eq!(phase_of(&controller, "db"), Phase::Restarting);
    assert_eq!(phase_of(&controller, "api"), Phase::Unhealthy);
    assert!(controller.states.read()["api"].blocked_on_dependency);
    assert_eq!(failures_of(&controller, "api"), 0);

    let events = controller.events.recent();
    assert!(events
        .iter()
        .any(|e| e.service == "api" && e.cause == Cause::DependencyUnhealthy));
}

#[tokio::test]
async fn dependency_outage_blocks_a_starting_dependent() {
    let (mut controller, _rx, _shutdown) =
        controller_with(vec![svc("db", &[], 3), svc("api", &["db"], 3)]);
    set_phase(&controller, "db", Phase::Healthy, 2);
    set_phase(&controller, "api", Phase::Starting, 7);

    controller.handle(exited("db", 2, "")).await.unwrap();

    assert_eq!(phase_of(&controller, "api"), Phase::Unhealthy);
    assert!(controller.states.read()["api"].blocked_on_dependency);
    assert_eq!(failures_of(&controller, "api"), 0);
}

#[tokio::test]
async fn dependency_outage_parks_a_restarting_dependent() {
    let (mut controller, _rx, _shutdown) =
        controller_with(vec![svc("db", &[], 3), svc("api", &["db"], 3)]);
    set_phase(&controller, "db", Phase::Healthy, 2);
    set_phase(&controller, "api", Phase::Restarting, 7);
    controller.states.write().get_mut("api").unwrap().restart_cause = Cause::FileChange;

    controller.handle(exited("db", 2, "")).await.unwrap();

    // The pending relaunch is parked, not burned; phase and cause survive.
    assert_eq!(phase_of(&controller, "api"), Phase::Restarting);
    assert!(controller.states.read()["api"].blocked_on_dependency);
    assert_eq!(controller.states.read()["api"].restart_cause, Cause::FileChange);
    assert_eq!(failures_of(&controller, "api"), 0);

    // The backoff timer that was already running fires into nothing.
    controller
        .handle(Signal::RestartDue {
            service: "api".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(phase_of(&controller, "api"), Phase::Restarting);
    assert!(controller.states.read()["api"].pid.is_none());
    assert_eq!(failures_of(&controller, "api"), 0);
}

#[tokio::test]
async fn restart_timer_parks_when_a_dependency_is_down() {
    let (mut controller, _rx, _shutdown) =
        controller_with(vec![svc("db", &[], 3), svc("api", &["db"], 3)]);
    set_phase(&controller, "db", Phase::Unhealthy, 2);
    set_phase(&controller, "api", Phase::Restarting, 7);

    controller
        .handle(Signal::RestartDue {
            service: "api".to_string(),
        })
        .await
        .unwrap();

    // No relaunch against a dead dependency; recovery restarts it instead.
    assert_eq!(phase_of(&controller, "api"), Phase::Restarting);
    assert!(controller.states.read()["api"].blocked_on_dependency);
    assert_eq!(failures_of(&controller, "api"), 0);
    assert!(controller.states.read()["api"].pid.is_none());
}

#[tokio::test(start_paused = true)]
async fn parked_restart_resumes_when_the_dependency_recovers() {
    let (mut controller, mut rx, _shutdown) =
        controller_with(vec![svc("db", &[], 3), svc("api", &["db"], 3)]);
    set_phase(&controller, "db", Phase::Starting, 3);
    set_phase(&controller, "api", Phase::Restarting, 7);
    controller
        .states
        .write()
        .get_mut("api")
        .unwrap()
        .blocked_on_dependency = true;

    controller.handle(probe_ok("db")).await.unwrap();

    assert_eq!(phase_of(&controller, "api"), Phase::Restarting);
    assert!(!controller.states.read()["api"].blocked_on_dependency);
    assert_eq!(
        controller.states.read()["api"].restart_cause,
        Cause::DependencyRecovered
    );

    match rx.recv().await {
        Some(Signal::RestartDue { service }) => assert_eq!(service, "api"),
        other => panic!("expected RestartDue, got {:?}", other),
    }
}

#[tokio::test]
async fn exit_of_a_blocked_service_is_not_charged() {
    let (mut controller, _rx, _shutdown) =
        controller_with(vec![svc("db", &[], 3), svc("api", &["db"], 3)]);
    set_phase(&controller, "api", Phase::Unhealthy, 7);
    {
        let mut states = controller.states.write();
        let state = states.get_mut("api").unwrap();
        state.blocked_on_dependency = true;
        state.pid = Some(4242);
    }

    controller.handle(exited("api", 7, "lost connection")).await.unwrap();

    assert_eq!(phase_of(&controller, "api"), Phase::Unhealthy);
    assert_eq!(failures_of(&controller, "api"), 0);
    assert!(controller.states.read()["api"].pid.is_none());
    assert!(controller.events.is_empty());
}

#[tokio::test]
async fn exit_while_awaiting_restart_is_charged_once() {
    let (mut controller, _rx, _shutdown) = controller_with(vec![svc("api", &[], 3)]);
    set_phase(&controller, "api", Phase::Restarting, 5);
    controller.states.write().get_mut("api").unwrap().consecutive_failures = 1;

    // The failure that entered Restarting was already counted; the reap of
    // the same child is the same incident.
    controller.handle(exited("api", 5, "")).await.unwrap();

    assert_eq!(phase_of(&controller, "api"), Phase::Restarting);
    assert_eq!(failures_of(&controller, "api"), 1);
    assert!(controller.events.is_empty());
}

#[tokio::test(start_paused = true)]
async fn reload_restarts_without_charging_failures() {
    let (mut controller, mut rx, _shutdown) = controller_with(vec![svc("web", &[], 3)]);
    set_phase(&controller, "web", Phase::Healthy, 1);

    controller
        .handle(Signal::Reload {
            service: "web".to_string(),
            rule_set: "src".to_string(),
        })
        .await
        .unwrap();

    assert_eq!(phase_of(&controller, "web"), Phase::Restarting);
    assert_eq!(failures_of(&controller, "web"), 0);
    assert_eq!(controller.states.read()["web"].restart_cause, Cause::FileChange);

    let events = controller.events.recent();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].cause, Cause::FileChange);
    assert!(events[0].detail.contains("src"));

    match rx.recv().await {
        Some(Signal::RestartDue { service }) => assert_eq!(service, "web"),
        other => panic!("expected RestartDue, got {:?}", other),
    }
}

#[tokio::test]
async fn reload_is_ignored_while_restarting() {
    let (mut controller, _rx, _shutdown) = controller_with(vec![svc("web", &[], 3)]);
    set_phase(&controller, "web", Phase::Restarting, 1);

    controller
        .handle(Signal::Reload {
            service: "web".to_string(),
            rule_set: "src".to_string(),
        })
        .await
        .unwrap();

    assert_eq!(phase_of(&controller, "web"), Phase::Restarting);
    assert!(controller.events.is_empty());
}

#[tokio::test(start_paused = true)]
async fn recovered_dependency_releases_blocked_dependent() {
    let (mut controller, mut rx, _shutdown) =
        controller_with(vec![svc("db", &[], 3), svc("api", &["db"], 3)]);
    set_phase(&controller, "db", Phase::Starting, 3);
    set_phase(&controller, "api", Phase::Unhealthy, 7);
    controller
        .states
        .write()
        .get_mut("api")
        .unwrap()
        .blocked_on_dependency = true;

    controller.handle(probe_ok("db")).await.unwrap();

    assert_eq!(phase_of(&controller, "db"), Phase::Healthy);
    assert_eq!(phase_of(&controller, "api"), Phase::Restarting);
    assert!(!controller.states.read()["api"].blocked_on_dependency);
    assert_eq!(
        controller.states.read()["api"].restart_cause,
        Cause::DependencyRecovered
    );

    match rx.recv().await {
        Some(Signal::RestartDue { service }) => assert_eq!(service, "api"),
        other => panic!("expected RestartDue, got {:?}", other),
    }
}

#[tokio::test]
async fn probe_of_blocked_service_is_inert() {
    let (mut controller, _rx, _shutdown) = controller_with(vec![svc("api", &[], 3)]);
    set_phase(&controller, "api", Phase::Unhealthy, 1);
    controller
        .states
        .write()
        .get_mut("api")
        .unwrap()
        .blocked_on_dependency = true;

    controller.handle(probe_ok("api")).await.unwrap();

    assert_eq!(phase_of(&controller, "api"), Phase::Unhealthy);
    assert!(controller.events.is_empty());
}

#[tokio::test]
async fn stopping_a_pending_service_skips_the_child() {
    let (mut controller, _rx, _shutdown) =
        controller_with(vec![svc("db", &[], 3), svc("api", &["db"], 3)]);

    controller.stop_service("api", false).await.unwrap();

    assert_eq!(phase_of(&controller, "api"), Phase::Stopped);
    let events = controller.events.recent();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].detail, "never started");

    // Stopping again must not add events.
    controller.stop_service("api", false).await.unwrap();
    assert_eq!(controller.events.len(), 1);
}
