//! Restart policy and lifecycle transitions.
//!
//! The [`RestartController`] is the only writer of service state. Health
//! monitors, process monitors and the file watcher report into the signal
//! channel; the controller serializes those reports into phase transitions,
//! applies the bounded-backoff restart policy, and cascades dependency
//! outages to dependents.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ServiceConfig;
use crate::errors::{Result, SupervisorError};
use crate::events::{Cause, EventLog, LifecycleEvent};
use crate::health::{spawn_health_monitor, ProbeResult};
use crate::process::{ExitInfo, ProcessManager, StopOutcome};
use crate::registry::ServiceRegistry;
use crate::snapshot;
use crate::state::{Phase, SharedStates};
use crate::supervisor::Signal;

/// Longest event-log detail retained from captured child output.
const DETAIL_TAIL_BYTES: usize = 4096;

pub struct RestartController {
    registry: Arc<ServiceRegistry>,
    states: SharedStates,
    events: Arc<EventLog>,
    manager: Arc<ProcessManager>,
    signal_tx: mpsc::Sender<Signal>,
    shutdown_rx: watch::Receiver<bool>,
    http: reqwest::Client,
    status_file: Option<PathBuf>,
    monitors: HashMap<String, JoinHandle<()>>,
}

impl RestartController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<ServiceRegistry>,
        states: SharedStates,
        events: Arc<EventLog>,
        manager: Arc<ProcessManager>,
        signal_tx: mpsc::Sender<Signal>,
        shutdown_rx: watch::Receiver<bool>,
        status_file: Option<PathBuf>,
    ) -> Self {
        Self {
            registry,
            states,
            events,
            manager,
            signal_tx,
            shutdown_rx,
            http: reqwest::Client::new(),
            status_file,
            monitors: HashMap::new(),
        }
    }

    /// Launch every service whose dependency list is empty; the rest stay
    /// Pending until all of their dependencies report Healthy.
    pub async fn start_initial(&mut self) -> Result<()> {
        let order: Vec<String> = self.registry.start_order().to_vec();
        for id in order {
            let desc = self.registry.get(&id)?.clone();
            if desc.dependencies.is_empty() {
                self.launch(&id, Cause::Operator).await?;
            } else {
                debug!("{} waits for dependencies {:?}", id, desc.dependencies);
            }
        }
        Ok(())
    }

    pub async fn handle(&mut self, signal: Signal) -> Result<()> {
        match signal {
            Signal::Probe { service, result } => self.on_probe(&service, result).await?,
            Signal::Exited {
                service,
                generation,
                exit,
                output,
            } => self.on_exit(&service, generation, exit, output).await?,
            Signal::Reload { service, rule_set } => self.on_reload(&service, &rule_set)?,
            Signal::RestartDue { service } => self.on_restart_due(&service).await?,
            Signal::WatcherDegraded { detail } => {
                warn!("file watching degraded, reloads disabled: {}", detail);
            }
            Signal::Interrupt => {
                // Handled by the supervisor run loop before dispatch.
            }
        }
        Ok(())
    }

    async fn on_probe(&mut self, service: &str, result: ProbeResult) -> Result<()> {
        let (phase, blocked, started_at) = {
            let mut states = self.states.write();
            let Some(state) = states.get_mut(service) else {
                return Ok(());
            };
            state.last_probe = Some(result.clone());
            (state.phase, state.blocked_on_dependency, state.started_at)
        };

        if !phase.is_probe_eligible() || blocked {
            return Ok(());
        }

        if result.is_ok() {
            if phase == Phase::Starting || phase == Phase::Unhealthy {
                {
                    let mut states = self.states.write();
                    if let Some(state) = states.get_mut(service) {
                        state.consecutive_failures = 0;
                    }
                }
                self.transition(
                    service,
                    Phase::Healthy,
                    Cause::ProbeOk,
                    format!("latency {}ms", result.latency.as_millis()),
                );
                self.on_service_healthy(service).await?;
            } else {
                let mut states = self.states.write();
                if let Some(state) = states.get_mut(service) {
                    state.consecutive_failures = 0;
                }
            }
            return Ok(());
        }

        // A dead child is reported through its exit notification; counting
        // the probe too would double-charge one crash.
        if !self.manager.child_alive(service) {
            debug!("probe of {} failed but the child is gone, deferring", service);
            return Ok(());
        }

        // While Starting, connectivity failures inside the grace window are
        // the service still coming up, not a fault.
        if phase == Phase::Starting {
            let grace = self.registry.get(service)?.graceful_stop();
            let elapsed = started_at
                .map(|t| (Utc::now() - t).to_std().unwrap_or_default())
                .unwrap_or(Duration::MAX);
            if elapsed < grace {
                debug!("{} still starting, probe failure within grace", service);
                return Ok(());
            }
        }

        self.fail(service, Cause::ProbeFailure, result.outcome.describe())
            .await?;
        Ok(())
    }

    async fn on_exit(
        &mut self,
        service: &str,
        generation: u64,
        exit: ExitInfo,
        output: String,
    ) -> Result<()> {
        let (phase, current_generation, blocked) = {
            let states = self.states.read();
            match states.get(service) {
                Some(state) => (state.phase, state.generation, state.blocked_on_dependency),
                None => return Ok(()),
            }
        };

        // Exits of superseded children and of deliberately stopped services
        // are not failures.
        if generation != current_generation {
            debug!(
                "ignoring exit of {} generation {} (current {})",
                service, generation, current_generation
            );
            return Ok(());
        }
        if !matches!(phase, Phase::Starting | Phase::Healthy | Phase::Unhealthy) {
            return Ok(());
        }
        // A blocked service is already counted against its dependency's
        // outage; its own death there carries no extra charge, and recovery
        // of the dependency restarts it anyway.
        if blocked {
            debug!("{} exited while blocked on a dependency", service);
            let mut states = self.states.write();
            if let Some(state) = states.get_mut(service) {
                state.pid = None;
            }
            return Ok(());
        }

        {
            let mut states = self.states.write();
            if let Some(state) = states.get_mut(service) {
                state.pid = None;
            }
        }

        let mut detail = exit.describe();
        let output = tail(&output, DETAIL_TAIL_BYTES);
        if !output.is_empty() {
            detail.push_str("; output: ");
            detail.push_str(&output);
        }
        self.fail(service, Cause::ProcessExit, detail).await
    }

    /// A change in a watched rule-set. Reload restarts are free: they never
    /// touch the failure counter.
    fn on_reload(&mut self, service: &str, rule_set: &str) -> Result<()> {
        let (phase, blocked) = {
            let states = self.states.read();
            match states.get(service) {
                Some(state) => (state.phase, state.blocked_on_dependency),
                None => return Ok(()),
            }
        };

        if blocked || !matches!(phase, Phase::Healthy | Phase::Unhealthy) {
            debug!("skipping reload of {} in phase {}", service, phase);
            return Ok(());
        }

        let was_healthy = phase == Phase::Healthy;
        {
            let mut states = self.states.write();
            if let Some(state) = states.get_mut(service) {
                state.restart_cause = Cause::FileChange;
            }
        }
        self.transition(
            service,
            Phase::Restarting,
            Cause::FileChange,
            format!("rule-set '{}'", rule_set),
        );
        if was_healthy {
            self.cascade_unhealthy(service);
        }
        self.schedule_restart(service, Duration::ZERO);
        Ok(())
    }

    async fn on_restart_due(&mut self, service: &str) -> Result<()> {
        let (phase, blocked, cause) = {
            let states = self.states.read();
            match states.get(service) {
                Some(state) => (state.phase, state.blocked_on_dependency, state.restart_cause),
                None => return Ok(()),
            }
        };

        // Stale timers fire after an operator stop or a later transition.
        if phase != Phase::Restarting {
            return Ok(());
        }
        // A blocked service restarts when its dependency recovers, not on
        // the backoff clock.
        if blocked {
            return Ok(());
        }
        // A dependency may have gone down while the timer ran; relaunching
        // against it would only burn the failure budget. Park instead.
        let desc = self.registry.get(service)?.clone();
        if !self.all_dependencies_healthy(&desc) {
            let mut states = self.states.write();
            if let Some(state) = states.get_mut(service) {
                state.blocked_on_dependency = true;
            }
            debug!("restart of {} parked until its dependencies recover", service);
            return Ok(());
        }

        self.manager.stop(service, desc.graceful_stop()).await;
        self.launch(service, cause).await
    }

    /// Record one failure and apply the restart policy.
    async fn fail(&mut self, service: &str, cause: Cause, detail: String) -> Result<()> {
        let desc = self.registry.get(service)?.clone();
        let (was_healthy, failures) = {
            let mut states = self.states.write();
            let Some(state) = states.get_mut(service) else {
                return Ok(());
            };
            state.consecutive_failures += 1;
            (state.phase == Phase::Healthy, state.consecutive_failures)
        };

        self.transition(service, Phase::Unhealthy, cause, detail.clone());
        if was_healthy {
            self.cascade_unhealthy(service);
        }

        if failures >= desc.max_consecutive_failures {
            self.manager.stop(service, Duration::ZERO).await;
            self.transition(
                service,
                Phase::Failed,
                Cause::MaxRetriesExceeded,
                format!("{} consecutive failures", failures),
            );
            return Ok(());
        }

        let delay = backoff(&desc, failures);
        {
            let mut states = self.states.write();
            if let Some(state) = states.get_mut(service) {
                state.restart_cause = cause;
            }
        }
        self.transition(
            service,
            Phase::Restarting,
            cause,
            format!("retry {} of {} in {:?}", failures, desc.max_consecutive_failures, delay),
        );
        self.schedule_restart(service, delay);
        Ok(())
    }

    /// Block every transitive dependent that is running or about to run,
    /// without charging its failure budget. Healthy and Starting dependents
    /// move to Unhealthy; a Restarting dependent keeps its phase and its
    /// pending relaunch is parked until the dependency recovers.
    fn cascade_unhealthy(&mut self, root: &str) {
        let mut stack: Vec<String> = self.registry.dependents_of(root).to_vec();
        while let Some(id) = stack.pop() {
            let blocked_phase = {
                let mut states = self.states.write();
                match states.get_mut(&id) {
                    Some(state)
                        if !state.blocked_on_dependency
                            && matches!(
                                state.phase,
                                Phase::Healthy | Phase::Starting | Phase::Restarting
                            ) =>
                    {
                        state.blocked_on_dependency = true;
                        Some(state.phase)
                    }
                    _ => None,
                }
            };
            let Some(phase) = blocked_phase else {
                continue;
            };
            if phase != Phase::Restarting {
                self.transition(
                    &id,
                    Phase::Unhealthy,
                    Cause::DependencyUnhealthy,
                    format!("dependency '{}' is unhealthy", root),
                );
            }
            stack.extend(self.registry.dependents_of(&id).iter().cloned());
        }
    }

    /// A service just reached Healthy: release dependents that were waiting
    /// on it, either for their first start or for recovery.
    async fn on_service_healthy(&mut self, service: &str) -> Result<()> {
        let dependents: Vec<String> = self.registry.dependents_of(service).to_vec();
        for id in dependents {
            let desc = self.registry.get(&id)?.clone();
            if !self.all_dependencies_healthy(&desc) {
                continue;
            }

            let (phase, blocked) = {
                let states = self.states.read();
                match states.get(&id) {
                    Some(state) => (state.phase, state.blocked_on_dependency),
                    None => continue,
                }
            };

            if phase == Phase::Pending {
                self.launch(&id, Cause::Operator).await?;
            } else if blocked {
                {
                    let mut states = self.states.write();
                    if let Some(state) = states.get_mut(&id) {
                        state.blocked_on_dependency = false;
                        state.restart_cause = Cause::DependencyRecovered;
                    }
                }
                self.transition(
                    &id,
                    Phase::Restarting,
                    Cause::DependencyRecovered,
                    format!("dependency '{}' recovered", service),
                );
                self.schedule_restart(&id, Duration::ZERO);
            }
        }
        Ok(())
    }

    fn all_dependencies_healthy(&self, desc: &ServiceConfig) -> bool {
        let states = self.states.read();
        desc.dependencies
            .iter()
            .all(|d| states.get(d).map(|s| s.phase == Phase::Healthy).unwrap_or(false))
    }

    /// Spawn the service's child and enter Starting.
    async fn launch(&mut self, service: &str, cause: Cause) -> Result<()> {
        let desc = self.registry.get(service)?.clone();
        match self.manager.start(&desc).await {
            Ok(info) => {
                {
                    let mut states = self.states.write();
                    if let Some(state) = states.get_mut(service) {
                        state.pid = Some(info.pid);
                        state.generation = info.generation;
                        state.started_at = Some(Utc::now());
                    }
                }
                self.transition(
                    service,
                    Phase::Starting,
                    cause,
                    format!("pid {}", info.pid),
                );
                self.ensure_monitor(&desc);
                Ok(())
            }
            Err(e) => self.spawn_failure(service, &desc, e).await,
        }
    }

    /// A failed spawn counts like any other failure; it just never produced
    /// a Starting phase to fall out of.
    async fn spawn_failure(
        &mut self,
        service: &str,
        desc: &ServiceConfig,
        err: SupervisorError,
    ) -> Result<()> {
        warn!("failed to start {}: {}", service, err);
        let failures = {
            let mut states = self.states.write();
            let Some(state) = states.get_mut(service) else {
                return Ok(());
            };
            state.consecutive_failures += 1;
            state.restart_cause = Cause::SpawnFailed;
            state.consecutive_failures
        };

        if failures >= desc.max_consecutive_failures {
            self.transition(
                service,
                Phase::Failed,
                Cause::MaxRetriesExceeded,
                err.to_string(),
            );
            return Ok(());
        }

        let delay = backoff(desc, failures);
        self.transition(service, Phase::Restarting, Cause::SpawnFailed, err.to_string());
        self.schedule_restart(service, delay);
        Ok(())
    }

    fn ensure_monitor(&mut self, desc: &Arc<ServiceConfig>) {
        let running = self
            .monitors
            .get(&desc.identifier)
            .map(|h| !h.is_finished())
            .unwrap_or(false);
        if running {
            return;
        }
        let handle = spawn_health_monitor(
            desc.clone(),
            self.states.clone(),
            self.manager.clone(),
            self.http.clone(),
            self.signal_tx.clone(),
            self.shutdown_rx.clone(),
        );
        self.monitors.insert(desc.identifier.clone(), handle);
    }

    /// Stop one service as part of supervisor shutdown. Idempotent; Failed
    /// and Stopped services are left alone.
    pub async fn stop_service(&mut self, service: &str, forced: bool) -> Result<()> {
        let Some(graceful) = self.begin_stop(service, forced)? else {
            return Ok(());
        };
        let outcome = self.manager.stop(service, graceful).await;
        self.finish_stop(service, outcome);
        Ok(())
    }

    /// Stop a group of mutually independent services. The phase transitions
    /// stay serialized, but the child stops run concurrently, so the group
    /// takes as long as its slowest member rather than the sum.
    pub async fn stop_level(&mut self, services: &[String], forced: bool) -> Result<()> {
        let mut stops = tokio::task::JoinSet::new();
        for id in services {
            let Some(graceful) = self.begin_stop(id, forced)? else {
                continue;
            };
            let manager = self.manager.clone();
            let id = id.clone();
            stops.spawn(async move {
                let outcome = manager.stop(&id, graceful).await;
                (id, outcome)
            });
        }
        while let Some(joined) = stops.join_next().await {
            match joined {
                Ok((id, outcome)) => self.finish_stop(&id, outcome),
                Err(e) => warn!("stop task panicked: {}", e),
            }
        }
        Ok(())
    }

    /// Enter Stopping and return the graceful window to apply, or `None`
    /// when there is nothing to stop.
    fn begin_stop(&mut self, service: &str, forced: bool) -> Result<Option<Duration>> {
        let phase = {
            let states = self.states.read();
            match states.get(service) {
                Some(state) => state.phase,
                None => return Ok(None),
            }
        };

        match phase {
            Phase::Stopped | Phase::Failed => return Ok(None),
            // A graceful stop is already in flight; only a forced retry may
            // finish it early.
            Phase::Stopping if !forced => return Ok(None),
            Phase::Pending => {
                self.transition(service, Phase::Stopped, Cause::Operator, "never started");
                return Ok(None);
            }
            _ => {}
        }

        let desc = self.registry.get(service)?.clone();
        if phase != Phase::Stopping {
            self.transition(service, Phase::Stopping, Cause::Operator, String::new());
        }
        Ok(Some(if forced {
            Duration::ZERO
        } else {
            desc.graceful_stop()
        }))
    }

    fn finish_stop(&mut self, service: &str, outcome: StopOutcome) {
        let mut detail = String::new();
        if outcome.escalation_failed {
            detail.push_str("did not die after kill");
        }
        let output = tail(&outcome.output, DETAIL_TAIL_BYTES);
        if !output.is_empty() {
            if !detail.is_empty() {
                detail.push_str("; ");
            }
            detail.push_str("output: ");
            detail.push_str(&output);
        }

        {
            let mut states = self.states.write();
            if let Some(state) = states.get_mut(service) {
                state.pid = None;
            }
        }
        self.transition(service, Phase::Stopped, Cause::Operator, detail);
    }

    pub fn any_failed(&self) -> bool {
        self.states.read().values().any(|s| s.phase == Phase::Failed)
    }

    fn schedule_restart(&self, service: &str, delay: Duration) {
        let tx = self.signal_tx.clone();
        let mut shutdown = self.shutdown_rx.clone();
        let service = service.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    let _ = tx.send(Signal::RestartDue { service }).await;
                }
                _ = shutdown.changed() => {}
            }
        });
    }

    /// Apply one phase transition: state, event log, snapshot, tracing.
    /// Identical from/to pairs are dropped so the log never stutters.
    fn transition(&self, service: &str, to: Phase, cause: Cause, detail: impl Into<String>) {
        let from = {
            let mut states = self.states.write();
            let Some(state) = states.get_mut(service) else {
                return;
            };
            if state.phase == to {
                return;
            }
            let from = state.phase;
            state.phase = to;
            state.last_transition = Utc::now();
            from
        };

        let detail = detail.into();
        info!(
            "{}: {} -> {} ({}){}{}",
            service,
            from,
            to,
            cause.as_str(),
            if detail.is_empty() { "" } else { ": " },
            detail
        );
        self.events
            .append(LifecycleEvent::new(service, from, to, cause, detail));

        if let Some(path) = &self.status_file {
            if let Err(e) = snapshot::write_status(path, &self.registry, &self.states) {
                warn!("failed to write status snapshot: {}", e);
            }
        }
    }
}

/// Bounded exponential backoff: base doubles per consecutive failure and is
/// clamped to the configured maximum.
pub fn backoff(desc: &ServiceConfig, failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(16);
    let ms = desc
        .restart_base_delay_ms
        .saturating_mul(1u64 << exp)
        .min(desc.restart_max_delay_ms);
    Duration::from_millis(ms)
}

/// Last `max` bytes of `s`, trimmed to a character boundary.
fn tail(s: &str, max: usize) -> String {
    let s = s.trim_end();
    if s.len() <= max {
        return s.to_string();
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    s[start..].to_string()
}

#[cfg(test)]
mod tests;
