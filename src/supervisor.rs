//! The supervisor event loop.
//!
//! One mpsc channel carries every runtime signal: probe verdicts, child
//! exits, reload intents, restart timers, and operator interrupts. The loop
//! consumes them single-file, so the restart controller never sees two
//! signals concurrently.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::config::SupervisorConfig;
use crate::errors::Result;
use crate::events::EventLog;
use crate::health::ProbeResult;
use crate::process::{ExitInfo, ProcessManager};
use crate::registry::ServiceRegistry;
use crate::restart::RestartController;
use crate::state::{new_shared_states, SharedStates};
use crate::watcher::spawn_watcher;

/// Signal channel depth; deep enough that monitor tasks never stall.
const SIGNAL_QUEUE: usize = 256;

/// Retained lifecycle events for diagnostics.
const EVENT_RING_CAPACITY: usize = 512;

/// A second interrupt inside this window forces an immediate kill-all.
const ESCALATION_WINDOW: Duration = Duration::from_secs(3);

/// Everything the event loop reacts to.
#[derive(Debug)]
pub enum Signal {
    /// A health monitor finished one probe attempt.
    Probe { service: String, result: ProbeResult },
    /// A child exited on its own. Generation distinguishes the current
    /// child from superseded ones.
    Exited {
        service: String,
        generation: u64,
        exit: ExitInfo,
        output: String,
    },
    /// A watched rule-set settled after a change burst.
    Reload { service: String, rule_set: String },
    /// A backoff timer came due.
    RestartDue { service: String },
    /// The file watcher died at runtime; reloads are disabled.
    WatcherDegraded { detail: String },
    /// Operator interrupt or terminate.
    Interrupt,
}

#[derive(Debug, Clone, Default)]
pub struct SupervisorOptions {
    /// JSONL event log destination; `None` keeps events in memory only.
    pub log_file: Option<PathBuf>,
    /// Status snapshot destination, rewritten on every transition.
    pub status_file: Option<PathBuf>,
    /// Disable to run without filesystem watching.
    pub no_watch: bool,
}

pub struct Supervisor {
    registry: Arc<ServiceRegistry>,
    states: SharedStates,
    events: Arc<EventLog>,
    controller: RestartController,
    signal_tx: mpsc::Sender<Signal>,
    signal_rx: mpsc::Receiver<Signal>,
    shutdown_tx: watch::Sender<bool>,
    no_watch: bool,
    watcher: Option<JoinHandle<()>>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig, options: SupervisorOptions) -> Result<Self> {
        let registry = Arc::new(ServiceRegistry::load(config)?);
        let states = new_shared_states(registry.identifiers());
        let events = Arc::new(EventLog::open(
            options.log_file.as_deref(),
            EVENT_RING_CAPACITY,
        )?);
        let (signal_tx, signal_rx) = mpsc::channel(SIGNAL_QUEUE);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let manager = Arc::new(ProcessManager::new(signal_tx.clone()));
        let controller = RestartController::new(
            registry.clone(),
            states.clone(),
            events.clone(),
            manager,
            signal_tx.clone(),
            shutdown_rx,
            options.status_file.clone(),
        );
        Ok(Self {
            registry,
            states,
            events,
            controller,
            signal_tx,
            signal_rx,
            shutdown_tx,
            no_watch: options.no_watch,
            watcher: None,
        })
    }

    /// Launch the watcher and the root services. Watcher setup failure is
    /// degraded operation, not a startup error.
    pub async fn start(&mut self) -> Result<()> {
        if !self.no_watch && !self.registry.watch_rules().is_empty() {
            match spawn_watcher(
                self.registry.clone(),
                self.signal_tx.clone(),
                self.shutdown_tx.subscribe(),
            ) {
                Ok(handle) => self.watcher = Some(handle),
                Err(e) => warn!("file watching unavailable, reloads disabled: {}", e),
            }
        }
        self.controller.start_initial().await
    }

    /// Run to completion: consume signals until an interrupt, then shut
    /// down and return the process exit code.
    pub async fn run(&mut self) -> Result<i32> {
        self.forward_os_signals();
        self.start().await?;

        loop {
            let Some(signal) = self.signal_rx.recv().await else {
                // All senders dropped; nothing can ever change again.
                return Ok(self.shutdown(false).await);
            };
            if matches!(signal, Signal::Interrupt) {
                info!("interrupt received, beginning graceful shutdown");
                return Ok(self.shutdown(false).await);
            }
            if let Err(e) = self.controller.handle(signal).await {
                error!("fatal error in event loop: {}", e);
                self.shutdown(false).await;
                return Err(e);
            }
        }
    }

    /// Stop everything in reverse dependency order; services within one
    /// dependency level stop concurrently, so total shutdown time is
    /// bounded by the per-level maxima, not the sum of graceful windows.
    /// A second interrupt within the escalation window abandons graceful
    /// stops for forced kills and yields exit code 4.
    pub async fn shutdown(&mut self, mut forced: bool) -> i32 {
        let _ = self.shutdown_tx.send(true);
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        let started = Instant::now();
        let levels: Vec<Vec<String>> = self.registry.stop_levels().to_vec();

        for level in &levels {
            if forced {
                if let Err(e) = self.controller.stop_level(level, true).await {
                    warn!("forced stop failed: {}", e);
                }
                continue;
            }

            let mut escalate = false;
            {
                let controller = &mut self.controller;
                let rx = &mut self.signal_rx;
                let stop = controller.stop_level(level, false);
                tokio::pin!(stop);
                loop {
                    tokio::select! {
                        result = &mut stop => {
                            if let Err(e) = result {
                                warn!("stop failed: {}", e);
                            }
                            break;
                        }
                        signal = rx.recv() => {
                            match signal {
                                Some(Signal::Interrupt)
                                    if started.elapsed() <= ESCALATION_WINDOW =>
                                {
                                    warn!("second interrupt, forcing shutdown");
                                    escalate = true;
                                    break;
                                }
                                // Late or non-interrupt signals are drained
                                // and dropped; the shutdown decision is made.
                                Some(_) | None => {}
                            }
                        }
                    }
                }
            }
            if escalate {
                forced = true;
                if let Err(e) = self.controller.stop_level(level, true).await {
                    warn!("forced stop failed: {}", e);
                }
            }
        }

        if forced {
            4
        } else if self.controller.any_failed() {
            3
        } else {
            0
        }
    }

    /// Translate OS interrupt/terminate into the internal interrupt signal.
    fn forward_os_signals(&self) {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let tx = self.signal_tx.clone();
            tokio::spawn(async move {
                let mut interrupt = match signal(SignalKind::interrupt()) {
                    Ok(s) => s,
                    Err(e) => {
                        warn!("cannot install SIGINT handler: {}", e);
                        return;
                    }
                };
                let mut terminate = match signal(SignalKind::terminate()) {
                    Ok(s) => s,
                    Err(e) => {
                        warn!("cannot install SIGTERM handler: {}", e);
                        return;
                    }
                };
                loop {
                    tokio::select! {
                        _ = interrupt.recv() => {}
                        _ = terminate.recv() => {}
                    }
                    if tx.send(Signal::Interrupt).await.is_err() {
                        return;
                    }
                }
            });
        }
    }

    /// Process signals until the window elapses. Used by tests that need
    /// the loop to make progress without running it forever.
    pub async fn drive_for(&mut self, window: Duration) {
        let deadline = Instant::now() + window;
        loop {
            match tokio::time::timeout_at(deadline, self.signal_rx.recv()).await {
                Ok(Some(Signal::Interrupt)) => continue,
                Ok(Some(signal)) => {
                    if let Err(e) = self.controller.handle(signal).await {
                        warn!("event loop error: {}", e);
                    }
                }
                Ok(None) | Err(_) => return,
            }
        }
    }

    pub fn states(&self) -> &SharedStates {
        &self.states
    }

    pub fn events(&self) -> &Arc<EventLog> {
        &self.events
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Sender for injecting signals, used by tests and diagnostics.
    pub fn signal_sender(&self) -> mpsc::Sender<Signal> {
        self.signal_tx.clone()
    }
}
