//! Process management: spawning, signalling, and reaping child processes.
//!
//! Each spawned child is owned by a monitor task that waits for the process
//! to exit or for a stop request. Stops escalate from the graceful
//! termination signal to a forced kill after a bounded grace period. Stdio
//! is captured into a byte-capped ring buffer that is flushed into the
//! lifecycle event log when the child goes away.

use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub mod ring;

use crate::config::ServiceConfig;
use crate::errors::{Result, SupervisorError};
use crate::supervisor::Signal;
use ring::RingBuffer;

/// Bytes of child stdio retained per service.
const STDIO_BUFFER_BYTES: usize = 64 * 1024;

/// How long to wait for a child to die after the forced kill.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Terminal status of a reaped child.
#[derive(Debug, Clone, Default)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub wall_time: Duration,
}

impl ExitInfo {
    pub fn describe(&self) -> String {
        match (self.code, self.signal) {
            (Some(code), _) => format!("exit code {}", code),
            (None, Some(sig)) => format!("killed by signal {}", sig),
            (None, None) => "exited".to_string(),
        }
    }
}

#[derive(Debug, Default)]
pub struct StopOutcome {
    /// True when a live child actually had to be stopped.
    pub stopped: bool,
    /// True when the child survived both the graceful signal and the kill.
    pub escalation_failed: bool,
    /// Remaining captured stdio, for the event-log detail.
    pub output: String,
}

#[derive(Debug, Clone, Copy)]
pub struct SpawnInfo {
    pub pid: u32,
    pub generation: u64,
}

struct StopRequest {
    graceful: Duration,
    done: oneshot::Sender<StopReply>,
}

struct StopReply {
    escalation_failed: bool,
}

struct ChildEntry {
    pid: u32,
    generation: u64,
    port: Option<u16>,
    alive: Arc<AtomicBool>,
    exit: Arc<Mutex<Option<ExitInfo>>>,
    stop_tx: Option<oneshot::Sender<StopRequest>>,
    buffer: Arc<Mutex<RingBuffer>>,
}

/// Owner of all live children. At most one child exists per service; the
/// entry map is the authority for that invariant.
pub struct ProcessManager {
    entries: Mutex<HashMap<String, ChildEntry>>,
    next_generation: AtomicU64,
    signal_tx: mpsc::Sender<Signal>,
}

impl ProcessManager {
    pub fn new(signal_tx: mpsc::Sender<Signal>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            signal_tx,
        }
    }

    /// Spawn the service's command. The declared port, if any, must be free
    /// or held by a prior child of this supervisor (which is then
    /// force-terminated first). A port held by a foreign process fails with
    /// `PortOccupied`.
    pub async fn start(&self, desc: &ServiceConfig) -> Result<SpawnInfo> {
        // One live child per service: clear any stale entry first.
        self.stop(&desc.identifier, Duration::ZERO).await;

        if let Some(port) = desc.port {
            if !port_is_free(port) {
                // Best-effort TOCTOU check; a holder we own gets reclaimed.
                let holder = {
                    let entries = self.entries.lock();
                    entries
                        .iter()
                        .find(|(_, e)| e.port == Some(port) && e.alive.load(Ordering::SeqCst))
                        .map(|(id, _)| id.clone())
                };
                if let Some(holder) = holder {
                    warn!(
                        "port {} still held by prior child of '{}', force-terminating",
                        port, holder
                    );
                    self.stop(&holder, Duration::ZERO).await;
                }
                if !port_is_free(port) {
                    return Err(SupervisorError::PortOccupied { port });
                }
            }
        }

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let program = &desc.command[0];
        let mut cmd = Command::new(program);
        cmd.args(&desc.command[1..])
            .envs(&desc.environment)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &desc.working_directory {
            cmd.current_dir(dir);
        }
        // Own process group so descendants are signalled together.
        #[cfg(unix)]
        cmd.process_group(0);

        debug!("spawning {}: {:?}", desc.identifier, desc.command);
        let mut child = cmd.spawn().map_err(|e| SupervisorError::SpawnFailed {
            service: desc.identifier.clone(),
            source: e,
        })?;

        let pid = child.id().ok_or_else(|| SupervisorError::SpawnFailed {
            service: desc.identifier.clone(),
            source: std::io::Error::other("child exited before a pid was assigned"),
        })?;

        let buffer = Arc::new(Mutex::new(RingBuffer::new(STDIO_BUFFER_BYTES)));
        let stdout_task = child.stdout.take().map(|s| spawn_capture_task(s, buffer.clone()));
        let stderr_task = child.stderr.take().map(|s| spawn_capture_task(s, buffer.clone()));

        let alive = Arc::new(AtomicBool::new(true));
        let exit = Arc::new(Mutex::new(None));
        let (stop_tx, stop_rx) = oneshot::channel();

        tokio::spawn(monitor_child(
            desc.identifier.clone(),
            generation,
            child,
            alive.clone(),
            exit.clone(),
            buffer.clone(),
            CaptureTasks {
                stdout: stdout_task,
                stderr: stderr_task,
            },
            stop_rx,
            self.signal_tx.clone(),
        ));

        self.entries.lock().insert(
            desc.identifier.clone(),
            ChildEntry {
                pid,
                generation,
                port: desc.port,
                alive,
                exit,
                stop_tx: Some(stop_tx),
                buffer,
            },
        );

        info!("service {} started with pid {}", desc.identifier, pid);
        Ok(SpawnInfo { pid, generation })
    }

    /// Stop the service's child, escalating from the graceful signal to a
    /// forced kill after `graceful`. Idempotent: a missing or already-exited
    /// child is a no-op.
    pub async fn stop(&self, service: &str, graceful: Duration) -> StopOutcome {
        let entry = self.entries.lock().remove(service);
        let Some(mut entry) = entry else {
            return StopOutcome::default();
        };

        let mut outcome = StopOutcome::default();

        if entry.alive.load(Ordering::SeqCst) {
            if let Some(stop_tx) = entry.stop_tx.take() {
                let (done_tx, done_rx) = oneshot::channel();
                let sent = stop_tx
                    .send(StopRequest {
                        graceful,
                        done: done_tx,
                    })
                    .is_ok();
                if sent {
                    outcome.stopped = true;
                    // Headroom for the kill escalation plus capture settling.
                    let deadline = graceful + KILL_GRACE + Duration::from_secs(2);
                    match tokio::time::timeout(deadline, done_rx).await {
                        Ok(Ok(reply)) => outcome.escalation_failed = reply.escalation_failed,
                        // Monitor raced a natural exit or went away; the
                        // child is gone either way.
                        Ok(Err(_)) => {}
                        Err(_) => {
                            warn!("stop of {} did not acknowledge in time", service);
                            outcome.escalation_failed = true;
                        }
                    }
                }
            }
        }

        outcome.output = entry.buffer.lock().drain();
        outcome
    }

    /// Non-blocking exit poll: `None` while the child is running. A service
    /// with no child at all reports a default `ExitInfo`.
    pub fn poll_exit(&self, service: &str) -> Option<ExitInfo> {
        let entries = self.entries.lock();
        match entries.get(service) {
            Some(entry) if entry.alive.load(Ordering::SeqCst) => None,
            Some(entry) => Some(entry.exit.lock().clone().unwrap_or_default()),
            None => Some(ExitInfo::default()),
        }
    }

    pub fn child_alive(&self, service: &str) -> bool {
        self.entries
            .lock()
            .get(service)
            .map(|e| e.alive.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    pub fn pid_of(&self, service: &str) -> Option<u32> {
        self.entries.lock().get(service).map(|e| e.pid)
    }

    pub fn generation_of(&self, service: &str) -> Option<u64> {
        self.entries.lock().get(service).map(|e| e.generation)
    }

    /// Ports that live children declared and that something currently holds
    /// bound. A declared port a child has not (yet) bound is excluded.
    pub fn ports_in_use(&self) -> BTreeSet<u16> {
        let declared: Vec<u16> = self
            .entries
            .lock()
            .values()
            .filter(|e| e.alive.load(Ordering::SeqCst))
            .filter_map(|e| e.port)
            .collect();
        declared
            .into_iter()
            .filter(|port| !port_is_free(*port))
            .collect()
    }
}

/// Best-effort free-port check: the verdict can become stale immediately
/// after it is taken, so occupancy is reported, never silently ignored.
fn port_is_free(port: u16) -> bool {
    std::net::TcpListener::bind(("127.0.0.1", port)).is_ok()
}

fn spawn_capture_task(
    stream: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    buffer: Arc<Mutex<RingBuffer>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let reader = BufReader::new(stream);
        let mut lines = reader.lines();
        while let Ok(Some(line)) = lines.next_line().await {
            buffer.lock().push_line(&line);
        }
    })
}

struct CaptureTasks {
    stdout: Option<JoinHandle<()>>,
    stderr: Option<JoinHandle<()>>,
}

impl CaptureTasks {
    /// Wait for the capture tasks to hit EOF so the last lines land in the
    /// buffer before it is drained. Bounded in case the pipes are still
    /// held open by a survivor.
    async fn settle(self) {
        let join = async {
            if let Some(task) = self.stdout {
                let _ = task.await;
            }
            if let Some(task) = self.stderr {
                let _ = task.await;
            }
        };
        let _ = tokio::time::timeout(Duration::from_secs(1), join).await;
    }
}

#[allow(clippy::too_many_arguments)]
async fn monitor_child(
    service: String,
    generation: u64,
    mut child: Child,
    alive: Arc<AtomicBool>,
    exit_slot: Arc<Mutex<Option<ExitInfo>>>,
    buffer: Arc<Mutex<RingBuffer>>,
    captures: CaptureTasks,
    stop_rx: oneshot::Receiver<StopRequest>,
    signal_tx: mpsc::Sender<Signal>,
) {
    let started = Instant::now();

    tokio::select! {
        result = child.wait() => {
            let info = exit_info(result.ok(), started);
            info!("service {} exited: {}", service, info.describe());
            alive.store(false, Ordering::SeqCst);
            *exit_slot.lock() = Some(info.clone());

            captures.settle().await;
            let output = buffer.lock().drain();
            let event = Signal::Exited { service: service.clone(), generation, exit: info, output };
            if let Err(e) = signal_tx.send(event).await {
                debug!("exit channel closed for {}: {}", service, e);
            }
        }
        request = stop_rx => {
            let Ok(StopRequest { graceful, done }) = request else {
                // Manager dropped the handle; wait out the child so it is reaped.
                let _ = child.wait().await;
                alive.store(false, Ordering::SeqCst);
                return;
            };

            send_graceful_signal(&child, &service);

            let mut escalation_failed = false;
            match tokio::time::timeout(graceful, child.wait()).await {
                Ok(result) => {
                    *exit_slot.lock() = Some(exit_info(result.ok(), started));
                }
                Err(_) => {
                    warn!("service {} ignored graceful stop, killing", service);
                    let _ = child.kill().await;
                    match tokio::time::timeout(KILL_GRACE, child.wait()).await {
                        Ok(result) => {
                            *exit_slot.lock() = Some(exit_info(result.ok(), started));
                        }
                        Err(_) => {
                            escalation_failed = true;
                        }
                    }
                }
            }

            alive.store(false, Ordering::SeqCst);
            captures.settle().await;
            // No exit signal here: deliberate stops are not failures.
            let _ = done.send(StopReply { escalation_failed });
        }
    }
}

#[cfg(unix)]
fn send_graceful_signal(child: &Child, service: &str) {
    use nix::sys::signal::{kill, Signal as NixSignal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        debug!("sending SIGTERM to {} (pid {})", service, pid);
        if let Err(e) = kill(Pid::from_raw(pid as i32), NixSignal::SIGTERM) {
            warn!("failed to signal {}: {}", service, e);
        }
    }
}

#[cfg(not(unix))]
fn send_graceful_signal(child: &Child, service: &str) {
    // No polite signal on this platform; the kill escalation handles it.
    let _ = (child, service);
}


fn exit_info(status: Option<std::process::ExitStatus>, started: Instant) -> ExitInfo {
    let wall_time = started.elapsed();
    match status {
        Some(status) => {
            #[cfg(unix)]
            let signal = {
                use std::os::unix::process::ExitStatusExt;
                status.signal()
            };
            #[cfg(not(unix))]
            let signal = None;
            ExitInfo {
                code: status.code(),
                signal,
                wall_time,
            }
        }
        None => ExitInfo {
            code: None,
            signal: None,
            wall_time,
        },
    }
}
