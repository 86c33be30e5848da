//! Health probing.
//!
//! Every service gets one monitor task that fires its probe at the
//! configured interval and reports the verdict to the restart controller
//! over the shared signal channel. Monitors never mutate service state
//! themselves; they observe and report.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

use crate::config::{ProbeConfig, ServiceConfig};
use crate::process::ProcessManager;
use crate::state::SharedStates;
use crate::supervisor::Signal;

/// Verdict of a single probe attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Ok,
    Timeout,
    BadStatus(u16),
    ConnectRefused,
    ProcessDead,
}

impl ProbeOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, ProbeOutcome::Ok)
    }

    pub fn describe(&self) -> String {
        match self {
            ProbeOutcome::Ok => "probe succeeded".to_string(),
            ProbeOutcome::Timeout => "probe timed out".to_string(),
            ProbeOutcome::BadStatus(status) => {
                format!("probe got unexpected status {}", status)
            }
            ProbeOutcome::ConnectRefused => "probe connection refused".to_string(),
            ProbeOutcome::ProcessDead => "process is not running".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub ts: DateTime<Utc>,
    pub outcome: ProbeOutcome,
    pub latency: Duration,
}

impl ProbeResult {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Spawn the per-service probe loop. The task ends when the shutdown flag
/// flips or the service reaches a terminal phase.
pub fn spawn_health_monitor(
    desc: Arc<ServiceConfig>,
    states: SharedStates,
    manager: Arc<ProcessManager>,
    http: reqwest::Client,
    signal_tx: mpsc::Sender<Signal>,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let interval = desc.probe.interval();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {
                    debug!("health monitor for {} shutting down", desc.identifier);
                    return;
                }
            }

            let eligible = {
                let states = states.read();
                match states.get(desc.identifier.as_str()) {
                    Some(state) if state.phase.is_terminal() => {
                        debug!(
                            "health monitor for {} ending, service is {}",
                            desc.identifier, state.phase
                        );
                        return;
                    }
                    // Blocked services are not probed so dependency outages
                    // do not burn their failure budget.
                    Some(state) => state.phase.is_probe_eligible() && !state.blocked_on_dependency,
                    None => return,
                }
            };
            if !eligible {
                continue;
            }

            let result = run_probe(&desc, &manager, &http).await;
            trace!("probe of {}: {:?}", desc.identifier, result.outcome);
            let event = Signal::Probe {
                service: desc.identifier.clone(),
                result,
            };
            if signal_tx.send(event).await.is_err() {
                return;
            }
        }
    })
}

/// Execute one probe attempt against the service.
pub async fn run_probe(
    desc: &ServiceConfig,
    manager: &ProcessManager,
    http: &reqwest::Client,
) -> ProbeResult {
    let started = Instant::now();
    let outcome = match &desc.probe {
        ProbeConfig::Http {
            url,
            expected_status,
            ..
        } => probe_http(http, url, *expected_status, desc.probe.timeout()).await,
        ProbeConfig::Tcp { host, port, .. } => {
            probe_tcp(host, *port, desc.probe.timeout()).await
        }
        ProbeConfig::Process { .. } => probe_process(desc, manager),
    };
    ProbeResult {
        ts: Utc::now(),
        outcome,
        latency: started.elapsed(),
    }
}

async fn probe_http(
    http: &reqwest::Client,
    url: &str,
    expected_status: u16,
    timeout: Duration,
) -> ProbeOutcome {
    match http.get(url).timeout(timeout).send().await {
        Ok(response) => {
            let status = response.status().as_u16();
            if status == expected_status {
                ProbeOutcome::Ok
            } else {
                ProbeOutcome::BadStatus(status)
            }
        }
        Err(e) if e.is_timeout() => ProbeOutcome::Timeout,
        Err(_) => ProbeOutcome::ConnectRefused,
    }
}

async fn probe_tcp(host: &str, port: u16, timeout: Duration) -> ProbeOutcome {
    match tokio::time::timeout(timeout, tokio::net::TcpStream::connect((host, port))).await {
        Ok(Ok(_stream)) => ProbeOutcome::Ok,
        Ok(Err(_)) => ProbeOutcome::ConnectRefused,
        Err(_) => ProbeOutcome::Timeout,
    }
}

fn probe_process(desc: &ServiceConfig, manager: &ProcessManager) -> ProbeOutcome {
    match manager.poll_exit(&desc.identifier) {
        None => ProbeOutcome::Ok,
        Some(_) => ProbeOutcome::ProcessDead,
    }
}

#[cfg(test)]
mod tests;
