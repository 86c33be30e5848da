//! Runtime state of managed services.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::events::Cause;
use crate::health::ProbeResult;

/// Lifecycle phase of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Pending,
    Starting,
    Healthy,
    Unhealthy,
    Restarting,
    Failed,
    Stopping,
    Stopped,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Pending => "pending",
            Phase::Starting => "starting",
            Phase::Healthy => "healthy",
            Phase::Unhealthy => "unhealthy",
            Phase::Restarting => "restarting",
            Phase::Failed => "failed",
            Phase::Stopping => "stopping",
            Phase::Stopped => "stopped",
        }
    }

    /// Phases in which the health monitor runs the probe.
    pub fn is_probe_eligible(&self) -> bool {
        matches!(self, Phase::Starting | Phase::Healthy | Phase::Unhealthy)
    }

    /// Phases that end a monitor task for good.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Failed | Phase::Stopped)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable per-service state. Only the restart controller writes to it;
/// health monitors and the snapshot writer read.
#[derive(Debug, Clone)]
pub struct ServiceState {
    pub phase: Phase,
    pub pid: Option<u32>,
    /// Monotonic spawn counter; exit notifications for older generations
    /// belong to children this supervisor already stopped.
    pub generation: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_probe: Option<ProbeResult>,
    pub last_transition: DateTime<Utc>,
    /// Set while a dependency is away from Healthy; suppresses probing and
    /// failure counting until the dependency recovers.
    pub blocked_on_dependency: bool,
    /// Cause recorded on entry to Restarting, replayed on the
    /// Restarting -> Starting transition.
    pub restart_cause: Cause,
}

impl Default for ServiceState {
    fn default() -> Self {
        Self {
            phase: Phase::Pending,
            pid: None,
            generation: 0,
            started_at: None,
            consecutive_failures: 0,
            last_probe: None,
            last_transition: Utc::now(),
            blocked_on_dependency: false,
            restart_cause: Cause::Operator,
        }
    }
}

pub type SharedStates = Arc<RwLock<HashMap<String, ServiceState>>>;

pub fn new_shared_states<'a>(identifiers: impl Iterator<Item = &'a str>) -> SharedStates {
    let map = identifiers
        .map(|id| (id.to_string(), ServiceState::default()))
        .collect();
    Arc::new(RwLock::new(map))
}
