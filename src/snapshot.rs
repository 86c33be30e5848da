//! Machine-readable status snapshots.
//!
//! The snapshot file is rewritten atomically after every phase transition,
//! so `status` invocations in another process always read a complete JSON
//! document, never a torn write.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;

use crate::errors::Result;
use crate::registry::ServiceRegistry;
use crate::state::{Phase, SharedStates};

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub written_at: DateTime<Utc>,
    pub supervisor_pid: u32,
    pub services: Vec<ServiceRow>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServiceRow {
    pub identifier: String,
    pub phase: Phase,
    pub pid: Option<u32>,
    pub consecutive_failures: u32,
    pub last_transition: DateTime<Utc>,
}

/// Write the snapshot via a temp file rename in the target directory.
pub fn write_status(path: &Path, registry: &ServiceRegistry, states: &SharedStates) -> Result<()> {
    let snapshot = collect(registry, states);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
    let mut tmp = match dir {
        Some(dir) => tempfile::NamedTempFile::new_in(dir)?,
        None => tempfile::NamedTempFile::new_in(".")?,
    };
    let json = serde_json::to_string_pretty(&snapshot)
        .map_err(|e| crate::errors::SupervisorError::Internal(e.to_string()))?;
    tmp.write_all(json.as_bytes())?;
    tmp.write_all(b"\n")?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

pub fn read_status(path: &Path) -> Result<StatusSnapshot> {
    let content = std::fs::read_to_string(path)?;
    serde_json::from_str(&content)
        .map_err(|e| crate::errors::SupervisorError::Internal(format!("bad status file: {}", e)))
}

fn collect(registry: &ServiceRegistry, states: &SharedStates) -> StatusSnapshot {
    let states = states.read();
    let services = registry
        .start_order()
        .iter()
        .filter_map(|id| {
            states.get(id).map(|state| ServiceRow {
                identifier: id.clone(),
                phase: state.phase,
                pid: state.pid,
                consecutive_failures: state.consecutive_failures,
                last_transition: state.last_transition,
            })
        })
        .collect();
    StatusSnapshot {
        written_at: Utc::now(),
        supervisor_pid: std::process::id(),
        services,
    }
}
