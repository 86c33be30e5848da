//! The append-only lifecycle event log.
//!
//! Every phase transition is recorded exactly once, as one JSON object per
//! line on disk and in a bounded in-memory ring for diagnostics. Records are
//! never rewritten; rotation is the operator's concern.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use tracing::warn;

use crate::errors::Result;
use crate::state::Phase;

/// What triggered a phase transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cause {
    Operator,
    ProbeOk,
    ProbeFailure,
    ProcessExit,
    SpawnFailed,
    FileChange,
    DependencyUnhealthy,
    DependencyRecovered,
    MaxRetriesExceeded,
}

impl Cause {
    pub fn as_str(&self) -> &'static str {
        match self {
            Cause::Operator => "operator",
            Cause::ProbeOk => "probe_ok",
            Cause::ProbeFailure => "probe_failure",
            Cause::ProcessExit => "process_exit",
            Cause::SpawnFailed => "spawn_failed",
            Cause::FileChange => "file_change",
            Cause::DependencyUnhealthy => "dependency_unhealthy",
            Cause::DependencyRecovered => "dependency_recovered",
            Cause::MaxRetriesExceeded => "max_retries_exceeded",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub ts: DateTime<Utc>,
    pub service: String,
    pub from: Phase,
    pub to: Phase,
    pub cause: Cause,
    pub detail: String,
}

impl LifecycleEvent {
    pub fn new(
        service: impl Into<String>,
        from: Phase,
        to: Phase,
        cause: Cause,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            ts: Utc::now(),
            service: service.into(),
            from,
            to,
            cause,
            detail: detail.into(),
        }
    }
}

struct LogInner {
    file: Option<File>,
    recent: VecDeque<LifecycleEvent>,
    capacity: usize,
}

/// Append-only event log behind a single mutex. Readers take snapshots.
pub struct EventLog {
    inner: Mutex<LogInner>,
}

impl EventLog {
    /// Open the log, appending to `path` when given. `capacity` bounds the
    /// in-memory ring; the file itself only ever grows.
    pub fn open(path: Option<&Path>, capacity: usize) -> Result<Self> {
        let file = match path {
            Some(p) => {
                if let Some(parent) = p.parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
                Some(OpenOptions::new().create(true).append(true).open(p)?)
            }
            None => None,
        };
        Ok(Self {
            inner: Mutex::new(LogInner {
                file,
                recent: VecDeque::with_capacity(capacity.min(1024)),
                capacity,
            }),
        })
    }

    /// In-memory log for tests and diagnostics.
    pub fn in_memory(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(LogInner {
                file: None,
                recent: VecDeque::new(),
                capacity,
            }),
        }
    }

    pub fn append(&self, event: LifecycleEvent) {
        let mut inner = self.inner.lock();
        if let Some(file) = inner.file.as_mut() {
            match serde_json::to_string(&event) {
                Ok(line) => {
                    if let Err(e) = writeln!(file, "{}", line) {
                        warn!("failed to append to event log: {}", e);
                    }
                }
                Err(e) => warn!("failed to serialize lifecycle event: {}", e),
            }
        }
        if inner.recent.len() >= inner.capacity {
            inner.recent.pop_front();
        }
        inner.recent.push_back(event);
    }

    /// Snapshot of the retained records, oldest first.
    pub fn recent(&self) -> Vec<LifecycleEvent> {
        self.inner.lock().recent.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().recent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
