use std::path::PathBuf;

pub mod config;
pub mod errors;
pub mod events;
pub mod health;
pub mod process;
pub mod registry;
pub mod restart;
pub mod snapshot;
pub mod state;
pub mod supervisor;
pub mod watcher;

const STATE_DIR: &str = ".supervisor";

/// Conventional state directory (`~/.supervisor`), falling back to a
/// relative directory when no home directory can be determined.
pub fn state_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(STATE_DIR))
        .unwrap_or_else(|| PathBuf::from(STATE_DIR))
}

pub fn default_pid_file() -> PathBuf {
    state_dir().join("supervisor.pid")
}

pub fn default_status_file() -> PathBuf {
    state_dir().join("status.json")
}

pub fn default_event_log() -> PathBuf {
    state_dir().join("events.jsonl")
}
