use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(PathBuf),

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Dependency cycle detected: {0}")]
    DependencyCycle(String),

    #[error("Unknown dependency for service {service}: {dependency}")]
    UnknownDependency { service: String, dependency: String },

    #[error("Port {port} is bound by a foreign process")]
    PortOccupied { port: u16 },

    #[error("Failed to spawn service {service}: {source}")]
    SpawnFailed {
        service: String,
        #[source]
        source: std::io::Error,
    },

    #[error("File watcher unavailable: {0}")]
    WatcherDegraded(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SupervisorError {
    /// True for errors that abort startup with exit code 2.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SupervisorError::ConfigInvalid(_)
                | SupervisorError::ConfigNotFound(_)
                | SupervisorError::ServiceNotFound(_)
                | SupervisorError::DependencyCycle(_)
                | SupervisorError::UnknownDependency { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
