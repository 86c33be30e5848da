//! Configuration schema for the supervisor.
//!
//! A configuration is a YAML document with a `services` list and an optional
//! `watch_rules` mapping of named rule-sets to path globs. Unknown keys are
//! rejected everywhere so a typo surfaces as a load error instead of a
//! silently ignored option.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::{Result, SupervisorError};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SupervisorConfig {
    #[serde(default)]
    pub services: Vec<ServiceConfig>,

    /// Named rule-sets of path globs referenced by each service's `reload_on`.
    #[serde(default)]
    pub watch_rules: BTreeMap<String, Vec<String>>,
}

impl SupervisorConfig {
    pub fn from_yaml(input: &str) -> Result<Self> {
        serde_yaml::from_str(input).map_err(|e| SupervisorError::ConfigInvalid(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SupervisorError::ConfigNotFound(path.to_path_buf())
            } else {
                SupervisorError::Io(e)
            }
        })?;
        Self::from_yaml(&content)
    }
}

/// Declarative description of one managed service. Immutable after load.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    /// Unique short name, used in events, logs, and dependency references.
    pub identifier: String,

    #[serde(default)]
    pub display_name: Option<String>,

    /// Launch command as an argv vector. Never passed through a shell.
    pub command: Vec<String>,

    #[serde(default)]
    pub working_directory: Option<PathBuf>,

    /// Environment overlay applied on top of the supervisor's environment.
    #[serde(default)]
    pub environment: HashMap<String, String>,

    /// Port the service is expected to listen on, checked before spawn.
    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default)]
    pub probe: ProbeConfig,

    /// Identifiers that must be healthy before this service starts.
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Names of `watch_rules` rule-sets whose changes reload this service.
    #[serde(default)]
    pub reload_on: Vec<String>,

    #[serde(default = "default_max_failures")]
    pub max_consecutive_failures: u32,

    #[serde(default = "default_base_delay")]
    pub restart_base_delay_ms: u64,

    #[serde(default = "default_max_delay")]
    pub restart_max_delay_ms: u64,

    #[serde(default = "default_graceful_stop")]
    pub graceful_stop_ms: u64,
}

impl ServiceConfig {
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.identifier)
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.restart_base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.restart_max_delay_ms)
    }

    pub fn graceful_stop(&self) -> Duration {
        Duration::from_millis(self.graceful_stop_ms)
    }

    /// Validate a single service entry. Cross-service checks (duplicate
    /// identifiers, dependency references, cycles) live in the registry.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.identifier.is_empty() {
            return Err("service identifier must not be empty".to_string());
        }
        if self.command.is_empty() {
            return Err(format!("service '{}' has no launch command", self.identifier));
        }
        if self.max_consecutive_failures == 0 {
            return Err(format!(
                "service '{}': max_consecutive_failures must be positive",
                self.identifier
            ));
        }
        if self.restart_base_delay_ms == 0 || self.restart_max_delay_ms == 0 {
            return Err(format!(
                "service '{}': restart delays must be positive",
                self.identifier
            ));
        }
        if self.restart_max_delay_ms < self.restart_base_delay_ms {
            return Err(format!(
                "service '{}': restart_max_delay_ms is below restart_base_delay_ms",
                self.identifier
            ));
        }
        if self.graceful_stop_ms == 0 {
            return Err(format!(
                "service '{}': graceful_stop_ms must be positive",
                self.identifier
            ));
        }
        self.probe
            .validate(self.port)
            .map_err(|e| format!("service '{}': {}", self.identifier, e))
    }
}

/// Liveness probe specification.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase", deny_unknown_fields)]
pub enum ProbeConfig {
    /// HTTP GET, healthy iff the response status equals `expected_status`.
    Http {
        url: String,
        #[serde(default = "default_expected_status")]
        expected_status: u16,
        #[serde(default = "default_probe_timeout")]
        timeout_ms: u64,
        #[serde(default = "default_probe_interval")]
        interval_ms: u64,
    },
    /// TCP connect-then-close.
    Tcp {
        #[serde(default = "default_probe_host")]
        host: String,
        port: u16,
        #[serde(default = "default_probe_timeout")]
        timeout_ms: u64,
        #[serde(default = "default_probe_interval")]
        interval_ms: u64,
    },
    /// Process-alive only.
    Process {
        #[serde(default = "default_probe_interval")]
        interval_ms: u64,
    },
}

impl Default for ProbeConfig {
    fn default() -> Self {
        ProbeConfig::Process {
            interval_ms: default_probe_interval(),
        }
    }
}

impl ProbeConfig {
    pub fn interval(&self) -> Duration {
        let ms = match self {
            ProbeConfig::Http { interval_ms, .. } => *interval_ms,
            ProbeConfig::Tcp { interval_ms, .. } => *interval_ms,
            ProbeConfig::Process { interval_ms } => *interval_ms,
        };
        Duration::from_millis(ms)
    }

    pub fn timeout(&self) -> Duration {
        let ms = match self {
            ProbeConfig::Http { timeout_ms, .. } => *timeout_ms,
            ProbeConfig::Tcp { timeout_ms, .. } => *timeout_ms,
            ProbeConfig::Process { .. } => default_probe_timeout(),
        };
        Duration::from_millis(ms)
    }

    /// Check internal consistency and agreement with the declared port.
    pub fn validate(&self, declared_port: Option<u16>) -> std::result::Result<(), String> {
        if self.interval().is_zero() {
            return Err("probe interval_ms must be positive".to_string());
        }
        match self {
            ProbeConfig::Http {
                url,
                expected_status,
                timeout_ms,
                ..
            } => {
                if *timeout_ms == 0 {
                    return Err("probe timeout_ms must be positive".to_string());
                }
                if !(100..=599).contains(expected_status) {
                    return Err(format!("invalid expected_status {}", expected_status));
                }
                let parsed = url::Url::parse(url)
                    .map_err(|e| format!("invalid probe url '{}': {}", url, e))?;
                if parsed.scheme() != "http" && parsed.scheme() != "https" {
                    return Err(format!("probe url '{}' must be http or https", url));
                }
                if let (Some(declared), Some(probed)) =
                    (declared_port, parsed.port_or_known_default())
                {
                    if declared != probed {
                        return Err(format!(
                            "probe url targets port {} but the service declares port {}",
                            probed, declared
                        ));
                    }
                }
                Ok(())
            }
            ProbeConfig::Tcp { port, timeout_ms, .. } => {
                if *timeout_ms == 0 {
                    return Err("probe timeout_ms must be positive".to_string());
                }
                if let Some(declared) = declared_port {
                    if declared != *port {
                        return Err(format!(
                            "tcp probe targets port {} but the service declares port {}",
                            port, declared
                        ));
                    }
                }
                Ok(())
            }
            ProbeConfig::Process { .. } => Ok(()),
        }
    }
}

fn default_max_failures() -> u32 {
    5
}

fn default_base_delay() -> u64 {
    1000
}

fn default_max_delay() -> u64 {
    30000
}

fn default_graceful_stop() -> u64 {
    10000
}

fn default_expected_status() -> u16 {
    200
}

fn default_probe_timeout() -> u64 {
    3000
}

fn default_probe_interval() -> u64 {
    10000
}

fn default_probe_host() -> String {
    "localhost".to_string()
}
