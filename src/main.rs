use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use supervisor::config::SupervisorConfig;
use supervisor::snapshot;
use supervisor::supervisor::{Supervisor, SupervisorOptions};
use supervisor::{default_event_log, default_pid_file, default_status_file};

#[derive(Parser)]
#[command(name = "supervisor", version, about = "Local development service supervisor")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the supervisor and run until interrupted.
    Run {
        /// Path to the service configuration.
        #[arg(long, env = "SUPERVISOR_CONFIG", default_value = "supervisor.yaml")]
        config: PathBuf,

        /// Lifecycle event log (JSON lines, append-only).
        #[arg(long, env = "SUPERVISOR_LOG")]
        log: Option<PathBuf>,

        /// Machine-readable status snapshot, rewritten on every transition.
        #[arg(long)]
        status_file: Option<PathBuf>,

        /// Pid file for `supervisor stop`.
        #[arg(long, env = "SUPERVISOR_PID_FILE")]
        pid_file: Option<PathBuf>,

        /// Disable filesystem watching and reload-on-change.
        #[arg(long)]
        no_watch: bool,
    },
    /// Print the current phase of every service from the status snapshot.
    Status {
        #[arg(long)]
        status_file: Option<PathBuf>,
    },
    /// Ask a running supervisor to shut down gracefully.
    Stop {
        #[arg(long, env = "SUPERVISOR_PID_FILE")]
        pid_file: Option<PathBuf>,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let code = match cli.command {
        Command::Run {
            config,
            log,
            status_file,
            pid_file,
            no_watch,
        } => run(config, log, status_file, pid_file, no_watch).await,
        Command::Status { status_file } => status(status_file),
        Command::Stop { pid_file } => stop(pid_file),
    };
    std::process::exit(code);
}

async fn run(
    config_path: PathBuf,
    log: Option<PathBuf>,
    status_file: Option<PathBuf>,
    pid_file: Option<PathBuf>,
    no_watch: bool,
) -> i32 {
    let config = match SupervisorConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            return 2;
        }
    };

    let options = SupervisorOptions {
        log_file: Some(log.unwrap_or_else(default_event_log)),
        status_file: Some(status_file.unwrap_or_else(default_status_file)),
        no_watch,
    };
    let pid_path = pid_file.unwrap_or_else(default_pid_file);

    let mut supervisor = match Supervisor::new(config, options) {
        Ok(supervisor) => supervisor,
        Err(e) => {
            eprintln!("error: {}", e);
            return if e.is_config_error() { 2 } else { 4 };
        }
    };

    if let Err(e) = write_pid_file(&pid_path) {
        eprintln!("error: cannot write pid file {}: {}", pid_path.display(), e);
        return 4;
    }

    info!("supervisor started, pid {}", std::process::id());
    let code = match supervisor.run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {}", e);
            if e.is_config_error() {
                2
            } else {
                4
            }
        }
    };

    let _ = std::fs::remove_file(&pid_path);
    code
}

fn write_pid_file(path: &std::path::Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, format!("{}\n", std::process::id()))
}

fn status(status_file: Option<PathBuf>) -> i32 {
    use tabled::{settings::Style, Table, Tabled};

    #[derive(Tabled)]
    struct Row {
        #[tabled(rename = "SERVICE")]
        service: String,
        #[tabled(rename = "PHASE")]
        phase: String,
        #[tabled(rename = "PID")]
        pid: String,
        #[tabled(rename = "FAILURES")]
        failures: u32,
        #[tabled(rename = "LAST TRANSITION")]
        last_transition: String,
    }

    let path = status_file.unwrap_or_else(default_status_file);
    let snapshot = match snapshot::read_status(&path) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            eprintln!("error: cannot read status from {}: {}", path.display(), e);
            return 1;
        }
    };

    let rows: Vec<Row> = snapshot
        .services
        .iter()
        .map(|s| Row {
            service: s.identifier.clone(),
            phase: s.phase.to_string(),
            pid: s
                .pid
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string()),
            failures: s.consecutive_failures,
            last_transition: s.last_transition.to_rfc3339(),
        })
        .collect();

    if rows.is_empty() {
        println!("no services");
        return 0;
    }

    let mut table = Table::new(rows);
    table.with(Style::sharp());
    println!("{}", table);
    println!(
        "snapshot written {} by pid {}",
        snapshot.written_at.to_rfc3339(),
        snapshot.supervisor_pid
    );
    0
}

#[cfg(unix)]
fn stop(pid_file: Option<PathBuf>) -> i32 {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let path = pid_file.unwrap_or_else(default_pid_file);
    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) => {
            eprintln!("error: cannot read pid file {}: {}", path.display(), e);
            return 1;
        }
    };
    let pid: i32 = match content.trim().parse() {
        Ok(pid) => pid,
        Err(_) => {
            eprintln!("error: malformed pid file {}", path.display());
            return 1;
        }
    };

    match kill(Pid::from_raw(pid), Signal::SIGTERM) {
        Ok(()) => {
            println!("sent stop request to supervisor (pid {})", pid);
            0
        }
        Err(Errno::ESRCH) => {
            eprintln!("supervisor (pid {}) is not running, removing stale pid file", pid);
            let _ = std::fs::remove_file(&path);
            1
        }
        Err(e) => {
            eprintln!("error: cannot signal pid {}: {}", pid, e);
            1
        }
    }
}

#[cfg(not(unix))]
fn stop(_pid_file: Option<PathBuf>) -> i32 {
    eprintln!("error: stop is only supported on unix platforms");
    1
}
