//! File watching end to end: real filesystem events through debounce to a
//! single reload.

#![cfg(unix)]

use std::time::Duration;

use supervisor::config::SupervisorConfig;
use supervisor::events::Cause;
use supervisor::state::Phase;
use supervisor::supervisor::{Supervisor, SupervisorOptions};
use tempfile::TempDir;

#[tokio::test(flavor = "current_thread")]
async fn change_burst_produces_exactly_one_reload() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src");
    std::fs::create_dir_all(&src).unwrap();

    let config = SupervisorConfig::from_yaml(&format!(
        r#"
services:
  - identifier: web
    command: ["/bin/sh", "-c", "sleep 30"]
    probe: {{ kind: process, interval_ms: 50 }}
    reload_on: [frontend_src]
    graceful_stop_ms: 1000
watch_rules:
  frontend_src: ["{}/**/*.ts"]
"#,
        src.display()
    ))
    .unwrap();

    let options = SupervisorOptions {
        log_file: None,
        status_file: None,
        no_watch: false,
    };
    let mut supervisor = Supervisor::new(config, options).unwrap();
    supervisor.start().await.unwrap();

    // Reach steady state before touching files.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while supervisor.states().read()["web"].phase != Phase::Healthy {
        assert!(tokio::time::Instant::now() < deadline, "web never healthy");
        supervisor.drive_for(Duration::from_millis(50)).await;
    }
    let generation_before = supervisor.states().read()["web"].generation;

    // A burst of writes inside the debounce window.
    std::fs::write(src.join("app.ts"), "export {}").unwrap();
    std::fs::write(src.join("api.ts"), "export {}").unwrap();
    std::fs::write(src.join("util.ts"), "export {}").unwrap();
    // A path outside every rule-set must be ignored.
    std::fs::write(dir.path().join("notes.md"), "scratch").unwrap();

    // Debounce (500ms), restart, and re-probe all fit in this window.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        supervisor.drive_for(Duration::from_millis(100)).await;
        let state = supervisor.states().read()["web"].clone();
        if state.generation > generation_before && state.phase == Phase::Healthy {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "web was never reloaded"
        );
    }

    // Let any straggler events coalesce, then count reloads.
    supervisor.drive_for(Duration::from_secs(1)).await;

    let events = supervisor.events().recent();
    let reloads = events
        .iter()
        .filter(|e| e.to == Phase::Restarting && e.cause == Cause::FileChange)
        .count();
    assert_eq!(reloads, 1, "burst must collapse into one reload");
    assert_eq!(supervisor.states().read()["web"].consecutive_failures, 0);

    supervisor.shutdown(false).await;
}
