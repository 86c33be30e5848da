#![cfg(unix)]

use super::*;
use crate::config::ServiceConfig;
use tokio::sync::mpsc;

fn service_with_probe(probe: ProbeConfig) -> ServiceConfig {
    ServiceConfig {
        identifier: "svc".to_string(),
        display_name: None,
        command: vec!["/bin/sh".to_string(), "-c".to_string(), "sleep 30".to_string()],
        working_directory: None,
        environment: Default::default(),
        port: None,
        probe,
        dependencies: vec![],
        reload_on: vec![],
        max_consecutive_failures: 5,
        restart_base_delay_ms: 1000,
        restart_max_delay_ms: 30000,
        graceful_stop_ms: 10000,
    }
}

#[tokio::test]
async fn tcp_probe_succeeds_against_a_listener() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let outcome = probe_tcp("127.0.0.1", port, Duration::from_secs(1)).await;
    assert_eq!(outcome, ProbeOutcome::Ok);
}

#[tokio::test]
async fn tcp_probe_reports_refusal() {
    // Bind then drop so the port is known free.
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let outcome = probe_tcp("127.0.0.1", port, Duration::from_secs(1)).await;
    assert_eq!(outcome, ProbeOutcome::ConnectRefused);
}

#[tokio::test]
async fn process_probe_tracks_the_child() {
    let (tx, _rx) = mpsc::channel(16);
    let manager = ProcessManager::new(tx);
    let http = reqwest::Client::new();
    let desc = service_with_probe(ProbeConfig::Process { interval_ms: 1000 });

    // No child at all reads as dead.
    let result = run_probe(&desc, &manager, &http).await;
    assert_eq!(result.outcome, ProbeOutcome::ProcessDead);

    manager.start(&desc).await.unwrap();
    let result = run_probe(&desc, &manager, &http).await;
    assert_eq!(result.outcome, ProbeOutcome::Ok);
    assert!(result.is_ok());

    manager.stop("svc", Duration::from_secs(5)).await;
    let result = run_probe(&desc, &manager, &http).await;
    assert_eq!(result.outcome, ProbeOutcome::ProcessDead);
}

/// Serve one canned HTTP response on an ephemeral port.
async fn serve_once(status_line: &'static str) -> u16 {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        if let Ok((mut stream, _)) = listener.accept().await {
            let mut request = [0u8; 1024];
            let _ = stream.read(&mut request).await;
            let response = format!(
                "{}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
                status_line
            );
            let _ = stream.write_all(response.as_bytes()).await;
        }
    });
    port
}

#[tokio::test]
async fn http_probe_accepts_the_expected_status() {
    let port = serve_once("HTTP/1.1 200 OK").await;
    let http = reqwest::Client::new();

    let outcome = probe_http(
        &http,
        &format!("http://127.0.0.1:{}/health", port),
        200,
        Duration::from_secs(2),
    )
    .await;
    assert_eq!(outcome, ProbeOutcome::Ok);
}

#[tokio::test]
async fn http_probe_flags_an_unexpected_status() {
    let port = serve_once("HTTP/1.1 503 Service Unavailable").await;
    let http = reqwest::Client::new();

    let outcome = probe_http(
        &http,
        &format!("http://127.0.0.1:{}/health", port),
        200,
        Duration::from_secs(2),
    )
    .await;
    assert_eq!(outcome, ProbeOutcome::BadStatus(503));
}

#[tokio::test]
async fn http_probe_classifies_a_refused_connection() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let http = reqwest::Client::new();

    let outcome = probe_http(
        &http,
        &format!("http://127.0.0.1:{}/health", port),
        200,
        Duration::from_secs(1),
    )
    .await;
    assert_eq!(outcome, ProbeOutcome::ConnectRefused);
}

#[test]
fn outcome_descriptions_name_the_failure() {
    assert!(ProbeOutcome::Ok.is_ok());
    assert!(!ProbeOutcome::Timeout.is_ok());
    assert_eq!(
        ProbeOutcome::BadStatus(503).describe(),
        "probe got unexpected status 503"
    );
    assert_eq!(ProbeOutcome::ProcessDead.describe(), "process is not running");
}
