//! Fleet fan-out tests driving [`Orchestrator::run`] over a real roster.
//!
//! No SSH endpoint is available here, so the devices point at closed
//! localhost ports: every session fails the reachability check, which
//! still exercises the worker pool, the job queue, the result channel and
//! the per-device error classification.

use std::io::Write;
use std::path::PathBuf;

use fleetrun::config::{DeviceConfig, FleetConfig};
use fleetrun::error::RunError;
use fleetrun::orchestrator::Orchestrator;

fn commands_file() -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(b"show version\n").expect("write commands");
    file
}

fn dead_device(hostname: &str, commands_file: PathBuf) -> DeviceConfig {
    DeviceConfig {
        hostname: hostname.to_string(),
        ip_address: "127.0.0.1".to_string(),
        // Reserved port, nothing listens here.
        port: 1,
        username: "admin".to_string(),
        password: Some("secret".to_string()),
        key_file: None,
        commands_file,
        prompt: None,
        timeout_secs: None,
    }
}

fn fleet_of(devices: Vec<DeviceConfig>, max_parallel: usize) -> FleetConfig {
    FleetConfig {
        output_dir: std::env::temp_dir().join("fleetrun-fanout-test"),
        prompt: r"[$#>]\s*$".to_string(),
        command_timeout_secs: 1,
        connect_timeout_secs: 1,
        max_parallel,
        devices,
    }
}

#[tokio::test]
async fn every_device_gets_exactly_one_result() {
    let commands = commands_file();
    let labels = ["edge-1", "edge-2", "edge-3"];
    let devices = labels
        .iter()
        .map(|label| dead_device(label, commands.path().to_path_buf()))
        .collect();

    // Fewer workers than devices, so the queue hand-off is exercised.
    let orchestrator = Orchestrator::new(fleet_of(devices, 2)).expect("valid roster");
    let summary = orchestrator.run().await;

    let seen: Vec<&str> = summary.results.keys().map(String::as_str).collect();
    assert_eq!(seen, labels);
    assert!(!summary.overall_success());
    assert_eq!(summary.failed_devices(), labels);
}

#[tokio::test]
async fn one_device_failing_leaves_the_others_classified_independently() {
    let commands = commands_file();
    let devices = vec![
        dead_device("edge-1", commands.path().to_path_buf()),
        dead_device("edge-2", commands.path().to_path_buf()),
    ];

    let orchestrator = Orchestrator::new(fleet_of(devices, 2)).expect("valid roster");
    let summary = orchestrator.run().await;

    // Each session fails its own reachability check; each result carries
    // its own Network classification and reports as never-usable.
    for label in ["edge-1", "edge-2"] {
        let result = &summary.results[label];
        assert!(matches!(
            result.session_error,
            Some(RunError::Network { .. })
        ));
        assert!(result.unreachable());
        assert!(result.commands.is_empty());
    }
    for line in summary.report_lines() {
        assert!(line.contains("unreachable or unauthenticated"));
    }
}

#[tokio::test]
async fn cancelling_before_run_skips_every_queued_device() {
    let commands = commands_file();
    let devices = vec![
        dead_device("edge-1", commands.path().to_path_buf()),
        dead_device("edge-2", commands.path().to_path_buf()),
        dead_device("edge-3", commands.path().to_path_buf()),
    ];

    let orchestrator = Orchestrator::new(fleet_of(devices, 1)).expect("valid roster");
    orchestrator.cancel_handle().cancel();
    let summary = orchestrator.run().await;

    assert_eq!(summary.results.len(), 3);
    for result in summary.results.values() {
        assert!(matches!(result.session_error, Some(RunError::Cancelled)));
        assert!(result.commands.is_empty());
    }
}
