//! Fan-out of device sessions across the fleet.
//!
//! The orchestrator runs one independent [`DeviceSession`] per device,
//! bounded by a fixed worker pool. Devices share no state; a failure on one
//! never touches another. Results are aggregated into a [`RunSummary`] that
//! distinguishes devices that were never usable from devices that were
//! reached but had failing commands.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::{Mutex, mpsc, watch};

use crate::artifact;
use crate::config::{DeviceConfig, FleetConfig, load_commands};
use crate::error::RunError;
use crate::session::{DeviceSession, RunResult, SessionOptions};

/// Cooperative cancellation signal for a fleet run.
///
/// Cloneable and usable from signal handlers. Cancelling is idempotent;
/// in-flight sessions observe the flag at their next await point, abort the
/// remaining commands and close cleanly, and queued devices are not started.
#[derive(Clone)]
pub struct CancelHandle(Arc<watch::Sender<bool>>);

impl CancelHandle {
    /// Requests cancellation of the run.
    pub fn cancel(&self) {
        if self.0.send_replace(true) {
            return;
        }
        warn!("cancellation requested, stopping fleet run");
    }

    /// True when cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }
}

/// Aggregated outcome of one fleet run, keyed by device label.
#[derive(Debug)]
pub struct RunSummary {
    /// Per-device results in stable label order.
    pub results: BTreeMap<String, RunResult>,
}

impl RunSummary {
    /// True when every device session completed and every command on every
    /// device succeeded.
    pub fn overall_success(&self) -> bool {
        self.results.values().all(RunResult::success)
    }

    /// Labels of devices with any failure, in stable order.
    pub fn failed_devices(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|(_, result)| !result.success())
            .map(|(label, _)| label.as_str())
            .collect()
    }

    /// One human-readable status line per device, in stable order.
    pub fn report_lines(&self) -> Vec<String> {
        self.results
            .iter()
            .map(|(label, result)| {
                if result.success() {
                    format!("{label}: ok ({} commands)", result.commands.len())
                } else if result.unreachable() {
                    let reason = result
                        .session_error
                        .as_ref()
                        .map(|err| err.to_string())
                        .unwrap_or_default();
                    format!("{label}: unreachable or unauthenticated ({reason})")
                } else if let Some(err) = &result.session_error {
                    format!(
                        "{label}: aborted after {} commands ({err})",
                        result.commands.len()
                    )
                } else {
                    format!(
                        "{label}: {} of {} commands failed",
                        result.failed_commands().len(),
                        result.commands.len()
                    )
                }
            })
            .collect()
    }
}

/// Runs the configured command lists against every device in the roster.
pub struct Orchestrator {
    config: Arc<FleetConfig>,
    cancel_tx: Arc<watch::Sender<bool>>,
    cancel_rx: watch::Receiver<bool>,
}

impl Orchestrator {
    /// Builds an orchestrator, validating the whole roster first.
    ///
    /// Malformed descriptors surface as [`RunError::Config`] here, before
    /// any session starts, whether the configuration came from a file or
    /// was built programmatically.
    pub fn new(config: FleetConfig) -> Result<Self, RunError> {
        config.validate()?;
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Ok(Self {
            config: Arc::new(config),
            cancel_tx: Arc::new(cancel_tx),
            cancel_rx,
        })
    }

    /// A handle that cancels this run when invoked.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(self.cancel_tx.clone())
    }

    /// Runs the whole fleet and returns the aggregated summary.
    ///
    /// At most `max_parallel` sessions run concurrently. Every device gets
    /// exactly one result; a panicking worker loses only the devices it
    /// would have picked up, never results already reported.
    pub async fn run(&self) -> RunSummary {
        let device_count = self.config.devices.len();
        let workers = self.config.max_parallel.min(device_count).max(1);
        info!(
            "starting fleet run: {} devices, {} parallel sessions",
            device_count, workers
        );

        let queue: Arc<Mutex<VecDeque<DeviceConfig>>> =
            Arc::new(Mutex::new(self.config.devices.iter().cloned().collect()));
        let (result_tx, mut result_rx) = mpsc::channel::<RunResult>(device_count.max(1));

        for worker in 0..workers {
            let queue = queue.clone();
            let result_tx = result_tx.clone();
            let config = self.config.clone();
            let cancel = self.cancel_rx.clone();
            tokio::spawn(async move {
                loop {
                    let device = { queue.lock().await.pop_front() };
                    let Some(device) = device else { break };
                    let label = device.label().to_string();

                    let result = if *cancel.borrow() {
                        debug!("worker {}: skipping {} (run cancelled)", worker, label);
                        RunResult::failed(label, RunError::Cancelled)
                    } else {
                        debug!("worker {}: starting {}", worker, label);
                        run_device(&config, device, cancel.clone()).await
                    };
                    if result_tx.send(result).await.is_err() {
                        break;
                    }
                }
            });
        }
        drop(result_tx);

        let mut results = BTreeMap::new();
        while let Some(result) = result_rx.recv().await {
            if let Some(err) = &result.session_error {
                error!("{}: session failed: {}", result.device, err);
            } else if !result.success() {
                warn!(
                    "{}: {} of {} commands failed",
                    result.device,
                    result.failed_commands().len(),
                    result.commands.len()
                );
            } else {
                info!("{}: completed successfully", result.device);
            }
            results.insert(result.device.clone(), result);
        }

        let summary = RunSummary { results };
        info!(
            "fleet run finished: {}/{} devices fully successful",
            summary.results.values().filter(|r| r.success()).count(),
            device_count
        );
        summary
    }
}

/// Runs one device end to end: load its command list, connect, open the
/// shell, execute, and close. Never panics on device failure; every exit
/// path produces a [`RunResult`].
async fn run_device(
    config: &FleetConfig,
    device: DeviceConfig,
    cancel: watch::Receiver<bool>,
) -> RunResult {
    let label = device.label().to_string();

    let commands = match load_commands(&device.commands_file).await {
        Ok(commands) => commands,
        Err(err) => return RunResult::failed(label, err),
    };
    if commands.is_empty() {
        return RunResult::failed(
            label,
            RunError::Config(format!(
                "commands file '{}' contains no commands",
                device.commands_file.display()
            )),
        );
    }

    let output_path =
        artifact::output_path(&config.output_dir, &device.ip_address, &device.hostname);
    let options = SessionOptions::new(config.prompt_for(&device), output_path)
        .with_command_timeout(config.command_timeout_for(&device))
        .with_connect_timeout(config.connect_timeout());

    let mut session = match DeviceSession::new(device, options) {
        Ok(session) => session,
        Err(err) => return RunResult::failed(label, err),
    };
    session.set_cancel(cancel);

    if let Err(err) = session.connect().await {
        session.close().await;
        return RunResult::failed(label, err);
    }
    if let Err(err) = session.open_shell().await {
        session.close().await;
        return RunResult::failed(label, err);
    }
    session.run_commands(&commands).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::CommandResult;
    use std::time::Duration;

    fn ok_result(label: &str, commands: usize) -> RunResult {
        RunResult {
            device: label.to_string(),
            output_file: None,
            commands: (0..commands)
                .map(|index| CommandResult {
                    index,
                    command: format!("cmd {index}"),
                    output_bytes: 10,
                    error: None,
                })
                .collect(),
            session_error: None,
        }
    }

    fn summary_of(results: Vec<RunResult>) -> RunSummary {
        RunSummary {
            results: results
                .into_iter()
                .map(|result| (result.device.clone(), result))
                .collect(),
        }
    }

    #[test]
    fn all_ok_is_overall_success() {
        let summary = summary_of(vec![ok_result("a", 2), ok_result("b", 2)]);
        assert!(summary.overall_success());
        assert!(summary.failed_devices().is_empty());
    }

    #[test]
    fn one_unreachable_device_fails_only_itself() {
        let failed = RunResult::failed(
            "edge-2",
            RunError::Auth {
                device: "edge-2".to_string(),
                reason: "permission denied".to_string(),
            },
        );
        let summary = summary_of(vec![ok_result("edge-1", 3), failed, ok_result("edge-3", 3)]);

        assert!(!summary.overall_success());
        assert_eq!(summary.failed_devices(), vec!["edge-2"]);
        assert!(summary.results["edge-2"].unreachable());
        assert!(summary.results["edge-1"].success());
        assert!(summary.results["edge-3"].success());
    }

    #[test]
    fn command_timeout_is_partial_failure_not_unreachable() {
        let mut result = ok_result("edge-1", 3);
        result.commands[1].error = Some(RunError::PromptTimeout {
            timeout: Duration::from_secs(30),
            captured: 512,
        });
        let summary = summary_of(vec![result]);

        assert!(!summary.overall_success());
        assert!(!summary.results["edge-1"].unreachable());
        assert_eq!(
            summary.results["edge-1"].failed_commands().len(),
            1
        );
        let lines = summary.report_lines();
        assert_eq!(lines, vec!["edge-1: 1 of 3 commands failed".to_string()]);
    }

    #[test]
    fn report_lines_are_in_stable_label_order() {
        let summary = summary_of(vec![ok_result("zulu", 1), ok_result("alpha", 1)]);
        let lines = summary.report_lines();
        assert!(lines[0].starts_with("alpha:"));
        assert!(lines[1].starts_with("zulu:"));
    }

    fn fleet_config_with(devices: Vec<DeviceConfig>) -> FleetConfig {
        FleetConfig {
            output_dir: "/tmp/out".into(),
            prompt: r"[$#>]\s*$".to_string(),
            command_timeout_secs: 30,
            connect_timeout_secs: 10,
            max_parallel: 4,
            devices,
        }
    }

    fn valid_device(hostname: &str, commands_file: std::path::PathBuf) -> DeviceConfig {
        DeviceConfig {
            hostname: hostname.to_string(),
            ip_address: "127.0.0.1".to_string(),
            port: 22,
            username: "admin".to_string(),
            password: Some("secret".to_string()),
            key_file: None,
            commands_file,
            prompt: None,
            timeout_secs: None,
        }
    }

    #[test]
    fn cancel_handle_is_idempotent() {
        let commands = tempfile::NamedTempFile::new().expect("temp file");
        std::fs::write(commands.path(), "show version\n").expect("write commands");
        let config = fleet_config_with(vec![valid_device(
            "edge-1",
            commands.path().to_path_buf(),
        )]);

        let orchestrator = Orchestrator::new(config).expect("valid roster");
        let handle = orchestrator.cancel_handle();
        assert!(!handle.is_cancelled());
        handle.cancel();
        handle.cancel();
        assert!(handle.is_cancelled());
    }

    #[test]
    fn malformed_descriptor_is_rejected_before_any_session() {
        let mut device = valid_device("edge-1", std::path::PathBuf::from("/nonexistent.txt"));
        device.ip_address = "not-an-ip".to_string();
        device.password = None;

        let err = match Orchestrator::new(fleet_config_with(vec![device])) {
            Ok(_) => panic!("malformed roster must not build an orchestrator"),
            Err(err) => err,
        };
        assert!(matches!(err, RunError::Config(_)));
    }

    #[tokio::test]
    async fn closed_port_reports_network_failure() {
        let config = FleetConfig {
            output_dir: std::env::temp_dir().join("fleetrun-orch-test"),
            prompt: r"[$#>]\s*$".to_string(),
            command_timeout_secs: 1,
            connect_timeout_secs: 1,
            max_parallel: 2,
            devices: Vec::new(),
        };
        let commands = std::env::temp_dir().join("fleetrun-orch-test-commands.txt");
        tokio::fs::write(&commands, "show version\n")
            .await
            .expect("write commands file");

        let device = DeviceConfig {
            hostname: "dead".to_string(),
            ip_address: "127.0.0.1".to_string(),
            // Reserved port, nothing listens here.
            port: 1,
            username: "admin".to_string(),
            password: Some("secret".to_string()),
            key_file: None,
            commands_file: commands,
            prompt: None,
            timeout_secs: None,
        };
        let result = run_device(&config, device, watch::channel(false).1).await;
        assert!(matches!(
            result.session_error,
            Some(RunError::Network { .. })
        ));
        assert!(result.unreachable());
    }
}
