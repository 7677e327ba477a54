//! # fleetrun - SSH Fleet Command Automation
//!
//! `fleetrun` connects to a fleet of network devices over SSH, runs an
//! ordered command list in each device's interactive shell, and writes one
//! sanitized output file per device. Command completion is detected by
//! synchronizing on the device's shell prompt rather than on exit codes,
//! which makes the engine work against network operating systems that only
//! expose an interactive CLI.
//!
//! ## Features
//!
//! - **Prompt Synchronization**: Regex-based completion detection over the
//!   raw shell byte stream, with bounded waits per command
//! - **Output Sanitization**: ANSI escape stripping, backspace resolution
//!   and newline normalization before anything is persisted
//! - **Independent Fan-Out**: One session per device under a bounded worker
//!   pool; a failing device never affects the others
//! - **Failure Classification**: Unreachable and unauthenticated devices are
//!   reported separately from devices with failing commands
//! - **Cooperative Cancellation**: A cancel handle stops queued devices and
//!   aborts in-flight sessions at their next await point
//! - **Maximum Compatibility**: Legacy-friendly SSH algorithm profile for
//!   older network gear, with an opt-in strict profile
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use fleetrun::config::FleetConfig;
//! use fleetrun::orchestrator::Orchestrator;
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = FleetConfig::load(Path::new("fleet.json"))?;
//!     let orchestrator = Orchestrator::new(config)?;
//!
//!     // Ctrl-C stops queued devices and aborts in-flight sessions.
//!     let cancel = orchestrator.cancel_handle();
//!     tokio::spawn(async move {
//!         if tokio::signal::ctrl_c().await.is_ok() {
//!             cancel.cancel();
//!         }
//!     });
//!
//!     let summary = orchestrator.run().await;
//!     for line in summary.report_lines() {
//!         println!("{line}");
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Main Components
//!
//! - [`orchestrator::Orchestrator`] - Fleet fan-out, worker pool, summary
//! - [`session::DeviceSession`] - Per-device connection and command loop
//! - [`prompt::PromptSync`] - Prompt-matched completion detection
//! - [`sanitize`] - Terminal output cleanup
//! - [`config::FleetConfig`] - Fleet options and device roster
//! - [`error::RunError`] - Error classification for all operations

pub mod artifact;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod prompt;
pub mod sanitize;
pub mod session;
