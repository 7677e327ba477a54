//! Fleet and device configuration.
//!
//! A fleet run is described by a JSON configuration file: global options
//! (output directory, default prompt pattern, default per-command timeout,
//! worker bound) plus one descriptor per device. Everything is validated
//! up front so that malformed descriptors surface before any session
//! starts. Command lists are plain text files, one command per line.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::info;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::RunError;

/// Default SSH port.
pub const DEFAULT_PORT: u16 = 22;
/// Default shell prompt pattern: a trailing `$`, `#` or `>` marker.
pub const DEFAULT_PROMPT: &str = r"[$#>]\s*$";
/// Default per-command timeout in seconds.
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 30;
/// Default connect/handshake/initial-prompt timeout in seconds.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
/// Default bound on concurrently running device sessions.
pub const DEFAULT_MAX_PARALLEL: usize = 4;

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_prompt() -> String {
    DEFAULT_PROMPT.to_string()
}

fn default_command_timeout() -> u64 {
    DEFAULT_COMMAND_TIMEOUT_SECS
}

fn default_connect_timeout() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

fn default_max_parallel() -> usize {
    DEFAULT_MAX_PARALLEL
}

/// Immutable per-device configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DeviceConfig {
    /// Friendly label for the device, used in logs, results and artifact
    /// file names.
    pub hostname: String,

    /// IPv4 or IPv6 address of the device.
    pub ip_address: String,

    /// SSH port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username for SSH authentication.
    pub username: String,

    /// Password for SSH authentication. When present, password
    /// authentication is used.
    #[serde(default)]
    pub password: Option<String>,

    /// Path to a private key file, used when no password is configured.
    #[serde(default)]
    pub key_file: Option<PathBuf>,

    /// Path to the file with commands to execute on this device.
    pub commands_file: PathBuf,

    /// Per-device prompt pattern override.
    #[serde(default)]
    pub prompt: Option<String>,

    /// Per-device command timeout override, in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl DeviceConfig {
    /// The device label used as the key in run summaries.
    pub fn label(&self) -> &str {
        &self.hostname
    }

    /// `user@ip:port`, used as log context.
    pub fn device_addr(&self) -> String {
        format!("{}@{}:{}", self.username, self.ip_address, self.port)
    }

    /// Validates the descriptor.
    ///
    /// Exactly the checks that must hold before a connection attempt: a
    /// parseable IP address, resolvable credentials (password or readable
    /// key file), and an existing command-list file.
    pub fn validate(&self) -> Result<(), RunError> {
        if self.hostname.trim().is_empty() {
            return Err(RunError::Config("device hostname must not be empty".into()));
        }
        self.ip_address.parse::<IpAddr>().map_err(|_| {
            RunError::Config(format!(
                "invalid IP address '{}' for device '{}'",
                self.ip_address, self.hostname
            ))
        })?;
        match (&self.password, &self.key_file) {
            (None, None) => {
                return Err(RunError::Config(format!(
                    "device '{}' has neither a password nor a key file",
                    self.hostname
                )));
            }
            (None, Some(key)) => {
                if !key.is_file() {
                    return Err(RunError::Config(format!(
                        "key file '{}' for device '{}' is not readable",
                        key.display(),
                        self.hostname
                    )));
                }
            }
            _ => {}
        }
        if !self.commands_file.is_file() {
            return Err(RunError::Config(format!(
                "commands file '{}' for device '{}' does not exist",
                self.commands_file.display(),
                self.hostname
            )));
        }
        if let Some(pattern) = &self.prompt {
            crate::prompt::PromptSync::new(pattern)?;
        }
        Ok(())
    }
}

/// Global options plus the device roster for one fleet run.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct FleetConfig {
    /// Directory that receives one output file per device.
    pub output_dir: PathBuf,

    /// Default prompt pattern for devices without an override.
    #[serde(default = "default_prompt")]
    pub prompt: String,

    /// Default per-command timeout in seconds.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Connect, handshake and initial-prompt timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Bound on concurrently running device sessions.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    /// The device roster.
    pub devices: Vec<DeviceConfig>,
}

impl FleetConfig {
    /// Loads and validates a fleet configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self, RunError> {
        info!("loading fleet configuration from {}", path.display());
        let raw = std::fs::read_to_string(path)?;
        let config: FleetConfig = serde_json::from_str(&raw).map_err(|err| {
            RunError::Config(format!(
                "failed to parse fleet configuration '{}': {err}",
                path.display()
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validates global options and every device descriptor.
    pub fn validate(&self) -> Result<(), RunError> {
        if self.devices.is_empty() {
            return Err(RunError::Config("device roster is empty".into()));
        }
        if self.max_parallel == 0 {
            return Err(RunError::Config("max_parallel must be at least 1".into()));
        }
        crate::prompt::PromptSync::new(&self.prompt)?;
        for device in &self.devices {
            device.validate()?;
        }
        Ok(())
    }

    /// The effective prompt pattern for a device.
    pub fn prompt_for<'a>(&'a self, device: &'a DeviceConfig) -> &'a str {
        device.prompt.as_deref().unwrap_or(&self.prompt)
    }

    /// The effective per-command timeout for a device.
    pub fn command_timeout_for(&self, device: &DeviceConfig) -> Duration {
        Duration::from_secs(device.timeout_secs.unwrap_or(self.command_timeout_secs))
    }

    /// The connect/handshake timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Loads an ordered command list from a file.
///
/// One command per line, surrounding whitespace trimmed, blank lines and
/// `#` comment lines skipped. Insertion order is execution order.
pub async fn load_commands(path: &Path) -> Result<Vec<String>, RunError> {
    let raw = tokio::fs::read_to_string(path).await.map_err(|err| {
        RunError::Config(format!(
            "failed to read commands file '{}': {err}",
            path.display()
        ))
    })?;
    Ok(raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}
