//! SSH device sessions and the prompt-synchronized command loop.
//!
//! A [`DeviceSession`] owns one authenticated SSH connection to one device,
//! one interactive PTY-backed shell channel, and an explicit state machine:
//!
//! `Disconnected → Connected → ShellOpen → PromptReady ↔ Executing → Closed`
//!
//! Any step may transition to `Failed`. Sessions are independent and share
//! no mutable state; the command loop is strictly sequential within a
//! session (one in-flight command per channel).
//!
//! # Main Components
//!
//! - [`DeviceSession`] - Per-device connection, shell channel, command loop
//! - [`SessionState`] - Explicit session state machine
//! - [`ShellIo`] - Bidirectional shell transport (also attachable from
//!   simulated shells for SSH-free testing)
//! - [`RunResult`] / [`CommandResult`] - Per-device and per-command outcomes

use std::borrow::Cow;
use std::path::PathBuf;
use std::time::Duration;

use async_ssh2_tokio::client::{AuthMethod, Client};
use async_ssh2_tokio::{Config, ServerCheckMethod};
use log::{debug, error, info};
use russh::keys::{Algorithm, EcdsaCurve, HashAlg};
use russh::{ChannelMsg, Preferred, cipher, compression, kex, mac};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::sync::watch;

use crate::config::{
    DEFAULT_COMMAND_TIMEOUT_SECS, DEFAULT_CONNECT_TIMEOUT_SECS, DeviceConfig,
};
use crate::error::RunError;
use crate::prompt::PromptSync;
use crate::{artifact, sanitize};

mod client;
mod security;

pub use security::{ConnectionSecurityOptions, SecurityLevel};

/// Transient per-device session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum SessionState {
    /// No connection established yet.
    Disconnected,
    /// Transport connected and authenticated.
    Connected,
    /// Interactive shell channel allocated; banner not yet consumed.
    ShellOpen,
    /// Shell prompt observed; ready to accept a command.
    PromptReady,
    /// A command is in flight; waiting for the prompt to reappear.
    Executing,
    /// Channel and connection released.
    Closed,
    /// A session-level error occurred; resources released.
    Failed,
}

/// Bidirectional shell transport: outgoing keystrokes, incoming output
/// chunks.
///
/// Produced by [`DeviceSession::open_shell`] from a real SSH channel, or
/// built from a pair of mpsc channels to drive a session against a
/// simulated shell.
pub struct ShellIo {
    pub(crate) sender: Sender<String>,
    pub(crate) recv: Receiver<String>,
}

impl ShellIo {
    /// Builds a transport from raw channel halves.
    pub fn from_parts(sender: Sender<String>, recv: Receiver<String>) -> Self {
        Self { sender, recv }
    }
}

/// Effective per-session options, resolved from fleet defaults and
/// per-device overrides by the caller.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Prompt pattern for this device.
    pub prompt: String,
    /// Bounded wait for each command's prompt reappearance.
    pub command_timeout: Duration,
    /// Bound on connect, handshake and the initial banner/prompt wait.
    pub connect_timeout: Duration,
    /// Where this device's output artifact is written.
    pub output_path: PathBuf,
    /// SSH algorithm and host-key policy.
    pub security: ConnectionSecurityOptions,
}

impl SessionOptions {
    /// Options with default timeouts and security profile.
    pub fn new(prompt: impl Into<String>, output_path: impl Into<PathBuf>) -> Self {
        Self {
            prompt: prompt.into(),
            command_timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            output_path: output_path.into(),
            security: ConnectionSecurityOptions::default(),
        }
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_security(mut self, security: ConnectionSecurityOptions) -> Self {
        self.security = security;
        self
    }
}

/// Outcome of one command within a session.
#[derive(Debug)]
pub struct CommandResult {
    /// Position in the command list (execution order).
    pub index: usize,
    /// The command text as sent.
    pub command: String,
    /// Size of the sanitized output recorded for this command.
    pub output_bytes: usize,
    /// Command-level failure, if any (`PromptTimeout`).
    pub error: Option<RunError>,
}

impl CommandResult {
    /// True when the command completed and its prompt was observed.
    pub fn ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Per-device outcome record, consumed by the orchestrator for reporting.
#[derive(Debug)]
pub struct RunResult {
    /// Device label.
    pub device: String,
    /// Artifact path, when the output file was written.
    pub output_file: Option<PathBuf>,
    /// Per-command results in execution order.
    pub commands: Vec<CommandResult>,
    /// Session-level failure (`Auth`, `Network`, `Shell`, `Cancelled`, ...),
    /// if the session aborted.
    pub session_error: Option<RunError>,
}

impl RunResult {
    /// A result for a device whose session never ran any commands.
    pub fn failed(device: impl Into<String>, err: RunError) -> Self {
        Self {
            device: device.into(),
            output_file: None,
            commands: Vec::new(),
            session_error: Some(err),
        }
    }

    /// True when the session completed and every command succeeded.
    pub fn success(&self) -> bool {
        self.session_error.is_none() && self.commands.iter().all(CommandResult::ok)
    }

    /// True when the device was never usable (connect/auth/shell failure),
    /// as opposed to reached-but-some-commands-failed.
    pub fn unreachable(&self) -> bool {
        self.session_error
            .as_ref()
            .map(RunError::is_connection_failure)
            .unwrap_or(false)
    }

    /// Commands that failed, in execution order.
    pub fn failed_commands(&self) -> Vec<&CommandResult> {
        self.commands.iter().filter(|c| !c.ok()).collect()
    }
}

/// One authenticated SSH session to one device, driving the
/// prompt-synchronized command loop.
pub struct DeviceSession {
    device: DeviceConfig,
    options: SessionOptions,
    sync: PromptSync,
    state: SessionState,
    client: Option<Client>,
    io: Option<ShellIo>,
    cancel: watch::Receiver<bool>,
}
