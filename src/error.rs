//! Error types for fleet command execution.
//!
//! This module defines all errors that can occur while validating device
//! configuration, establishing SSH sessions, and driving the prompt-
//! synchronized command loop. Command-level errors (`PromptTimeout`) are
//! recovered into result entries; session-level errors abort a single
//! device; nothing here aborts an overall fleet run.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc::error::SendError;

use crate::session::SessionState;

/// Errors that can occur during device configuration and session execution.
#[derive(Error, Debug)]
pub enum RunError {
    /// A device descriptor or global option is malformed or incomplete.
    ///
    /// Raised before any session starts: missing credentials, invalid IP
    /// address, unreadable key file, invalid prompt pattern, or a missing
    /// command-list file.
    #[error("configuration error: {0}")]
    Config(String),

    /// The device rejected the supplied credentials.
    #[error("authentication failed for {device}: {reason}")]
    Auth { device: String, reason: String },

    /// The device could not be reached at the transport level.
    ///
    /// Connection refused, unreachable host, or connect timeout. No retry
    /// is performed by default.
    #[error("cannot reach {device}: {reason}")]
    Network { device: String, reason: String },

    /// An interactive shell channel could not be allocated, or the initial
    /// shell prompt never appeared.
    #[error("failed to open interactive shell on {device}: {reason}")]
    Shell { device: String, reason: String },

    /// A single command's prompt wait exceeded its timeout.
    ///
    /// Recorded as that command's failure; the session continues with the
    /// next command. Carries the amount of output captured before giving up.
    #[error("prompt not detected within {timeout:?} ({captured} bytes captured)")]
    PromptTimeout { timeout: Duration, captured: usize },

    /// The session was cancelled from outside.
    #[error("session cancelled")]
    Cancelled,

    /// An operation was invoked in a state that does not permit it.
    ///
    /// This is a programming-contract error, e.g. `run_commands` before the
    /// initial prompt has been synchronized.
    #[error("operation '{operation}' requires state {expected:?}, session is {actual:?}")]
    InvalidState {
        operation: &'static str,
        expected: SessionState,
        actual: SessionState,
    },

    /// The shell channel closed while output was still expected.
    #[error("channel disconnected while waiting for shell output")]
    ChannelDisconnect,

    /// An I/O error occurred while reading command lists or writing artifacts.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to send data to the shell I/O task.
    #[error("failed to send data to shell: {0}")]
    SendData(#[from] SendError<String>),
}

impl RunError {
    /// True for errors that mean the device was never usable at all
    /// (as opposed to reached-but-some-commands-failed).
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            RunError::Auth { .. } | RunError::Network { .. } | RunError::Shell { .. }
        )
    }
}
