//! Prompt synchronization over an unstructured shell byte stream.
//!
//! The remote shell speaks no framing protocol; the only completion signal
//! for a command is the reappearance of the shell prompt. [`PromptSync`]
//! reads chunks from a shell channel and matches a configured prompt
//! pattern against the cumulative buffer, so a prompt (or command echo)
//! split across multiple reads is still detected.

use std::time::Duration;

use log::{debug, trace};
use regex::Regex;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::RunError;

/// Pagination marker emitted by devices that page long output.
const MORE_MARKER: &str = "--More--";
/// Pagination marker emitted by pagers that wait at end of output.
const END_MARKER: &str = "(END)";

/// Outcome of a prompt wait.
#[derive(Debug)]
pub struct PromptWait {
    /// Everything accumulated from the channel, including the prompt when
    /// matched.
    pub buffer: String,
    /// Whether the prompt pattern was observed before the timeout.
    pub matched: bool,
}

/// Matches a shell prompt pattern against streamed channel output.
#[derive(Debug, Clone)]
pub struct PromptSync {
    pattern: Regex,
}

impl PromptSync {
    /// Compiles a prompt pattern.
    ///
    /// An invalid pattern is a configuration error and is surfaced before
    /// any connection is attempted.
    pub fn new(pattern: &str) -> Result<Self, RunError> {
        let pattern = Regex::new(pattern)
            .map_err(|err| RunError::Config(format!("invalid prompt pattern '{pattern}': {err}")))?;
        Ok(Self { pattern })
    }

    /// The compiled prompt pattern.
    pub fn pattern(&self) -> &Regex {
        &self.pattern
    }

    /// Reads from `recv` until the prompt pattern matches the cumulative
    /// buffer or `timeout` elapses.
    ///
    /// Returns `matched: false` with whatever was accumulated on timeout;
    /// the caller decides whether that is fatal. When `reply` is supplied,
    /// pagination markers (`--More--`, `(END)`) are answered automatically
    /// and removed from the buffer. Cancellation via `cancel` terminates the
    /// wait with [`RunError::Cancelled`]; a closed channel yields
    /// [`RunError::ChannelDisconnect`].
    pub async fn wait(
        &self,
        recv: &mut Receiver<String>,
        reply: Option<&Sender<String>>,
        timeout: Duration,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<PromptWait, RunError> {
        let deadline = Instant::now() + timeout;
        let mut buffer = String::new();
        // Disabled once the cancel source goes away, so a dropped sender
        // does not spin this loop.
        let mut cancel_open = true;

        loop {
            tokio::select! {
                chunk = recv.recv() => {
                    match chunk {
                        Some(data) => {
                            trace!("shell chunk: {:?}", data);
                            let data = match reply {
                                Some(sender) => self.answer_pager(data, sender).await?,
                                None => data,
                            };
                            buffer.push_str(&data);
                            if self.pattern.is_match(&buffer) {
                                trace!("prompt matched after {} bytes", buffer.len());
                                return Ok(PromptWait { buffer, matched: true });
                            }
                        }
                        None => return Err(RunError::ChannelDisconnect),
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    debug!(
                        "prompt wait timed out after {:?} with {} bytes accumulated",
                        timeout,
                        buffer.len()
                    );
                    return Ok(PromptWait { buffer, matched: false });
                }
                changed = cancel.changed(), if cancel_open => {
                    match changed {
                        Ok(()) if *cancel.borrow() => return Err(RunError::Cancelled),
                        Ok(()) => {}
                        Err(_) => cancel_open = false,
                    }
                }
            }
        }
    }

    /// Answers pagination markers in `chunk` and strips them from the text.
    async fn answer_pager(&self, chunk: String, sender: &Sender<String>) -> Result<String, RunError> {
        let mut chunk = chunk;
        if chunk.contains(MORE_MARKER) {
            trace!("pagination marker '{MORE_MARKER}' seen, answering with space");
            sender.send(" ".to_string()).await?;
            chunk = chunk.replace(MORE_MARKER, "");
        }
        if chunk.contains(END_MARKER) {
            trace!("pagination marker '{END_MARKER}' seen, answering with 'q'");
            sender.send("q".to_string()).await?;
            chunk = chunk.replace(END_MARKER, "");
        }
        Ok(chunk)
    }
}
