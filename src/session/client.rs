use super::*;

/// True when an error chain bottoms out in a transport-level I/O error,
/// e.g. a connection reset mid-handshake. Such failures are reachability
/// problems, not credential rejections.
fn transport_failure(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(err) = current {
        if err.downcast_ref::<std::io::Error>().is_some() {
            return true;
        }
        current = err.source();
    }
    false
}

/// Resolves once the cancellation flag flips to true; never resolves when
/// the cancellation source has gone away.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

impl DeviceSession {
    /// Creates a session for one device.
    ///
    /// Compiles the prompt pattern up front so a bad pattern surfaces as a
    /// configuration error before any connection is attempted.
    pub fn new(device: DeviceConfig, options: SessionOptions) -> Result<Self, RunError> {
        let sync = PromptSync::new(&options.prompt)?;
        // Inert cancellation receiver; replaced by `set_cancel` when the
        // session runs under an orchestrator.
        let (_tx, cancel) = watch::channel(false);
        Ok(Self {
            device,
            options,
            sync,
            state: SessionState::Disconnected,
            client: None,
            io: None,
            cancel,
        })
    }

    /// Binds an external cancellation signal to this session.
    pub fn set_cancel(&mut self, cancel: watch::Receiver<bool>) {
        self.cancel = cancel;
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    fn require(&self, expected: SessionState, operation: &'static str) -> Result<(), RunError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(RunError::InvalidState {
                operation,
                expected,
                actual: self.state,
            })
        }
    }

    /// Opens the transport connection and authenticates.
    ///
    /// Reachability is probed at the TCP level first, so connection refusal
    /// and connect timeouts classify as [`RunError::Network`]; failures
    /// during SSH establishment on a reachable host classify as
    /// [`RunError::Auth`]. Password authentication is used when a password
    /// is configured, otherwise the private key file. One attempt, no
    /// silent retries.
    pub async fn connect(&mut self) -> Result<(), RunError> {
        self.require(SessionState::Disconnected, "connect")?;
        let addr = self.device.device_addr();
        let label = self.device.label().to_string();
        info!("{} connecting", addr);

        let socket = (self.device.ip_address.clone(), self.device.port);
        let mut cancel = self.cancel.clone();

        let probe = tokio::select! {
            _ = cancelled(&mut cancel) => {
                self.state = SessionState::Failed;
                return Err(RunError::Cancelled);
            }
            probe = tokio::time::timeout(
                self.options.connect_timeout,
                tokio::net::TcpStream::connect(socket.clone()),
            ) => probe,
        };
        match probe {
            Ok(Ok(stream)) => drop(stream),
            Ok(Err(err)) => {
                error!("{} unreachable: {}", addr, err);
                self.state = SessionState::Failed;
                return Err(RunError::Network {
                    device: label,
                    reason: err.to_string(),
                });
            }
            Err(_) => {
                error!("{} connect timed out", addr);
                self.state = SessionState::Failed;
                return Err(RunError::Network {
                    device: label,
                    reason: format!("connect timed out after {:?}", self.options.connect_timeout),
                });
            }
        }

        let auth = match (&self.device.password, &self.device.key_file) {
            (Some(password), _) => {
                debug!("{} authenticating with password", addr);
                AuthMethod::with_password(password)
            }
            (None, Some(key)) => {
                debug!("{} authenticating with key file {}", addr, key.display());
                AuthMethod::with_key_file(key, None)
            }
            (None, None) => {
                self.state = SessionState::Failed;
                return Err(RunError::Config(format!(
                    "device '{label}' has neither a password nor a key file"
                )));
            }
        };

        let config = Config {
            preferred: self.options.security.preferred(),
            inactivity_timeout: Some(Duration::from_secs(60)),
            ..Default::default()
        };

        let establish = Client::connect_with_config(
            socket,
            &self.device.username,
            auth,
            self.options.security.server_check.clone(),
            config,
        );
        let established = tokio::select! {
            _ = cancelled(&mut cancel) => {
                self.state = SessionState::Failed;
                return Err(RunError::Cancelled);
            }
            established = tokio::time::timeout(self.options.connect_timeout, establish) => established,
        };
        match established {
            Ok(Ok(client)) => {
                info!("{} authenticated", addr);
                self.client = Some(client);
                self.state = SessionState::Connected;
                Ok(())
            }
            Ok(Err(err)) => {
                self.state = SessionState::Failed;
                if transport_failure(&err) {
                    error!("{} connection lost during handshake: {}", addr, err);
                    Err(RunError::Network {
                        device: label,
                        reason: err.to_string(),
                    })
                } else {
                    error!("{} authentication failed: {}", addr, err);
                    Err(RunError::Auth {
                        device: label,
                        reason: err.to_string(),
                    })
                }
            }
            Err(_) => {
                error!("{} handshake timed out", addr);
                self.state = SessionState::Failed;
                Err(RunError::Network {
                    device: label,
                    reason: format!(
                        "handshake timed out after {:?}",
                        self.options.connect_timeout
                    ),
                })
            }
        }
    }

    /// Allocates the PTY-backed interactive shell channel, bridges it to a
    /// [`ShellIo`] pair, and consumes the initial banner/prompt.
    ///
    /// Establishes `PromptReady`; any failure here is fatal for the device.
    pub async fn open_shell(&mut self) -> Result<(), RunError> {
        self.require(SessionState::Connected, "open_shell")?;
        let addr = self.device.device_addr();
        let label = self.device.label().to_string();

        let client = self.client.as_ref().ok_or_else(|| RunError::Shell {
            device: label.clone(),
            reason: "no authenticated client".to_string(),
        })?;

        let shell = async {
            let channel = client
                .get_channel()
                .await
                .map_err(|err| err.to_string())?;
            channel
                .request_pty(false, "xterm", 800, 600, 0, 0, &[])
                .await
                .map_err(|err| err.to_string())?;
            channel
                .request_shell(false)
                .await
                .map_err(|err| err.to_string())?;
            Ok::<_, String>(channel)
        };
        let mut channel = match shell.await {
            Ok(channel) => channel,
            Err(reason) => {
                error!("{} failed to open shell: {}", addr, reason);
                self.state = SessionState::Failed;
                return Err(RunError::Shell {
                    device: label,
                    reason,
                });
            }
        };
        debug!("{} shell request successful", addr);

        let (sender_to_shell, mut receiver_from_user) = mpsc::channel::<String>(256);
        let (sender_to_user, receiver_from_shell) = mpsc::channel::<String>(256);

        let io_task_addr = addr.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(data) = receiver_from_user.recv() => {
                        if let Err(e) = channel.data(data.as_bytes()).await {
                            debug!("{} failed to send data to shell: {:?}", io_task_addr, e);
                            break;
                        }
                    },
                    Some(msg) = channel.wait() => {
                        match msg {
                            ChannelMsg::Data { ref data } => {
                                let text = String::from_utf8_lossy(data).to_string();
                                if sender_to_user.send(text).await.is_err() {
                                    debug!("{} shell output receiver dropped, closing task", io_task_addr);
                                    break;
                                }
                            }
                            ChannelMsg::ExitStatus { exit_status } => {
                                debug!("{} shell exited with status code {}", io_task_addr, exit_status);
                                let _ = channel.eof().await;
                                break;
                            }
                            ChannelMsg::Eof => {
                                debug!("{} shell sent EOF", io_task_addr);
                                break;
                            }
                            _ => {}
                        }
                    }
                    else => break,
                }
            }
            debug!("{} shell I/O task ended", io_task_addr);
        });

        self.io = Some(ShellIo::from_parts(sender_to_shell, receiver_from_shell));
        self.state = SessionState::ShellOpen;
        info!("{} interactive shell opened", addr);

        self.sync_prompt().await
    }

    /// Attaches an existing shell transport instead of opening one over SSH.
    ///
    /// Used to drive sessions against simulated shells; the session still
    /// needs [`sync_prompt`](Self::sync_prompt) before running commands.
    pub fn attach_shell(&mut self, io: ShellIo) -> Result<(), RunError> {
        self.require(SessionState::Disconnected, "attach_shell")?;
        self.io = Some(io);
        self.state = SessionState::ShellOpen;
        Ok(())
    }

    /// Waits for and consumes the initial shell banner/prompt.
    pub async fn sync_prompt(&mut self) -> Result<(), RunError> {
        self.require(SessionState::ShellOpen, "sync_prompt")?;
        let addr = self.device.device_addr();
        let label = self.device.label().to_string();
        let timeout = self.options.connect_timeout;

        let wait = {
            let io = match self.io.as_mut() {
                Some(io) => io,
                None => {
                    self.state = SessionState::Failed;
                    return Err(RunError::ChannelDisconnect);
                }
            };
            self.sync
                .wait(&mut io.recv, None, timeout, &mut self.cancel)
                .await
        };
        match wait {
            Ok(wait) if wait.matched => {
                debug!(
                    "{} initial prompt detected ({} bytes of banner consumed)",
                    addr,
                    wait.buffer.len()
                );
                self.state = SessionState::PromptReady;
                Ok(())
            }
            Ok(_) => {
                error!("{} initial shell prompt never appeared", addr);
                self.state = SessionState::Failed;
                Err(RunError::Shell {
                    device: label,
                    reason: format!("initial shell prompt not seen within {timeout:?}"),
                })
            }
            Err(err) => {
                self.state = SessionState::Failed;
                Err(err)
            }
        }
    }

    /// Runs every command in order, capturing and persisting sanitized
    /// output.
    ///
    /// A command whose prompt wait times out is recorded as failed and the
    /// loop continues (partial results over total loss). Cancellation or a
    /// dropped channel aborts the session. The output artifact is written
    /// once, after the full list completes or is abandoned, and the session
    /// is always closed on exit.
    pub async fn run_commands(&mut self, commands: &[String]) -> RunResult {
        let label = self.device.label().to_string();

        if let Err(err) = self.require(SessionState::PromptReady, "run_commands") {
            error!("{}: {}", label, err);
            self.state = SessionState::Failed;
            self.close().await;
            return RunResult::failed(label, err);
        }

        let mut results = Vec::with_capacity(commands.len());
        let mut sections = Vec::with_capacity(commands.len());
        let mut session_error = None;

        for (index, command) in commands.iter().enumerate() {
            match self.execute(index, command).await {
                Ok((body, command_error)) => {
                    results.push(CommandResult {
                        index,
                        command: command.clone(),
                        output_bytes: body.len(),
                        error: command_error,
                    });
                    sections.push((command.clone(), body));
                }
                Err(err) => {
                    error!("{} session aborted at command [{}]: {}", label, index, err);
                    session_error = Some(err);
                    break;
                }
            }
        }

        let content = artifact::render(&sections);
        let output_file = match artifact::write(&self.options.output_path, &content).await {
            Ok(()) => Some(self.options.output_path.clone()),
            Err(err) => {
                error!("{} failed to write output artifact: {}", label, err);
                if session_error.is_none() {
                    session_error = Some(err);
                }
                None
            }
        };

        if session_error.is_some() {
            self.state = SessionState::Failed;
        }
        self.close().await;

        RunResult {
            device: label,
            output_file,
            commands: results,
            session_error,
        }
    }

    /// Sends one command and waits for the prompt to reappear.
    ///
    /// Returns the artifact body plus an optional command-level error;
    /// `Err` is reserved for session-fatal conditions.
    async fn execute(
        &mut self,
        index: usize,
        command: &str,
    ) -> Result<(String, Option<RunError>), RunError> {
        let addr = self.device.device_addr();
        info!("{} executing command [{}]: {}", addr, index, command);

        {
            let io = self.io.as_mut().ok_or(RunError::ChannelDisconnect)?;
            // Residual output from a timed-out predecessor must not leak
            // into this command's capture.
            while io.recv.try_recv().is_ok() {}
            io.sender.send(format!("{command}\n")).await?;
        }
        self.state = SessionState::Executing;

        let timeout = self.options.command_timeout;
        let wait = {
            let io = self.io.as_mut().ok_or(RunError::ChannelDisconnect)?;
            self.sync
                .wait(&mut io.recv, Some(&io.sender), timeout, &mut self.cancel)
                .await
        };

        match wait {
            Ok(wait) if wait.matched => {
                self.state = SessionState::PromptReady;
                let clean = sanitize::sanitize(&wait.buffer);
                let body = self.extract_body(command, &clean, true);
                info!(
                    "{} command [{}] completed ({} bytes captured)",
                    addr,
                    index,
                    body.len()
                );
                Ok((body, None))
            }
            Ok(wait) => {
                self.state = SessionState::PromptReady;
                let err = RunError::PromptTimeout {
                    timeout,
                    captured: wait.buffer.len(),
                };
                error!("{} command [{}] failed: {}", addr, index, err);
                let clean = sanitize::sanitize(&wait.buffer);
                let body = self.extract_body(command, &clean, false);
                Ok((body, Some(err)))
            }
            Err(err) => Err(err),
        }
    }

    /// Separates a command's output from its terminal framing: the echoed
    /// command line at the start, the trailing prompt line when one was
    /// matched, and any residual prompt lines in between.
    fn extract_body(&self, command: &str, clean: &str, prompt_matched: bool) -> String {
        let mut content = clean.trim_start_matches('\n');
        if !command.is_empty()
            && let Some(rest) = content.strip_prefix(command)
        {
            content = rest.trim_start_matches('\n');
        }
        let content = if prompt_matched {
            match content.rfind('\n') {
                Some(pos) => &content[..pos],
                None => "",
            }
        } else {
            content
        };
        sanitize::filter_lines(content, self.sync.pattern())
    }

    /// Releases the shell channel and connection.
    ///
    /// Idempotent; never downgrades `Failed`. A best-effort `exit` gives the
    /// remote shell a chance to terminate cleanly.
    pub async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        let addr = self.device.device_addr();

        if let Some(io) = self.io.as_mut() {
            if let Err(err) = io.sender.send("exit\n".to_string()).await {
                debug!("{} failed to send exit command: {:?}", addr, err);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
            io.recv.close();
        }
        self.io = None;
        // The underlying client closes on drop.
        self.client = None;

        if self.state != SessionState::Failed {
            self.state = SessionState::Closed;
        }
        debug!("{} session closed", addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn test_session(prompt: &str) -> DeviceSession {
        let device = DeviceConfig {
            hostname: "edge-1".to_string(),
            ip_address: "192.0.2.10".to_string(),
            port: 22,
            username: "admin".to_string(),
            password: Some("secret".to_string()),
            key_file: None,
            commands_file: PathBuf::from("commands.txt"),
            prompt: None,
            timeout_secs: None,
        };
        DeviceSession::new(device, SessionOptions::new(prompt, "/tmp/out.txt"))
            .expect("session")
    }

    #[test]
    fn echoed_command_and_trailing_prompt_are_stripped() {
        let session = test_session(r"device#\s*$");
        let clean = "show version\nVersion 1.0\nuptime 4 days\ndevice# ";
        assert_eq!(
            session.extract_body("show version", clean, true),
            "Version 1.0\nuptime 4 days"
        );
    }

    #[test]
    fn body_without_prompt_keeps_partial_output() {
        let session = test_session(r"device#\s*$");
        let clean = "show tech\npartial dump";
        assert_eq!(
            session.extract_body("show tech", clean, false),
            "partial dump"
        );
    }

    #[test]
    fn residual_prompt_lines_are_filtered() {
        let session = test_session(r"device#\s*$");
        let clean = "show clock\n12:00:00\ndevice# \n12:00:01\ndevice# ";
        assert_eq!(
            session.extract_body("show clock", clean, true),
            "12:00:00\n12:00:01"
        );
    }

    #[derive(Debug, thiserror::Error)]
    #[error("handshake failed: {0}")]
    struct WrappedIo(#[from] std::io::Error);

    #[test]
    fn io_error_anywhere_in_the_chain_classifies_as_transport() {
        let reset = WrappedIo(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "connection reset by peer",
        ));
        assert!(transport_failure(&reset));
    }

    #[test]
    fn non_io_errors_classify_as_credential_rejection() {
        assert!(!transport_failure(&RunError::Cancelled));
        assert!(!transport_failure(&RunError::Auth {
            device: "edge-1".to_string(),
            reason: "permission denied".to_string(),
        }));
    }

    #[test]
    fn new_session_starts_disconnected() {
        let session = test_session(r"device#\s*$");
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn operations_out_of_order_fail_the_contract() {
        let mut session = test_session(r"device#\s*$");
        let result = session.run_commands(&["show version".to_string()]).await;
        assert!(matches!(
            result.session_error,
            Some(RunError::InvalidState {
                operation: "run_commands",
                ..
            })
        ));
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn open_shell_requires_connected_state() {
        let mut session = test_session(r"device#\s*$");
        let err = session.open_shell().await.expect_err("contract");
        assert!(matches!(err, RunError::InvalidState { .. }));
    }
}
