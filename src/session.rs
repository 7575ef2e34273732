//! The session facade: one logical connection to a remote host.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::command::RemoteCommand;
use crate::config::{ExecStrategy, SessionSettings};
use crate::error::{Result, SessionError};
use crate::exec::{
    CommandOutput, CommandResult, DiscreteExecutor, Executor, InteractiveExecutor, OutputStyle,
    RawOutput,
};
use crate::ssh::client::RusshConnector;
use crate::ssh::connector::{self, ConnectTimeouts, ConsolePrompt, CredentialSource};
use crate::ssh::sftp::RemoteReader;
use crate::ssh::{Connector, Credential, SshTarget, Transport};
use crate::transfer::rsync::{Rsync, SyncProgram};
use crate::transfer::{FileTransferEngine, TransferContext};
use crate::workdir::{self, WorkingDirectory};

/// Prefix of the line an interactive shell prints after a successful `cd`.
const CWD_MARKER: &str = "cwd=";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connected,
}

/// A long-lived connection to a remote host.
///
/// Commands run through the strategy chosen in [`SessionSettings::strategy`]
/// against a working directory tracked on this side. Timeouts on exec
/// channels are handled by reconnecting and retrying once; a session that
/// is not connected connects on first use.
pub struct RemoteSession {
    settings: SessionSettings,
    connector: Arc<dyn Connector>,
    credentials: Arc<dyn CredentialSource>,
    credential: Option<Credential>,
    status: ConnectionStatus,
    target: Option<SshTarget>,
    transport: Option<Box<dyn Transport>>,
    executor: Executor,
    transfer: Option<FileTransferEngine>,
    sync: Option<Arc<dyn SyncProgram>>,
    cwd: WorkingDirectory,
}

impl RemoteSession {
    /// A session over russh that prompts on the console and uses rsync
    /// when it is installed.
    pub fn new(settings: SessionSettings) -> Self {
        let sync = Rsync::detect().map(|rsync| Arc::new(rsync) as Arc<dyn SyncProgram>);
        Self::with_parts(
            settings,
            Arc::new(RusshConnector),
            Arc::new(ConsolePrompt),
            sync,
        )
    }

    pub fn with_parts(
        settings: SessionSettings,
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn CredentialSource>,
        sync: Option<Arc<dyn SyncProgram>>,
    ) -> Self {
        let executor = match settings.strategy {
            ExecStrategy::Discrete => Executor::Discrete(DiscreteExecutor::new()),
            ExecStrategy::Interactive => Executor::Interactive(
                InteractiveExecutor::new(settings.prompt.clone())
                    .with_input_echo(settings.shell_echo),
            ),
        };
        Self {
            settings,
            connector,
            credentials,
            credential: None,
            status: ConnectionStatus::Disconnected,
            target: None,
            transport: None,
            executor,
            transfer: None,
            sync,
            cwd: WorkingDirectory::new(),
        }
    }

    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    /// Used from the next connect on.
    pub fn set_credential(&mut self, credential: Credential) {
        self.credential = Some(credential);
    }

    /// Forget the stored secret, e.g. before rsync transfers that need
    /// key authentication.
    pub fn clear_credential(&mut self) {
        self.credential = None;
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }

    pub fn working_directory(&self) -> &WorkingDirectory {
        &self.cwd
    }

    pub async fn connect(&mut self) -> Result<()> {
        if self.is_connected() {
            log::info!("Already connected to {}", self.settings.host.as_deref().unwrap_or(""));
            return Ok(());
        }

        let target = self.resolve_target().await?;
        let timeouts = ConnectTimeouts {
            first: self.settings.connect_timeout(),
            retry: self.settings.connect_retry_timeout(),
        };
        let transport = connector::establish(
            self.connector.as_ref(),
            &target,
            &mut self.credential,
            &self.credentials,
            timeouts,
        )
        .await?;

        self.transport = Some(transport);
        self.target = Some(target);
        self.status = ConnectionStatus::Connected;

        if let Err(e) = self.bootstrap().await {
            log::error!("Session setup failed: {}", e);
            self.disconnect().await;
            return Err(e);
        }
        log::info!("Successfully connected to remote host.");
        Ok(())
    }

    /// Close every channel. Safe to call repeatedly; failures while closing
    /// are logged and otherwise ignored.
    pub async fn disconnect(&mut self) {
        if let Executor::Interactive(shell) = &mut self.executor {
            shell.shutdown().await;
        }
        self.transfer = None;
        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                log::debug!("Error while closing connection: {}", e);
            }
            if let Some(target) = &self.target {
                log::info!("Disconnected from {}", target.host);
            }
        }
        self.status = ConnectionStatus::Disconnected;
    }

    pub async fn reconnect(&mut self) -> Result<()> {
        self.disconnect().await;
        self.connect().await
    }

    /// Host and user from the settings, asking the credential source for
    /// whatever is missing.
    async fn resolve_target(&mut self) -> Result<SshTarget> {
        let missing = self.settings.missing();
        if !missing.is_empty() {
            if let Some((host, user)) = connector::prompt_target(&self.credentials, missing).await? {
                if self.settings.missing().contains(&"host") {
                    self.settings.host = Some(host);
                }
                if self.settings.missing().contains(&"user") {
                    self.settings.user = Some(user);
                }
            }
        }
        self.settings.target()
    }

    /// Open the shell and SFTP channels, then establish the working
    /// directory: the home directory on first connect, the tracked one after
    /// a reconnect.
    async fn bootstrap(&mut self) -> Result<()> {
        let command_timeout = self.settings.command_timeout();
        let transport = self
            .transport
            .as_deref_mut()
            .ok_or(SessionError::NotConnected)?;

        if let Executor::Interactive(shell) = &mut self.executor {
            let channel = transport.open_shell().await?;
            shell.start(channel, command_timeout).await?;
        }

        let fs = transport.open_sftp().await?;
        self.transfer = Some(FileTransferEngine::new(
            fs,
            self.sync.clone(),
            self.settings.transfer,
            self.settings.sync_retry_delay(),
        ));

        if self.cwd.is_unset() {
            let query = if self.executor.is_discrete() {
                "pwd"
            } else {
                "echo $PWD"
            };
            let home = self.execute_once(query, command_timeout).await?.into_lines();
            match home.stdout.first() {
                Some(dir) => self.cwd.apply(dir),
                None => {
                    return Err(SessionError::Protocol(
                        "home directory query returned no output".to_string(),
                    ))
                }
            }
        } else if !self.executor.is_discrete() {
            let cd = format!("cd {}", workdir::quote_for_command(self.cwd.as_str()));
            self.execute_once(&cd, command_timeout).await?;
        }
        Ok(())
    }

    async fn ensure_connected(&mut self) -> Result<()> {
        if !self.is_connected() {
            log::info!("Not connected. Attempting connection now...");
            self.connect().await?;
        }
        Ok(())
    }

    async fn execute_once(&mut self, command: &str, timeout: Duration) -> Result<RawOutput> {
        match &mut self.executor {
            Executor::Discrete(executor) => {
                let transport = self
                    .transport
                    .as_deref_mut()
                    .ok_or(SessionError::NotConnected)?;
                executor.execute(transport, command, &self.cwd, timeout).await
            }
            Executor::Interactive(shell) => shell.execute(command, timeout).await,
        }
    }

    /// Run `command` with the configured timeout.
    pub async fn command(&mut self, command: &str) -> Result<CommandResult> {
        let timeout = self.settings.command_timeout();
        Ok(self
            .command_with(command, timeout, OutputStyle::Lines)
            .await?
            .into_lines())
    }

    pub async fn command_with(
        &mut self,
        command: &str,
        timeout: Duration,
        style: OutputStyle,
    ) -> Result<CommandOutput> {
        self.ensure_connected().await?;

        let result = match self.execute_once(command, timeout).await {
            Err(e) if e.is_timeout() => {
                log::warn!("Communication timeout. Reconnecting...");
                self.reconnect().await?;
                log::info!("Reattempting command...");
                self.execute_once(command, timeout).await
            }
            other => other,
        };

        // After a failed attempt the channels are in an unknown state. Closing
        // the session makes the next call reconnect.
        let raw = match result {
            Ok(raw) => raw,
            Err(e) => {
                if e.is_fatal() {
                    log::error!("{}; closing session", e);
                } else {
                    log::warn!("Command failed: {}; closing session", e);
                }
                self.disconnect().await;
                return Err(e);
            }
        };
        Ok(match style {
            OutputStyle::Lines => CommandOutput::Lines(raw.into_lines()),
            OutputStyle::Raw => CommandOutput::Raw(raw),
        })
    }

    /// Change the remote working directory.
    ///
    /// On exec channels the tracked directory only moves when the `cd`
    /// itself wrote nothing to stderr; it is then set to what the shell
    /// reports as `$PWD`. A PTY merges both streams, so an interactive shell
    /// has to confirm the change itself. A failed interactive `cd` returns
    /// the shell's message as stderr.
    pub async fn cd(&mut self, directory: &str) -> Result<CommandResult> {
        self.ensure_connected().await?;
        let target = workdir::quote_for_command(&self.cwd.resolve(directory));
        let cd = if target.is_empty() {
            "cd".to_string()
        } else {
            format!("cd {}", target)
        };

        let mut response = self.command(&cd).await?;
        if self.executor.is_discrete() {
            if response.stderr.is_empty() {
                let reported = self.command(&format!("{}; echo $PWD", cd)).await?;
                if let Some(dir) = reported.stdout.first() {
                    self.cwd.apply(dir);
                }
            }
            return Ok(response);
        }

        let query = format!("{} && echo \"{}$PWD\"", cd, CWD_MARKER);
        let reported = self.command(&query).await?;
        match reported
            .stdout
            .iter()
            .rev()
            .find_map(|line| line.strip_prefix(CWD_MARKER))
        {
            Some(dir) => self.cwd.apply(dir),
            None if response.stderr.is_empty() => {
                response.stderr = std::mem::take(&mut response.stdout);
            }
            None => {}
        }
        Ok(response)
    }

    /// The tracked working directory, double-quoted when it contains a space.
    pub fn pwd(&self) -> String {
        self.cwd.quoted()
    }

    /// Run `name` with `args` joined by spaces.
    pub async fn run<I>(&mut self, name: &str, args: I) -> Result<CommandResult>
    where
        I: IntoIterator,
        I::Item: ToString,
    {
        let command = RemoteCommand::new(name).args(args);
        self.command(&command.to_string()).await
    }

    pub async fn run_command(&mut self, command: &RemoteCommand) -> Result<CommandResult> {
        self.command(&command.to_string()).await
    }

    pub async fn pull(&mut self, remote: &str, local: Option<&Path>, recursive: bool) -> Result<()> {
        self.ensure_connected().await?;
        let password_auth = self.uses_password();
        let engine = self.transfer.as_mut().ok_or(SessionError::NotConnected)?;
        let target = self.target.as_ref().ok_or(SessionError::NotConnected)?;
        let ctx = TransferContext {
            cwd: &self.cwd,
            target,
            password_auth,
        };
        engine.pull(&ctx, remote, local, recursive).await
    }

    pub async fn push(&mut self, local: &Path, remote: Option<&str>, recursive: bool) -> Result<()> {
        self.ensure_connected().await?;
        let password_auth = self.uses_password();
        let engine = self.transfer.as_mut().ok_or(SessionError::NotConnected)?;
        let target = self.target.as_ref().ok_or(SessionError::NotConnected)?;
        let ctx = TransferContext {
            cwd: &self.cwd,
            target,
            password_auth,
        };
        engine.push(&ctx, local, remote, recursive).await
    }

    /// Open a remote file for reading. With `anchor`, relative paths resolve
    /// against the tracked working directory. The reader does not survive a
    /// reconnect.
    pub async fn open(&mut self, path: &str, anchor: bool) -> Result<RemoteReader> {
        self.ensure_connected().await?;
        let engine = self.transfer.as_mut().ok_or(SessionError::NotConnected)?;
        engine.open(&self.cwd, path, anchor).await
    }

    fn uses_password(&self) -> bool {
        self.credential.as_ref().is_some_and(Credential::is_password)
    }
}
