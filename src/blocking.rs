//! Synchronous wrapper for callers without an async runtime.

use std::path::Path;
use std::time::Duration;

use crate::command::RemoteCommand;
use crate::config::SessionSettings;
use crate::error::{Result, SessionError};
use crate::exec::{CommandOutput, CommandResult, OutputStyle};
use crate::session::{ConnectionStatus, RemoteSession};
use crate::ssh::Credential;

/// A [`RemoteSession`] driven by its own single-threaded tokio runtime.
///
/// Must not be used from inside another tokio runtime.
pub struct BlockingSession {
    runtime: tokio::runtime::Runtime,
    inner: RemoteSession,
}

impl BlockingSession {
    pub fn new(settings: SessionSettings) -> Result<Self> {
        Self::from_session(RemoteSession::new(settings))
    }

    pub fn from_session(inner: RemoteSession) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .thread_name("remotebox")
            .build()?;
        Ok(Self { runtime, inner })
    }

    pub fn session(&self) -> &RemoteSession {
        &self.inner
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.status()
    }

    pub fn set_credential(&mut self, credential: Credential) {
        self.inner.set_credential(credential);
    }

    pub fn clear_credential(&mut self) {
        self.inner.clear_credential();
    }

    pub fn connect(&mut self) -> Result<()> {
        self.runtime.block_on(self.inner.connect())
    }

    pub fn disconnect(&mut self) {
        self.runtime.block_on(self.inner.disconnect())
    }

    pub fn reconnect(&mut self) -> Result<()> {
        self.runtime.block_on(self.inner.reconnect())
    }

    pub fn command(&mut self, command: &str) -> Result<CommandResult> {
        self.runtime.block_on(self.inner.command(command))
    }

    pub fn command_with(
        &mut self,
        command: &str,
        timeout: Duration,
        style: OutputStyle,
    ) -> Result<CommandOutput> {
        self.runtime
            .block_on(self.inner.command_with(command, timeout, style))
    }

    pub fn cd(&mut self, directory: &str) -> Result<CommandResult> {
        self.runtime.block_on(self.inner.cd(directory))
    }

    pub fn pwd(&self) -> String {
        self.inner.pwd()
    }

    pub fn run<I>(&mut self, name: &str, args: I) -> Result<CommandResult>
    where
        I: IntoIterator,
        I::Item: ToString,
    {
        self.command(&RemoteCommand::new(name).args(args).to_string())
    }

    pub fn pull(&mut self, remote: &str, local: Option<&Path>, recursive: bool) -> Result<()> {
        self.runtime
            .block_on(self.inner.pull(remote, local, recursive))
    }

    pub fn push(&mut self, local: &Path, remote: Option<&str>, recursive: bool) -> Result<()> {
        self.runtime
            .block_on(self.inner.push(local, remote, recursive))
    }

    /// Read a whole remote file.
    pub fn read_file(&mut self, path: &str) -> Result<Vec<u8>> {
        use tokio::io::AsyncReadExt;

        let inner = &mut self.inner;
        self.runtime.block_on(async move {
            let mut reader = inner.open(path, true).await?;
            let mut contents = Vec::new();
            reader.read_to_end(&mut contents).await?;
            Ok::<_, SessionError>(contents)
        })
    }
}

impl Drop for BlockingSession {
    fn drop(&mut self) {
        if self.inner.is_connected() {
            self.runtime.block_on(self.inner.disconnect());
        }
    }
}
