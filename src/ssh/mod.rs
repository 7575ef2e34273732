pub mod client;
pub mod connector;
pub mod sftp;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::exec::RawOutput;
use sftp::RemoteFs;

/// Resolved SSH connection target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub user: String,
    pub port: u16,
    /// `None` when verification is disabled or the file is missing.
    pub known_hosts: Option<PathBuf>,
    pub identity_files: Vec<PathBuf>,
}

/// Secret used to authenticate. Held in memory only.
#[derive(Clone)]
pub enum Credential {
    Password(String),
    KeyFile {
        path: PathBuf,
        passphrase: Option<String>,
    },
}

impl Credential {
    pub fn is_password(&self) -> bool {
        matches!(self, Credential::Password(_))
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::Password(_) => f.write_str("Password(***)"),
            Credential::KeyFile { path, .. } => f
                .debug_struct("KeyFile")
                .field("path", path)
                .finish_non_exhaustive(),
        }
    }
}

/// Opens authenticated transports.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Perform one handshake and authentication attempt. The handshake is
    /// bounded by `timeout`.
    async fn connect(
        &self,
        target: &SshTarget,
        credential: Option<&Credential>,
        timeout: Duration,
    ) -> Result<Box<dyn Transport>>;
}

/// An authenticated SSH connection.
#[async_trait]
pub trait Transport: Send {
    /// Run `command` on a fresh exec channel, collecting its output until the
    /// channel closes or `timeout` elapses.
    async fn exec(&mut self, command: &str, timeout: Duration) -> Result<RawOutput>;

    /// Open a persistent shell with a PTY attached.
    async fn open_shell(&mut self) -> Result<Box<dyn ShellChannel>>;

    /// Open the SFTP subsystem on a new channel.
    async fn open_sftp(&mut self) -> Result<Box<dyn RemoteFs>>;

    async fn close(&mut self) -> Result<()>;
}

/// A chunk received from an interactive shell.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ShellChunk {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

/// Byte-level access to a persistent shell channel.
#[async_trait]
pub trait ShellChannel: Send {
    async fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Next chunk of output; `None` once the channel has closed.
    async fn recv(&mut self) -> Result<Option<ShellChunk>>;

    async fn close(&mut self) -> Result<()>;
}
