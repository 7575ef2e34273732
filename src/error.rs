use std::time::Duration;

use crate::exec::RawOutput;

/// Errors surfaced by a remote session.
///
/// Transient failures (connect timeouts, exec-channel timeouts, an rsync
/// connection refusal) are retried inside the session layer; anything that
/// reaches a caller is either fatal or needs the caller's attention.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("missing connection parameter: {0}")]
    MissingParameter(&'static str),

    #[error("connection to {host}:{port} timed out after {timeout:?}")]
    ConnectTimeout {
        host: String,
        port: u16,
        timeout: Duration,
    },

    #[error("authentication failed for {user}@{host}")]
    Authentication { user: String, host: String },

    #[error("host key for {host} does not match known_hosts entry on line {line}")]
    HostKeyMismatch { host: String, line: usize },

    #[error("not connected")]
    NotConnected,

    #[error("command timed out after {timeout:?}")]
    Timeout { timeout: Duration, partial: RawOutput },

    #[error("interactive shell lost synchronisation: {reason}")]
    ShellDesync { reason: String, partial: RawOutput },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{program} exited with status {status}: {stderr}")]
    SyncFailed {
        program: String,
        status: i32,
        stderr: String,
    },

    #[error("unexpected response: {0}")]
    Protocol(String),

    #[error("ssh: {0}")]
    Ssh(#[from] russh::Error),

    #[error("sftp: {0}")]
    Sftp(#[from] russh_sftp::client::error::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SessionError {
    /// Exec-channel timeouts are recoverable by reconnecting.
    pub fn is_timeout(&self) -> bool {
        matches!(self, SessionError::Timeout { .. })
    }

    /// Errors the session cannot recover from on its own.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SessionError::Authentication { .. }
                | SessionError::HostKeyMismatch { .. }
                | SessionError::ShellDesync { .. }
                | SessionError::MissingParameter(_)
        )
    }

    /// Output collected before the failure, if any.
    pub fn partial_output(&self) -> Option<&RawOutput> {
        match self {
            SessionError::Timeout { partial, .. } | SessionError::ShellDesync { partial, .. } => {
                Some(partial)
            }
            _ => None,
        }
    }
}

pub type Result<T, E = SessionError> = std::result::Result<T, E>;
