//! Session settings with environment fallbacks.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};

pub const ENV_HOST: &str = "REMOTEBOX_SSH_HOST";
pub const ENV_USER: &str = "REMOTEBOX_SSH_USER";
pub const ENV_PORT: &str = "REMOTEBOX_SSH_PORT";

/// How commands reach the remote shell. Fixed for a session's lifetime.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecStrategy {
    /// One exec channel per command, working directory prefixed client-side.
    #[default]
    Discrete,
    /// One persistent PTY shell, output framed by a sentinel.
    Interactive,
}

/// Which mechanism moves file contents.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    /// rsync when it is installed locally, SFTP otherwise.
    #[default]
    Auto,
    Sftp,
    Rsync,
}

/// Everything needed to open a session.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub host: Option<String>,
    pub user: Option<String>,
    pub port: u16,
    /// `None` disables host key verification.
    pub known_hosts: Option<PathBuf>,
    /// Private keys tried in order when no credential is set.
    pub identity_files: Vec<PathBuf>,
    pub strategy: ExecStrategy,
    /// Prompt marker awaited when an interactive shell starts.
    pub prompt: String,
    /// Whether the remote terminal echoes input back to an interactive shell.
    pub shell_echo: bool,
    pub connect_timeout_secs: u64,
    pub connect_retry_timeout_secs: u64,
    pub command_timeout_secs: u64,
    pub transfer: TransferMode,
    pub sync_retry_delay_secs: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        let ssh_dir = dirs::home_dir().map(|home| home.join(".ssh"));
        Self {
            host: None,
            user: None,
            port: 22,
            known_hosts: ssh_dir.as_ref().map(|dir| dir.join("known_hosts")),
            identity_files: ssh_dir
                .map(|dir| {
                    ["id_ed25519", "id_ecdsa", "id_rsa"]
                        .iter()
                        .map(|name| dir.join(name))
                        .collect()
                })
                .unwrap_or_default(),
            strategy: ExecStrategy::Discrete,
            prompt: "$".to_string(),
            shell_echo: true,
            connect_timeout_secs: 3,
            connect_retry_timeout_secs: 10,
            command_timeout_secs: 5,
            transfer: TransferMode::Auto,
            sync_retry_delay_secs: 10,
        }
    }
}

impl SessionSettings {
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: Some(host.into()),
            user: Some(user.into()),
            ..Self::default()
        }
    }

    /// Defaults with host, user and port taken from the environment.
    pub fn from_env() -> Self {
        Self::default().with_env_fallback()
    }

    /// Fill unset host and user from the environment, and the port when
    /// it is still the default.
    pub fn with_env_fallback(mut self) -> Self {
        if self.host.is_none() {
            self.host = non_empty_var(ENV_HOST);
        }
        if self.user.is_none() {
            self.user = non_empty_var(ENV_USER);
        }
        if self.port == 22 {
            if let Some(port) = non_empty_var(ENV_PORT) {
                match port.parse() {
                    Ok(port) => self.port = port,
                    Err(_) => log::warn!("Ignoring invalid {}={}", ENV_PORT, port),
                }
            }
        }
        self
    }

    /// Names of required parameters that are still unset.
    pub fn missing(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.host.as_deref().map_or(true, str::is_empty) {
            missing.push("host");
        }
        if self.user.as_deref().map_or(true, str::is_empty) {
            missing.push("user");
        }
        missing
    }

    /// Resolve the connection target, failing on the first missing parameter.
    pub fn target(&self) -> Result<crate::ssh::SshTarget> {
        let host = self
            .host
            .clone()
            .filter(|h| !h.is_empty())
            .ok_or(SessionError::MissingParameter("host"))?;
        let user = self
            .user
            .clone()
            .filter(|u| !u.is_empty())
            .ok_or(SessionError::MissingParameter("user"))?;
        let known_hosts = match &self.known_hosts {
            Some(path) if path.exists() => Some(path.clone()),
            Some(path) => {
                log::warn!(
                    "known_hosts file ({}) not found; host keys will not be verified",
                    path.display()
                );
                None
            }
            None => None,
        };
        Ok(crate::ssh::SshTarget {
            host,
            user,
            port: self.port,
            known_hosts,
            identity_files: self.identity_files.clone(),
        })
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn connect_retry_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_retry_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn sync_retry_delay(&self) -> Duration {
        Duration::from_secs(self.sync_retry_delay_secs)
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}
