//! Connection establishment policy: timeout retry and credential prompting.

use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::time::Duration;

use super::{Connector, Credential, SshTarget, Transport};
use crate::error::{Result, SessionError};

/// Supplies what the session cannot find on its own.
///
/// Called from a blocking thread, so implementations may prompt on the console.
pub trait CredentialSource: Send + Sync {
    /// Host and user when the settings lack them.
    fn connection_target(&self, missing: &[&'static str]) -> Option<(String, String)>;

    /// A password after authentication failed.
    fn password(&self, user: &str, host: &str) -> Option<String>;
}

/// Prompts on the terminal.
#[derive(Clone, Debug, Default)]
pub struct ConsolePrompt;

impl CredentialSource for ConsolePrompt {
    fn connection_target(&self, missing: &[&'static str]) -> Option<(String, String)> {
        println!("Remote host credentials unspecified ({}).", missing.join(", "));
        let host = read_line("Please enter the remote hostname: ")?;
        let user = read_line("Please enter the remote username: ")?;
        Some((host, user))
    }

    fn password(&self, user: &str, host: &str) -> Option<String> {
        rpassword::prompt_password(format!("Password for {}@{}: ", user, host))
            .map_err(|e| log::warn!("Could not read password: {}", e))
            .ok()
    }
}

fn read_line(prompt: &str) -> Option<String> {
    print!("{}", prompt);
    io::stdout().flush().ok()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line).ok()?;
    let line = line.trim();
    (!line.is_empty()).then(|| line.to_string())
}

/// Never prompts; optionally hands out a fixed password.
#[derive(Clone, Default)]
pub struct StaticCredentials {
    password: Option<String>,
}

impl StaticCredentials {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn password(password: impl Into<String>) -> Self {
        Self {
            password: Some(password.into()),
        }
    }
}

impl CredentialSource for StaticCredentials {
    fn connection_target(&self, _missing: &[&'static str]) -> Option<(String, String)> {
        None
    }

    fn password(&self, _user: &str, _host: &str) -> Option<String> {
        self.password.clone()
    }
}

/// Handshake deadlines for the first attempt and the single retry.
#[derive(Clone, Copy, Debug)]
pub struct ConnectTimeouts {
    pub first: Duration,
    pub retry: Duration,
}

/// Connect, retrying once on timeout and once more after asking for a
/// password if authentication fails. A password obtained here is stored in
/// `credential` for later reconnects.
pub async fn establish(
    connector: &dyn Connector,
    target: &SshTarget,
    credential: &mut Option<Credential>,
    source: &Arc<dyn CredentialSource>,
    timeouts: ConnectTimeouts,
) -> Result<Box<dyn Transport>> {
    match connect_with_retry(connector, target, credential.as_ref(), timeouts).await {
        Err(SessionError::Authentication { user, host }) => {
            log::warn!(
                "Authentication failed. Please specify password for {} on {}.",
                user,
                host
            );
            let password = {
                let source = Arc::clone(source);
                let (user, host) = (user.clone(), host.clone());
                tokio::task::spawn_blocking(move || source.password(&user, &host))
                    .await
                    .map_err(anyhow::Error::from)?
            };
            let Some(password) = password else {
                return Err(SessionError::Authentication { user, host });
            };
            *credential = Some(Credential::Password(password));
            connect_with_retry(connector, target, credential.as_ref(), timeouts).await
        }
        other => other,
    }
}

async fn connect_with_retry(
    connector: &dyn Connector,
    target: &SshTarget,
    credential: Option<&Credential>,
    timeouts: ConnectTimeouts,
) -> Result<Box<dyn Transport>> {
    match connector.connect(target, credential, timeouts.first).await {
        Err(SessionError::ConnectTimeout { .. }) => {
            log::warn!(
                "Connection to {}:{} timed out. Re-trying with {:?} timeout...",
                target.host,
                target.port,
                timeouts.retry
            );
            connector.connect(target, credential, timeouts.retry).await
        }
        other => other,
    }
}

/// Ask `source` for host and user on a blocking thread.
pub async fn prompt_target(
    source: &Arc<dyn CredentialSource>,
    missing: Vec<&'static str>,
) -> Result<Option<(String, String)>> {
    let source = Arc::clone(source);
    let answer = tokio::task::spawn_blocking(move || source.connection_target(&missing))
        .await
        .map_err(anyhow::Error::from)?;
    Ok(answer)
}
