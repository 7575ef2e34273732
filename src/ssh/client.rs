use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh::keys::{self, check_known_hosts_path, load_secret_key, ssh_key, PrivateKeyWithHashAlg};
use russh::{ChannelMsg, Disconnect};

use super::sftp::{RemoteFs, SftpClient};
use super::{Connector, Credential, ShellChannel, ShellChunk, SshTarget, Transport};
use crate::error::{Result, SessionError};
use crate::exec::RawOutput;

/// PTY geometry for interactive shells. Wide enough that echoed commands do not wrap.
const PTY_COLS: u32 = 1024;
const PTY_ROWS: u32 = 24;

/// Opens transports with russh.
#[derive(Clone, Debug, Default)]
pub struct RusshConnector;

/// SSH client handler that checks server keys against known_hosts.
struct KnownHostsHandler {
    host: String,
    port: u16,
    known_hosts: Option<PathBuf>,
}

impl client::Handler for KnownHostsHandler {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        let Some(path) = &self.known_hosts else {
            log::warn!(
                "Accepting server key for {} without verification (no known_hosts)",
                self.host
            );
            return Ok(true);
        };

        match check_known_hosts_path(&self.host, self.port, server_public_key, path) {
            Ok(true) => Ok(true),
            Ok(false) => {
                log::warn!(
                    "{} is not listed in {}; accepting its key",
                    self.host,
                    path.display()
                );
                Ok(true)
            }
            Err(keys::Error::KeyChanged { line }) => Err(SessionError::HostKeyMismatch {
                host: self.host.clone(),
                line,
            }
            .into()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Recover typed errors from the handler's `anyhow` error.
fn from_handler_error(err: anyhow::Error) -> SessionError {
    match err.downcast::<SessionError>() {
        Ok(e) => e,
        Err(err) => match err.downcast::<russh::Error>() {
            Ok(e) => SessionError::Ssh(e),
            Err(err) => SessionError::Other(err),
        },
    }
}

#[async_trait]
impl Connector for RusshConnector {
    async fn connect(
        &self,
        target: &SshTarget,
        credential: Option<&Credential>,
        timeout: Duration,
    ) -> Result<Box<dyn Transport>> {
        let ssh_config = client::Config::default();
        let handler = KnownHostsHandler {
            host: target.host.clone(),
            port: target.port,
            known_hosts: target.known_hosts.clone(),
        };

        let handshake = client::connect(
            Arc::new(ssh_config),
            (target.host.as_str(), target.port),
            handler,
        );
        let mut handle = match tokio::time::timeout(timeout, handshake).await {
            Ok(result) => result.map_err(from_handler_error)?,
            Err(_) => {
                return Err(SessionError::ConnectTimeout {
                    host: target.host.clone(),
                    port: target.port,
                    timeout,
                })
            }
        };

        if !authenticate(&mut handle, target, credential).await? {
            return Err(SessionError::Authentication {
                user: target.user.clone(),
                host: target.host.clone(),
            });
        }

        log::info!(
            "SSH connected to {}@{}:{}",
            target.user,
            target.host,
            target.port
        );
        Ok(Box::new(RusshTransport { handle }))
    }
}

async fn authenticate(
    handle: &mut client::Handle<KnownHostsHandler>,
    target: &SshTarget,
    credential: Option<&Credential>,
) -> Result<bool> {
    match credential {
        Some(Credential::Password(password)) => {
            let result = handle.authenticate_password(&target.user, password).await?;
            Ok(matches!(result, client::AuthResult::Success))
        }
        Some(Credential::KeyFile { path, passphrase }) => {
            authenticate_key(handle, &target.user, path, passphrase.as_deref()).await
        }
        None => {
            for path in target.identity_files.iter().filter(|p| p.exists()) {
                match authenticate_key(handle, &target.user, path, None).await {
                    Ok(true) => return Ok(true),
                    Ok(false) => log::debug!("Key {} rejected", path.display()),
                    Err(e) => log::debug!("Skipping key {}: {}", path.display(), e),
                }
            }
            Ok(false)
        }
    }
}

async fn authenticate_key(
    handle: &mut client::Handle<KnownHostsHandler>,
    user: &str,
    path: &Path,
    passphrase: Option<&str>,
) -> Result<bool> {
    let key_pair = load_secret_key(path, passphrase).map_err(anyhow::Error::from)?;
    let pk = PrivateKeyWithHashAlg::new(Arc::new(key_pair), None);
    let result = handle.authenticate_publickey(user, pk).await?;
    Ok(matches!(result, client::AuthResult::Success))
}

/// An authenticated russh connection.
pub struct RusshTransport {
    handle: client::Handle<KnownHostsHandler>,
}

#[async_trait]
impl Transport for RusshTransport {
    async fn exec(&mut self, command: &str, timeout: Duration) -> Result<RawOutput> {
        let mut channel = self.handle.channel_open_session().await?;
        channel.exec(true, command).await?;

        let deadline = tokio::time::Instant::now() + timeout;
        let mut output = RawOutput::default();
        loop {
            match tokio::time::timeout_at(deadline, channel.wait()).await {
                Err(_) => {
                    let _ = channel.close().await;
                    return Err(SessionError::Timeout {
                        timeout,
                        partial: output,
                    });
                }
                Ok(None) | Ok(Some(ChannelMsg::Close)) => break,
                Ok(Some(ChannelMsg::Data { data })) => output.stdout.extend_from_slice(&data),
                Ok(Some(ChannelMsg::ExtendedData { data, ext: 1 })) => {
                    output.stderr.extend_from_slice(&data)
                }
                Ok(Some(ChannelMsg::ExitStatus { exit_status })) => {
                    output.exit_status = Some(exit_status)
                }
                Ok(Some(_)) => {}
            }
        }
        Ok(output)
    }

    async fn open_shell(&mut self) -> Result<Box<dyn ShellChannel>> {
        let channel = self.handle.channel_open_session().await?;
        channel
            .request_pty(false, "dumb", PTY_COLS, PTY_ROWS, 0, 0, &[])
            .await?;
        channel.request_shell(true).await?;
        Ok(Box::new(RusshShell { channel }))
    }

    async fn open_sftp(&mut self) -> Result<Box<dyn RemoteFs>> {
        let channel = self.handle.channel_open_session().await?;
        let mut sftp = SftpClient::new();
        sftp.init(channel).await?;
        Ok(Box::new(sftp))
    }

    async fn close(&mut self) -> Result<()> {
        self.handle
            .disconnect(Disconnect::ByApplication, "User disconnect", "en")
            .await?;
        Ok(())
    }
}

/// A PTY shell channel.
struct RusshShell {
    channel: russh::Channel<client::Msg>,
}

#[async_trait]
impl ShellChannel for RusshShell {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        self.channel.data(data).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<ShellChunk>> {
        loop {
            match self.channel.wait().await {
                None => return Ok(None),
                Some(ChannelMsg::Data { data }) => return Ok(Some(ShellChunk::Stdout(data.to_vec()))),
                Some(ChannelMsg::ExtendedData { data, .. }) => {
                    return Ok(Some(ShellChunk::Stderr(data.to_vec())))
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) => return Ok(None),
                Some(_) => {}
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.channel.eof().await?;
        self.channel.close().await?;
        Ok(())
    }
}
