//! File and directory transfers between the local machine and the remote host.
//!
//! SFTP does not copy directories, so recursive transfers walk the source
//! tree and copy it one file at a time. Individual files go through rsync
//! when it is available, SFTP otherwise.

pub mod rsync;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::config::TransferMode;
use crate::error::{Result, SessionError};
use crate::ssh::sftp::{RemoteFs, RemoteReader};
use crate::ssh::SshTarget;
use crate::workdir::{self, WorkingDirectory};
use rsync::SyncProgram;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Pull,
    Push,
}

/// Session state a transfer depends on.
pub struct TransferContext<'a> {
    pub cwd: &'a WorkingDirectory,
    pub target: &'a SshTarget,
    /// rsync opens its own connection and cannot reuse a password.
    pub password_auth: bool,
}

pub struct FileTransferEngine {
    fs: Box<dyn RemoteFs>,
    sync: Option<Arc<dyn SyncProgram>>,
    mode: TransferMode,
    retry_delay: Duration,
}

impl FileTransferEngine {
    pub fn new(
        fs: Box<dyn RemoteFs>,
        sync: Option<Arc<dyn SyncProgram>>,
        mode: TransferMode,
        retry_delay: Duration,
    ) -> Self {
        Self {
            fs,
            sync,
            mode,
            retry_delay,
        }
    }

    /// Point relative remote paths at the tracked working directory.
    fn anchor(&mut self, cwd: &WorkingDirectory) {
        if !cwd.is_unset() {
            self.fs.chdir(cwd.as_str());
        }
    }

    /// The external program to use, or `None` for SFTP.
    fn sync_program(&self, ctx: &TransferContext<'_>) -> Result<Option<Arc<dyn SyncProgram>>> {
        let sync = match (self.mode, &self.sync) {
            (TransferMode::Sftp, _) | (TransferMode::Auto, None) => return Ok(None),
            (TransferMode::Rsync, None) => {
                return Err(SessionError::Config(
                    "rsync transfers requested but rsync is not installed".to_string(),
                ))
            }
            (_, Some(sync)) => sync,
        };
        if ctx.password_auth {
            return Err(SessionError::Config(format!(
                "{} transfers need SSH key authentication; set up keys or use SFTP transfers",
                sync.name()
            )));
        }
        Ok(Some(Arc::clone(sync)))
    }

    /// Copy `remote` to `local` (default: the remote file name in the
    /// current local directory).
    pub async fn pull(
        &mut self,
        ctx: &TransferContext<'_>,
        remote: &str,
        local: Option<&Path>,
        recursive: bool,
    ) -> Result<()> {
        let remote = workdir::trim_trailing_slashes(remote).to_string();
        let local = match local {
            Some(path) => trim_local(path),
            None => PathBuf::from(workdir::basename(&remote)),
        };
        self.anchor(ctx.cwd);

        let mut pending = vec![(remote, local)];
        while let Some((remote, local)) = pending.pop() {
            if recursive && self.fs.is_dir(&remote).await? {
                create_local_dir(&local).await?;
                for entry in self.fs.list_dir(&remote).await? {
                    pending.push((workdir::join(&remote, &entry.name), local.join(&entry.name)));
                }
                continue;
            }
            if let Some(parent) = local.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await?;
            }
            self.pull_file(ctx, &remote, &local).await?;
        }
        Ok(())
    }

    /// Copy `local` to `remote` (default: the local file name in the
    /// remote working directory).
    pub async fn push(
        &mut self,
        ctx: &TransferContext<'_>,
        local: &Path,
        remote: Option<&str>,
        recursive: bool,
    ) -> Result<()> {
        let local = trim_local(local);
        let remote = match remote {
            Some(path) => workdir::trim_trailing_slashes(path).to_string(),
            None => workdir::basename(&local.to_string_lossy()).to_string(),
        };
        self.anchor(ctx.cwd);

        let mut pending = vec![(local, remote)];
        while let Some((local, remote)) = pending.pop() {
            if recursive && tokio::fs::metadata(&local).await?.is_dir() {
                self.create_remote_dir(&remote).await?;
                let mut entries = tokio::fs::read_dir(&local).await?;
                while let Some(entry) = entries.next_entry().await? {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    pending.push((entry.path(), workdir::join(&remote, &name)));
                }
                continue;
            }
            self.push_file(ctx, &local, &remote).await?;
        }
        Ok(())
    }

    /// Open a remote file for streaming reads.
    pub async fn open(&mut self, cwd: &WorkingDirectory, path: &str, anchor: bool) -> Result<RemoteReader> {
        if anchor {
            self.anchor(cwd);
        }
        self.fs.open(path).await
    }

    async fn pull_file(&self, ctx: &TransferContext<'_>, remote: &str, local: &Path) -> Result<()> {
        match self.sync_program(ctx)? {
            Some(sync) => {
                let args = rsync::rsync_args(
                    ctx.target,
                    Direction::Pull,
                    &self.fs.resolve(remote),
                    &absolute_local(local)?,
                );
                rsync::run_with_retry(sync.as_ref(), &args, self.retry_delay).await
            }
            None => self.fs.download(remote, local).await,
        }
    }

    async fn push_file(&self, ctx: &TransferContext<'_>, local: &Path, remote: &str) -> Result<()> {
        match self.sync_program(ctx)? {
            Some(sync) => {
                let args = rsync::rsync_args(
                    ctx.target,
                    Direction::Push,
                    &self.fs.resolve(remote),
                    &absolute_local(local)?,
                );
                rsync::run_with_retry(sync.as_ref(), &args, self.retry_delay).await
            }
            None => self.fs.upload(local, remote).await,
        }
    }

    /// Create a remote directory, tolerating one that already exists.
    async fn create_remote_dir(&self, path: &str) -> Result<()> {
        match self.fs.create_dir(path).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if self.fs.is_dir(path).await.unwrap_or(false) {
                    log::debug!("Remote directory {} already exists", path);
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }
}

async fn create_local_dir(path: &Path) -> Result<()> {
    match tokio::fs::create_dir(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tokio::fs::create_dir_all(path).await?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn trim_local(path: &Path) -> PathBuf {
    PathBuf::from(workdir::trim_trailing_slashes(&path.to_string_lossy()))
}

fn absolute_local(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}
