use std::path::Path;
use std::pin::Pin;

use async_trait::async_trait;
use russh_sftp::client::SftpSession;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWriteExt};

use crate::error::{Result, SessionError};
use crate::workdir;

/// Streaming reader over a remote file.
pub type RemoteReader = Pin<Box<dyn AsyncRead + Send>>;

/// Represents a remote file entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoteFileEntry {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
    pub modified: Option<u64>,
    pub permissions: Option<u32>,
}

/// Remote filesystem operations used by file transfers.
///
/// Relative paths resolve against the directory last passed to
/// [`RemoteFs::chdir`].
#[async_trait]
pub trait RemoteFs: Send + Sync {
    /// Anchor relative paths at `dir`.
    fn chdir(&mut self, dir: &str);

    /// The anchor directory, if one has been set.
    fn cwd(&self) -> Option<&str>;

    async fn is_dir(&self, path: &str) -> Result<bool>;

    /// Directory entries, excluding `.` and `..`.
    async fn list_dir(&self, path: &str) -> Result<Vec<RemoteFileEntry>>;

    async fn create_dir(&self, path: &str) -> Result<()>;

    async fn download(&self, remote_path: &str, local_path: &Path) -> Result<()>;

    async fn upload(&self, local_path: &Path, remote_path: &str) -> Result<()>;

    async fn open(&self, path: &str) -> Result<RemoteReader>;

    /// Absolute form of `path` under the current anchor.
    fn resolve(&self, path: &str) -> String {
        match self.cwd() {
            Some(base) if !path.starts_with('/') => workdir::join(base, path),
            _ => path.to_string(),
        }
    }
}

/// SFTP operations wrapper.
pub struct SftpClient {
    session: Option<SftpSession>,
    cwd: Option<String>,
}

impl SftpClient {
    pub fn new() -> Self {
        Self {
            session: None,
            cwd: None,
        }
    }

    /// Initialize SFTP session from an existing SSH channel.
    pub async fn init(
        &mut self,
        channel: russh::Channel<russh::client::Msg>,
    ) -> Result<()> {
        channel.request_subsystem(true, "sftp").await?;
        let sftp = SftpSession::new(channel.into_stream()).await?;
        self.session = Some(sftp);
        Ok(())
    }

    fn session(&self) -> Result<&SftpSession> {
        self.session
            .as_ref()
            .ok_or_else(|| SessionError::Protocol("SFTP session not initialized".to_string()))
    }
}

impl Default for SftpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteFs for SftpClient {
    fn chdir(&mut self, dir: &str) {
        self.cwd = Some(workdir::unquote(dir).to_string());
    }

    fn cwd(&self) -> Option<&str> {
        self.cwd.as_deref()
    }

    async fn is_dir(&self, path: &str) -> Result<bool> {
        let metadata = self.session()?.metadata(self.resolve(path)).await?;
        Ok(metadata.file_type().is_dir())
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<RemoteFileEntry>> {
        let path = self.resolve(path);
        let dir = self.session()?.read_dir(path.as_str()).await?;
        let mut entries = Vec::new();

        for entry in dir {
            let name = entry.file_name();
            if name == "." || name == ".." {
                continue;
            }
            let file_path = workdir::join(workdir::trim_trailing_slashes(&path), &name);
            let metadata = entry.metadata();

            entries.push(RemoteFileEntry {
                is_dir: entry.file_type().is_dir(),
                size: metadata.size.unwrap_or(0),
                modified: metadata.mtime.map(|v| v as u64),
                permissions: metadata.permissions,
                name,
                path: file_path,
            });
        }

        // Sort: directories first, then files, alphabetically
        entries.sort_by(|a, b| {
            b.is_dir
                .cmp(&a.is_dir)
                .then(a.name.to_lowercase().cmp(&b.name.to_lowercase()))
        });

        Ok(entries)
    }

    async fn create_dir(&self, path: &str) -> Result<()> {
        self.session()?.create_dir(self.resolve(path)).await?;
        Ok(())
    }

    async fn download(&self, remote_path: &str, local_path: &Path) -> Result<()> {
        let remote_path = self.resolve(remote_path);
        let mut remote = Box::pin(self.session()?.open(remote_path.as_str()).await?);
        let mut local = tokio::fs::File::create(local_path).await?;
        let bytes = tokio::io::copy(&mut remote, &mut local).await?;
        local.flush().await?;

        log::info!(
            "Downloaded {} -> {} ({} bytes)",
            remote_path,
            local_path.display(),
            bytes
        );
        Ok(())
    }

    async fn upload(&self, local_path: &Path, remote_path: &str) -> Result<()> {
        let remote_path = self.resolve(remote_path);
        let mut local = tokio::fs::File::open(local_path).await?;
        let mut remote = Box::pin(self.session()?.create(remote_path.as_str()).await?);
        let bytes = tokio::io::copy(&mut local, &mut remote).await?;
        remote.shutdown().await?;

        log::info!(
            "Uploaded {} -> {} ({} bytes)",
            local_path.display(),
            remote_path,
            bytes
        );
        Ok(())
    }

    async fn open(&self, path: &str) -> Result<RemoteReader> {
        let file = self.session()?.open(self.resolve(path)).await?;
        Ok(Box::pin(file))
    }
}
