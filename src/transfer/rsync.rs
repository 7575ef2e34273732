//! rsync as an external transfer program.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;

use super::Direction;
use crate::error::{Result, SessionError};
use crate::ssh::SshTarget;

/// Exit status rsync reports when the remote shell could not connect.
pub const CONNECTION_FAILED: i32 = 255;

/// Exit status and diagnostics of one run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    /// `None` when the process was killed by a signal.
    pub status: Option<i32>,
    pub stderr: String,
}

/// An external program that copies files over its own SSH connection.
#[async_trait]
pub trait SyncProgram: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, args: &[String]) -> Result<SyncOutcome>;
}

/// The local `rsync` binary.
#[derive(Clone, Debug)]
pub struct Rsync {
    program: PathBuf,
}

impl Rsync {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Locate rsync on `PATH`.
    pub fn detect() -> Option<Self> {
        match which::which("rsync") {
            Ok(program) => {
                log::debug!("Using {} for file transfers", program.display());
                Some(Self::new(program))
            }
            Err(_) => None,
        }
    }
}

#[async_trait]
impl SyncProgram for Rsync {
    fn name(&self) -> &str {
        "rsync"
    }

    async fn run(&self, args: &[String]) -> Result<SyncOutcome> {
        log::debug!("{} {}", self.program.display(), args.join(" "));
        let output = tokio::process::Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::piped())
            .output()
            .await?;
        Ok(SyncOutcome {
            status: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Arguments for copying one path. `remote` and `local` must be absolute.
pub fn rsync_args(target: &SshTarget, direction: Direction, remote: &str, local: &Path) -> Vec<String> {
    let shell = if target.port == 22 {
        "ssh".to_string()
    } else {
        format!("ssh -p {}", target.port)
    };
    let remote = format!("{}@{}:\"{}\"", target.user, target.host, remote);
    let local = local.display().to_string();

    let mut args = vec!["-P".to_string(), "-e".to_string(), shell];
    match direction {
        Direction::Pull => args.extend([remote, local]),
        Direction::Push => args.extend([local, remote]),
    }
    args
}

/// Run `program`, retrying once after `delay` if it could not connect.
pub async fn run_with_retry(program: &dyn SyncProgram, args: &[String], delay: Duration) -> Result<()> {
    let mut outcome = program.run(args).await?;
    if outcome.status == Some(CONNECTION_FAILED) {
        log::warn!(
            "{} connection failed. Retrying in {:?}...",
            program.name(),
            delay
        );
        tokio::time::sleep(delay).await;
        outcome = program.run(args).await?;
    }
    match outcome.status {
        Some(0) => Ok(()),
        status => Err(SessionError::SyncFailed {
            program: program.name().to_string(),
            status: status.unwrap_or(-1),
            stderr: outcome.stderr,
        }),
    }
}
