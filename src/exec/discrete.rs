//! One exec channel per command.

use std::time::Duration;

use super::RawOutput;
use crate::error::Result;
use crate::ssh::Transport;
use crate::workdir::WorkingDirectory;

/// Stateless execution: every command runs on a fresh channel, prefixed
/// with a `cd` to the tracked directory.
#[derive(Clone, Debug, Default)]
pub struct DiscreteExecutor;

impl DiscreteExecutor {
    pub fn new() -> Self {
        Self
    }

    /// The literal string submitted for `command` against `cwd`.
    pub fn submission(command: &str, cwd: &WorkingDirectory) -> String {
        // A fresh channel always starts in $HOME, so pwd cannot be asked directly.
        let command = if command.trim() == "pwd" {
            "echo \"$HOME\""
        } else {
            command
        };
        cwd.prefix(command)
    }

    pub async fn execute(
        &self,
        transport: &mut dyn Transport,
        command: &str,
        cwd: &WorkingDirectory,
        timeout: Duration,
    ) -> Result<RawOutput> {
        let submit = Self::submission(command, cwd);
        log::debug!("exec: {}", submit);
        transport.exec(&submit, timeout).await
    }
}
