//! Command execution strategies.

pub mod discrete;
pub mod interactive;

use std::io::Cursor;

use serde::{Deserialize, Serialize};

pub use discrete::DiscreteExecutor;
pub use interactive::{InteractiveExecutor, ShellState};

/// Bytes collected from one command.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Reported by exec channels; interactive shells have none.
    pub exit_status: Option<u32>,
}

impl RawOutput {
    /// Stdout as a reader for stream parsing.
    pub fn stdout_reader(&self) -> Cursor<&[u8]> {
        Cursor::new(self.stdout.as_slice())
    }

    pub fn stderr_reader(&self) -> Cursor<&[u8]> {
        Cursor::new(self.stderr.as_slice())
    }

    /// Decode permissively and split into trimmed lines.
    pub fn into_lines(self) -> CommandResult {
        CommandResult {
            stdout: split_lines(&self.stdout),
            stderr: split_lines(&self.stderr),
            exit_status: self.exit_status,
        }
    }
}

/// Output of a remote command as trimmed lines.
///
/// An empty `stderr` does not imply success; check `exit_status` when the
/// transport provides one.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub exit_status: Option<u32>,
}

impl CommandResult {
    pub fn succeeded(&self) -> bool {
        match self.exit_status {
            Some(status) => status == 0,
            None => self.stderr.is_empty(),
        }
    }
}

/// How [`crate::RemoteSession::command_with`] returns output.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputStyle {
    #[default]
    Lines,
    /// Undecoded streams for callers that parse incrementally.
    Raw,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommandOutput {
    Lines(CommandResult),
    Raw(RawOutput),
}

impl CommandOutput {
    pub fn into_lines(self) -> CommandResult {
        match self {
            CommandOutput::Lines(result) => result,
            CommandOutput::Raw(raw) => raw.into_lines(),
        }
    }
}

/// The execution strategy chosen for a session.
pub enum Executor {
    Discrete(DiscreteExecutor),
    Interactive(InteractiveExecutor),
}

impl Executor {
    pub fn is_discrete(&self) -> bool {
        matches!(self, Executor::Discrete(_))
    }
}

/// Split on line breaks, trimming each line. Invalid UTF-8 is replaced.
pub fn split_lines(bytes: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(bytes)
        .lines()
        .map(|line| line.trim().to_string())
        .collect()
}
