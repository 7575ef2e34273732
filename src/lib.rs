//! Remote execution sessions over SSH.
//!
//! A [`RemoteSession`] keeps one logical connection to a remote host,
//! runs shell commands against a client-tracked working directory, and
//! moves files and directory trees over SFTP or rsync.

pub mod blocking;
pub mod command;
pub mod config;
pub mod error;
pub mod exec;
pub mod session;
pub mod ssh;
pub mod transfer;
pub mod workdir;

#[cfg(test)]
mod testing;

pub use blocking::BlockingSession;
pub use command::RemoteCommand;
pub use config::{ExecStrategy, SessionSettings, TransferMode};
pub use error::{Result, SessionError};
pub use exec::{CommandOutput, CommandResult, OutputStyle, RawOutput};
pub use session::{ConnectionStatus, RemoteSession};
pub use ssh::connector::{ConsolePrompt, CredentialSource, StaticCredentials};
pub use ssh::Credential;

/// Install `env_logger`, honouring `RUST_LOG` and defaulting to `info`.
/// Later calls are no-ops.
pub fn init_logging() {
    let env = env_logger::Env::default().default_filter_or("info");
    let _ = env_logger::Builder::from_env(env).try_init();
}
