//! Persistent shell with sentinel-framed responses.
//!
//! Each command is sent as `command; \` followed by `echo <sentinel>` on a
//! continuation line. The PTY echoes the input, so the sentinel shows up
//! twice per command: once in the echo, once as output. What precedes the
//! first occurrence is discarded, what follows the last is the new prompt.

use std::time::Duration;

use tokio::time::Instant;

use super::RawOutput;
use crate::error::{Result, SessionError};
use crate::ssh::{ShellChannel, ShellChunk};

/// How long to wait for the prompt once the closing sentinel has arrived.
const PROMPT_GRACE: Duration = Duration::from_millis(200);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShellState {
    Connecting,
    AwaitInitialPrompt,
    Idle,
    AwaitSentinel,
    /// A read timed out without resynchronising; the shell is unusable.
    Broken,
}

/// Marker echoed after every command. Constant for the process.
pub fn default_sentinel() -> String {
    format!("===REMOTEBOX-END-{}===", std::process::id())
}

pub struct InteractiveExecutor {
    shell: Option<Box<dyn ShellChannel>>,
    state: ShellState,
    prompt: String,
    sentinel: String,
    echoes_input: bool,
}

impl InteractiveExecutor {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            shell: None,
            state: ShellState::Connecting,
            prompt: prompt.into(),
            sentinel: default_sentinel(),
            echoes_input: true,
        }
    }

    /// Whether the remote terminal echoes submitted input. Without echo the
    /// sentinel is expected once per command instead of twice.
    pub fn with_input_echo(mut self, echoes_input: bool) -> Self {
        self.echoes_input = echoes_input;
        self
    }

    pub fn echoes_input(&self) -> bool {
        self.echoes_input
    }

    pub fn state(&self) -> ShellState {
        self.state
    }

    /// The prompt marker currently expected from the shell.
    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn sentinel(&self) -> &str {
        &self.sentinel
    }

    /// Take ownership of a freshly opened shell and wait for its first prompt.
    ///
    /// If the configured prompt never shows up but the shell printed
    /// something, the tail of that output becomes the prompt marker.
    pub async fn start(&mut self, mut shell: Box<dyn ShellChannel>, timeout: Duration) -> Result<()> {
        self.state = ShellState::AwaitInitialPrompt;
        match read_until(shell.as_mut(), &self.prompt, 1, timeout).await {
            Ok(_) => {}
            Err(SessionError::Timeout { partial, .. }) => {
                let text = String::from_utf8_lossy(&partial.stdout).into_owned();
                if text.trim().is_empty() {
                    self.state = ShellState::Broken;
                    return Err(SessionError::ShellDesync {
                        reason: "no response from remote shell".to_string(),
                        partial,
                    });
                }
                let observed = observed_prompt(&text);
                log::warn!(
                    "Command prompt doesn't contain '{}'. Consider changing the prompt setting to '{}'.",
                    self.prompt,
                    observed
                );
                self.prompt = observed;
            }
            Err(e) => {
                self.state = ShellState::Broken;
                return Err(e);
            }
        }
        self.shell = Some(shell);
        self.state = ShellState::Idle;
        Ok(())
    }

    pub async fn execute(&mut self, command: &str, timeout: Duration) -> Result<RawOutput> {
        let shell = match (self.state, self.shell.as_mut()) {
            (ShellState::Idle, Some(shell)) => shell,
            _ => return Err(SessionError::NotConnected),
        };

        self.state = ShellState::AwaitSentinel;
        log::debug!("shell: {}", command);
        if let Err(e) = shell.send(frame_command(command, &self.sentinel).as_bytes()).await {
            self.state = ShellState::Broken;
            return Err(e);
        }

        let expected = if self.echoes_input { 2 } else { 1 };
        let mut raw = match read_until(shell.as_mut(), &self.sentinel, expected, timeout).await {
            Ok(raw) => raw,
            Err(SessionError::Timeout { timeout, partial }) => {
                self.state = ShellState::Broken;
                return Err(SessionError::ShellDesync {
                    reason: format!("sentinel not seen within {:?}", timeout),
                    partial,
                });
            }
            Err(e) => {
                self.state = ShellState::Broken;
                return Err(e);
            }
        };

        let grace = timeout.min(PROMPT_GRACE);
        if let Err(e) = read_prompt(shell.as_mut(), &mut raw, &self.sentinel, &self.prompt, grace).await {
            self.state = ShellState::Broken;
            return Err(e);
        }

        let text = String::from_utf8_lossy(&raw.stdout);
        let Some((output, trailing)) = split_frame(&text, &self.sentinel, self.echoes_input) else {
            self.state = ShellState::Broken;
            return Err(SessionError::ShellDesync {
                reason: "malformed response frame".to_string(),
                partial: raw.clone(),
            });
        };

        let trailing = trailing.trim();
        if !trailing.is_empty() && trailing != self.prompt {
            log::warn!(
                "Shell prompt changed from '{}' to '{}'; update the prompt setting to match.",
                self.prompt,
                trailing
            );
            self.prompt = trailing.to_string();
        }

        let stdout = output.trim().as_bytes().to_vec();
        let stderr = String::from_utf8_lossy(&raw.stderr).trim().as_bytes().to_vec();
        self.state = ShellState::Idle;
        Ok(RawOutput {
            stdout,
            stderr,
            exit_status: None,
        })
    }

    /// Close the shell. The executor can be started again afterwards.
    pub async fn shutdown(&mut self) {
        if let Some(mut shell) = self.shell.take() {
            if let Err(e) = shell.close().await {
                log::debug!("Closing shell channel: {}", e);
            }
        }
        self.state = ShellState::Connecting;
    }
}

/// The bytes sent for one command.
pub fn frame_command(command: &str, sentinel: &str) -> String {
    format!("{}; \\\necho {}\n", command, sentinel)
}

/// Accumulate shell output until `marker` has appeared `count` times in
/// stdout. On deadline the partial output travels in the timeout error.
async fn read_until(
    shell: &mut dyn ShellChannel,
    marker: &str,
    count: usize,
    timeout: Duration,
) -> Result<RawOutput> {
    let deadline = Instant::now() + timeout;
    let mut output = RawOutput::default();
    loop {
        if !output.stdout.is_empty() && occurrences(&output.stdout, marker) >= count {
            return Ok(output);
        }
        match tokio::time::timeout_at(deadline, shell.recv()).await {
            Err(_) => {
                return Err(SessionError::Timeout {
                    timeout,
                    partial: output,
                })
            }
            Ok(Err(e)) => return Err(e),
            Ok(Ok(None)) => {
                return Err(SessionError::ShellDesync {
                    reason: "shell channel closed".to_string(),
                    partial: output,
                })
            }
            Ok(Ok(Some(ShellChunk::Stdout(bytes)))) => output.stdout.extend_from_slice(&bytes),
            Ok(Ok(Some(ShellChunk::Stderr(bytes)))) => output.stderr.extend_from_slice(&bytes),
        }
    }
}

/// Keep reading after the closing sentinel until the prompt marker shows up
/// or the shell stays quiet for `grace`. A prompt that arrives later lands
/// before the next command's echo and is discarded with it.
async fn read_prompt(
    shell: &mut dyn ShellChannel,
    output: &mut RawOutput,
    sentinel: &str,
    prompt: &str,
    grace: Duration,
) -> Result<()> {
    loop {
        let complete = {
            let text = String::from_utf8_lossy(&output.stdout);
            let trailing = text
                .rfind(sentinel)
                .map(|at| &text[at + sentinel.len()..])
                .unwrap_or("");
            !prompt.is_empty() && trailing.contains(prompt)
        };
        if complete {
            return Ok(());
        }
        match tokio::time::timeout(grace, shell.recv()).await {
            Err(_) | Ok(Ok(None)) => return Ok(()),
            Ok(Err(e)) => return Err(e),
            Ok(Ok(Some(ShellChunk::Stdout(bytes)))) => output.stdout.extend_from_slice(&bytes),
            Ok(Ok(Some(ShellChunk::Stderr(bytes)))) => output.stderr.extend_from_slice(&bytes),
        }
    }
}

fn occurrences(haystack: &[u8], marker: &str) -> usize {
    if marker.is_empty() {
        return usize::MAX;
    }
    String::from_utf8_lossy(haystack).matches(marker).count()
}

/// Split a response into the command output and the trailing prompt.
fn split_frame<'a>(text: &'a str, sentinel: &str, echoed: bool) -> Option<(&'a str, &'a str)> {
    let last = text.rfind(sentinel)?;
    let trailing = &text[last + sentinel.len()..];
    let output = if echoed {
        let first = text.find(sentinel)?;
        if first == last {
            return None;
        }
        &text[first + sentinel.len()..last]
    } else {
        &text[..last]
    };
    Some((output, trailing))
}

/// Best guess at the prompt from a shell's greeting: whatever follows the
/// last `~`, or the final character.
fn observed_prompt(text: &str) -> String {
    let text = text.trim();
    match text.rsplit_once('~') {
        Some((_, tail)) if !tail.is_empty() => tail.to_string(),
        _ => text.chars().last().map(String::from).unwrap_or_default(),
    }
}
