//! Client-side tracking of the remote working directory.
//!
//! Exec channels start every command in the login directory, so the
//! session keeps the canonical directory here and prefixes commands with
//! a `cd` to it.

const QUOTES: &[char] = &['\'', '"'];

/// The remote current directory as last reported by the shell.
///
/// Stored unquoted; [`WorkingDirectory::quoted`] renders the form the
/// shell echoes back, double-quoted when the path contains a space.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkingDirectory {
    path: String,
}

impl WorkingDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// True until the first directory has been applied.
    pub fn is_unset(&self) -> bool {
        self.path.is_empty()
    }

    /// The unquoted absolute path.
    pub fn as_str(&self) -> &str {
        &self.path
    }

    /// The tracked form: double quotes when the path contains a space.
    pub fn quoted(&self) -> String {
        if self.path.contains(' ') {
            format!("\"{}\"", self.path)
        } else {
            self.path.clone()
        }
    }

    /// Resolve `input` against the current directory.
    ///
    /// Absolute input is returned as-is, empty input resolves to the current
    /// directory, anything else is appended after a `/`.
    pub fn resolve(&self, input: &str) -> String {
        let input = unquote(input);
        if input.is_empty() {
            self.path.clone()
        } else if input.starts_with('/') {
            input.to_string()
        } else {
            join(&self.path, input)
        }
    }

    /// Replace the tracked directory with what the shell reported.
    pub fn apply(&mut self, reported: &str) {
        let reported = unquote(reported.trim());
        if reported.is_empty() {
            return;
        }
        if reported != self.path {
            log::debug!("Remote working directory is now {}", reported);
        }
        self.path = reported.to_string();
    }

    /// Prepare `command` for a fresh exec channel.
    ///
    /// Commands starting with the `cd` token change directory themselves and
    /// are submitted unchanged.
    pub fn prefix(&self, command: &str) -> String {
        if self.path.is_empty() || is_cd(command) {
            command.to_string()
        } else {
            format!("cd {}; {}", self.quoted(), command)
        }
    }
}

/// Whether the first shell token of `command` is `cd`.
pub fn is_cd(command: &str) -> bool {
    let command = command.trim_start();
    match command.strip_prefix("cd") {
        Some(rest) => rest.is_empty() || rest.starts_with(|c: char| c.is_whitespace() || c == ';'),
        None => false,
    }
}

/// Single-quote a path for submission in a `cd` command when it contains a space.
pub fn quote_for_command(path: &str) -> String {
    if path.contains(' ') {
        format!("'{}'", path)
    } else {
        path.to_string()
    }
}

/// Strip one matching pair of surrounding single or double quotes.
pub fn unquote(path: &str) -> &str {
    for quote in QUOTES {
        if path.len() >= 2 && path.starts_with(*quote) && path.ends_with(*quote) {
            return &path[1..path.len() - 1];
        }
    }
    path
}

/// Join a remote base directory and a relative path with `/`.
pub fn join(base: &str, relative: &str) -> String {
    if base.ends_with('/') {
        format!("{}{}", base, relative)
    } else {
        format!("{}/{}", base, relative)
    }
}

/// Strip trailing slashes, keeping a lone `/` intact.
pub fn trim_trailing_slashes(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() && path.starts_with('/') {
        "/"
    } else {
        trimmed
    }
}

/// Final `/`-separated segment of a path.
pub fn basename(path: &str) -> &str {
    let path = trim_trailing_slashes(path);
    path.rsplit('/').next().unwrap_or(path)
}
