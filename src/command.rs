//! Command lines built from a program name and arguments.

use std::fmt;

/// A remote command: program name followed by space-joined arguments.
///
/// Arguments are passed through verbatim; use [`RemoteCommand::quoted_arg`]
/// for values that may contain shell metacharacters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteCommand {
    name: String,
    args: Vec<String>,
}

impl RemoteCommand {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl ToString) -> Self {
        self.args.push(arg.to_string());
        self
    }

    pub fn args<I>(mut self, args: I) -> Self
    where
        I: IntoIterator,
        I::Item: ToString,
    {
        self.args.extend(args.into_iter().map(|a| a.to_string()));
        self
    }

    /// Append `arg` wrapped in single quotes.
    pub fn quoted_arg(mut self, arg: impl AsRef<str>) -> Self {
        self.args
            .push(format!("'{}'", arg.as_ref().replace('\'', "'\\''")));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for RemoteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}
