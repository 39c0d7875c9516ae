//! Engine invocation building.

use std::path::PathBuf;

use thiserror::Error;

use crate::resolve_executable_path;

/// Command build error.
#[derive(Debug, Error)]
pub enum CommandBuildError {
    #[error("Flags cannot be parsed: {0}")]
    InvalidFlags(String),
    #[error("Engine program is empty")]
    EmptyCommand,
    #[error("Failed to quote command: {0}")]
    QuoteError(#[from] shlex::QuoteError),
    #[error("Executable not found: {0}")]
    NotFound(String),
}

/// Parsed command parts (program + args).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandParts {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl CommandParts {
    #[must_use]
    pub const fn new(program: PathBuf, args: Vec<String>) -> Self {
        Self { program, args }
    }

    /// Resolve the program to a full path.
    ///
    /// # Errors
    /// Returns error if the executable cannot be found.
    pub async fn into_resolved(self) -> Result<Self, CommandBuildError> {
        let Self { program, args } = self;
        let display = program.to_string_lossy().into_owned();
        let program = resolve_executable_path(&display)
            .await
            .ok_or(CommandBuildError::NotFound(display))?;
        Ok(Self { program, args })
    }
}

/// Builder for the engine command line.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    /// Engine executable.
    pub program: PathBuf,
    /// Startup flags.
    pub params: Vec<String>,
}

impl CommandBuilder {
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            params: Vec::new(),
        }
    }

    /// Replace the flags.
    #[must_use]
    pub fn params<I>(mut self, params: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.params = params.into_iter().map(Into::into).collect();
        self
    }

    /// Append flags.
    #[must_use]
    pub fn extend_params<I>(mut self, more: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.params.extend(more.into_iter().map(Into::into));
        self
    }

    /// Append flags given as one shell-quoted string.
    ///
    /// # Errors
    /// Returns error if the string cannot be split.
    pub fn extend_params_str(self, flags: &str) -> Result<Self, CommandBuildError> {
        let parts = split_command_line(flags)?;
        Ok(self.extend_params(parts))
    }

    /// Build the command parts.
    ///
    /// # Errors
    /// Returns error if the program is empty.
    pub fn build(&self) -> Result<CommandParts, CommandBuildError> {
        if self.program.as_os_str().is_empty() {
            return Err(CommandBuildError::EmptyCommand);
        }
        Ok(CommandParts::new(self.program.clone(), self.params.clone()))
    }
}

/// Everything needed to spawn one engine process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl LaunchSpec {
    #[must_use]
    pub fn new(parts: CommandParts) -> Self {
        Self {
            program: parts.program,
            args: parts.args,
            working_dir: None,
            env: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_working_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.working_dir = dir;
        self
    }

    #[must_use]
    pub fn with_env<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Shell-quoted command line, for logs.
    ///
    /// # Errors
    /// Returns error if an argument cannot be quoted.
    pub fn command_line(&self) -> Result<String, CommandBuildError> {
        let program = self.program.to_string_lossy();
        let words = std::iter::once(program.as_ref()).chain(self.args.iter().map(String::as_str));
        Ok(shlex::try_join(words)?)
    }
}

/// Split a flag string the way the platform shell would.
///
/// # Errors
/// Returns error on unbalanced quoting.
pub fn split_command_line(input: &str) -> Result<Vec<String>, CommandBuildError> {
    #[cfg(windows)]
    {
        Ok(winsplit::split(input))
    }

    #[cfg(not(windows))]
    {
        shlex::split(input).ok_or_else(|| CommandBuildError::InvalidFlags(input.to_string()))
    }
}
