//! Process errors.

use thiserror::Error;

use crate::CommandBuildError;

/// Engine process error.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Engine executable not found: {0}")]
    NotFound(String),
    #[error("Engine failed to start: {0}")]
    Startup(String),
    #[error("Command build error: {0}")]
    CommandBuild(#[from] CommandBuildError),
    #[error("Engine process has exited")]
    Exited,
    #[error("Interrupting the engine is not supported on this platform")]
    InterruptUnsupported,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProcessError {
    /// Whether the engine never came up.
    #[must_use]
    pub const fn is_startup(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::Startup(_) | Self::CommandBuild(_))
    }
}
