//! Protocol errors.

use std::time::Duration;

use octbridge_codec::CodecError;
use octbridge_process::ProcessError;
use thiserror::Error;

/// Protocol error.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The engine could not be launched or never answered its first sync.
    #[error("Engine failed to start: {0}")]
    Startup(String),

    /// The engine reported an error while running the command.
    #[error("Engine error: {message}")]
    EngineRuntime {
        /// Engine error text, verbatim.
        message: String,
        identifier: Option<String>,
        backtrace: Option<String>,
    },

    /// The command exceeded its deadline and was interrupted.
    #[error("Command timed out after {timeout:?}")]
    Timeout {
        timeout: Duration,
        /// Output lines seen before the deadline.
        partial_output: Vec<String>,
        /// The engine could not be resynchronised and was killed.
        session_reset: bool,
    },

    /// The request cannot be expressed as an engine command.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The engine answered with something other than the expected marker.
    #[error("Protocol violation: {0}")]
    Violation(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Whether the engine is gone after this error.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Startup(_)
                | Self::Process(_)
                | Self::Timeout {
                    session_reset: true,
                    ..
                }
        )
    }
}
