//! Session errors.

use octbridge_codec::CodecError;
use octbridge_protocol::ProtocolError;
use thiserror::Error;

/// Session error.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The engine could not be found, launched or synchronised.
    #[error("Engine failed to start: {0}")]
    Startup(String),

    /// The session was closed.
    #[error("Session is closed")]
    Closed,

    /// The engine has no variable or function by this name.
    #[error("'{0}' is not defined in the engine")]
    Undefined(String),

    /// Not a valid engine variable name.
    #[error("Invalid variable name: {0:?}")]
    InvalidName(String),

    /// A built-in method was called with the wrong arguments.
    #[error("Invalid arguments for {method}: {reason}")]
    InvalidArguments { method: &'static str, reason: String },

    #[error(transparent)]
    Protocol(ProtocolError),
}

impl From<ProtocolError> for SessionError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Startup(reason) => Self::Startup(reason),
            other => Self::Protocol(other),
        }
    }
}

impl From<CodecError> for SessionError {
    fn from(err: CodecError) -> Self {
        Self::Protocol(ProtocolError::Codec(err))
    }
}

impl SessionError {
    /// Whether the command ran past its deadline.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Protocol(ProtocolError::Timeout { .. }))
    }

    /// Whether the engine itself reported the error.
    #[must_use]
    pub const fn is_engine_error(&self) -> bool {
        matches!(self, Self::Protocol(ProtocolError::EngineRuntime { .. }))
    }

    /// Whether a value could not be converted to or from the engine.
    #[must_use]
    pub const fn is_unsupported_type(&self) -> bool {
        matches!(
            self,
            Self::Protocol(ProtocolError::Codec(CodecError::UnsupportedType(_)))
        )
    }

    /// The engine's error text, verbatim.
    #[must_use]
    pub fn engine_message(&self) -> Option<&str> {
        match self {
            Self::Protocol(ProtocolError::EngineRuntime { message, .. }) => Some(message),
            _ => None,
        }
    }

    /// Output printed before a timeout.
    #[must_use]
    pub fn partial_output(&self) -> Option<&[String]> {
        match self {
            Self::Protocol(ProtocolError::Timeout { partial_output, .. }) => Some(partial_output),
            _ => None,
        }
    }
}
