//! Codec errors.

use octbridge_core::ValueError;
use thiserror::Error;

/// Codec error.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Unsupported type: {0}")]
    UnsupportedType(String),
    #[error("Malformed container data: {0}")]
    Malformed(String),
    #[error("Invalid variable or field name: {0:?}")]
    InvalidName(String),
    #[error("Value too large for the container format: {0}")]
    TooLarge(String),
    #[error("Invalid value: {0}")]
    Value(#[from] ValueError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub(crate) fn malformed(msg: impl Into<String>) -> CodecError {
    CodecError::Malformed(msg.into())
}
