//! Container codec for values crossing the engine boundary.
//!
//! Provides:
//! - `Envelope` - A set of named values stored as one MAT-file (level 5)
//! - `encode_value` / `decode_value` - Single-element encoding
//! - `write_request` / `read_response` - File-level helpers used per command

pub mod envelope;
pub mod error;
pub mod mat5;
mod reader;
mod writer;

pub use envelope::{Envelope, read_response, write_request};
pub use error::CodecError;
pub use reader::decode_value;
pub use writer::{EncodeOptions, encode_value};
