//! Core abstractions shared by every octbridge crate.
//!
//! This crate provides the fundamental building blocks:
//! - `Value` - Host-native values exchanged with the engine
//! - `EngineRef` - Engine-side values passed by name
//! - `CommandRequest` / `CommandOutcome` - One engine call and its result
//! - `SessionConfig` - Per-session configuration
//! - `LogSink` / `LogStore` - Where engine output lines go

pub mod config;
pub mod log_store;
pub mod request;
pub mod traits;
pub mod value;

pub use config::SessionConfig;
pub use log_store::{LogLine, LogStore, Stream};
pub use request::{CommandOutcome, CommandRequest, Nout, RequestKind};
pub use traits::{LogSink, NullSink, TracingSink};
pub use value::{
    CellArray, EngineRef, NumericArray, NumericData, NumericKind, RefKind, SparseMatrix,
    StructArray, Value, ValueError,
};
