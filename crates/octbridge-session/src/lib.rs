//! Octave sessions for host programs.
//!
//! Provides:
//! - `Session` - One engine process with lifecycle and convenience methods
//! - `Callable` / `ProxyFunction` - Engine functions resolved by name
//! - `SessionError` - Everything a session call can fail with

pub mod error;
pub mod proxy;
pub mod session;

pub use error::SessionError;
pub use octbridge_core::{CommandOutcome, CommandRequest, EngineRef, Nout, SessionConfig, Value};
pub use proxy::{BuiltinMethod, Callable, ProxyFunction};
pub use session::{Session, SessionState};
