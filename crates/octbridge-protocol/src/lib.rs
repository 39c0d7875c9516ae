//! Session protocol driver.
//!
//! Commands are sent to the engine's interactive prompt as single lines of
//! engine source. Values travel through envelope files; completion is
//! signalled by a sentinel line printed by the engine.
//!
//! Provides:
//! - `Sentinel` / `SentinelScanner` - Completion markers and the output scanner
//! - `Dialect` / `OctaveDialect` - Engine-specific script generation
//! - `ScratchDir` / `EnvelopePair` - Per-call envelope files, removed on drop
//! - `PreparedRequest` - A validated, encoded request; fails before any engine I/O
//! - `ProtocolDriver` - Runs one command at a time with timeouts and recovery

pub mod dialect;
pub mod driver;
pub mod error;
pub mod scratch;
pub mod sentinel;
#[cfg(any(test, feature = "sh-dialect"))]
pub mod testing;

pub use dialect::{ARGS_VAR, CallSpec, CallTarget, Dialect, ERR_VAR, OUT_VAR, OctaveDialect};
pub use driver::{DriverOptions, PreparedRequest, ProtocolDriver};
pub use error::ProtocolError;
pub use scratch::{EnvelopePair, ScratchDir};
pub use sentinel::{Marker, ParsedSentinel, ScanEvent, Sentinel, SentinelScanner, parse_sentinel};
