//! Engine process management.
//!
//! Provides:
//! - `locate_engine` - Executable and flag resolution from config, environment and PATH
//! - `CommandBuilder` / `LaunchSpec` - The engine invocation
//! - `EngineProcess` - A running engine with line-oriented stdout/stderr capture

pub mod command;
pub mod error;
pub mod locate;
pub mod process;

pub use command::{CommandBuildError, CommandBuilder, CommandParts, LaunchSpec, split_command_line};
pub use error::ProcessError;
pub use locate::{EngineDefaults, locate_engine, locate_engine_with, resolve_executable_path};
pub use process::{EngineLine, EngineProcess};
