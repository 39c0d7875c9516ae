//! Core traits for engine output handling.

use crate::LogLine;

/// Receiver of engine output lines.
///
/// A session only forwards engine output while logging is enabled; with
/// logging disabled that output is suppressed entirely. [`LogLine::Finished`]
/// is recorded once at close either way.
pub trait LogSink: Send + Sync {
    /// Record one line.
    fn record(&self, line: &LogLine);
}

/// Sink that emits each line as a `tracing` event on target `octbridge::engine`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn record(&self, line: &LogLine) {
        match line {
            LogLine::Stdout(text) => {
                tracing::info!(target: "octbridge::engine", stream = "stdout", "{text}");
            }
            LogLine::Stderr(text) => {
                tracing::warn!(target: "octbridge::engine", stream = "stderr", "{text}");
            }
            LogLine::Command(text) => tracing::debug!(target: "octbridge::engine", "> {text}"),
            LogLine::Finished => tracing::debug!(target: "octbridge::engine", "session finished"),
        }
    }
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl LogSink for NullSink {
    fn record(&self, _line: &LogLine) {}
}
