//! Broadcast + history store for engine output lines.

use std::{
    collections::VecDeque,
    sync::RwLock,
};

use futures::{StreamExt, future};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::LogSink;

/// Default history size limit (4 MB).
const HISTORY_BYTES: usize = 4 * 1024 * 1024;

/// Which engine stream a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stream {
    Stdout,
    Stderr,
}

/// One entry in the engine log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "snake_case")]
pub enum LogLine {
    Stdout(String),
    Stderr(String),
    /// Engine source text sent on behalf of the caller.
    Command(String),
    /// The session closed; no further lines follow.
    Finished,
}

impl LogLine {
    /// Build an output line for the given stream.
    #[must_use]
    pub fn output(stream: Stream, text: impl Into<String>) -> Self {
        match stream {
            Stream::Stdout => Self::Stdout(text.into()),
            Stream::Stderr => Self::Stderr(text.into()),
        }
    }

    /// Approximate heap size, used for history accounting.
    #[must_use]
    pub fn approx_bytes(&self) -> usize {
        const OVERHEAD: usize = 8;
        match self {
            Self::Stdout(s) | Self::Stderr(s) | Self::Command(s) => OVERHEAD + s.len(),
            Self::Finished => OVERHEAD,
        }
    }
}

#[derive(Clone)]
struct StoredLine {
    line: LogLine,
    bytes: usize,
}

struct Inner {
    history: VecDeque<StoredLine>,
    total_bytes: usize,
}

/// Log store with broadcast and bounded history.
///
/// Late subscribers receive the history first, then live lines.
pub struct LogStore {
    inner: RwLock<Inner>,
    sender: broadcast::Sender<LogLine>,
    limit: usize,
}

impl Default for LogStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LogStore {
    /// Create a store with the default history limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_limit(HISTORY_BYTES)
    }

    /// Create a store keeping at most `limit` bytes of history.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self {
            inner: RwLock::new(Inner {
                history: VecDeque::with_capacity(32),
                total_bytes: 0,
            }),
            sender,
            limit,
        }
    }

    /// Push a line to both live listeners and history.
    pub fn push(&self, line: LogLine) {
        let _ = self.sender.send(line.clone());
        let bytes = line.approx_bytes();

        let mut inner = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        while inner.total_bytes.saturating_add(bytes) > self.limit {
            if let Some(front) = inner.history.pop_front() {
                inner.total_bytes = inner.total_bytes.saturating_sub(front.bytes);
            } else {
                break;
            }
        }
        inner.history.push_back(StoredLine { line, bytes });
        inner.total_bytes = inner.total_bytes.saturating_add(bytes);
    }

    /// Push the end-of-session marker.
    pub fn push_finished(&self) {
        self.push(LogLine::Finished);
    }

    /// Get a receiver for live lines.
    #[must_use]
    pub fn get_receiver(&self) -> broadcast::Receiver<LogLine> {
        self.sender.subscribe()
    }

    /// Get a snapshot of the history.
    #[must_use]
    pub fn get_history(&self) -> Vec<LogLine> {
        let inner = match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.history.iter().map(|s| s.line.clone()).collect()
    }

    /// Stream that yields history first, then live lines.
    #[must_use]
    pub fn history_plus_stream(&self) -> futures::stream::BoxStream<'static, LogLine> {
        let (history, rx) = (self.get_history(), self.get_receiver());

        let hist = futures::stream::iter(history);
        let live = BroadcastStream::new(rx).filter_map(|res| async move { res.ok() });

        Box::pin(hist.chain(live))
    }

    /// Stream of stdout lines until the session finishes.
    #[must_use]
    pub fn stdout_stream(&self) -> futures::stream::BoxStream<'static, String> {
        self.stream_of(Stream::Stdout)
    }

    /// Stream of stderr lines until the session finishes.
    #[must_use]
    pub fn stderr_stream(&self) -> futures::stream::BoxStream<'static, String> {
        self.stream_of(Stream::Stderr)
    }

    fn stream_of(&self, wanted: Stream) -> futures::stream::BoxStream<'static, String> {
        self.history_plus_stream()
            .take_while(|line| future::ready(!matches!(line, LogLine::Finished)))
            .filter_map(move |line| async move {
                match (wanted, line) {
                    (Stream::Stdout, LogLine::Stdout(s)) | (Stream::Stderr, LogLine::Stderr(s)) => {
                        Some(s)
                    }
                    _ => None,
                }
            })
            .boxed()
    }
}

impl LogSink for LogStore {
    fn record(&self, line: &LogLine) {
        self.push(line.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_is_bounded() {
        let store = LogStore::with_limit(40);
        for i in 0..10 {
            store.push(LogLine::Stdout(format!("line {i}")));
        }
        let history = store.get_history();
        assert!(history.len() < 10);
        assert_eq!(history.last(), Some(&LogLine::Stdout("line 9".into())));
    }

    #[tokio::test]
    async fn test_stdout_stream_stops_at_finished() {
        let store = LogStore::new();
        store.push(LogLine::Stdout("ans = 3".into()));
        store.push(LogLine::Stderr("warning: implicit conversion".into()));
        store.push(LogLine::Command("x = 3".into()));
        store.push_finished();

        let lines: Vec<String> = store.stdout_stream().collect().await;
        assert_eq!(lines, vec!["ans = 3".to_string()]);
        let errors: Vec<String> = store.stderr_stream().collect().await;
        assert_eq!(errors, vec!["warning: implicit conversion".to_string()]);
    }

    #[tokio::test]
    async fn test_live_lines_follow_history() {
        let store = std::sync::Arc::new(LogStore::new());
        store.push(LogLine::Stdout("first".into()));
        let stream = store.stdout_stream();
        store.record(&LogLine::output(Stream::Stdout, "second"));
        store.push_finished();
        let lines: Vec<String> = stream.collect().await;
        assert_eq!(lines, vec!["first".to_string(), "second".to_string()]);
    }
}
