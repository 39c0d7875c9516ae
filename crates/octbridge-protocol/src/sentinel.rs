//! Completion sentinels.
//!
//! A sentinel line looks like `<<OCTBRIDGE:1:<token>:OK>>`. The version field
//! lets the format change without confusing an older scanner, and the random
//! per-command token keeps program output (or a late marker from an
//! interrupted command) from being taken as completion.

use std::fmt;

use uuid::Uuid;

/// Current sentinel format version.
pub const SENTINEL_VERSION: u32 = 1;

const OPEN: &str = "<<OCTBRIDGE:";
const CLOSE: &str = ">>";

/// What a sentinel reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    /// The command finished and its outputs were saved.
    Ok,
    /// The command raised an engine error; details were saved.
    Err,
    /// Answer to a synchronisation request.
    Sync,
}

impl Marker {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Err => "ERR",
            Self::Sync => "SYNC",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "OK" => Some(Self::Ok),
            "ERR" => Some(Self::Err),
            "SYNC" => Some(Self::Sync),
            _ => None,
        }
    }
}

impl fmt::Display for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A sentinel bound to one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sentinel {
    token: String,
}

impl Default for Sentinel {
    fn default() -> Self {
        Self::new()
    }
}

impl Sentinel {
    /// A sentinel with a fresh random token.
    #[must_use]
    pub fn new() -> Self {
        Self {
            token: Uuid::new_v4().simple().to_string(),
        }
    }

    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// The full line the engine prints for `marker`.
    #[must_use]
    pub fn line(&self, marker: Marker) -> String {
        format!("{OPEN}{SENTINEL_VERSION}:{}:{marker}{CLOSE}", self.token)
    }
}

/// A sentinel found in an output line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSentinel<'a> {
    pub version: u32,
    pub token: &'a str,
    pub marker: Marker,
    /// Byte offset of the sentinel within the line.
    pub start: usize,
}

/// Find a well-formed sentinel anywhere in `line`.
///
/// Text may precede the sentinel (an engine prompt, or output printed without
/// a trailing newline).
#[must_use]
pub fn parse_sentinel(line: &str) -> Option<ParsedSentinel<'_>> {
    let start = line.rfind(OPEN)?;
    let rest = &line[start + OPEN.len()..];
    let body = &rest[..rest.find(CLOSE)?];

    let mut parts = body.splitn(3, ':');
    let version = parts.next()?.parse().ok()?;
    let token = parts.next()?;
    let marker = Marker::parse(parts.next()?)?;
    if token.is_empty() || !token.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ParsedSentinel {
        version,
        token,
        marker,
        start,
    })
}

/// Result of feeding one line to the scanner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    /// Ordinary output.
    Output,
    /// The awaited sentinel. `leading` holds any text before it on the line.
    Complete {
        marker: Marker,
        leading: Option<String>,
    },
    /// A sentinel for some other (earlier) command.
    Stale,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ScanState {
    Idle,
    AwaitingSentinel { token: String },
}

/// Line scanner with two states: idle, or awaiting one sentinel token.
#[derive(Debug, Clone)]
pub struct SentinelScanner {
    state: ScanState,
}

impl Default for SentinelScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl SentinelScanner {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: ScanState::Idle,
        }
    }

    /// Start waiting for `sentinel`.
    pub fn arm(&mut self, sentinel: &Sentinel) {
        self.state = ScanState::AwaitingSentinel {
            token: sentinel.token().to_string(),
        };
    }

    /// Stop waiting; later lines are plain output.
    pub fn disarm(&mut self) {
        self.state = ScanState::Idle;
    }

    #[must_use]
    pub const fn is_idle(&self) -> bool {
        matches!(self.state, ScanState::Idle)
    }

    /// Classify one line. Completing returns the scanner to idle.
    pub fn feed(&mut self, line: &str) -> ScanEvent {
        let Some(found) = parse_sentinel(line) else {
            return ScanEvent::Output;
        };
        let matches = match &self.state {
            ScanState::AwaitingSentinel { token } => {
                found.version == SENTINEL_VERSION && found.token == token
            }
            ScanState::Idle => false,
        };
        if !matches {
            return ScanEvent::Stale;
        }
        self.state = ScanState::Idle;
        let leading = line[..found.start].trim_end();
        ScanEvent::Complete {
            marker: found.marker,
            leading: (!leading.is_empty()).then(|| leading.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_parses_back() {
        let sentinel = Sentinel::new();
        let line = sentinel.line(Marker::Err);
        let parsed = parse_sentinel(&line).unwrap();
        assert_eq!(parsed.version, SENTINEL_VERSION);
        assert_eq!(parsed.token, sentinel.token());
        assert_eq!(parsed.marker, Marker::Err);
        assert_eq!(parsed.start, 0);
    }

    #[test]
    fn test_lookalikes_are_output() {
        assert!(parse_sentinel("<<OCTBRIDGE:1:abc:MAYBE>>").is_none());
        assert!(parse_sentinel("<<OCTBRIDGE:x:abc:OK>>").is_none());
        assert!(parse_sentinel("<<OCTBRIDGE:1:abc:OK").is_none());
        assert!(parse_sentinel("<<OCTBRIDGE:1:a b:OK>>").is_none());
        assert!(parse_sentinel("plain output").is_none());
    }

    #[test]
    fn test_scanner_completes_once() {
        let sentinel = Sentinel::new();
        let mut scanner = SentinelScanner::new();
        assert!(scanner.is_idle());
        scanner.arm(&sentinel);
        assert!(!scanner.is_idle());

        assert_eq!(scanner.feed("ans = 3"), ScanEvent::Output);
        assert_eq!(
            scanner.feed(&format!(">> {}", sentinel.line(Marker::Ok))),
            ScanEvent::Complete {
                marker: Marker::Ok,
                leading: Some(">>".into())
            }
        );
        assert!(scanner.is_idle());
        assert_eq!(scanner.feed(&sentinel.line(Marker::Ok)), ScanEvent::Stale);
    }

    #[test]
    fn test_stale_token_and_version_are_ignored() {
        let old = Sentinel::new();
        let current = Sentinel::new();
        let mut scanner = SentinelScanner::new();
        scanner.arm(&current);
        assert_eq!(scanner.feed(&old.line(Marker::Ok)), ScanEvent::Stale);

        let future = format!("<<OCTBRIDGE:2:{}:OK>>", current.token());
        assert_eq!(scanner.feed(&future), ScanEvent::Stale);
        assert!(!scanner.is_idle());

        scanner.disarm();
        assert!(scanner.is_idle());
    }
}
