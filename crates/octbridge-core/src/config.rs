//! Per-session configuration.

use std::{collections::HashMap, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

/// Default time allowed for the engine to come up and answer its first sync.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(60);

/// Default grace period between the exit command and a forced kill.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Default time allowed for the engine to answer after an interrupt.
pub const DEFAULT_RESYNC_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for one engine session.
///
/// Everything here is resolved once when the session starts and held by that
/// session only; nothing is cached process-wide.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Engine executable. Falls back to the environment, then to a PATH search.
    #[serde(default)]
    pub executable: Option<PathBuf>,

    /// Startup flags. Falls back to the environment, then to engine defaults.
    #[serde(default)]
    pub flags: Option<Vec<String>>,

    /// Working directory for the engine process.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Default per-call timeout. `None` waits indefinitely.
    #[serde(default)]
    pub timeout: Option<Duration>,

    /// Directory for envelope files. A private temp directory when unset.
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,

    /// Forward engine output to the log sink.
    #[serde(default)]
    pub logging: bool,

    /// Send integer arrays as doubles.
    #[serde(default)]
    pub convert_to_float: bool,

    #[serde(default = "default_startup_timeout")]
    pub startup_timeout: Duration,

    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace: Duration,

    #[serde(default = "default_resync_timeout")]
    pub resync_timeout: Duration,

    /// Extra environment variables for the engine process.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

const fn default_startup_timeout() -> Duration {
    DEFAULT_STARTUP_TIMEOUT
}

const fn default_shutdown_grace() -> Duration {
    DEFAULT_SHUTDOWN_GRACE
}

const fn default_resync_timeout() -> Duration {
    DEFAULT_RESYNC_TIMEOUT
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            executable: None,
            flags: None,
            working_dir: None,
            timeout: None,
            temp_dir: None,
            logging: false,
            convert_to_float: false,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            resync_timeout: DEFAULT_RESYNC_TIMEOUT,
            env: HashMap::new(),
        }
    }
}

impl SessionConfig {
    /// Create a configuration with all defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_executable(mut self, executable: impl Into<PathBuf>) -> Self {
        self.executable = Some(executable.into());
        self
    }

    #[must_use]
    pub fn with_flags<I>(mut self, flags: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.flags = Some(flags.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub const fn with_logging(mut self, enabled: bool) -> Self {
        self.logging = enabled;
        self
    }

    #[must_use]
    pub const fn with_convert_to_float(mut self, enabled: bool) -> Self {
        self.convert_to_float = enabled;
        self
    }

    #[must_use]
    pub const fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    #[must_use]
    pub const fn with_resync_timeout(mut self, timeout: Duration) -> Self {
        self.resync_timeout = timeout;
        self
    }

    /// Set an environment variable for the engine process.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_deserializes_with_defaults() {
        let cfg: SessionConfig =
            serde_json::from_str(r#"{"executable": "/opt/octave/bin/octave-cli", "logging": true}"#)
                .unwrap();
        assert_eq!(cfg.executable, Some(PathBuf::from("/opt/octave/bin/octave-cli")));
        assert!(cfg.logging);
        assert_eq!(cfg.startup_timeout, DEFAULT_STARTUP_TIMEOUT);
        assert!(cfg.timeout.is_none());
    }

    #[test]
    fn test_builder() {
        let cfg = SessionConfig::new()
            .with_flags(["--quiet"])
            .with_timeout(Duration::from_secs(3))
            .with_env("LANG", "C.UTF-8");
        assert_eq!(cfg.flags.as_deref(), Some(&["--quiet".to_string()][..]));
        assert_eq!(cfg.timeout, Some(Duration::from_secs(3)));
        assert_eq!(cfg.env.get("LANG").map(String::as_str), Some("C.UTF-8"));
    }
}
