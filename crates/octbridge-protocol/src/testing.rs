//! A `/bin/sh` stand-in for the engine.
//!
//! Calls are answered from prepared response envelopes: calling `name`
//! copies `<fixtures>/<name>.mat` (or `<name>.err.mat`, answered with the
//! error marker) to the response path. Two names are special: `sleep`
//! runs for a long time but can be interrupted, `hang` also ignores
//! interrupts.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use octbridge_codec::{CodecError, EncodeOptions, Envelope};
use octbridge_core::Value;
use octbridge_process::EngineDefaults;

use crate::{CallSpec, CallTarget, Dialect, ERR_VAR, OUT_VAR};

const SH_DEFAULTS: EngineDefaults = EngineDefaults {
    executable_vars: &[],
    flags_var: None,
    candidates: &["sh"],
    flags: &["-s"],
};

/// Shell-backed dialect answering from fixture files.
#[derive(Debug, Clone)]
pub struct ShDialect {
    fixtures: PathBuf,
}

fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

impl ShDialect {
    /// Use `fixtures` for response envelopes. The directory must exist.
    #[must_use]
    pub fn new(fixtures: impl Into<PathBuf>) -> Self {
        Self {
            fixtures: fixtures.into(),
        }
    }

    #[must_use]
    pub fn fixtures(&self) -> &Path {
        &self.fixtures
    }

    /// Answer calls to `name` with `values`.
    ///
    /// # Errors
    /// Returns error if the fixture cannot be written.
    pub fn respond(&self, name: &str, values: Vec<Value>) -> Result<(), CodecError> {
        let mut envelope = Envelope::new();
        envelope.insert(OUT_VAR, Value::from(values))?;
        envelope.write_to(&self.fixtures.join(format!("{name}.mat")), EncodeOptions::default())
    }

    /// Answer calls to `name` with an engine error.
    ///
    /// # Errors
    /// Returns error if the fixture cannot be written.
    pub fn fail(&self, name: &str, message: &str, identifier: &str) -> Result<(), CodecError> {
        let mut details = BTreeMap::new();
        details.insert("message".to_string(), Value::from(message));
        details.insert("identifier".to_string(), Value::from(identifier));
        details.insert("stack".to_string(), Value::Empty);
        let mut envelope = Envelope::new();
        envelope.insert(ERR_VAR, Value::Struct(details))?;
        envelope.write_to(&self.fixtures.join(format!("{name}.err.mat")), EncodeOptions::default())
    }
}

impl Dialect for ShDialect {
    fn defaults(&self) -> EngineDefaults {
        SH_DEFAULTS
    }

    fn setup_script(&self) -> String {
        // Survive SIGINT so an interrupted command leaves the shell running.
        "trap 'true' INT; echo sh engine up".to_string()
    }

    fn sync_script(&self, sentinel_line: &str) -> String {
        format!("printf '%s\\n' {}", quote(sentinel_line))
    }

    fn call_script(&self, call: &CallSpec<'_>) -> String {
        let ok = format!("printf '%s\\n' {}", quote(call.ok_line));
        let err = format!("printf '%s\\n' {}", quote(call.err_line));
        let name = match call.target {
            CallTarget::Function { name, .. } => name,
            CallTarget::Eval => "eval",
        };
        let resp = quote(&call.response.to_string_lossy());
        let work = match name {
            "sleep" => "echo sleeping; sleep 30".to_string(),
            "hang" => "echo hanging; ( trap '' INT; sleep 30 )".to_string(),
            _ => String::from("true"),
        };
        let fixture = |suffix: &str| {
            quote(&self.fixtures.join(format!("{name}{suffix}")).to_string_lossy())
        };
        format!(
            "{work}; if [ -f {ok_file} ]; then cp {ok_file} {resp} && {ok}; \
             elif [ -f {err_file} ]; then cp {err_file} {resp} && {err}; \
             else echo \"'{name}' undefined\"; {err}; fi",
            ok_file = fixture(".mat"),
            err_file = fixture(".err.mat"),
        )
    }

    fn exit_command(&self) -> &str {
        "exit"
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::{sync::Arc, time::Duration};

    use octbridge_core::{CommandRequest, LogLine, LogStore, Nout, SessionConfig};

    use super::*;
    use crate::{ProtocolDriver, ProtocolError};

    async fn driver(dialect: &ShDialect, sink: Option<&LogStore>) -> ProtocolDriver {
        let config = SessionConfig::new()
            .with_startup_timeout(Duration::from_secs(10))
            .with_resync_timeout(Duration::from_millis(500))
            .with_shutdown_grace(Duration::from_secs(2));
        let sink = sink.map(|s| s as &dyn octbridge_core::LogSink);
        ProtocolDriver::start(&config, Arc::new(dialect.clone()), sink)
            .await
            .unwrap()
    }

    fn fixtures() -> (tempfile::TempDir, ShDialect) {
        let dir = tempfile::tempdir().unwrap();
        let dialect = ShDialect::new(dir.path());
        (dir, dialect)
    }

    #[tokio::test]
    async fn test_outputs_trimmed_to_request() {
        let (_dir, dialect) = fixtures();
        dialect
            .respond("three", vec![Value::from(1.0), Value::from("two"), Value::from(3.0)])
            .unwrap();
        let mut driver = driver(&dialect, None).await;

        let outcome = driver
            .execute(&CommandRequest::call("three").nout(2), None, None)
            .await
            .unwrap();
        assert_eq!(outcome.values, vec![Value::from(1.0), Value::from("two")]);

        let outcome = driver
            .execute(&CommandRequest::call("three").nout(Nout::Max), None, None)
            .await
            .unwrap();
        assert_eq!(outcome.values.len(), 3);

        let outcome = driver
            .execute(&CommandRequest::call("three").nout(0), None, None)
            .await
            .unwrap();
        assert!(outcome.values.is_empty());

        tokio_test::assert_ok!(driver.shutdown().await);
        assert!(!driver.is_usable());
    }

    #[tokio::test]
    async fn test_engine_errors_keep_driver_usable() {
        let (_dir, dialect) = fixtures();
        dialect.fail("broken", "division by zero", "my:err").unwrap();
        dialect.respond("ok", vec![Value::from(true)]).unwrap();
        let mut driver = driver(&dialect, None).await;

        let err = driver
            .execute(&CommandRequest::call("broken"), None, None)
            .await
            .unwrap_err();
        match err {
            ProtocolError::EngineRuntime {
                message,
                identifier,
                ..
            } => {
                assert_eq!(message, "division by zero");
                assert_eq!(identifier.as_deref(), Some("my:err"));
            }
            other => panic!("unexpected {other:?}"),
        }

        let err = driver
            .execute(&CommandRequest::call("nosuchfn"), None, None)
            .await
            .unwrap_err();
        assert!(
            matches!(
                err,
                ProtocolError::EngineRuntime { ref message, .. }
                    if message.contains("'nosuchfn' undefined")
            ),
            "{err:?}"
        );

        assert!(driver.is_usable());
        let outcome = driver
            .execute(&CommandRequest::call("ok"), None, None)
            .await
            .unwrap();
        assert_eq!(outcome.first(), Value::from(true));
    }

    #[tokio::test]
    async fn test_timeout_interrupts_and_recovers() {
        let (_dir, dialect) = fixtures();
        dialect.respond("ok", vec![Value::from(7.0)]).unwrap();
        let mut driver = driver(&dialect, None).await;

        let err = driver
            .execute(&CommandRequest::call("sleep"), Some(Duration::from_millis(300)), None)
            .await
            .unwrap_err();
        match err {
            ProtocolError::Timeout {
                partial_output,
                session_reset,
                ..
            } => {
                assert!(!session_reset);
                assert!(partial_output.iter().any(|l| l == "sleeping"));
            }
            other => panic!("unexpected {other:?}"),
        }

        assert!(driver.is_usable());
        let outcome = driver
            .execute(&CommandRequest::call("ok"), None, None)
            .await
            .unwrap();
        assert_eq!(outcome.first(), Value::from(7.0));
    }

    #[tokio::test]
    async fn test_wedged_engine_is_killed() {
        let (_dir, dialect) = fixtures();
        let mut driver = driver(&dialect, None).await;

        let err = driver
            .execute(&CommandRequest::call("hang"), Some(Duration::from_millis(200)), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Timeout { session_reset: true, .. }));
        assert!(err.is_fatal());
        assert!(!driver.is_usable());

        let err = driver
            .execute(&CommandRequest::call("ok"), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Process(_)));
    }

    #[tokio::test]
    async fn test_envelopes_removed_after_each_call() {
        let (_dir, dialect) = fixtures();
        dialect.respond("ok", Vec::new()).unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let config = SessionConfig::new().with_temp_dir(scratch.path());
        let mut driver = ProtocolDriver::start(&config, Arc::new(dialect.clone()), None)
            .await
            .unwrap();

        driver
            .execute(&CommandRequest::call("ok").arg(1.0), None, None)
            .await
            .unwrap();
        driver
            .execute(&CommandRequest::call("missing"), None, None)
            .await
            .unwrap_err();

        let mut entries = std::fs::read_dir(scratch.path()).unwrap();
        let session_dir = entries.next().unwrap().unwrap().path();
        assert_eq!(std::fs::read_dir(&session_dir).unwrap().count(), 0);
        tokio_test::assert_ok!(driver.shutdown().await);
        drop(driver);
        assert!(!session_dir.exists());
    }

    #[tokio::test]
    async fn test_invalid_requests_fail_before_sending() {
        let (_dir, dialect) = fixtures();
        let store = LogStore::new();
        let mut driver = driver(&dialect, Some(&store)).await;
        let before = store.get_history().len();

        let err = driver
            .execute(&CommandRequest::call("models/model.txt"), None, Some(&store))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidRequest(_)));

        let err = driver
            .execute(&CommandRequest::call("f\ng"), None, Some(&store))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidRequest(_)));

        let err = driver
            .execute(&CommandRequest::call("f").store_as("not valid"), None, Some(&store))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidRequest(_)));

        assert_eq!(store.get_history().len(), before);
        assert!(!store.get_history().iter().any(|l| matches!(l, LogLine::Command(_))));
    }

    #[tokio::test]
    async fn test_output_reaches_sink() {
        let (_dir, dialect) = fixtures();
        let store = LogStore::new();
        let mut driver = driver(&dialect, Some(&store)).await;
        assert!(store.get_history().contains(&LogLine::Stdout("sh engine up".into())));

        let err = driver
            .execute(&CommandRequest::call("absent"), None, Some(&store))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::EngineRuntime { .. }));
        let history = store.get_history();
        assert!(
            history
                .iter()
                .any(|l| matches!(l, LogLine::Command(c) if c.starts_with("absent(")))
        );
        assert!(history.contains(&LogLine::Stdout("'absent' undefined".into())));
    }

    #[tokio::test]
    async fn test_missing_engine_is_startup_error() {
        let config = SessionConfig::new().with_executable("/nonexistent/engine");
        let err = ProtocolDriver::start(&config, Arc::new(ShDialect::new("/tmp")), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Startup(_)));
    }
}
