//! The session facade.
//!
//! A [`Session`] owns at most one engine process at a time. It starts on
//! first use, serialises commands through an async mutex, restarts the engine
//! transparently after a timeout had to kill it, and refuses everything once
//! closed.

use std::{
    panic::AssertUnwindSafe,
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use futures::{FutureExt, future::BoxFuture};
use octbridge_codec::mat5::is_valid_name;
use octbridge_core::{
    CommandOutcome, CommandRequest, EngineRef, LogLine, LogSink, Nout, SessionConfig, TracingSink,
    Value,
};
use octbridge_protocol::{Dialect, DriverOptions, OctaveDialect, PreparedRequest, ProtocolDriver};

use crate::SessionError;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No engine has been started yet.
    Unstarted,
    /// An engine is running (or will be restarted on the next call).
    Running,
    /// Closed for good.
    Closed,
}

struct Inner {
    state: SessionState,
    driver: Option<ProtocolDriver>,
}

#[derive(Debug, Clone, Copy)]
struct Settings {
    timeout: Option<Duration>,
    logging: bool,
}

/// One engine session.
pub struct Session {
    config: SessionConfig,
    dialect: Arc<dyn Dialect>,
    sink: Arc<dyn LogSink>,
    inner: tokio::sync::Mutex<Inner>,
    settings: Mutex<Settings>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .field("dialect", &self.dialect)
            .field("settings", &*self.settings())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create an unstarted Octave session. Nothing is launched until first use.
    #[must_use]
    pub fn new(config: SessionConfig) -> Self {
        let settings = Settings {
            timeout: config.timeout,
            logging: config.logging,
        };
        Self {
            config,
            dialect: Arc::new(OctaveDialect),
            sink: Arc::new(TracingSink),
            inner: tokio::sync::Mutex::new(Inner {
                state: SessionState::Unstarted,
                driver: None,
            }),
            settings: Mutex::new(settings),
        }
    }

    /// Drive a different engine dialect.
    #[must_use]
    pub fn with_dialect(mut self, dialect: Arc<dyn Dialect>) -> Self {
        self.dialect = dialect;
        self
    }

    /// Send engine output to `sink` while logging is enabled.
    ///
    /// The sink also sees [`LogLine::Finished`] when the session closes or
    /// is dropped.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = sink;
        self
    }

    #[must_use]
    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    /// Process id of the running engine.
    pub async fn pid(&self) -> Option<u32> {
        self.inner.lock().await.driver.as_ref().and_then(ProtocolDriver::pid)
    }

    /// Start the engine if it is not running.
    ///
    /// # Errors
    /// Returns [`SessionError::Closed`] after close, or
    /// [`SessionError::Startup`] if the engine cannot be launched.
    pub async fn start(&self) -> Result<(), SessionError> {
        let mut inner = self.inner.lock().await;
        self.ensure_running(&mut inner).await.map(|_| ())
    }

    /// Replace the engine with a fresh one. Workspace state is lost.
    ///
    /// # Errors
    /// Returns [`SessionError::Closed`] after close, or
    /// [`SessionError::Startup`] if the new engine cannot be launched.
    pub async fn restart(&self) -> Result<(), SessionError> {
        let mut inner = self.inner.lock().await;
        if inner.state == SessionState::Closed {
            return Err(SessionError::Closed);
        }
        if let Some(mut old) = inner.driver.take() {
            if let Err(e) = old.shutdown().await {
                tracing::warn!("failed to stop engine before restart: {e}");
            }
        }
        inner.driver = Some(self.spawn().await?);
        inner.state = SessionState::Running;
        tracing::info!("engine restarted");
        Ok(())
    }

    /// Stop the engine and close the session. Closing twice is a no-op.
    ///
    /// The sink receives [`LogLine::Finished`] once, whether or not logging
    /// is enabled.
    ///
    /// # Errors
    /// Returns error if the engine process could not be reaped.
    pub async fn close(&self) -> Result<(), SessionError> {
        let mut inner = self.inner.lock().await;
        if inner.state == SessionState::Closed {
            return Ok(());
        }
        inner.state = SessionState::Closed;
        let stopped = match inner.driver.take() {
            Some(mut driver) => driver.shutdown().await,
            None => Ok(()),
        };
        self.sink.record(&LogLine::Finished);
        tracing::info!("session closed");
        Ok(stopped?)
    }

    /// Run `f` with the session started, then close it.
    ///
    /// The session is closed whether `f` succeeds, fails or panics; a panic
    /// is resumed after the engine is gone.
    ///
    /// # Errors
    /// Returns the error from startup or `f`, else any error from closing.
    pub async fn scoped<T, F>(&self, f: F) -> Result<T, SessionError>
    where
        F: for<'a> FnOnce(&'a Self) -> BoxFuture<'a, Result<T, SessionError>>,
    {
        let outcome = AssertUnwindSafe(async {
            self.start().await?;
            f(self).await
        })
        .catch_unwind()
        .await;
        let closed = self.close().await;
        match outcome {
            Ok(result) => {
                let value = result?;
                closed?;
                Ok(value)
            }
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    /// Run one command, starting or restarting the engine as needed.
    ///
    /// The request's own timeout wins over the session default.
    ///
    /// # Errors
    /// Returns [`SessionError::Closed`] after close, startup errors, and the
    /// engine, timeout and codec errors of the command itself.
    pub async fn execute(&self, request: CommandRequest) -> Result<CommandOutcome, SessionError> {
        let Settings { timeout, logging } = *self.settings();
        let timeout = request.timeout_override().or(timeout);

        let mut inner = self.inner.lock().await;
        if inner.state == SessionState::Closed {
            return Err(SessionError::Closed);
        }
        // Bad requests must not start (or restart) an engine.
        let prepared = PreparedRequest::new(&request, DriverOptions::from(&self.config).encode)?;
        let driver = self.ensure_running(&mut inner).await?;
        let sink: Option<&dyn LogSink> = logging.then_some(&*self.sink);
        let result = driver.execute_prepared(&prepared, timeout, sink).await;
        if let Err(e) = &result {
            if e.is_fatal() {
                tracing::warn!("engine lost during {}: {e}", request.name());
            }
        }
        Ok(result?)
    }

    /// Call `name` with positional `args`, keeping up to `nout` outputs.
    ///
    /// # Errors
    /// See [`Session::execute`].
    pub async fn feval(
        &self,
        name: &str,
        args: Vec<Value>,
        nout: impl Into<Nout>,
    ) -> Result<Vec<Value>, SessionError> {
        let request = CommandRequest::call(name).args(args).nout(nout);
        Ok(self.execute(request).await?.values)
    }

    /// Call `name` for its first output. [`Value::Empty`] when there is none.
    ///
    /// # Errors
    /// See [`Session::execute`].
    pub async fn call(&self, name: &str, args: Vec<Value>) -> Result<Value, SessionError> {
        Ok(self.execute(CommandRequest::call(name).args(args)).await?.first())
    }

    /// Evaluate engine source in the base workspace.
    ///
    /// Returns the value of `ans` if the code produced one.
    ///
    /// # Errors
    /// See [`Session::execute`].
    pub async fn eval(&self, code: &str) -> Result<Option<Value>, SessionError> {
        let outcome = self.execute(CommandRequest::eval(code)).await?;
        Ok(outcome.values.into_iter().next())
    }

    /// Assign `value` to variable `name` in the base workspace.
    ///
    /// # Errors
    /// Returns [`SessionError::InvalidName`] before contacting the engine if
    /// `name` is not a valid variable name.
    pub async fn push(&self, name: &str, value: impl Into<Value>) -> Result<(), SessionError> {
        check_name(name)?;
        let args = vec![Value::from("base"), Value::from(name), value.into()];
        self.feval("assignin", args, 0).await?;
        Ok(())
    }

    /// Read variable `name` from the base workspace.
    ///
    /// Functions, objects and variables the codec cannot carry come back as
    /// [`Value::Ref`], usable as arguments to later calls.
    ///
    /// # Errors
    /// Returns [`SessionError::InvalidName`] for invalid names and an engine
    /// error if the variable does not exist.
    pub async fn pull(&self, name: &str) -> Result<Value, SessionError> {
        check_name(name)?;
        match self.exists(name).await? {
            EXIST_VARIABLE => {
                if let Some(class) = self.object_class(name).await? {
                    return Ok(EngineRef::object(name, class).into());
                }
                let args = vec![Value::from("base"), Value::from(name)];
                match self.call("evalin", args).await {
                    Err(e) if e.is_unsupported_type() => {
                        tracing::debug!("{name} cannot be transferred, returning a reference");
                        Ok(EngineRef::variable(name).into())
                    }
                    other => other,
                }
            }
            code if is_function_code(code) => Ok(EngineRef::function(name).into()),
            _ => self.call("evalin", vec![Value::from("base"), Value::from(name)]).await,
        }
    }

    /// A reference to `name` left in the engine: a variable, an object or a
    /// function.
    ///
    /// # Errors
    /// Returns [`SessionError::Undefined`] when the engine knows no such name.
    pub async fn get_ref(&self, name: &str) -> Result<EngineRef, SessionError> {
        check_name(name)?;
        match self.exists(name).await? {
            EXIST_VARIABLE => Ok(match self.object_class(name).await? {
                Some(class) => EngineRef::object(name, class),
                None => EngineRef::variable(name),
            }),
            code if is_function_code(code) => Ok(EngineRef::function(name)),
            _ => Err(SessionError::Undefined(name.to_string())),
        }
    }

    /// Add `dir` to the engine's search path.
    ///
    /// # Errors
    /// See [`Session::execute`].
    pub async fn add_path(&self, dir: impl AsRef<Path>) -> Result<(), SessionError> {
        self.feval("addpath", vec![path_value(dir.as_ref())], 0)
            .await
            .map(|_| ())
    }

    /// Remove `dir` from the engine's search path.
    ///
    /// # Errors
    /// See [`Session::execute`].
    pub async fn remove_path(&self, dir: impl AsRef<Path>) -> Result<(), SessionError> {
        self.feval("rmpath", vec![path_value(dir.as_ref())], 0)
            .await
            .map(|_| ())
    }

    /// Change the engine's working directory.
    ///
    /// # Errors
    /// See [`Session::execute`].
    pub async fn cd(&self, dir: impl AsRef<Path>) -> Result<(), SessionError> {
        self.feval("cd", vec![path_value(dir.as_ref())], 0)
            .await
            .map(|_| ())
    }

    /// Run an `.m` script file from its own directory.
    ///
    /// # Errors
    /// Returns an invalid-request error for files without an `.m`
    /// extension, otherwise see [`Session::execute`].
    pub async fn run_script(&self, path: impl AsRef<Path>) -> Result<(), SessionError> {
        let path = path.as_ref().to_string_lossy();
        self.execute(CommandRequest::call(path).nout(0))
            .await
            .map(|_| ())
    }

    /// The engine's `exist` code for `name`; 0 when undefined.
    ///
    /// # Errors
    /// See [`Session::execute`].
    pub async fn exists(&self, name: &str) -> Result<u32, SessionError> {
        let code = self.call("exist", vec![Value::from(name)]).await?;
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let code = code.as_f64().map_or(0, |c| c.max(0.0) as u32);
        Ok(code)
    }

    /// Class of variable `name` if it holds an object.
    async fn object_class(&self, name: &str) -> Result<Option<String>, SessionError> {
        let var = || vec![Value::from(EngineRef::variable(name))];
        let is_object = self.call("isobject", var()).await?;
        if is_object.as_f64().unwrap_or_default() <= 0.0 {
            return Ok(None);
        }
        let class = self.call("class", var()).await?;
        Ok(Some(class.as_str().unwrap_or("object").to_string()))
    }

    /// Default timeout for later calls. `None` waits indefinitely.
    pub fn set_timeout(&self, timeout: Option<Duration>) {
        self.settings().timeout = timeout;
    }

    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.settings().timeout
    }

    /// Forward engine output to the sink. Off means output is dropped.
    pub fn set_logging(&self, enabled: bool) {
        self.settings().logging = enabled;
    }

    #[must_use]
    pub fn logging_enabled(&self) -> bool {
        self.settings().logging
    }

    fn settings(&self) -> MutexGuard<'_, Settings> {
        match self.settings.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    async fn spawn(&self) -> Result<ProtocolDriver, SessionError> {
        let sink: Option<&dyn LogSink> = self.logging_enabled().then_some(&*self.sink);
        Ok(ProtocolDriver::start(&self.config, Arc::clone(&self.dialect), sink).await?)
    }

    async fn ensure_running<'a>(
        &self,
        inner: &'a mut Inner,
    ) -> Result<&'a mut ProtocolDriver, SessionError> {
        if inner.state == SessionState::Closed {
            return Err(SessionError::Closed);
        }
        let usable = inner.driver.as_mut().is_some_and(ProtocolDriver::is_usable);
        if !usable {
            if let Some(mut old) = inner.driver.take() {
                tracing::info!("engine is gone, starting a new one");
                if let Err(e) = old.shutdown().await {
                    tracing::warn!("failed to reap old engine: {e}");
                }
            }
            inner.driver = Some(self.spawn().await?);
            inner.state = SessionState::Running;
        }
        inner.driver.as_mut().ok_or(SessionError::Closed)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if let Some(driver) = inner.driver.as_mut() {
            driver.start_kill();
        }
        if inner.state != SessionState::Closed {
            self.sink.record(&LogLine::Finished);
        }
    }
}

/// `exist` code of a workspace variable.
const EXIST_VARIABLE: u32 = 1;

/// `exist` codes of callables: files on the path, mex files, built-ins and
/// command-line functions.
const fn is_function_code(code: u32) -> bool {
    matches!(code, 2 | 3 | 5 | 103)
}

fn check_name(name: &str) -> Result<(), SessionError> {
    if is_valid_name(name) {
        Ok(())
    } else {
        Err(SessionError::InvalidName(name.to_string()))
    }
}

fn path_value(path: &Path) -> Value {
    Value::from(path.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use octbridge_protocol::ProtocolError;

    use super::*;

    #[tokio::test]
    async fn test_new_session_is_unstarted() {
        let session = Session::new(SessionConfig::new().with_timeout(Duration::from_secs(4)));
        assert_eq!(session.state().await, SessionState::Unstarted);
        assert_eq!(session.timeout(), Some(Duration::from_secs(4)));
        assert!(!session.logging_enabled());
        assert!(session.pid().await.is_none());
    }

    #[tokio::test]
    async fn test_settings_update() {
        let session = Session::new(SessionConfig::new().with_logging(true));
        assert!(session.logging_enabled());
        session.set_logging(false);
        session.set_timeout(Some(Duration::from_millis(250)));
        assert!(!session.logging_enabled());
        assert_eq!(session.timeout(), Some(Duration::from_millis(250)));
        session.set_timeout(None);
        assert!(session.timeout().is_none());
    }

    #[tokio::test]
    async fn test_invalid_names_rejected_without_engine() {
        let session = Session::new(SessionConfig::new().with_executable("/nonexistent/octave"));
        let err = session.push("not a name", 1.0).await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidName(_)));
        let err = session.pull("1x").await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidName(_)));
        assert_eq!(session.state().await, SessionState::Unstarted);
    }

    #[tokio::test]
    async fn test_startup_failure_leaves_session_unstarted() {
        let session = Session::new(SessionConfig::new().with_executable("/nonexistent/octave"));
        let err = session.call("zeros", vec![]).await.unwrap_err();
        assert!(matches!(err, SessionError::Startup(_)));
        assert_eq!(session.state().await, SessionState::Unstarted);
    }

    #[tokio::test]
    async fn test_unencodable_request_does_not_start_engine() {
        let session = Session::new(SessionConfig::new().with_executable("/nonexistent/octave"));
        let bad = Value::Struct([("not valid".to_string(), Value::from(1.0))].into());
        let err = session.call("disp", vec![bad]).await.unwrap_err();
        assert!(
            matches!(err, SessionError::Protocol(ProtocolError::Codec(_))),
            "{err:?}"
        );
        assert_eq!(session.state().await, SessionState::Unstarted);
        assert!(session.pid().await.is_none());
    }

    #[tokio::test]
    async fn test_closed_session_refuses_calls() {
        let session = Session::new(SessionConfig::new());
        session.close().await.unwrap();
        session.close().await.unwrap();
        assert_eq!(session.state().await, SessionState::Closed);
        assert!(matches!(session.start().await, Err(SessionError::Closed)));
        assert!(matches!(session.restart().await, Err(SessionError::Closed)));
        assert!(matches!(
            session.eval("1 + 1").await,
            Err(SessionError::Closed)
        ));
    }
}
