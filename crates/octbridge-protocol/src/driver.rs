//! The protocol driver: one engine, one command at a time.

use std::{path::PathBuf, sync::Arc, time::Duration};

use octbridge_codec::{EncodeOptions, Envelope, mat5::is_valid_name, read_response};
use octbridge_core::{
    CellArray, CommandOutcome, CommandRequest, LogLine, LogSink, Nout, RequestKind,
    SessionConfig, Value,
    config::{DEFAULT_RESYNC_TIMEOUT, DEFAULT_SHUTDOWN_GRACE, DEFAULT_STARTUP_TIMEOUT},
};
use octbridge_process::{EngineLine, EngineProcess, ProcessError, locate_engine};

use crate::{
    ARGS_VAR, CallSpec, CallTarget, Dialect, ERR_VAR, Marker, OUT_VAR, ProtocolError,
    ScanEvent, ScratchDir, Sentinel, SentinelScanner,
};

/// Driver timing and encoding settings.
#[derive(Debug, Clone, Copy)]
pub struct DriverOptions {
    pub startup_timeout: Duration,
    pub resync_timeout: Duration,
    pub shutdown_grace: Duration,
    pub encode: EncodeOptions,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            resync_timeout: DEFAULT_RESYNC_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            encode: EncodeOptions::default(),
        }
    }
}

impl From<&SessionConfig> for DriverOptions {
    fn from(config: &SessionConfig) -> Self {
        Self {
            startup_timeout: config.startup_timeout,
            resync_timeout: config.resync_timeout,
            shutdown_grace: config.shutdown_grace,
            encode: EncodeOptions {
                convert_to_float: config.convert_to_float,
            },
        }
    }
}

/// A request checked and encoded, ready to send.
///
/// Preparing needs no engine: invalid names and arguments the codec cannot
/// express fail here, before any process is started or written to.
#[derive(Debug, Clone)]
pub struct PreparedRequest<'a> {
    request: &'a CommandRequest,
    dir: Option<PathBuf>,
    target: String,
    replacements: Vec<usize>,
    payload: Vec<u8>,
}

impl<'a> PreparedRequest<'a> {
    /// Validate `request` and encode its arguments.
    ///
    /// Top-level [`Value::Ref`] arguments travel as their engine address and
    /// are resolved by the engine before the call.
    ///
    /// # Errors
    /// Returns [`ProtocolError::InvalidRequest`] for malformed names and
    /// codec errors for arguments that cannot be encoded.
    pub fn new(request: &'a CommandRequest, encode: EncodeOptions) -> Result<Self, ProtocolError> {
        let (dir, target, args) = match request.kind() {
            RequestKind::Call { name } => {
                if name.trim().is_empty() || name.contains(['\n', '\r']) {
                    return Err(ProtocolError::InvalidRequest(format!(
                        "invalid function name {name:?}"
                    )));
                }
                let script = request.script_path().map_err(|ext| {
                    ProtocolError::InvalidRequest(format!("unsupported file extension {ext:?}"))
                })?;
                let (dir, target) = match script {
                    Some((dir, stem)) => (Some(dir).filter(|d| !d.as_os_str().is_empty()), stem),
                    None => (None, name.clone()),
                };
                (dir, target, request.arguments().to_vec())
            }
            RequestKind::Eval { code } => (None, String::new(), vec![Value::from(code.as_str())]),
        };
        if let Some(var) = request.store_target() {
            if !is_valid_name(var) {
                return Err(ProtocolError::InvalidRequest(format!(
                    "invalid variable name {var:?}"
                )));
            }
        }

        let mut replacements = Vec::new();
        let args: Vec<Value> = args
            .into_iter()
            .enumerate()
            .map(|(i, arg)| match arg {
                Value::Ref(r) => {
                    replacements.push(i + 1);
                    Value::Char(r.address())
                }
                other => other,
            })
            .collect();
        let mut envelope = Envelope::new();
        envelope.insert(ARGS_VAR, Value::Cell(CellArray::row(args)))?;
        let payload = envelope.encode(encode)?;

        Ok(Self {
            request,
            dir,
            target,
            replacements,
            payload,
        })
    }

    #[must_use]
    pub const fn request(&self) -> &CommandRequest {
        self.request
    }

    /// 1-based positions of arguments the engine resolves by address.
    #[must_use]
    pub fn replacements(&self) -> &[usize] {
        &self.replacements
    }

    fn call_target(&self) -> CallTarget<'_> {
        match self.request.kind() {
            RequestKind::Call { .. } => CallTarget::Function {
                name: &self.target,
                dir: self.dir.as_deref(),
            },
            RequestKind::Eval { .. } => CallTarget::Eval,
        }
    }
}

/// Drives one engine process.
///
/// Not shareable: callers serialize access (the session holds it behind a
/// mutex), so exactly one command is in flight at a time.
pub struct ProtocolDriver {
    process: EngineProcess,
    dialect: Arc<dyn Dialect>,
    scratch: ScratchDir,
    scanner: SentinelScanner,
    options: DriverOptions,
    usable: bool,
}

impl std::fmt::Debug for ProtocolDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolDriver")
            .field("pid", &self.process.pid())
            .field("dialect", &self.dialect)
            .field("scratch", &self.scratch.path())
            .field("usable", &self.usable)
            .finish_non_exhaustive()
    }
}

impl ProtocolDriver {
    /// Locate, launch and synchronise with the engine.
    ///
    /// # Errors
    /// Returns [`ProtocolError::Startup`] if the engine cannot be found,
    /// launched, or does not answer within the startup timeout.
    pub async fn start(
        config: &SessionConfig,
        dialect: Arc<dyn Dialect>,
        sink: Option<&dyn LogSink>,
    ) -> Result<Self, ProtocolError> {
        let spec = locate_engine(config, &dialect.defaults())
            .await
            .map_err(|e| ProtocolError::Startup(e.to_string()))?;
        let process = EngineProcess::start(&spec)
            .await
            .map_err(|e| ProtocolError::Startup(e.to_string()))?;
        let scratch = ScratchDir::new(config.temp_dir.as_deref())?;

        let mut driver = Self {
            process,
            dialect,
            scratch,
            scanner: SentinelScanner::new(),
            options: DriverOptions::from(config),
            usable: true,
        };

        let setup = driver.dialect.setup_script();
        let startup_timeout = driver.options.startup_timeout;
        let mut banner = Vec::new();
        let synced = async {
            driver.process.write_line(&setup).await?;
            driver.sync(&mut banner, sink).await
        };
        match tokio::time::timeout(startup_timeout, synced).await {
            Ok(Ok(())) => {
                tracing::info!(pid = ?driver.process.pid(), "engine ready");
                Ok(driver)
            }
            Ok(Err(e)) => {
                driver.kill().await;
                Err(ProtocolError::Startup(startup_failure(&e.to_string(), &banner)))
            }
            Err(_) => {
                driver.kill().await;
                Err(ProtocolError::Startup(startup_failure(
                    &format!("no response within {startup_timeout:?}"),
                    &banner,
                )))
            }
        }
    }

    /// Whether the engine is alive and in a known state.
    pub fn is_usable(&mut self) -> bool {
        self.usable && self.process.is_alive()
    }

    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    /// Run one command and collect its outcome.
    ///
    /// Argument encoding happens before anything is sent to the engine. On
    /// timeout the engine is interrupted and resynchronised; if that fails it
    /// is killed and the driver becomes unusable.
    ///
    /// # Errors
    /// Returns [`ProtocolError::EngineRuntime`] for engine-side errors,
    /// [`ProtocolError::Timeout`] when the deadline passes, codec errors for
    /// values that cannot be encoded or decoded, and process errors if the
    /// engine has died.
    pub async fn execute(
        &mut self,
        request: &CommandRequest,
        timeout: Option<Duration>,
        sink: Option<&dyn LogSink>,
    ) -> Result<CommandOutcome, ProtocolError> {
        let prepared = PreparedRequest::new(request, self.options.encode)?;
        self.execute_prepared(&prepared, timeout, sink).await
    }

    /// Run a request prepared with [`PreparedRequest::new`].
    ///
    /// # Errors
    /// See [`ProtocolDriver::execute`].
    pub async fn execute_prepared(
        &mut self,
        prepared: &PreparedRequest<'_>,
        timeout: Option<Duration>,
        sink: Option<&dyn LogSink>,
    ) -> Result<CommandOutcome, ProtocolError> {
        if !self.usable {
            return Err(ProcessError::Exited.into());
        }
        let request = prepared.request();

        let pair = self.scratch.pair()?;
        std::fs::write(pair.request(), &prepared.payload)?;

        let sentinel = Sentinel::new();
        let (ok_line, err_line) = (sentinel.line(Marker::Ok), sentinel.line(Marker::Err));
        let script = self.dialect.call_script(&CallSpec {
            target: prepared.call_target(),
            nout: request.requested_nout(),
            store_as: request.store_target(),
            replacements: prepared.replacements(),
            request: pair.request(),
            response: pair.response(),
            ok_line: &ok_line,
            err_line: &err_line,
        });

        tracing::debug!(name = request.name(), nout = ?request.requested_nout(), "sending command");
        if let Some(sink) = sink {
            sink.record(&LogLine::Command(request_text(request)));
        }

        self.scanner.arm(&sentinel);
        if let Err(e) = self.process.write_line(&script).await {
            self.usable = false;
            return Err(e.into());
        }

        let mut output = Vec::new();
        let marker = match timeout {
            Some(limit) => {
                match tokio::time::timeout(limit, self.await_sentinel(&mut output, sink)).await {
                    Ok(result) => result?,
                    Err(_) => return Err(self.recover(limit, output, sink).await),
                }
            }
            None => self.await_sentinel(&mut output, sink).await?,
        };

        match marker {
            Marker::Ok => {
                let mut envelope = read_response(pair.response())?;
                let values = match envelope.remove(OUT_VAR) {
                    Some(Value::Cell(cell)) => cell.into_values(),
                    Some(Value::Empty) | None => Vec::new(),
                    Some(other) => vec![other],
                };
                Ok(CommandOutcome {
                    values: trim_outputs(values, request.requested_nout()),
                    output,
                })
            }
            Marker::Err => Err(engine_error(pair.response(), &output)),
            Marker::Sync => Err(ProtocolError::Violation("sync marker in reply to a call".into())),
        }
    }

    /// Ask the engine to exit, escalating to a kill after the grace period.
    ///
    /// # Errors
    /// Returns error only if the process could not be reaped.
    pub async fn shutdown(&mut self) -> Result<(), ProtocolError> {
        self.usable = false;
        self.scanner.disarm();
        let exit = self.dialect.exit_command().to_string();
        self.process
            .terminate(Some(&exit), self.options.shutdown_grace)
            .await?;
        Ok(())
    }

    /// Kill the engine without waiting. For drop paths.
    pub fn start_kill(&mut self) {
        self.usable = false;
        self.process.start_kill();
    }

    async fn kill(&mut self) {
        self.usable = false;
        if let Err(e) = self.process.terminate(None, Duration::ZERO).await {
            tracing::warn!("failed to kill engine: {e}");
        }
    }

    /// Print a fresh sync sentinel and wait for it.
    async fn sync(
        &mut self,
        output: &mut Vec<String>,
        sink: Option<&dyn LogSink>,
    ) -> Result<(), ProtocolError> {
        let sentinel = Sentinel::new();
        let script = self.dialect.sync_script(&sentinel.line(Marker::Sync));
        self.scanner.arm(&sentinel);
        self.process.write_line(&script).await?;
        match self.await_sentinel(output, sink).await? {
            Marker::Sync => Ok(()),
            other => Err(ProtocolError::Violation(format!("expected SYNC, got {other}"))),
        }
    }

    /// Read lines until the armed sentinel. Cancel-safe: lines already read
    /// are in `output`.
    async fn await_sentinel(
        &mut self,
        output: &mut Vec<String>,
        sink: Option<&dyn LogSink>,
    ) -> Result<Marker, ProtocolError> {
        loop {
            let Some(line) = self.process.next_line().await else {
                self.usable = false;
                return Err(ProcessError::Exited.into());
            };
            match self.scanner.feed(&line.text) {
                ScanEvent::Complete { marker, leading } => {
                    if let Some(text) = leading {
                        emit(EngineLine { text, ..line }, output, sink);
                    }
                    return Ok(marker);
                }
                ScanEvent::Stale => tracing::debug!("ignoring stale sentinel"),
                ScanEvent::Output => emit(line, output, sink),
            }
        }
    }

    /// Interrupt a command that overran its deadline and get back in sync.
    async fn recover(
        &mut self,
        limit: Duration,
        mut output: Vec<String>,
        sink: Option<&dyn LogSink>,
    ) -> ProtocolError {
        tracing::warn!(?limit, "command timed out, interrupting engine");
        let resynced = match self.process.interrupt() {
            Ok(()) => {
                let resync = self.options.resync_timeout;
                matches!(
                    tokio::time::timeout(resync, self.sync(&mut output, sink)).await,
                    Ok(Ok(()))
                )
            }
            Err(e) => {
                tracing::warn!("cannot interrupt engine: {e}");
                false
            }
        };
        if !resynced {
            tracing::warn!("engine did not recover from interrupt, killing it");
            self.kill().await;
        }
        ProtocolError::Timeout {
            timeout: limit,
            partial_output: output,
            session_reset: !resynced,
        }
    }
}

fn emit(line: EngineLine, output: &mut Vec<String>, sink: Option<&dyn LogSink>) {
    if let Some(sink) = sink {
        sink.record(&LogLine::output(line.stream, line.text.as_str()));
    }
    output.push(line.text);
}

fn startup_failure(reason: &str, banner: &[String]) -> String {
    if banner.is_empty() {
        reason.to_string()
    } else {
        format!("{reason}; engine output: {}", banner.join(" | "))
    }
}

fn request_text(request: &CommandRequest) -> String {
    match request.kind() {
        RequestKind::Eval { code } => code.clone(),
        RequestKind::Call { name } => format!(
            "{name}(<{} args>) nout={:?}",
            request.arguments().len(),
            request.requested_nout()
        ),
    }
}

fn trim_outputs(mut values: Vec<Value>, nout: Nout) -> Vec<Value> {
    if let Nout::Count(k) = nout {
        values.truncate(k);
    }
    values
}

/// Build the runtime error from saved details, falling back to output text.
fn engine_error(response: &std::path::Path, output: &[String]) -> ProtocolError {
    let details = read_response(response)
        .ok()
        .and_then(|mut envelope| envelope.remove(ERR_VAR));
    let Some(details) = details else {
        let message = if output.is_empty() {
            "engine reported an error without details".to_string()
        } else {
            output.join("\n")
        };
        return ProtocolError::EngineRuntime {
            message,
            identifier: None,
            backtrace: None,
        };
    };

    let text = |field: &str| {
        details
            .field(field)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    ProtocolError::EngineRuntime {
        message: text("message").unwrap_or_else(|| "unknown engine error".into()),
        identifier: text("identifier"),
        backtrace: details.field("stack").and_then(render_stack),
    }
}

fn render_stack(stack: &Value) -> Option<String> {
    let frames: Vec<_> = match stack {
        Value::Struct(frame) => vec![frame],
        Value::StructArray(frames) => frames.elements().iter().collect(),
        _ => return None,
    };
    let lines: Vec<String> = frames
        .into_iter()
        .map(|frame| {
            let name = frame.get("name").and_then(Value::as_str).unwrap_or("?");
            let line = frame.get("line").and_then(Value::as_f64).unwrap_or(-1.0);
            let column = frame.get("column").and_then(Value::as_f64).unwrap_or(-1.0);
            format!("    {name} at line {line} column {column}")
        })
        .collect();
    (!lines.is_empty()).then(|| lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use octbridge_codec::CodecError;
    use octbridge_core::{EngineRef, StructArray};

    use super::*;

    #[test]
    fn test_trim_outputs() {
        let values = vec![Value::from(1.0), Value::from(2.0), Value::from(3.0)];
        assert_eq!(trim_outputs(values.clone(), Nout::Count(2)).len(), 2);
        assert_eq!(trim_outputs(values.clone(), Nout::Count(5)).len(), 3);
        assert!(trim_outputs(values.clone(), Nout::Count(0)).is_empty());
        assert_eq!(trim_outputs(values, Nout::Max).len(), 3);
    }

    #[test]
    fn test_engine_error_from_saved_details() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resp.mat");

        let frame = |name: &str, line: f64| {
            let mut f = BTreeMap::new();
            f.insert("name".to_string(), Value::from(name));
            f.insert("line".to_string(), Value::from(line));
            f.insert("column".to_string(), Value::from(5.0));
            f
        };
        let mut err = BTreeMap::new();
        err.insert("message".to_string(), Value::from("'foo' undefined"));
        err.insert("identifier".to_string(), Value::from("Octave:undefined-function"));
        err.insert(
            "stack".to_string(),
            Value::StructArray(
                StructArray::from_records(vec![frame("inner", 3.0), frame("outer", 10.0)]).unwrap(),
            ),
        );
        let mut envelope = Envelope::new();
        envelope.insert(ERR_VAR, Value::Struct(err)).unwrap();
        envelope.write_to(&path, EncodeOptions::default()).unwrap();

        match engine_error(&path, &[]) {
            ProtocolError::EngineRuntime {
                message,
                identifier,
                backtrace,
            } => {
                assert_eq!(message, "'foo' undefined");
                assert_eq!(identifier.as_deref(), Some("Octave:undefined-function"));
                let backtrace = backtrace.unwrap();
                assert!(backtrace.contains("inner at line 3 column 5"));
                assert!(backtrace.contains("outer at line 10"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_engine_error_without_details() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.mat");
        std::fs::write(&path, b"").unwrap();
        let err = engine_error(&path, &["error: boom".to_string()]);
        assert!(matches!(
            err,
            ProtocolError::EngineRuntime { ref message, .. } if message == "error: boom"
        ));
    }

    #[test]
    fn test_prepare_resolves_references_by_address() {
        let request = CommandRequest::call("feval")
            .arg(Value::Ref(EngineRef::function("sin")))
            .arg(1.0)
            .arg(Value::Ref(EngineRef::variable("handle")));
        let prepared = PreparedRequest::new(&request, EncodeOptions::default()).unwrap();
        assert_eq!(prepared.replacements(), &[1, 3]);

        let envelope = Envelope::decode(&prepared.payload).unwrap();
        let args = envelope.get(ARGS_VAR).and_then(Value::as_cell).unwrap();
        assert_eq!(args.values()[0], Value::from("@sin"));
        assert_eq!(args.values()[1], Value::from(1.0));
        assert_eq!(args.values()[2], Value::from("handle"));
    }

    #[test]
    fn test_prepare_fails_on_values_the_codec_rejects() {
        let mut record = BTreeMap::new();
        record.insert("not valid".to_string(), Value::from(1.0));
        let request = CommandRequest::call("f").arg(Value::Struct(record));
        let err = PreparedRequest::new(&request, EncodeOptions::default()).unwrap_err();
        assert!(matches!(err, ProtocolError::Codec(CodecError::InvalidName(_))), "{err:?}");

        let nested = CommandRequest::call("f")
            .arg(Value::from(vec![Value::Ref(EngineRef::variable("x"))]));
        let err = PreparedRequest::new(&nested, EncodeOptions::default()).unwrap_err();
        assert!(matches!(err, ProtocolError::Codec(CodecError::UnsupportedType(_))), "{err:?}");
    }

    #[test]
    fn test_prepare_script_paths() {
        let request = CommandRequest::call("/work/models/fit.m");
        let prepared = PreparedRequest::new(&request, EncodeOptions::default()).unwrap();
        assert_eq!(
            prepared.call_target(),
            CallTarget::Function {
                name: "fit",
                dir: Some(std::path::Path::new("/work/models")),
            }
        );

        let request = CommandRequest::call("models/fit.txt");
        assert!(matches!(
            PreparedRequest::new(&request, EncodeOptions::default()),
            Err(ProtocolError::InvalidRequest(_))
        ));
    }
}
