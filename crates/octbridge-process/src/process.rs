//! A running engine subprocess.
//!
//! The engine is spawned as a process-group leader so that interrupt and
//! termination signals also reach anything it spawned. Stdout and stderr are
//! read by background tasks into one line channel; reading from it is
//! cancel-safe, so callers can race it against a deadline.

use std::{process::Stdio, time::Duration};

use command_group::{AsyncCommandGroup, AsyncGroupChild};
use octbridge_core::Stream;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader},
    process::{ChildStdin, Command},
    sync::mpsc,
};

use crate::{LaunchSpec, ProcessError};

/// How long to wait after SIGTERM before killing outright.
const TERM_GRACE: Duration = Duration::from_millis(500);

/// One line of engine output, without its terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineLine {
    pub stream: Stream,
    pub text: String,
}

/// Handle to a running engine.
pub struct EngineProcess {
    child: Option<AsyncGroupChild>,
    stdin: Option<ChildStdin>,
    lines: mpsc::Receiver<EngineLine>,
    pid: Option<u32>,
}

impl EngineProcess {
    /// Spawn the engine described by `spec`.
    ///
    /// # Errors
    /// Returns [`ProcessError::Startup`] if the process cannot be spawned or
    /// exits immediately.
    pub async fn start(spec: &LaunchSpec) -> Result<Self, ProcessError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }
        cmd.envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));

        let mut child = cmd
            .group_spawn()
            .map_err(|e| ProcessError::Startup(format!("{}: {e}", spec.program.display())))?;

        let stdin = child.inner().stdin.take();
        let stdout = child.inner().stdout.take();
        let stderr = child.inner().stderr.take();
        let (Some(stdin), Some(stdout), Some(stderr)) = (stdin, stdout, stderr) else {
            return Err(ProcessError::Startup("engine stdio was not captured".into()));
        };

        let (tx, lines) = mpsc::channel(256);
        spawn_reader(stdout, Stream::Stdout, tx.clone());
        spawn_reader(stderr, Stream::Stderr, tx);

        if let Some(status) = child.try_wait()? {
            return Err(ProcessError::Startup(format!(
                "{} exited immediately ({status})",
                spec.program.display()
            )));
        }

        let pid = child.id();
        tracing::info!(?pid, program = %spec.program.display(), "engine started");
        Ok(Self {
            child: Some(child),
            stdin: Some(stdin),
            lines,
            pid,
        })
    }

    /// Process id of the engine, if it was running when started.
    #[must_use]
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Write raw bytes to the engine's stdin.
    ///
    /// # Errors
    /// Returns [`ProcessError::Exited`] if stdin is closed.
    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), ProcessError> {
        let stdin = self.stdin.as_mut().ok_or(ProcessError::Exited)?;
        let result = async {
            stdin.write_all(bytes).await?;
            stdin.flush().await
        }
        .await;
        result.map_err(|e| match e.kind() {
            std::io::ErrorKind::BrokenPipe => ProcessError::Exited,
            _ => ProcessError::Io(e),
        })
    }

    /// Write one line to the engine's stdin.
    ///
    /// # Errors
    /// See [`EngineProcess::write`].
    pub async fn write_line(&mut self, line: &str) -> Result<(), ProcessError> {
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        self.write(&buf).await
    }

    /// Next output line; `None` once both streams have closed.
    ///
    /// Cancel-safe.
    pub async fn next_line(&mut self) -> Option<EngineLine> {
        self.lines.recv().await
    }

    /// Read lines up to and including the first one matching `is_marker`.
    ///
    /// # Errors
    /// Returns [`ProcessError::Exited`] if output ends before the marker.
    pub async fn read_until<F>(&mut self, mut is_marker: F) -> Result<Vec<EngineLine>, ProcessError>
    where
        F: FnMut(&EngineLine) -> bool,
    {
        let mut seen = Vec::new();
        while let Some(line) = self.next_line().await {
            let done = is_marker(&line);
            seen.push(line);
            if done {
                return Ok(seen);
            }
        }
        Err(ProcessError::Exited)
    }

    /// Whether the engine process is still running.
    pub fn is_alive(&mut self) -> bool {
        self.child
            .as_mut()
            .is_some_and(|child| matches!(child.try_wait(), Ok(None)))
    }

    /// Send an interrupt (SIGINT) to the engine's process group.
    ///
    /// # Errors
    /// Returns error if the engine has exited or the platform has no interrupt.
    pub fn interrupt(&self) -> Result<(), ProcessError> {
        let child = self.child.as_ref().ok_or(ProcessError::Exited)?;
        tracing::debug!(pid = ?self.pid, "interrupting engine");
        #[cfg(unix)]
        {
            use command_group::{Signal, UnixChildExt};
            child.signal(Signal::SIGINT)?;
            Ok(())
        }
        #[cfg(not(unix))]
        {
            let _ = child;
            Err(ProcessError::InterruptUnsupported)
        }
    }

    /// Stop the engine and wait until it is gone.
    ///
    /// Sends `exit_command` (if any), closes stdin and waits up to `grace`;
    /// then escalates to SIGTERM and finally a kill. Calling this on an
    /// already terminated engine returns `Ok(None)`.
    ///
    /// # Errors
    /// Returns error only if the final kill or wait fails.
    pub async fn terminate(
        &mut self,
        exit_command: Option<&str>,
        grace: Duration,
    ) -> Result<Option<std::process::ExitStatus>, ProcessError> {
        let Some(mut child) = self.child.take() else {
            return Ok(None);
        };

        if let Some(command) = exit_command {
            if let Err(e) = self.write_line(command).await {
                tracing::debug!("exit command not delivered: {e}");
            }
        }
        self.stdin = None;

        if let Ok(Ok(status)) = tokio::time::timeout(grace, child.wait()).await {
            tracing::info!(pid = ?self.pid, %status, "engine exited");
            return Ok(Some(status));
        }

        #[cfg(unix)]
        {
            use command_group::{Signal, UnixChildExt};
            tracing::warn!(pid = ?self.pid, "engine ignored exit request, sending SIGTERM");
            if child.signal(Signal::SIGTERM).is_ok() {
                if let Ok(Ok(status)) = tokio::time::timeout(TERM_GRACE, child.wait()).await {
                    return Ok(Some(status));
                }
            }
        }

        tracing::warn!(pid = ?self.pid, "killing engine");
        child.start_kill()?;
        let status = child.wait().await?;
        Ok(Some(status))
    }

    /// Kill the engine without waiting. Used on drop paths.
    pub fn start_kill(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.start_kill() {
                tracing::debug!("failed to kill engine: {e}");
            }
        }
        self.stdin = None;
    }
}

impl Drop for EngineProcess {
    fn drop(&mut self) {
        self.start_kill();
    }
}

fn spawn_reader<R>(reader: R, stream: Stream, tx: mpsc::Sender<EngineLine>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buffer = Vec::new();
        loop {
            buffer.clear();
            match reader.read_until(b'\n', &mut buffer).await {
                Ok(0) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&buffer)
                        .trim_end_matches(['\n', '\r'])
                        .to_string();
                    if tx.send(EngineLine { stream, text }).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!(?stream, "engine stream read failed: {e}");
                    break;
                }
            }
        }
    });
}
