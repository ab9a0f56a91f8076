//! One interpreter subprocess and the protocol state machine around it.
//!
//! A [`Worker`] exclusively owns its subprocess handle; no other component
//! touches the child's stdio streams. Lifecycle is an explicit state
//! machine: `Uninitialized -> Starting -> Ready <-> Busy`, with `Dead`
//! reachable from any state (crash, explicit terminate, or timeout-triggered
//! kill). `Dead` is terminal; a replacement worker must be constructed.

use std::fmt;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::watch;
use tokio::time::timeout;

use crate::codec::FrameDecoder;
use crate::config::HostConfig;
use crate::error::{EvalError, ExecutionOutput};
use crate::shutdown;

/// Stderr carries no sentinel, so after the response frame completes the
/// worker briefly keeps reading stderr to pick up bytes the subprocess wrote
/// alongside the response.
const STDERR_SETTLE: Duration = Duration::from_millis(10);

/// Upper bound on draining pipe remainders after the subprocess exited.
const EXIT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Uninitialized,
    Starting,
    Ready,
    Busy,
    Dead,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Busy => "busy",
            Self::Dead => "dead",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

enum IoEvent {
    Stdout(io::Result<usize>),
    Stderr(io::Result<usize>),
    Exited(io::Result<ExitStatus>),
    Interrupted,
}

pub struct Worker {
    config: Arc<HostConfig>,
    state: WorkerState,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: ChildStdout,
    stderr: ChildStderr,
    stderr_open: bool,
    decoder: FrameDecoder,
    stderr_buf: Vec<u8>,
    pid: Option<u32>,
    exit_code: Option<i32>,
    interrupt: Option<watch::Receiver<u64>>,
}

impl Worker {
    /// Spawns the subprocess and completes the readiness handshake: the
    /// subprocess must write the ready sentinel to stdout within
    /// `initialization_timeout`. Never retries on its own.
    pub async fn spawn(config: Arc<HostConfig>) -> Result<Self, EvalError> {
        let process = &config.process;
        let mut command = Command::new(&process.command);
        command.args(&process.args);
        if let Some(dir) = &process.working_directory {
            command.current_dir(dir);
        }
        for (key, value) in &process.env {
            command.env(key, value);
        }
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| EvalError::ProcessSpawnError {
            command: process.command.clone(),
            source,
        })?;

        let Some(stdin) = child.stdin.take() else {
            return Err(missing_pipe(&mut child, &process.command, "stdin"));
        };
        let Some(stdout) = child.stdout.take() else {
            return Err(missing_pipe(&mut child, &process.command, "stdout"));
        };
        let Some(stderr) = child.stderr.take() else {
            return Err(missing_pipe(&mut child, &process.command, "stderr"));
        };

        let pid = child.id();
        if let Some(pid) = pid {
            shutdown::register_worker(pid);
        }
        tracing::info!(command = %process.command, pid, "spawned interpreter worker");

        let mut worker = Self {
            config,
            state: WorkerState::Uninitialized,
            child,
            stdin: Some(stdin),
            stdout,
            stderr,
            stderr_open: true,
            decoder: FrameDecoder::new(),
            stderr_buf: Vec::new(),
            pid,
            exit_code: None,
            interrupt: None,
        };
        worker.state = WorkerState::Starting;
        match worker.await_ready().await {
            Ok(()) => {
                worker.state = WorkerState::Ready;
                tracing::debug!(pid, "interpreter worker is ready");
                Ok(worker)
            }
            Err(error) => {
                worker.terminate().await;
                Err(error)
            }
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Binds the interrupt channel whose bumps settle an in-flight
    /// evaluation with [`EvalError::Interrupted`].
    pub fn bind_interrupt(&mut self, interrupt: watch::Receiver<u64>) {
        self.interrupt = Some(interrupt);
    }

    /// Whether the subprocess has exited even though no termination was
    /// requested through this worker.
    pub fn has_exited(&mut self) -> bool {
        if self.state == WorkerState::Dead {
            return true;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exit_code = status.code();
                self.state = WorkerState::Dead;
                if let Some(pid) = self.pid.take() {
                    shutdown::unregister_worker(pid);
                }
                true
            }
            Ok(None) => false,
            Err(_) => true,
        }
    }

    /// Sends one evaluation unit and returns the sentinel-framed response.
    ///
    /// Valid only in `Ready`. Always settles: on failure the error carries
    /// whatever partial stdout/stderr was captured. A failure that kills or
    /// distrusts the subprocess leaves the worker `Dead`.
    pub async fn evaluate(&mut self, code: &str) -> Result<ExecutionOutput, EvalError> {
        if self.state != WorkerState::Ready {
            return Err(EvalError::InvalidState { state: self.state });
        }
        self.state = WorkerState::Busy;
        self.stderr_buf.clear();

        let eom = self.config.sentinels.end_of_message;
        if let Err(source) = self.write_unit(code, eom).await {
            let partial = self.capture_partial();
            self.terminate().await;
            return Err(EvalError::StdinWriteFailure { source, partial });
        }

        let limit = self.config.limits.execution_timeout;
        match timeout(limit, self.exchange(eom)).await {
            Ok(Ok(frame)) => {
                let output = ExecutionOutput {
                    stdout: String::from_utf8_lossy(&frame).trim().to_string(),
                    stderr: String::from_utf8_lossy(&self.stderr_buf).to_string(),
                    exit_code: self.exit_code,
                };
                // A complete frame can still arrive from a subprocess that
                // exited right after responding.
                self.state = if self.exit_code.is_some() {
                    WorkerState::Dead
                } else {
                    WorkerState::Ready
                };
                Ok(output)
            }
            Ok(Err(error)) => {
                self.terminate().await;
                Err(error)
            }
            Err(_elapsed) => {
                let timeout_ms = limit.as_millis() as u64;
                let partial = self.capture_partial();
                tracing::warn!(pid = self.pid, timeout_ms, "evaluation timed out, killing worker");
                self.terminate().await;
                Err(EvalError::ExecutionTimeout { timeout_ms, partial })
            }
        }
    }

    /// Terminates the subprocess: graceful signal first, forceful kill after
    /// the grace window. Idempotent and infallible so disposal paths can
    /// never be blocked by a misbehaving subprocess.
    pub async fn terminate(&mut self) {
        if self.state == WorkerState::Dead && self.pid.is_none() {
            return;
        }
        // Closing stdin lets a well-behaved interpreter loop exit on EOF.
        self.stdin = None;

        if self.exit_code.is_none() {
            #[cfg(unix)]
            if let Some(pid) = self.pid {
                tracing::debug!(pid, "sending SIGTERM to interpreter worker");
                // SAFETY: plain kill(2) on the pid of a child this worker owns.
                unsafe {
                    libc::kill(pid as i32, libc::SIGTERM);
                }
            }
            #[cfg(not(unix))]
            {
                let _ = self.child.start_kill();
            }
        }

        match timeout(self.config.limits.termination_grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                self.exit_code = status.code();
            }
            Ok(Err(_)) => {}
            Err(_elapsed) => {
                tracing::warn!(pid = self.pid, "grace window elapsed, killing interpreter worker");
                let _ = self.child.start_kill();
                if let Ok(status) = self.child.wait().await {
                    self.exit_code = status.code();
                }
            }
        }

        self.state = WorkerState::Dead;
        if let Some(pid) = self.pid.take() {
            shutdown::unregister_worker(pid);
        }
    }

    async fn await_ready(&mut self) -> Result<(), EvalError> {
        let limit = self.config.limits.initialization_timeout;
        let ready = self.config.sentinels.ready;
        let mut out_buf = [0u8; 4096];
        let mut err_buf = [0u8; 4096];
        let mut stdout_open = true;

        let handshake = async {
            loop {
                let event = tokio::select! {
                    read = self.stdout.read(&mut out_buf), if stdout_open => IoEvent::Stdout(read),
                    read = self.stderr.read(&mut err_buf), if self.stderr_open => IoEvent::Stderr(read),
                    status = self.child.wait() => IoEvent::Exited(status),
                };
                match event {
                    IoEvent::Stdout(Ok(n)) if n > 0 => {
                        self.decoder.push(&out_buf[..n]);
                        // Boot noise before the marker is discarded; bytes
                        // after it stay buffered for the first evaluation.
                        if self.decoder.split_frame(ready).is_some() {
                            return Ok(());
                        }
                    }
                    IoEvent::Stdout(_) => stdout_open = false,
                    IoEvent::Stderr(Ok(n)) if n > 0 => {
                        self.stderr_buf.extend_from_slice(&err_buf[..n]);
                    }
                    IoEvent::Stderr(_) => self.stderr_open = false,
                    IoEvent::Exited(status) => {
                        if let Ok(status) = status {
                            self.exit_code = status.code();
                        }
                        let partial = self.capture_partial();
                        return Err(EvalError::ProcessExit { partial });
                    }
                    IoEvent::Interrupted => unreachable!("no interrupt bound during startup"),
                }
            }
        };

        match timeout(limit, handshake).await {
            Ok(result) => result,
            Err(_elapsed) => {
                let timeout_ms = limit.as_millis() as u64;
                tracing::warn!(
                    pid = self.pid,
                    timeout_ms,
                    "interpreter never emitted the ready marker"
                );
                Err(EvalError::InitializationTimeout { timeout_ms })
            }
        }
    }

    async fn write_unit(&mut self, code: &str, eom: u8) -> io::Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "stdin is closed"))?;
        stdin.write_all(code.as_bytes()).await?;
        stdin.write_all(&[eom]).await?;
        stdin.flush().await
    }

    async fn exchange(&mut self, eom: u8) -> Result<Vec<u8>, EvalError> {
        let mut out_buf = [0u8; 4096];
        let mut err_buf = [0u8; 4096];
        let mut stdout_open = true;
        let mut had_output = !self.decoder.is_empty();

        // Leftover from the handshake or a previous exchange may already
        // hold a complete frame.
        if let Some(frame) = self.decoder.split_frame(eom) {
            self.settle_stderr(&mut err_buf).await;
            return Ok(frame);
        }

        loop {
            let event = tokio::select! {
                read = self.stdout.read(&mut out_buf), if stdout_open => IoEvent::Stdout(read),
                read = self.stderr.read(&mut err_buf), if self.stderr_open => IoEvent::Stderr(read),
                status = self.child.wait() => IoEvent::Exited(status),
                _ = interrupt_signal(&mut self.interrupt) => IoEvent::Interrupted,
            };
            match event {
                IoEvent::Stdout(Ok(n)) if n > 0 => {
                    had_output = true;
                    self.decoder.push(&out_buf[..n]);
                    if let Some(frame) = self.decoder.split_frame(eom) {
                        self.settle_stderr(&mut err_buf).await;
                        return Ok(frame);
                    }
                }
                IoEvent::Stdout(_) => stdout_open = false,
                IoEvent::Stderr(Ok(n)) if n > 0 => {
                    had_output = true;
                    self.stderr_buf.extend_from_slice(&err_buf[..n]);
                }
                IoEvent::Stderr(_) => self.stderr_open = false,
                IoEvent::Exited(status) => {
                    return self.classify_exit(status, eom, had_output).await;
                }
                IoEvent::Interrupted => {
                    tracing::debug!(pid = self.pid, "evaluation interrupted");
                    let partial = self.capture_partial();
                    return Err(EvalError::Interrupted { partial });
                }
            }
        }
    }

    /// The subprocess exited while an evaluation was in flight. Drain the
    /// pipe remainders, then decide: a completed frame still counts as a
    /// response; a clean exit that never produced output is anomalous and
    /// surfaced distinctly so the caller can respawn instead of trusting an
    /// empty success.
    async fn classify_exit(
        &mut self,
        status: io::Result<ExitStatus>,
        eom: u8,
        had_output: bool,
    ) -> Result<Vec<u8>, EvalError> {
        if let Ok(status) = status {
            self.exit_code = status.code();
        }
        tracing::debug!(pid = self.pid, exit_code = self.exit_code, "worker exited while busy");
        self.state = WorkerState::Dead;
        if let Some(pid) = self.pid.take() {
            shutdown::unregister_worker(pid);
        }
        self.drain_after_exit().await;

        if let Some(frame) = self.decoder.split_frame(eom) {
            return Ok(frame);
        }
        let had_output =
            had_output || !self.decoder.buffered().is_empty() || !self.stderr_buf.is_empty();
        let partial = self.capture_partial();
        match self.exit_code {
            Some(0) if !had_output => Err(EvalError::CleanExitNoOutput { partial }),
            _ => Err(EvalError::ProcessExit { partial }),
        }
    }

    async fn drain_after_exit(&mut self) {
        let mut buf = [0u8; 4096];
        loop {
            match timeout(EXIT_DRAIN_TIMEOUT, self.stdout.read(&mut buf)).await {
                Ok(Ok(n)) if n > 0 => self.decoder.push(&buf[..n]),
                _ => break,
            }
        }
        while self.stderr_open {
            match timeout(EXIT_DRAIN_TIMEOUT, self.stderr.read(&mut buf)).await {
                Ok(Ok(n)) if n > 0 => self.stderr_buf.extend_from_slice(&buf[..n]),
                _ => {
                    self.stderr_open = false;
                }
            }
        }
    }

    async fn settle_stderr(&mut self, buf: &mut [u8]) {
        while self.stderr_open {
            match timeout(STDERR_SETTLE, self.stderr.read(buf)).await {
                Ok(Ok(n)) if n > 0 => self.stderr_buf.extend_from_slice(&buf[..n]),
                Ok(_) => self.stderr_open = false,
                Err(_elapsed) => break,
            }
        }
    }

    fn capture_partial(&mut self) -> ExecutionOutput {
        let buffered = self.decoder.take_buffered();
        ExecutionOutput {
            stdout: String::from_utf8_lossy(&buffered).trim().to_string(),
            stderr: String::from_utf8_lossy(&self.stderr_buf).to_string(),
            exit_code: self.exit_code,
        }
    }
}

impl Drop for Worker {
    /// Keeps the shutdown registry honest on every drop path, including
    /// workers dropped without an explicit `terminate` (the subprocess
    /// itself is reaped by `kill_on_drop`). A stale registry entry would
    /// let a later shutdown signal kill a recycled pid.
    fn drop(&mut self) {
        if let Some(pid) = self.pid.take() {
            shutdown::unregister_worker(pid);
        }
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("state", &self.state)
            .field("pid", &self.pid)
            .field("exit_code", &self.exit_code)
            .finish()
    }
}

fn missing_pipe(child: &mut Child, command: &str, what: &str) -> EvalError {
    let _ = child.start_kill();
    EvalError::ProcessSpawnError {
        command: command.to_string(),
        source: io::Error::new(io::ErrorKind::BrokenPipe, format!("{what} pipe unavailable")),
    }
}

async fn interrupt_signal(interrupt: &mut Option<watch::Receiver<u64>>) {
    if let Some(receiver) = interrupt {
        if receiver.changed().await.is_ok() {
            return;
        }
    }
    // No channel bound, or the sender is gone: never fires.
    std::future::pending::<()>().await
}
