//! Worker supervision: owns the worker process from spawn to exit.
//!
//! [`Supervisor::start_worker`] spawns `<interpreter> <script>` with three
//! separate pipes. stdout and stdin become the [`TransportHandle`]; stderr is
//! forwarded chunk by chunk into the output channel; a monitor task waits for
//! the process and records the exit. There is no heartbeat and no restart: the
//! exit event is the only termination signal and `Exited` is final.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time;

use crate::error::SpawnError;
use crate::log_sink::LogSink;
use crate::process::hide_window;
use crate::session::ProtocolSession;
use crate::transport::{StdoutTap, TransportHandle};
use crate::types::{ExitObservation, WorkerState};

const STDERR_CHUNK_BYTES: usize = 8 * 1024;

/// How long the exit line waits for stderr to reach EOF once the worker is
/// gone. Orphaned grandchildren can hold the pipe open indefinitely.
const STDERR_DRAIN_GRACE: Duration = Duration::from_millis(250);

/// What to run: `<interpreter> <script>` in `cwd`, no further arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSpec {
    interpreter: PathBuf,
    script: PathBuf,
    cwd: PathBuf,
}

impl WorkerSpec {
    pub fn new(
        interpreter: impl Into<PathBuf>,
        script: impl Into<PathBuf>,
        cwd: impl Into<PathBuf>,
    ) -> Self {
        Self {
            interpreter: interpreter.into(),
            script: script.into(),
            cwd: cwd.into(),
        }
    }

    #[must_use]
    pub fn interpreter(&self) -> &Path {
        &self.interpreter
    }

    #[must_use]
    pub fn script(&self) -> &Path {
        &self.script
    }

    #[must_use]
    pub fn cwd(&self) -> &Path {
        &self.cwd
    }
}

#[derive(Debug, Clone)]
pub struct Supervisor {
    log: LogSink,
    mirror_stdout: bool,
}

impl Supervisor {
    #[must_use]
    pub fn new(log: LogSink) -> Self {
        Self {
            log,
            mirror_stdout: false,
        }
    }

    /// Also copy protocol stdout into the output channel. Debug aid only.
    #[must_use]
    pub fn mirror_stdout(mut self, enabled: bool) -> Self {
        self.mirror_stdout = enabled;
        self
    }

    #[must_use]
    pub fn log(&self) -> &LogSink {
        &self.log
    }

    /// Spawn the worker and return its handle plus the duplex transport.
    ///
    /// Must be called from within a Tokio runtime. The environment is
    /// inherited unchanged. A failed spawn is returned immediately and never
    /// retried.
    pub fn start_worker(
        &self,
        spec: &WorkerSpec,
    ) -> Result<(WorkerHandle, TransportHandle), SpawnError> {
        let (state_tx, state_rx) = watch::channel(WorkerState::Starting);

        tracing::debug!(
            interpreter = %spec.interpreter.display(),
            script = %spec.script.display(),
            cwd = %spec.cwd.display(),
            "spawning worker"
        );

        let mut cmd = Command::new(&spec.interpreter);
        cmd.arg(&spec.script)
            .current_dir(&spec.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        hide_window(&mut cmd);

        let mut child = cmd.spawn().map_err(|source| {
            self.log.append_line(format!(
                "Failed to start worker {}: {source}",
                spec.interpreter.display()
            ));
            SpawnError::from_io(&spec.interpreter, source)
        })?;

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            let _ = child.start_kill();
            return Err(SpawnError::MissingPipe("stdio"));
        };

        let pid = child.id();
        state_tx.send_replace(WorkerState::Running);
        match pid {
            Some(pid) => self.log.append_line(format!("Worker started (pid {pid})")),
            None => self.log.append_line("Worker started"),
        }
        tracing::info!(pid, script = %spec.script.display(), "worker spawned");

        let (kill_tx, kill_rx) = oneshot::channel();
        let stopping = Arc::new(AtomicBool::new(false));
        let forwarder = tokio::spawn(forward_stderr(stderr, self.log.clone()));
        tokio::spawn(observe_exit(
            child,
            ExitMonitor {
                forwarder,
                kill: kill_rx,
                stopping: stopping.clone(),
                state: state_tx,
                log: self.log.clone(),
            },
        ));

        let mirror = self.mirror_stdout.then(|| self.log.clone());
        let transport = TransportHandle::new(StdoutTap::new(stdout, mirror), stdin);
        let handle = WorkerHandle {
            pid,
            state: state_rx,
            stopping,
            kill: Some(kill_tx),
        };
        Ok((handle, transport))
    }
}

/// Supervisor-side view of a spawned worker.
///
/// Dropping the handle leaves the process running; it is then up to the
/// worker (or the OS) to end it.
#[derive(Debug)]
pub struct WorkerHandle {
    pid: Option<u32>,
    state: watch::Receiver<WorkerState>,
    stopping: Arc<AtomicBool>,
    kill: Option<oneshot::Sender<()>>,
}

impl WorkerHandle {
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    #[must_use]
    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// The recorded exit, once the process is gone.
    #[must_use]
    pub fn exit(&self) -> Option<ExitObservation> {
        self.state().exit()
    }

    /// A detached waiter for the exit, usable while someone else holds the handle.
    #[must_use]
    pub fn exit_watch(&self) -> ExitWatch {
        ExitWatch(self.state.clone())
    }

    pub async fn wait_for_exit(&self) -> Option<ExitObservation> {
        self.exit_watch().wait().await
    }

    /// Kill the process without any protocol shutdown and wait for the exit.
    ///
    /// For tearing down a worker whose session never came up.
    pub async fn kill(mut self) -> Option<ExitObservation> {
        self.mark_stopping();
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
        self.wait_for_exit().await
    }

    pub(crate) fn mark_stopping(&self) {
        self.stopping.store(true, Ordering::Release);
    }
}

/// Resolves when the worker's exit has been recorded.
#[derive(Debug, Clone)]
pub struct ExitWatch(watch::Receiver<WorkerState>);

impl ExitWatch {
    /// `None` only if the monitor went away without recording an exit
    /// (runtime shutdown).
    pub async fn wait(mut self) -> Option<ExitObservation> {
        match self.0.wait_for(WorkerState::is_exited).await {
            Ok(state) => state.exit(),
            Err(_) => None,
        }
    }
}

/// Stop the worker through its session, then wait for the process to exit.
///
/// Never fails. When the session cannot stop and the worker is still
/// running, the worker is left alone and `None` is returned.
pub async fn stop_worker<S: ProtocolSession>(
    session: S,
    worker: WorkerHandle,
) -> Option<ExitObservation> {
    worker.mark_stopping();
    match session.stop().await {
        Ok(()) => worker.wait_for_exit().await,
        Err(e) => {
            if let Some(exit) = worker.exit() {
                tracing::debug!("session stop after worker exit: {e:#}");
                Some(exit)
            } else {
                tracing::warn!(
                    pid = worker.pid(),
                    "session stop failed, worker left running: {e:#}"
                );
                None
            }
        }
    }
}

struct ExitMonitor {
    forwarder: JoinHandle<()>,
    kill: oneshot::Receiver<()>,
    stopping: Arc<AtomicBool>,
    state: watch::Sender<WorkerState>,
    log: LogSink,
}

async fn observe_exit(mut child: Child, monitor: ExitMonitor) {
    let ExitMonitor {
        mut forwarder,
        kill,
        stopping,
        state,
        log,
    } = monitor;

    let waited = tokio::select! {
        waited = child.wait() => waited,
        Ok(()) = kill => {
            tracing::debug!(pid = child.id(), "killing worker");
            if let Err(e) = child.kill().await {
                tracing::warn!(error = %e, "failed to kill worker");
            }
            child.wait().await
        }
    };

    // stderr lines should land before the exit line, but the exit is
    // recorded whether or not the pipe closes.
    match time::timeout(STDERR_DRAIN_GRACE, &mut forwarder).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::debug!(error = %e, "stderr forwarder ended abnormally"),
        Err(_) => tracing::debug!("worker stderr still open after exit, forwarding continues"),
    }

    let observation = match waited {
        Ok(status) => ExitObservation::from_status(status),
        Err(e) => {
            tracing::warn!(error = %e, "failed to collect worker exit status");
            ExitObservation::default()
        }
    };

    if stopping.load(Ordering::Acquire) || observation.is_clean() {
        tracing::info!(%observation, "worker exited");
        log.append_line(format!("Worker exited with {observation}"));
    } else {
        tracing::warn!(%observation, "worker exited unexpectedly");
        log.append_line(format!("Worker exited unexpectedly with {observation}"));
    }

    state.send_replace(WorkerState::Exited(observation));
}

async fn forward_stderr<R: AsyncRead + Unpin>(mut stderr: R, log: LogSink) {
    let mut buf = vec![0u8; STDERR_CHUNK_BYTES];
    let mut pending = Vec::new();
    loop {
        match stderr.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                let complete = complete_utf8_len(&pending);
                if complete > 0 {
                    log.append_error(&String::from_utf8_lossy(&pending[..complete]));
                    pending.drain(..complete);
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "worker stderr read failed");
                break;
            }
        }
    }
    if !pending.is_empty() {
        log.append_error(&String::from_utf8_lossy(&pending));
    }
}

/// Length of `bytes` without a trailing, possibly split, UTF-8 sequence.
/// Invalid bytes elsewhere are left for lossy decoding.
fn complete_utf8_len(bytes: &[u8]) -> usize {
    match str::from_utf8(bytes) {
        Ok(_) => bytes.len(),
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        Err(_) => bytes.len(),
    }
}
