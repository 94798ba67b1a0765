//! Host-facing entry points.
//!
//! The editor decides when `activate` and `deactivate` run; [`Extension`] only
//! guarantees that the transitions between not started, running and stopped
//! are idempotent and serialized. The session handle lives in the extension's
//! state and is threaded through to the stop path, never in a global.

use std::mem;
use std::path::{Path, PathBuf};

use globset::GlobMatcher;
use tokio::sync::Mutex;

use crate::error::ActivationError;
use crate::log_sink::LogSink;
use crate::provision::{CommandRunner, ProvisionOutput, Provisioner, SystemRunner};
use crate::session::SessionFactory;
use crate::supervisor::{ExitWatch, Supervisor, WorkerHandle, WorkerSpec, stop_worker};
use crate::types::{DocumentSelector, ExitObservation, ServerConfig, WorkerState};

/// Name of the user-visible output channel.
pub const OUTPUT_CHANNEL: &str = "Pineapple LSP";

enum ExtensionState<S> {
    NotStarted,
    Running { worker: WorkerHandle, session: S },
    Stopped,
}

/// Provision → spawn → connect on activation; stop through the session on
/// deactivation.
pub struct Extension<F: SessionFactory, R = SystemRunner> {
    extension_root: PathBuf,
    install_root: PathBuf,
    worker_script: PathBuf,
    provisioner: Provisioner<R>,
    supervisor: Supervisor,
    factory: F,
    selector: DocumentSelector,
    matcher: GlobMatcher,
    state: Mutex<ExtensionState<F::Session>>,
}

impl<F: SessionFactory> Extension<F, SystemRunner> {
    /// Extension whose provisioning commands share the host's stdio.
    pub fn new(
        config: &ServerConfig,
        extension_root: impl Into<PathBuf>,
        log: LogSink,
        factory: F,
    ) -> Result<Self, globset::Error> {
        let runner = SystemRunner::new(
            ProvisionOutput::Inherit,
            config.policy.provisioning_timeout(),
        );
        Self::with_runner(config, extension_root, log, factory, runner)
    }
}

impl<F: SessionFactory, R: CommandRunner> Extension<F, R> {
    pub fn with_runner(
        config: &ServerConfig,
        extension_root: impl Into<PathBuf>,
        log: LogSink,
        factory: F,
        runner: R,
    ) -> Result<Self, globset::Error> {
        let provisioner = Provisioner::new(
            runner,
            config.base_interpreter.as_str(),
            config.packages.clone(),
        );
        Self::with_provisioner(config, extension_root, log, factory, provisioner)
    }

    /// Full control over provisioning (platform, notice handling).
    pub fn with_provisioner(
        config: &ServerConfig,
        extension_root: impl Into<PathBuf>,
        log: LogSink,
        factory: F,
        provisioner: Provisioner<R>,
    ) -> Result<Self, globset::Error> {
        let extension_root = extension_root.into();
        let matcher = config.selector.matcher()?;
        Ok(Self {
            install_root: config.install_root_for(&extension_root),
            worker_script: config.worker_script_for(&extension_root),
            extension_root,
            provisioner,
            supervisor: Supervisor::new(log).mirror_stdout(config.debug_log_stdout),
            factory,
            selector: config.selector.clone(),
            matcher,
            state: Mutex::new(ExtensionState::NotStarted),
        })
    }

    #[must_use]
    pub fn log(&self) -> &LogSink {
        self.supervisor.log()
    }

    #[must_use]
    pub fn install_root(&self) -> &Path {
        &self.install_root
    }

    #[must_use]
    pub fn worker_script(&self) -> &Path {
        &self.worker_script
    }

    /// Whether opening the file at `path` should activate the extension.
    #[must_use]
    pub fn handles(&self, path: &Path) -> bool {
        self.handles_document(&self.selector.scheme, &self.selector.language, path)
    }

    /// Whether a document the editor opened belongs to the worker: the URI
    /// scheme must match, then either the language id or the file glob.
    #[must_use]
    pub fn handles_document(&self, scheme: &str, language_id: &str, path: &Path) -> bool {
        scheme == self.selector.scheme
            && (language_id == self.selector.language || self.matcher.is_match(path))
    }

    /// Provision the environment, start the worker and connect the session.
    ///
    /// Does nothing while the worker is running. A worker that has since
    /// exited is stopped through its session first and a new one is started;
    /// this is the host asking again, never an automatic restart. On any
    /// failure nothing is left running: a worker whose session could not
    /// connect is killed.
    pub async fn activate(&self) -> Result<(), ActivationError> {
        let mut state = self.state.lock().await;
        let running = match &*state {
            ExtensionState::Running { worker, .. } => Some(worker.state().is_exited()),
            ExtensionState::NotStarted | ExtensionState::Stopped => None,
        };
        match running {
            Some(false) => {
                tracing::debug!("already active");
                return Ok(());
            }
            Some(true) => {
                if let ExtensionState::Running { worker, session } =
                    mem::replace(&mut *state, ExtensionState::Stopped)
                {
                    let exit = stop_worker(session, worker).await;
                    tracing::info!(?exit, "previous worker had exited, starting a new one");
                }
            }
            None => {}
        }

        let interpreter = match self.provisioner.ensure_environment(&self.install_root).await {
            Ok(interpreter) => interpreter,
            Err(e) => {
                self.log().append_line(format!("Provisioning failed: {e}"));
                return Err(e.into());
            }
        };

        let spec = WorkerSpec::new(
            interpreter,
            self.worker_script.clone(),
            self.extension_root.clone(),
        );
        let (worker, transport) = self.supervisor.start_worker(&spec)?;

        let session = match self.factory.connect(transport).await {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!("protocol session failed to connect: {e:#}");
                worker.kill().await;
                return Err(ActivationError::Session(e));
            }
        };

        *state = ExtensionState::Running { worker, session };
        tracing::info!("extension activated");
        Ok(())
    }

    /// Stop the worker through its session. Safe to call in any state;
    /// returns the worker's exit when one was running.
    pub async fn deactivate(&self) -> Option<ExitObservation> {
        let mut state = self.state.lock().await;
        match mem::replace(&mut *state, ExtensionState::Stopped) {
            ExtensionState::Running { worker, session } => {
                let exit = stop_worker(session, worker).await;
                tracing::info!(?exit, "extension deactivated");
                exit
            }
            ExtensionState::NotStarted => {
                *state = ExtensionState::NotStarted;
                None
            }
            ExtensionState::Stopped => None,
        }
    }

    /// State of the current worker, `NotStarted` when there is none.
    pub async fn worker_state(&self) -> WorkerState {
        match &*self.state.lock().await {
            ExtensionState::Running { worker, .. } => worker.state(),
            ExtensionState::NotStarted | ExtensionState::Stopped => WorkerState::NotStarted,
        }
    }

    /// Waiter for the current worker's exit, if a worker is running.
    pub async fn exit_watch(&self) -> Option<ExitWatch> {
        match &*self.state.lock().await {
            ExtensionState::Running { worker, .. } => Some(worker.exit_watch()),
            ExtensionState::NotStarted | ExtensionState::Stopped => None,
        }
    }
}
