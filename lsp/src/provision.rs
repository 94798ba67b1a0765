//! Environment provisioning.
//!
//! [`Provisioner::ensure_environment`] makes sure an isolated interpreter with
//! the worker's pinned packages exists before anything is spawned:
//!
//! 1. `<base> -m venv <root>` when the interpreter is missing
//! 2. `<interpreter> -m pip install --upgrade pip`
//! 3. `<interpreter> -m pip install <name>==<version>...`
//!
//! Steps 2 and 3 run on every call. Installed versions are not inspected, pip
//! is simply asked again. Commands run one after another and the first
//! failure aborts the rest.

use std::ffi::OsString;
use std::fmt;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::{fs, time};

use crate::error::ProvisionError;
use crate::process::hide_window;
use crate::types::{EnvironmentDescriptor, ExitObservation, PinnedPackage, Platform};

/// Notice shown while the environment is created for the first time.
pub const CREATING_NOTICE: &str = "Creating Python venv for pineapple-lsp...";

/// One external command, spawned from an argument vector (never through a shell).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionCommand {
    program: PathBuf,
    args: Vec<OsString>,
}

impl ProvisionCommand {
    pub fn new<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// `<base> -m venv <root>`
    #[must_use]
    pub fn create_environment(base_interpreter: &Path, root: &Path) -> Self {
        Self::new(
            base_interpreter,
            [
                OsString::from("-m"),
                OsString::from("venv"),
                root.as_os_str().to_owned(),
            ],
        )
    }

    /// `<interpreter> -m pip install --upgrade pip`
    #[must_use]
    pub fn upgrade_installer(interpreter: &Path) -> Self {
        Self::new(interpreter, ["-m", "pip", "install", "--upgrade", "pip"])
    }

    /// `<interpreter> -m pip install <requirement>...`
    #[must_use]
    pub fn install_packages(interpreter: &Path, packages: &[PinnedPackage]) -> Self {
        let requirements = packages.iter().map(PinnedPackage::requirement);
        Self::new(
            interpreter,
            ["-m", "pip", "install"]
                .into_iter()
                .map(String::from)
                .chain(requirements),
        )
    }

    #[must_use]
    pub fn program(&self) -> &Path {
        &self.program
    }

    #[must_use]
    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    /// Whether this is the environment-creation step.
    #[must_use]
    pub fn is_create_environment(&self) -> bool {
        self.args.get(..2) == Some(&[OsString::from("-m"), OsString::from("venv")][..])
    }
}

impl fmt::Display for ProvisionCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Runs provisioning commands to completion.
///
/// [`SystemRunner`] spawns real processes; tests substitute a recorder.
pub trait CommandRunner: Send + Sync {
    fn run(
        &self,
        command: &ProvisionCommand,
    ) -> impl Future<Output = Result<(), ProvisionError>> + Send;
}

/// Where provisioning children write their standard output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProvisionOutput {
    /// Children share the host's stdio, so the user sees installer output directly.
    #[default]
    Inherit,
    /// stdout goes to the host's stderr and stdin is closed. For hosts whose
    /// own stdout is a protocol stream.
    Stderr,
}

/// Spawns provisioning commands as real child processes.
#[derive(Debug, Clone, Default)]
pub struct SystemRunner {
    output: ProvisionOutput,
    timeout: Option<Duration>,
}

impl SystemRunner {
    #[must_use]
    pub fn new(output: ProvisionOutput, timeout: Option<Duration>) -> Self {
        Self { output, timeout }
    }

    fn command(&self, program: &Path, args: &[OsString]) -> Command {
        let mut cmd = Command::new(program);
        cmd.args(args).kill_on_drop(true);
        match self.output {
            ProvisionOutput::Inherit => {
                cmd.stdin(Stdio::inherit())
                    .stdout(Stdio::inherit())
                    .stderr(Stdio::inherit());
            }
            ProvisionOutput::Stderr => {
                cmd.stdin(Stdio::null())
                    .stdout(Stdio::from(io::stderr()))
                    .stderr(Stdio::inherit());
            }
        }
        hide_window(&mut cmd);
        cmd
    }
}

impl CommandRunner for SystemRunner {
    async fn run(&self, command: &ProvisionCommand) -> Result<(), ProvisionError> {
        let label = command.to_string();
        let program =
            which::which(command.program()).map_err(|source| ProvisionError::ProgramNotFound {
                program: command.program().display().to_string(),
                source,
            })?;

        tracing::info!(command = %label, "running provisioning command");
        let mut child = self
            .command(&program, command.args())
            .spawn()
            .map_err(|source| ProvisionError::Spawn {
                command: label.clone(),
                source,
            })?;

        let waited = match self.timeout {
            Some(after) => match time::timeout(after, child.wait()).await {
                Ok(waited) => waited,
                Err(_) => {
                    tracing::warn!(command = %label, ?after, "provisioning command timed out");
                    let _ = child.kill().await;
                    return Err(ProvisionError::TimedOut {
                        command: label,
                        after,
                    });
                }
            },
            None => child.wait().await,
        };
        let status = waited.map_err(|source| ProvisionError::Wait {
            command: label.clone(),
            source,
        })?;

        let status = ExitObservation::from_status(status);
        if status.is_clean() {
            tracing::debug!(command = %label, "provisioning command finished");
            Ok(())
        } else {
            tracing::warn!(command = %label, %status, "provisioning command failed");
            Err(ProvisionError::CommandFailed {
                command: label,
                status,
            })
        }
    }
}

type Notifier = Box<dyn Fn(&str) + Send + Sync>;

/// Creates and maintains the worker's interpreter environment.
pub struct Provisioner<R = SystemRunner> {
    runner: R,
    base_interpreter: PathBuf,
    platform: Platform,
    packages: Vec<PinnedPackage>,
    notifier: Notifier,
}

impl<R: CommandRunner> Provisioner<R> {
    pub fn new(runner: R, base_interpreter: impl Into<PathBuf>, packages: Vec<PinnedPackage>) -> Self {
        Self {
            runner,
            base_interpreter: base_interpreter.into(),
            platform: Platform::current(),
            packages,
            notifier: Box::new(|message| tracing::info!("{message}")),
        }
    }

    /// Override the platform layout. Defaults to the host's.
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    /// Where the one-off creation notice goes. Defaults to the log.
    pub fn on_notice(mut self, notifier: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.notifier = Box::new(notifier);
        self
    }

    #[must_use]
    pub fn runner(&self) -> &R {
        &self.runner
    }

    #[must_use]
    pub fn descriptor(&self, install_root: &Path) -> EnvironmentDescriptor {
        EnvironmentDescriptor::new(install_root, self.platform, self.packages.clone())
    }

    /// Ensure the environment under `install_root` is ready and return its interpreter.
    pub async fn ensure_environment(&self, install_root: &Path) -> Result<PathBuf, ProvisionError> {
        let env = self.descriptor(install_root);
        let interpreter = env.interpreter();

        let present = fs::try_exists(interpreter)
            .await
            .map_err(|source| ProvisionError::Io {
                path: interpreter.to_path_buf(),
                source,
            })?;

        if present {
            tracing::debug!(
                interpreter = %interpreter.display(),
                "environment present, skipping creation"
            );
        } else {
            (self.notifier)(CREATING_NOTICE);
            self.runner
                .run(&ProvisionCommand::create_environment(
                    &self.base_interpreter,
                    env.root(),
                ))
                .await?;
        }

        self.runner
            .run(&ProvisionCommand::upgrade_installer(interpreter))
            .await?;
        if !env.packages().is_empty() {
            self.runner
                .run(&ProvisionCommand::install_packages(
                    interpreter,
                    env.packages(),
                ))
                .await?;
        }

        tracing::info!(interpreter = %interpreter.display(), "environment ready");
        Ok(interpreter.to_path_buf())
    }
}

impl<R: fmt::Debug> fmt::Debug for Provisioner<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provisioner")
            .field("runner", &self.runner)
            .field("base_interpreter", &self.base_interpreter)
            .field("platform", &self.platform)
            .field("packages", &self.packages)
            .finish_non_exhaustive()
    }
}
