//! Errors raised while provisioning the environment and starting the worker.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::types::ExitObservation;

/// A provisioning step failed. The worker must not be started afterwards.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("`{command}` failed ({status})")]
    CommandFailed {
        command: String,
        status: ExitObservation,
    },
    #[error("`{program}` not found in PATH")]
    ProgramNotFound {
        program: String,
        #[source]
        source: which::Error,
    },
    #[error("failed to start `{command}`")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("failed waiting for `{command}`")]
    Wait {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("`{command}` did not finish within {}s", after.as_secs())]
    TimedOut { command: String, after: Duration },
    #[error("failed to inspect {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ProvisionError {
    /// Exit code of the failing command, when it exited with one.
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::CommandFailed { status, .. } => status.code(),
            _ => None,
        }
    }
}

/// The worker process could not be launched. Never retried.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("worker interpreter {} not found", program.display())]
    NotFound {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("permission denied launching {}", program.display())]
    PermissionDenied {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to launch {}", program.display())]
    Io {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("worker {0} was not captured")]
    MissingPipe(&'static str),
}

impl SpawnError {
    pub(crate) fn from_io(program: &Path, source: io::Error) -> Self {
        let program = program.to_path_buf();
        match source.kind() {
            io::ErrorKind::NotFound => Self::NotFound { program, source },
            io::ErrorKind::PermissionDenied => Self::PermissionDenied { program, source },
            _ => Self::Io { program, source },
        }
    }
}

/// Activation aborted. Nothing is left running when this is returned.
#[derive(Debug, Error)]
pub enum ActivationError {
    #[error("provisioning failed: {0}")]
    Provision(#[from] ProvisionError),
    #[error("worker failed to start: {0}")]
    Spawn(#[from] SpawnError),
    #[error("protocol session failed to start: {0:#}")]
    Session(anyhow::Error),
}
