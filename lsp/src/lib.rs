//! Client-side bootstrap for the Pineapple language server.
//!
//! Provisions an isolated Python environment for the worker, spawns the
//! worker with piped stdio, and hands its stdout/stdin to a protocol session
//! as one duplex stream. Worker stderr and lifecycle events go to a
//! user-visible [`LogSink`].

pub mod error;
pub mod types;

pub(crate) mod process;

mod lifecycle;
mod log_sink;
mod provision;
mod session;
mod supervisor;
mod transport;

pub use error::{ActivationError, ProvisionError, SpawnError};
pub use lifecycle::{Extension, OUTPUT_CHANNEL};
pub use log_sink::{ERROR_PREFIX, LogSink, OUTPUT_TARGET};
pub use provision::{
    CREATING_NOTICE, CommandRunner, ProvisionCommand, ProvisionOutput, Provisioner, SystemRunner,
};
pub use session::{ProtocolSession, SessionFactory};
pub use supervisor::{ExitWatch, Supervisor, WorkerHandle, WorkerSpec, stop_worker};
pub use transport::{StdoutTap, TransportHandle};
pub use types::{
    DocumentSelector, EnvironmentDescriptor, ExitObservation, LifecyclePolicy, PinnedPackage,
    Platform, RestartPolicy, ServerConfig, SpawnRetry, WorkerState, default_packages,
    interpreter_path,
};
