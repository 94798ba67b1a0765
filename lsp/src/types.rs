//! Public types shared by the provisioner, the supervisor and the host lifecycle.
//!
//! Everything here is plain data: no IO, no async. [`ServerConfig`] is the
//! deserialized `[server]` table; the [`EnvironmentDescriptor`] is derived from
//! it together with the host [`Platform`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::Duration;

use globset::{Glob, GlobMatcher};
use serde::Deserialize;

/// Interpreter used to create the environment when none is configured.
pub const DEFAULT_BASE_INTERPRETER: &str = "python";

/// Environment directory name under the extension root.
pub const DEFAULT_ENV_DIR: &str = ".venv";

/// Worker script, relative to the extension root.
pub const DEFAULT_WORKER_SCRIPT: &str = "server/pineapple-lsp.py";

/// Platform family. Only decides where the interpreter lives inside the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    /// `Scripts/python.exe`
    Windows,
    /// `bin/python`
    Unix,
}

impl Platform {
    /// Platform family of the running host.
    #[must_use]
    pub const fn current() -> Self {
        if cfg!(windows) {
            Self::Windows
        } else {
            Self::Unix
        }
    }

    /// Interpreter location relative to the environment root.
    #[must_use]
    pub fn interpreter_relative(self) -> PathBuf {
        match self {
            Self::Windows => Path::new("Scripts").join("python.exe"),
            Self::Unix => Path::new("bin").join("python"),
        }
    }
}

/// Interpreter path for an environment rooted at `root`.
///
/// Pure: the same root and platform always give the same path.
#[must_use]
pub fn interpreter_path(root: &Path, platform: Platform) -> PathBuf {
    root.join(platform.interpreter_relative())
}

/// A package pinned to one exact version. No range resolution.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PinnedPackage {
    pub name: String,
    pub version: String,
}

impl PinnedPackage {
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }

    /// Requirement specifier as pip expects it, e.g. `pygls==2.0.0a6`.
    #[must_use]
    pub fn requirement(&self) -> String {
        format!("{}=={}", self.name, self.version)
    }
}

/// Packages the worker needs, in install order.
#[must_use]
pub fn default_packages() -> Vec<PinnedPackage> {
    vec![PinnedPackage::new("pygls", "2.0.0a6")]
}

/// Where the environment lives and what it must contain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentDescriptor {
    root: PathBuf,
    interpreter: PathBuf,
    packages: Vec<PinnedPackage>,
}

impl EnvironmentDescriptor {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, platform: Platform, packages: Vec<PinnedPackage>) -> Self {
        let root = root.into();
        let interpreter = interpreter_path(&root, platform);
        Self {
            root,
            interpreter,
            packages,
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn interpreter(&self) -> &Path {
        &self.interpreter
    }

    #[must_use]
    pub fn packages(&self) -> &[PinnedPackage] {
        &self.packages
    }
}

/// How a process ended: exit code, terminating signal, or neither when the
/// status could not be collected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitObservation {
    code: Option<i32>,
    signal: Option<i32>,
}

impl ExitObservation {
    #[must_use]
    pub const fn new(code: Option<i32>, signal: Option<i32>) -> Self {
        Self { code, signal }
    }

    #[must_use]
    pub fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }

    #[must_use]
    pub fn code(&self) -> Option<i32> {
        self.code
    }

    #[must_use]
    pub fn signal(&self) -> Option<i32> {
        self.signal
    }

    /// Conventional name of the terminating signal, e.g. `SIGKILL`.
    #[must_use]
    pub fn signal_name(&self) -> Option<&'static str> {
        self.signal.and_then(signal_name)
    }

    /// Exit code 0 and no signal.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.code == Some(0) && self.signal.is_none()
    }
}

impl fmt::Display for ExitObservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "code {code}")?,
            None => f.write_str("code none")?,
        }
        match (self.signal, self.signal_name()) {
            (_, Some(name)) => write!(f, ", signal {name}"),
            (Some(signal), None) => write!(f, ", signal {signal}"),
            (None, None) => f.write_str(", signal none"),
        }
    }
}

// Numbers shared by Linux and the BSDs.
fn signal_name(signal: i32) -> Option<&'static str> {
    let name = match signal {
        1 => "SIGHUP",
        2 => "SIGINT",
        3 => "SIGQUIT",
        4 => "SIGILL",
        5 => "SIGTRAP",
        6 => "SIGABRT",
        8 => "SIGFPE",
        9 => "SIGKILL",
        11 => "SIGSEGV",
        13 => "SIGPIPE",
        14 => "SIGALRM",
        15 => "SIGTERM",
        _ => return None,
    };
    Some(name)
}

/// Lifecycle of one worker process. `Exited` is terminal: a worker is never
/// relaunched, a new one has to be started explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    NotStarted,
    Starting,
    Running,
    Exited(ExitObservation),
}

impl WorkerState {
    #[must_use]
    pub fn is_exited(&self) -> bool {
        matches!(self, Self::Exited(_))
    }

    #[must_use]
    pub fn exit(&self) -> Option<ExitObservation> {
        match self {
            Self::Exited(observation) => Some(*observation),
            Self::NotStarted | Self::Starting | Self::Running => None,
        }
    }
}

/// Whether a failed worker spawn is retried. Only `none` exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum SpawnRetry {
    #[default]
    #[serde(rename = "none")]
    Never,
}

/// Whether a crashed worker is relaunched. Only `never` exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum RestartPolicy {
    #[default]
    #[serde(rename = "never")]
    Never,
}

/// Timeouts and retry behaviour of the bootstrap.
///
/// ```toml
/// [server.policy]
/// provisioning_timeout_secs = 600
/// spawn_retry = "none"
/// crash_restart = "never"
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LifecyclePolicy {
    /// Per-command limit while provisioning. Unset means wait indefinitely.
    pub provisioning_timeout_secs: Option<u64>,
    pub spawn_retry: SpawnRetry,
    pub crash_restart: RestartPolicy,
}

impl LifecyclePolicy {
    #[must_use]
    pub fn provisioning_timeout(&self) -> Option<Duration> {
        self.provisioning_timeout_secs.map(Duration::from_secs)
    }
}

/// Documents that belong to the worker.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DocumentSelector {
    pub scheme: String,
    pub language: String,
    /// Glob for files the editor should watch, e.g. `**/*.pineapple`.
    pub file_glob: String,
}

impl Default for DocumentSelector {
    fn default() -> Self {
        Self {
            scheme: "file".to_string(),
            language: "pineapple".to_string(),
            file_glob: "**/*.pineapple".to_string(),
        }
    }
}

impl DocumentSelector {
    pub fn matcher(&self) -> Result<GlobMatcher, globset::Error> {
        Ok(Glob::new(&self.file_glob)?.compile_matcher())
    }
}

/// The `[server]` table of the configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Interpreter that creates the environment (resolved through `PATH`).
    pub base_interpreter: String,
    /// Environment root. Relative paths are taken from the extension root.
    /// Default: `<extension root>/.venv`.
    pub install_root: Option<PathBuf>,
    /// Worker script, relative to the extension root.
    pub worker_script: PathBuf,
    pub packages: Vec<PinnedPackage>,
    /// Mirror the worker's protocol stdout into the output channel. Debug aid only.
    pub debug_log_stdout: bool,
    pub policy: LifecyclePolicy,
    pub selector: DocumentSelector,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_interpreter: DEFAULT_BASE_INTERPRETER.to_string(),
            install_root: None,
            worker_script: PathBuf::from(DEFAULT_WORKER_SCRIPT),
            packages: default_packages(),
            debug_log_stdout: false,
            policy: LifecyclePolicy::default(),
            selector: DocumentSelector::default(),
        }
    }
}

impl ServerConfig {
    #[must_use]
    pub fn install_root_for(&self, extension_root: &Path) -> PathBuf {
        match &self.install_root {
            Some(root) => extension_root.join(root),
            None => extension_root.join(DEFAULT_ENV_DIR),
        }
    }

    #[must_use]
    pub fn worker_script_for(&self, extension_root: &Path) -> PathBuf {
        extension_root.join(&self.worker_script)
    }

    #[must_use]
    pub fn environment(&self, extension_root: &Path, platform: Platform) -> EnvironmentDescriptor {
        EnvironmentDescriptor::new(
            self.install_root_for(extension_root),
            platform,
            self.packages.clone(),
        )
    }
}
