//! `pineapple-lsp` - language server command for editors that launch servers
//! over stdio.
//!
//! ```text
//! editor ──stdin──▶ pineapple-lsp ──stdin──▶ python server/pineapple-lsp.py
//! editor ◀─stdout── pineapple-lsp ◀─stdout── (worker stderr → log file)
//! ```
//!
//! stdout belongs to the protocol. Logs go to `~/.pineapple/logs/`, and
//! provisioning output and notices go to stderr.

mod proxy;

use std::{
    env,
    error::Error,
    fs::{self, File, OpenOptions},
    future,
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Mutex,
    time::Duration,
};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio::{runtime, signal};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use pineapple_config::{PineappleConfig, config_dir};
use pineapple_lsp::{
    Extension, LogSink, OUTPUT_CHANNEL, Platform, ProvisionOutput, Provisioner, SystemRunner,
};
use proxy::ProxyFactory;

/// Blocking stdin reads can outlive the session; don't wait on them at exit.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

#[derive(Parser)]
#[command(name = "pineapple-lsp")]
#[command(about = "Provision and run the Pineapple language server")]
struct Cli {
    /// Configuration file (default: ~/.pineapple/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Directory holding the worker script and the environment (default: current directory)
    #[arg(long, global = true)]
    extension_root: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Default)]
enum Commands {
    /// Provision, start the worker and relay stdio until the editor disconnects
    #[default]
    Serve,
    /// Create or update the environment and print its interpreter
    Provision,
    /// Print the resolved environment layout without touching the filesystem
    Paths,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let (config, config_warning) = load_config(cli.config.as_deref());
    init_tracing(&config);
    if let Some(warning) = config_warning {
        tracing::warn!("{warning}");
        eprintln!("pineapple-lsp: {warning}, using defaults");
    }

    let runtime = match runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("pineapple-lsp: failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(run(cli, config));
    runtime.shutdown_timeout(SHUTDOWN_GRACE);

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            eprintln!("pineapple-lsp: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli, config: PineappleConfig) -> Result<()> {
    let extension_root = match cli.extension_root {
        Some(root) => root,
        None => env::current_dir().context("failed to resolve current directory")?,
    };

    match cli.command.unwrap_or_default() {
        Commands::Serve => serve(&config, extension_root).await,
        Commands::Provision => provision(&config, &extension_root).await,
        Commands::Paths => {
            paths(&config, &extension_root);
            Ok(())
        }
    }
}

fn provisioner(config: &PineappleConfig) -> Provisioner {
    let server = &config.server;
    let runner = SystemRunner::new(ProvisionOutput::Stderr, server.policy.provisioning_timeout());
    Provisioner::new(runner, server.base_interpreter.as_str(), server.packages.clone()).on_notice(
        |notice| {
            tracing::info!("{notice}");
            eprintln!("{notice}");
        },
    )
}

async fn serve(config: &PineappleConfig, extension_root: PathBuf) -> Result<()> {
    let factory = ProxyFactory::new();
    let host_closed = factory.host_closed();
    let extension = Extension::with_provisioner(
        &config.server,
        extension_root,
        LogSink::new(OUTPUT_CHANNEL),
        factory,
        provisioner(config),
    )
    .context("invalid document selector")?;

    extension.activate().await?;
    let Some(exit_watch) = extension.exit_watch().await else {
        bail!("worker is not running after activation");
    };

    tokio::select! {
        () = host_closed.notified() => tracing::info!("editor disconnected"),
        exit = exit_watch.wait() => tracing::info!(?exit, "worker exited"),
        () = interrupted() => tracing::info!("interrupted"),
    }

    if let Some(exit) = extension.deactivate().await {
        tracing::info!(%exit, "shut down");
    }
    Ok(())
}

async fn interrupted() {
    if let Err(e) = signal::ctrl_c().await {
        tracing::warn!("failed to listen for Ctrl-C: {e}");
        future::pending::<()>().await;
    }
}

async fn provision(config: &PineappleConfig, extension_root: &Path) -> Result<()> {
    let install_root = config.server.install_root_for(extension_root);
    let interpreter = provisioner(config)
        .ensure_environment(&install_root)
        .await?;
    println!("{}", interpreter.display());
    Ok(())
}

fn paths(config: &PineappleConfig, extension_root: &Path) {
    let env = config
        .server
        .environment(extension_root, Platform::current());
    println!("root: {}", env.root().display());
    println!("interpreter: {}", env.interpreter().display());
    println!(
        "worker_script: {}",
        config.server.worker_script_for(extension_root).display()
    );
    for package in env.packages() {
        println!("package: {}", package.requirement());
    }
}

fn load_config(path: Option<&Path>) -> (PineappleConfig, Option<String>) {
    let loaded = match path {
        Some(path) => PineappleConfig::load_from(path),
        None => PineappleConfig::load(),
    };
    match loaded {
        Ok(config) => (config.unwrap_or_default(), None),
        Err(e) => (
            PineappleConfig::default(),
            Some(format!("{e}: {}", error_source(&e))),
        ),
    }
}

fn error_source(e: &dyn Error) -> String {
    e.source().map(ToString::to_string).unwrap_or_default()
}

fn init_tracing(config: &PineappleConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.log_level().unwrap_or("info")))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let (log_file, init_warnings) = open_log_file(config.log_file());

    if let Some((log_path, file)) = log_file {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .with(env_filter)
            .init();

        tracing::info!(path = %log_path.display(), "Logging initialized");
        for warning in init_warnings {
            tracing::warn!("{warning}");
        }
        return;
    }

    // stdout is the protocol stream; no logs beats corrupt frames.
    tracing_subscriber::registry().with(env_filter).init();
}

fn open_log_file(configured: Option<&Path>) -> (Option<(PathBuf, File)>, Vec<String>) {
    let mut warnings = Vec::new();

    for candidate in log_file_candidates(configured) {
        if let Some(parent) = candidate.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            warnings.push(format!(
                "Failed to create log dir {}: {e}",
                parent.display()
            ));
            continue;
        }

        match OpenOptions::new().create(true).append(true).open(&candidate) {
            Ok(file) => return (Some((candidate, file)), warnings),
            Err(e) => {
                warnings.push(format!(
                    "Failed to open log file {}: {e}",
                    candidate.display()
                ));
            }
        }
    }

    (None, warnings)
}

fn log_file_candidates(configured: Option<&Path>) -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    if let Some(path) = configured {
        candidates.push(path.to_path_buf());
    }

    // ~/.pineapple/logs/pineapple.log
    if let Some(dir) = config_dir() {
        candidates.push(dir.join("logs").join("pineapple.log"));
    }

    // ./.pineapple/logs/pineapple.log
    candidates.push(PathBuf::from(".pineapple").join("logs").join("pineapple.log"));

    candidates
}
