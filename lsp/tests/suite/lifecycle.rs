use std::path::Path;

use pineapple_lsp::{
    ActivationError, Extension, ExitObservation, LogSink, OUTPUT_CHANNEL, ServerConfig,
    WorkerState,
};

use crate::common::{EchoFactory, Events, RecordingRunner, events, snapshot, write_script};

const WORKER_SCRIPT: &str = "server/pineapple-lsp.py";

fn extension(
    root: &Path,
    factory: EchoFactory,
    runner: RecordingRunner,
) -> Extension<EchoFactory, RecordingRunner> {
    Extension::with_runner(
        &ServerConfig::default(),
        root,
        LogSink::new(OUTPUT_CHANNEL),
        factory,
        runner,
    )
    .unwrap()
}

fn echo_extension(root: &Path, events: &Events) -> Extension<EchoFactory, RecordingRunner> {
    extension(
        root,
        EchoFactory::new(events.clone()),
        RecordingRunner::new(events.clone()),
    )
}

fn count(events: &Events, needle: &str) -> usize {
    snapshot(events)
        .iter()
        .filter(|event| event.contains(needle))
        .count()
}

fn exited_lines(log: &LogSink) -> Vec<String> {
    log.lines()
        .into_iter()
        .filter(|line| line.starts_with("Worker exited"))
        .collect()
}

// ── Activation ──────────────────────────────────────────────────────────

#[tokio::test]
async fn activate_echoes_payload_and_deactivates_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write_script(root, WORKER_SCRIPT, "pwd -P >&2\nexec cat\n");
    let events = events();
    let ext = echo_extension(root, &events);

    ext.activate().await.unwrap();
    assert_eq!(ext.worker_state().await, WorkerState::Running);

    let exit = ext.deactivate().await;
    assert_eq!(exit, Some(ExitObservation::new(Some(0), None)));
    assert_eq!(ext.worker_state().await, WorkerState::NotStarted);

    let cwd = root.canonicalize().unwrap();
    let lines = ext.log().lines();
    assert!(lines.contains(&format!("ERROR: {}", cwd.display())));
    assert_eq!(exited_lines(ext.log()), vec!["Worker exited with code 0, signal none"]);
}

#[tokio::test]
async fn provisioning_runs_before_connect_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write_script(root, WORKER_SCRIPT, "exec cat\n");
    let events = events();
    let ext = echo_extension(root, &events);

    ext.activate().await.unwrap();
    ext.deactivate().await;

    let install_root = root.join(".venv");
    let interpreter = install_root.join("bin").join("python");
    assert_eq!(
        snapshot(&events),
        vec![
            format!("python -m venv {}", install_root.display()),
            format!("{} -m pip install --upgrade pip", interpreter.display()),
            format!("{} -m pip install pygls==2.0.0a6", interpreter.display()),
            "connect".to_string(),
        ]
    );
}

#[tokio::test]
async fn provisioning_failure_aborts_startup() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write_script(root, WORKER_SCRIPT, "exec cat\n");
    let events = events();
    let ext = extension(
        root,
        EchoFactory::new(events.clone()),
        RecordingRunner::failing_install(events.clone()),
    );

    let err = ext.activate().await.unwrap_err();

    match err {
        ActivationError::Provision(e) => assert_eq!(e.exit_code(), Some(1)),
        other => panic!("expected provisioning error, got {other:?}"),
    }
    assert_eq!(count(&events, "connect"), 0);
    assert_eq!(ext.worker_state().await, WorkerState::NotStarted);
    assert!(ext.exit_watch().await.is_none());

    let lines = ext.log().lines();
    assert!(lines.iter().any(|line| line.starts_with("Provisioning failed:")));
    assert!(!lines.iter().any(|line| line.starts_with("Worker started")));
}

#[tokio::test]
async fn activate_twice_starts_one_worker() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write_script(root, WORKER_SCRIPT, "exec cat\n");
    let events = events();
    let ext = echo_extension(root, &events);

    ext.activate().await.unwrap();
    ext.activate().await.unwrap();

    assert_eq!(count(&events, "connect"), 1);
    assert_eq!(count(&events, "pip install --upgrade pip"), 1);
    ext.deactivate().await;
}

#[tokio::test]
async fn reactivation_reuses_environment() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write_script(root, WORKER_SCRIPT, "exec cat\n");
    let events = events();
    let ext = echo_extension(root, &events);

    ext.activate().await.unwrap();
    ext.deactivate().await;
    ext.activate().await.unwrap();
    let exit = ext.deactivate().await;

    assert_eq!(exit, Some(ExitObservation::new(Some(0), None)));
    assert_eq!(count(&events, " -m venv "), 1);
    assert_eq!(count(&events, "pip install --upgrade pip"), 2);
    assert_eq!(count(&events, "connect"), 2);
}

#[tokio::test]
async fn failed_connect_leaves_nothing_running() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write_script(root, WORKER_SCRIPT, "exec cat\n");
    let events = events();
    let ext = extension(
        root,
        EchoFactory::failing(events.clone()),
        RecordingRunner::new(events.clone()),
    );

    let err = ext.activate().await.unwrap_err();

    assert!(matches!(err, ActivationError::Session(_)));
    assert_eq!(ext.worker_state().await, WorkerState::NotStarted);
    assert_eq!(exited_lines(ext.log()).len(), 1);
    assert_eq!(ext.deactivate().await, None);
}

// ── Deactivation ────────────────────────────────────────────────────────

#[tokio::test]
async fn deactivate_without_activate_is_noop() {
    let dir = tempfile::tempdir().unwrap();
    let events = events();
    let ext = echo_extension(dir.path(), &events);

    assert_eq!(ext.deactivate().await, None);
    assert_eq!(ext.deactivate().await, None);
    assert!(snapshot(&events).is_empty());
    assert!(ext.log().is_empty());
}

#[tokio::test]
async fn deactivate_after_worker_exit_reports_exit() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    // Echo the handshake payload, then die on its own.
    write_script(root, WORKER_SCRIPT, "head -c 10\nexit 5\n");
    let events = events();
    let ext = echo_extension(root, &events);

    ext.activate().await.unwrap();
    let watch = ext.exit_watch().await.unwrap();
    let exit = watch.wait().await.unwrap();
    assert_eq!(exit.code(), Some(5));

    assert_eq!(ext.deactivate().await, Some(exit));
    assert_eq!(
        exited_lines(ext.log()),
        vec!["Worker exited unexpectedly with code 5, signal none"]
    );
}

#[tokio::test]
async fn activate_after_worker_exit_starts_a_new_worker() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write_script(root, WORKER_SCRIPT, "head -c 10\nexit 5\n");
    let events = events();
    let ext = echo_extension(root, &events);

    ext.activate().await.unwrap();
    let first = ext.exit_watch().await.unwrap().wait().await.unwrap();
    assert_eq!(first.code(), Some(5));

    ext.activate().await.unwrap();

    assert_eq!(count(&events, "connect"), 2);
    assert_eq!(count(&events, " -m venv "), 1);
    let started = ext
        .log()
        .lines()
        .iter()
        .filter(|line| line.starts_with("Worker started"))
        .count();
    assert_eq!(started, 2);

    let second = ext.exit_watch().await.unwrap().wait().await.unwrap();
    assert_eq!(second.code(), Some(5));
    assert_eq!(ext.deactivate().await, Some(second));
}

// ── Document selector ───────────────────────────────────────────────────

#[tokio::test]
async fn handles_only_pineapple_files() {
    let dir = tempfile::tempdir().unwrap();
    let ext = echo_extension(dir.path(), &events());

    assert!(ext.handles(Path::new("src/main.pineapple")));
    assert!(ext.handles(Path::new("main.pineapple")));
    assert!(!ext.handles(Path::new("README.md")));

    assert!(ext.handles_document("file", "pineapple", Path::new("untitled")));
    assert!(ext.handles_document("file", "plaintext", Path::new("a/b.pineapple")));
    assert!(!ext.handles_document("file", "python", Path::new("a/b.py")));
    assert!(!ext.handles_document("untitled", "pineapple", Path::new("b.pineapple")));
    assert_eq!(ext.worker_script(), dir.path().join(WORKER_SCRIPT));
    assert_eq!(ext.install_root(), dir.path().join(".venv"));
}
