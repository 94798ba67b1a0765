use std::path::Path;
use std::time::Duration;

use pineapple_lsp::{
    ExitObservation, LogSink, SpawnError, Supervisor, WorkerSpec, WorkerState, stop_worker,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time;

use crate::common::{BrokenSession, NoopSession, write_script};

const SH: &str = "/bin/sh";

fn exited_lines(log: &LogSink) -> Vec<String> {
    log.lines()
        .into_iter()
        .filter(|line| line.starts_with("Worker exited"))
        .collect()
}

fn sh_worker(dir: &Path, body: &str) -> WorkerSpec {
    let script = write_script(dir, "worker.sh", body);
    WorkerSpec::new(SH, script, dir)
}

// ── Transport ───────────────────────────────────────────────────────────

#[tokio::test]
async fn transport_is_byte_exact_and_free_of_stderr() {
    let dir = tempfile::tempdir().unwrap();
    let log = LogSink::new("out");
    let spec = sh_worker(dir.path(), "printf 'noise on stderr\\n' >&2\nexec cat\n");

    let (worker, transport) = Supervisor::new(log.clone()).start_worker(&spec).unwrap();
    let (mut reader, mut writer) = transport.into_split();

    let payload: Vec<u8> = (0..64 * 1024u32)
        .map(|i| u8::try_from(i % 251).unwrap())
        .collect();
    let sent = payload.clone();
    let feeder = tokio::spawn(async move {
        writer.write_all(&sent).await.unwrap();
        writer.shutdown().await.unwrap();
    });

    let mut echoed = Vec::new();
    reader.read_to_end(&mut echoed).await.unwrap();
    feeder.await.unwrap();

    assert_eq!(echoed.len(), payload.len());
    assert!(echoed == payload, "echoed bytes differ from what was written");

    let exit = worker.wait_for_exit().await.unwrap();
    assert_eq!(exit, ExitObservation::new(Some(0), None));
    assert!(log.lines().contains(&"ERROR: noise on stderr".to_string()));
}

#[tokio::test]
async fn stdout_is_not_logged_by_default() {
    let dir = tempfile::tempdir().unwrap();
    let log = LogSink::new("out");
    let spec = sh_worker(dir.path(), "printf 'protocol bytes\\n'\n");

    let (worker, transport) = Supervisor::new(log.clone()).start_worker(&spec).unwrap();
    let (mut reader, _writer) = transport.into_split();
    let mut out = Vec::new();
    reader.read_to_end(&mut out).await.unwrap();
    worker.wait_for_exit().await;

    assert_eq!(out, b"protocol bytes\n");
    assert!(!log.lines().iter().any(|line| line.contains("protocol bytes")));
}

#[tokio::test]
async fn stdout_mirror_logs_protocol_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let log = LogSink::new("out");
    let spec = sh_worker(dir.path(), "printf 'hello\\n'\n");

    let supervisor = Supervisor::new(log.clone()).mirror_stdout(true);
    let (worker, transport) = supervisor.start_worker(&spec).unwrap();
    let (mut reader, _writer) = transport.into_split();
    let mut out = Vec::new();
    reader.read_to_end(&mut out).await.unwrap();
    worker.wait_for_exit().await;

    assert_eq!(out, b"hello\n");
    assert!(log.lines().contains(&"hello".to_string()));
}

// ── Exit observation ────────────────────────────────────────────────────

#[tokio::test]
async fn exit_code_is_recorded_with_one_lifecycle_line() {
    let dir = tempfile::tempdir().unwrap();
    let log = LogSink::new("out");
    let spec = sh_worker(dir.path(), "exit 7\n");

    let (worker, _transport) = Supervisor::new(log.clone()).start_worker(&spec).unwrap();
    let exit = worker.wait_for_exit().await.unwrap();

    assert_eq!(exit.code(), Some(7));
    assert_eq!(exit.signal(), None);
    assert_eq!(worker.state(), WorkerState::Exited(exit));

    let exited = exited_lines(&log);
    assert_eq!(exited.len(), 1);
    assert_eq!(exited[0], "Worker exited unexpectedly with code 7, signal none");
}

#[tokio::test]
async fn exit_is_recorded_while_grandchild_holds_stderr() {
    let dir = tempfile::tempdir().unwrap();
    let log = LogSink::new("out");
    // The background sleep inherits the worker's stdout and stderr.
    let spec = sh_worker(dir.path(), "sleep 3 &\nexit 7\n");

    let (worker, _transport) = Supervisor::new(log.clone()).start_worker(&spec).unwrap();
    let exit = time::timeout(Duration::from_secs(2), worker.wait_for_exit())
        .await
        .expect("exit not recorded while stderr stayed open")
        .unwrap();

    assert_eq!(exit, ExitObservation::new(Some(7), None));
    assert_eq!(worker.state(), WorkerState::Exited(exit));
    assert_eq!(
        exited_lines(&log),
        vec!["Worker exited unexpectedly with code 7, signal none"]
    );
}

#[tokio::test]
async fn stop_after_exit_reports_recorded_exit() {
    let dir = tempfile::tempdir().unwrap();
    let log = LogSink::new("out");
    let spec = sh_worker(dir.path(), "exit 7\n");

    let (worker, transport) = Supervisor::new(log.clone()).start_worker(&spec).unwrap();
    worker.wait_for_exit().await;
    drop(transport);

    let exit = stop_worker(BrokenSession, worker).await;
    assert_eq!(exit, Some(ExitObservation::new(Some(7), None)));
    assert_eq!(exited_lines(&log).len(), 1);
}

#[tokio::test]
async fn clean_stop_waits_for_exit() {
    let dir = tempfile::tempdir().unwrap();
    let log = LogSink::new("out");
    let spec = sh_worker(dir.path(), "exec cat\n");

    let (worker, transport) = Supervisor::new(log.clone()).start_worker(&spec).unwrap();
    // Closing stdin is what ends `cat`.
    drop(transport);

    let exit = stop_worker(NoopSession, worker).await;
    assert_eq!(exit, Some(ExitObservation::new(Some(0), None)));
    assert_eq!(exited_lines(&log), vec!["Worker exited with code 0, signal none"]);
}

#[tokio::test]
async fn kill_records_signal() {
    let dir = tempfile::tempdir().unwrap();
    let log = LogSink::new("out");
    let spec = sh_worker(dir.path(), "exec sleep 30\n");

    let (worker, _transport) = Supervisor::new(log.clone()).start_worker(&spec).unwrap();
    let exit = worker.kill().await.unwrap();

    assert_eq!(exit.code(), None);
    assert_eq!(exit.signal(), Some(9));
    assert_eq!(exited_lines(&log), vec!["Worker exited with code none, signal SIGKILL"]);
}

#[tokio::test]
async fn exited_worker_is_never_restarted() {
    let dir = tempfile::tempdir().unwrap();
    let log = LogSink::new("out");
    let spec = sh_worker(dir.path(), "exit 1\n");

    let (worker, _transport) = Supervisor::new(log.clone()).start_worker(&spec).unwrap();
    worker.wait_for_exit().await;
    time::sleep(Duration::from_millis(200)).await;

    let started = log
        .lines()
        .iter()
        .filter(|line| line.starts_with("Worker started"))
        .count();
    assert_eq!(started, 1);
    assert!(worker.state().is_exited());
}

// ── Spawn failures ──────────────────────────────────────────────────────

#[tokio::test]
async fn missing_interpreter_fails_without_retry() {
    let dir = tempfile::tempdir().unwrap();
    let log = LogSink::new("out");
    let spec = WorkerSpec::new(dir.path().join("bin/python"), "worker.sh", dir.path());

    let err = Supervisor::new(log.clone()).start_worker(&spec).unwrap_err();

    assert!(matches!(err, SpawnError::NotFound { .. }));
    assert_eq!(log.len(), 1);
    assert!(exited_lines(&log).is_empty());
}
