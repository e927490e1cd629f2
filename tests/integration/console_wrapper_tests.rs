//! End-to-end tests for the console wrapper against the reference worker.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;

use testhost_bridge::process::manager::WorkerEvent;
use testhost_bridge::protocol::message::{MessageLevel, TestProcessStartInfo};
use testhost_bridge::wrapper::ConsoleWrapper;
use testhost_bridge::{AppError, BridgeConfig};

use super::test_helpers::{sources, RecordingHandler, STEP_TIMEOUT};

const WORKER: &str = env!("CARGO_BIN_EXE_testhost-bridge-worker");

fn worker_config(args: &[&str]) -> BridgeConfig {
    let mut config = BridgeConfig::new(WORKER);
    config.worker_args = args.iter().map(|arg| (*arg).to_owned()).collect();
    config.connection_timeout_seconds = 10;
    config
}

async fn next_exit(rx: &mut mpsc::Receiver<WorkerEvent>) -> WorkerEvent {
    tokio::time::timeout(STEP_TIMEOUT, rx.recv())
        .await
        .expect("exit event in time")
        .expect("event channel open")
}

/// Discovery then a run of the discovered tests, then a clean shutdown.
#[tokio::test]
async fn discover_then_run_discovered_tests() {
    let (tx, mut rx) = mpsc::channel(8);
    let wrapper = ConsoleWrapper::new(worker_config(&[]), tx);

    let mut discovery = RecordingHandler::default();
    let result = wrapper
        .discover_tests(&sources(&["alpha.dll", "beta.dll"]), None, &mut discovery)
        .await
        .expect("discovery");

    assert_eq!(result.total_count, 2);
    assert!(!result.is_aborted);
    let found = discovery.discovered();
    assert_eq!(found.len(), 2);
    assert_eq!(found[0]["Source"], json!("alpha.dll"));
    assert_eq!(discovery.logs_at(MessageLevel::Informational).len(), 1);
    let first_pid = wrapper.worker_pid();
    assert!(first_pid.is_some());

    let mut run = RecordingHandler::default();
    let result = wrapper
        .run_tests_with_test_cases(&found, None, &mut run)
        .await
        .expect("run");

    assert!(!result.completion_args.is_aborted);
    assert!(!result.completion_args.is_canceled);
    assert_eq!(result.executor_uris.len(), 1);
    assert_eq!(run.kinds(), vec!["stats", "stats", "run_complete"]);
    assert_eq!(wrapper.worker_pid(), first_pid, "the session is reused");

    wrapper.end_session().await;
    let WorkerEvent::Exited { pid, .. } = next_exit(&mut rx).await;
    assert_eq!(pid, first_pid);

    wrapper.end_session().await;
}

/// Running by source with a custom host goes through the launcher.
#[tokio::test]
async fn run_with_custom_host_uses_launcher() {
    let (tx, _rx) = mpsc::channel(8);
    let wrapper = ConsoleWrapper::new(worker_config(&[]), tx);
    let calls = Arc::new(AtomicUsize::new(0));

    let mut launcher = {
        let calls = Arc::clone(&calls);
        move |info: &TestProcessStartInfo| -> testhost_bridge::Result<i32> {
            calls.fetch_add(1, Ordering::SeqCst);
            assert_eq!(info["FileName"], json!("testhost"));
            Ok(31337)
        }
    };

    let mut handler = RecordingHandler::default();
    let result = wrapper
        .run_tests_with_custom_host(&sources(&["alpha.dll"]), None, &mut handler, &mut launcher)
        .await
        .expect("run");

    assert!(!result.completion_args.is_aborted);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(handler.kinds(), vec!["stats", "run_complete"]);

    wrapper.end_session().await;
}

/// Selected test cases with a custom host go through the launcher too.
#[tokio::test]
async fn run_test_cases_with_custom_host_uses_launcher() {
    let (tx, _rx) = mpsc::channel(8);
    let wrapper = ConsoleWrapper::new(worker_config(&[]), tx);
    let mut launcher =
        |_: &TestProcessStartInfo| -> testhost_bridge::Result<i32> { Ok(2024) };

    let cases = vec![json!({ "FullyQualifiedName": "alpha.dll::passes" })];
    let mut handler = RecordingHandler::default();
    let result = wrapper
        .run_test_cases_with_custom_host(&cases, None, &mut handler, &mut launcher)
        .await
        .expect("run");

    assert!(!result.completion_args.is_aborted);
    assert_eq!(handler.kinds(), vec!["stats", "run_complete"]);

    wrapper.end_session().await;
}

/// A worker that exits between requests is replaced transparently.
#[tokio::test]
async fn exited_worker_is_restarted_on_next_request() {
    let (tx, mut rx) = mpsc::channel(8);
    let wrapper = ConsoleWrapper::new(worker_config(&["--exit-after-requests", "1"]), tx);

    let mut handler = RecordingHandler::default();
    wrapper
        .run_tests(&sources(&["alpha.dll"]), None, &mut handler)
        .await
        .expect("first run");
    let first_pid = wrapper.worker_pid();

    let WorkerEvent::Exited { pid, exit_code, .. } = next_exit(&mut rx).await;
    assert_eq!(pid, first_pid);
    assert_eq!(exit_code, Some(0));

    let mut handler = RecordingHandler::default();
    let result = wrapper
        .discover_tests(&sources(&["beta.dll"]), None, &mut handler)
        .await
        .expect("discovery on a restarted worker");

    assert_eq!(result.total_count, 1);
    assert_ne!(wrapper.worker_pid(), first_pid);

    wrapper.end_session().await;
}

/// An abort the worker never answers does not strand the next request: the
/// silent worker is stopped and a fresh one takes over.
#[tokio::test]
async fn unanswered_abort_restarts_worker_for_next_request() {
    let (tx, mut rx) = mpsc::channel(8);
    let wrapper = Arc::new(ConsoleWrapper::new(
        worker_config(&["--ignore-requests"]),
        tx,
    ));
    wrapper.start_session().await.expect("session");
    let first_pid = wrapper.worker_pid();
    assert!(first_pid.is_some());

    let discovery = tokio::spawn({
        let wrapper = Arc::clone(&wrapper);
        async move {
            let mut handler = RecordingHandler::default();
            wrapper
                .discover_tests(&sources(&["alpha.dll"]), None, &mut handler)
                .await
        }
    });

    // Let the request reach the worker before aborting.
    tokio::time::sleep(Duration::from_millis(200)).await;
    wrapper.abort_test_run().await;

    let result = tokio::time::timeout(STEP_TIMEOUT, discovery)
        .await
        .expect("abort must unblock discovery")
        .expect("task")
        .expect("discovery");
    assert!(result.is_aborted);

    tokio::time::timeout(STEP_TIMEOUT, wrapper.initialize_extensions(&[]))
        .await
        .expect("next request must not hang")
        .expect("extensions on a new worker");
    assert_ne!(wrapper.worker_pid(), first_pid);

    let WorkerEvent::Exited { pid, .. } = next_exit(&mut rx).await;
    assert_eq!(pid, first_pid);

    wrapper.end_session().await;
}

/// A worker speaking another protocol version is rejected and stopped.
#[tokio::test]
async fn version_mismatch_fails_session_start() {
    let (tx, mut rx) = mpsc::channel(8);
    let wrapper = ConsoleWrapper::new(worker_config(&["--protocol-version", "2"]), tx);

    let err = wrapper
        .start_session()
        .await
        .expect_err("mismatched worker must be rejected");
    assert!(matches!(err, AppError::Handshake(_)), "got {err:?}");

    next_exit(&mut rx).await;
    wrapper.end_session().await;
}

/// A worker executable that does not exist fails with a process error.
#[tokio::test]
async fn missing_worker_fails_with_process_error() {
    let (tx, _rx) = mpsc::channel(8);
    let wrapper = ConsoleWrapper::new(BridgeConfig::new("/definitely/not/a/worker"), tx);

    let mut handler = RecordingHandler::default();
    let err = wrapper
        .discover_tests(&sources(&["alpha.dll"]), None, &mut handler)
        .await
        .expect_err("missing worker must fail");
    assert!(matches!(err, AppError::Process(_)), "got {err:?}");
    assert!(handler.events.is_empty());
}

/// Cancel without a session is refused; abort without one is a no-op.
#[tokio::test]
async fn cancel_and_abort_without_session() {
    let (tx, _rx) = mpsc::channel(8);
    let wrapper = ConsoleWrapper::new(worker_config(&[]), tx);

    assert!(matches!(
        wrapper.cancel_test_run().await,
        Err(AppError::InvalidState(_))
    ));
    wrapper.abort_test_run().await;
}

/// Extensions are accepted by a running worker.
#[tokio::test]
async fn initialize_extensions_starts_session() {
    let (tx, _rx) = mpsc::channel(8);
    let wrapper = ConsoleWrapper::new(worker_config(&[]), tx);

    wrapper
        .initialize_extensions(&sources(&["/ext/adapter.dll"]))
        .await
        .expect("initialize extensions");
    assert!(wrapper.worker_pid().is_some());

    wrapper.cancel_test_run().await.expect("cancel with no run");
    wrapper.end_session().await;
}
