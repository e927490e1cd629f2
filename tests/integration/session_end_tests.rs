//! Integration tests for ending a session.

use std::time::Duration;

use testhost_bridge::protocol::message::message_type;
use testhost_bridge::AppError;

use super::test_helpers::{connected_session, sources, RecordingHandler, STEP_TIMEOUT};

/// Ending sends the terminate message, then closes the connection.
#[tokio::test]
async fn end_session_notifies_worker_and_closes() {
    let (driver, mut worker) = connected_session().await;

    driver.end_session().await;

    assert!(worker.recv().await.is(message_type::SESSION_END));
    assert!(worker.closed_within(STEP_TIMEOUT).await);
}

/// Ending twice sends the terminate message once.
#[tokio::test]
async fn end_session_is_idempotent() {
    let (driver, mut worker) = connected_session().await;

    driver.end_session().await;
    driver.end_session().await;

    assert!(worker.recv().await.is(message_type::SESSION_END));
    assert!(worker.try_recv(Duration::from_millis(100)).await.is_none());
}

/// Requests after the session ended are refused.
#[tokio::test]
async fn requests_after_end_are_refused() {
    let (driver, _worker) = connected_session().await;
    driver.end_session().await;

    let mut handler = RecordingHandler::default();
    let err = driver
        .discover_tests(&sources(&["a.dll"]), None, &mut handler)
        .await
        .expect_err("ended session must refuse requests");
    assert!(matches!(err, AppError::InvalidState(_)), "got {err:?}");
    assert!(handler.events.is_empty());
}

/// Ending a session whose worker is already gone still closes cleanly.
#[tokio::test]
async fn end_session_after_worker_disconnect() {
    let (driver, worker) = connected_session().await;
    worker.disconnect();

    tokio::time::timeout(STEP_TIMEOUT, driver.end_session())
        .await
        .expect("end_session must not hang");
}
