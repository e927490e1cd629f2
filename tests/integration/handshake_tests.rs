//! Integration tests for communication setup and version negotiation.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use testhost_bridge::channel::socket::SocketChannel;
use testhost_bridge::channel::{Channel, ChannelFuture};
use testhost_bridge::protocol::message::{message_type, Message};
use testhost_bridge::session::driver::SessionDriver;
use testhost_bridge::session::HandshakeState;
use testhost_bridge::AppError;

use super::test_helpers::{connected_session, sources, FakeWorker, RecordingHandler, STEP_TIMEOUT};

fn new_driver() -> SessionDriver {
    SessionDriver::new(Arc::new(SocketChannel::new()))
}

// ── Successful negotiation ───────────────────────────────────────────────────

/// A worker replying with version 1 completes the handshake.
#[tokio::test]
async fn matching_version_succeeds() {
    let (driver, _worker) = connected_session().await;

    assert_eq!(driver.handshake_state(), HandshakeState::Succeeded);
    assert!(driver.port().is_some_and(|port| port > 0));
}

/// The returned port is the one the driver reports afterwards.
#[tokio::test]
async fn initialize_returns_listening_port() {
    let driver = new_driver();
    assert_eq!(driver.port(), None);
    assert_eq!(driver.handshake_state(), HandshakeState::NotStarted);

    let port = driver.initialize_communication().await.expect("initialize");

    assert_eq!(driver.port(), Some(port));
    assert_eq!(driver.handshake_state(), HandshakeState::Negotiating);
}

/// Communication is set up once per driver.
#[tokio::test]
async fn second_initialize_is_rejected() {
    let driver = new_driver();
    driver.initialize_communication().await.expect("first");

    let err = driver
        .initialize_communication()
        .await
        .expect_err("second initialize must fail");
    assert!(matches!(err, AppError::InvalidState(_)), "got {err:?}");
}

// ── Failed negotiation ───────────────────────────────────────────────────────

/// A worker replying with another version fails the handshake, and the
/// client sends nothing further.
#[tokio::test]
async fn version_mismatch_fails_and_sends_no_request() {
    let driver = new_driver();
    let port = driver.initialize_communication().await.expect("initialize");
    let mut worker = FakeWorker::connect(port).await;

    worker.handshake(2).await;

    assert!(!driver.wait_for_connection(STEP_TIMEOUT).await);
    assert_eq!(driver.handshake_state(), HandshakeState::Failed);

    let mut handler = RecordingHandler::default();
    let err = driver
        .discover_tests(&sources(&["a.dll"]), None, &mut handler)
        .await
        .expect_err("requests after a failed handshake must fail");
    assert!(matches!(err, AppError::Handshake(_)), "got {err:?}");
    assert!(handler.events.is_empty());

    assert!(
        worker.try_recv(Duration::from_millis(200)).await.is_none(),
        "no request may be sent after a failed handshake"
    );
}

/// A first message other than `SessionConnected` fails the handshake.
#[tokio::test]
async fn unexpected_first_message_fails() {
    let driver = new_driver();
    let port = driver.initialize_communication().await.expect("initialize");
    let mut worker = FakeWorker::connect(port).await;

    worker
        .send(Message::empty(message_type::DISCOVERY_COMPLETE))
        .await;

    assert!(!driver.wait_for_connection(STEP_TIMEOUT).await);
    assert_eq!(driver.handshake_state(), HandshakeState::Failed);
}

/// A peer that connects but cannot be written to.
#[derive(Default)]
struct WriteFailingChannel {
    connected_sent: AtomicBool,
    send_attempts: AtomicUsize,
}

const STUB_PORT: u16 = 40123;

impl Channel for WriteFailingChannel {
    fn listen(&self) -> ChannelFuture<'_, testhost_bridge::Result<u16>> {
        Box::pin(async { Ok(STUB_PORT) })
    }

    fn accept_async(&self) {}

    fn wait_for_connection(&self, _timeout: Duration) -> ChannelFuture<'_, bool> {
        Box::pin(async { true })
    }

    fn send(&self, message: Message) -> ChannelFuture<'_, testhost_bridge::Result<()>> {
        self.send_attempts.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            Err(AppError::Transport(format!(
                "write of {} failed: broken pipe",
                message.message_type
            )))
        })
    }

    fn receive(&self) -> ChannelFuture<'_, testhost_bridge::Result<Message>> {
        Box::pin(async {
            if self.connected_sent.swap(true, Ordering::SeqCst) {
                std::future::pending().await
            } else {
                Ok(Message::empty(message_type::SESSION_CONNECTED))
            }
        })
    }

    fn close(&self) -> ChannelFuture<'_, ()> {
        Box::pin(async {})
    }
}

/// A version check that cannot be sent fails the handshake and leaves the
/// port as initialized.
#[tokio::test]
async fn version_check_send_failure_fails_handshake() {
    let channel = Arc::new(WriteFailingChannel::default());
    let driver = SessionDriver::new(Arc::clone(&channel) as Arc<dyn Channel>);

    let port = driver.initialize_communication().await.expect("initialize");
    assert_eq!(port, STUB_PORT);

    assert!(!driver.wait_for_connection(STEP_TIMEOUT).await);
    assert_eq!(driver.handshake_state(), HandshakeState::Failed);
    assert_eq!(driver.port(), Some(port));
    assert_eq!(channel.send_attempts.load(Ordering::SeqCst), 1);
}

/// Waiting with no worker times out and reports failure.
#[tokio::test]
async fn wait_without_worker_times_out() {
    let driver = new_driver();
    driver.initialize_communication().await.expect("initialize");

    assert!(!driver.wait_for_connection(Duration::from_millis(100)).await);
    assert_eq!(driver.handshake_state(), HandshakeState::Negotiating);
}

// ── Requests before the handshake ────────────────────────────────────────────

/// Requests on a driver that never initialized fail fast.
#[tokio::test]
async fn requests_before_initialize_fail_fast() {
    let driver = new_driver();
    let mut handler = RecordingHandler::default();

    let discovery = driver
        .discover_tests(&sources(&["a.dll"]), None, &mut handler)
        .await;
    assert!(matches!(discovery, Err(AppError::Handshake(_))));

    let run = driver
        .start_test_run(&sources(&["a.dll"]), None, &mut handler)
        .await;
    assert!(matches!(run, Err(AppError::Handshake(_))));

    assert!(matches!(
        driver.cancel_test_run().await,
        Err(AppError::Handshake(_))
    ));
    assert!(handler.events.is_empty());
}
