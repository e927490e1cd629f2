//! Session driver: the client half of the worker protocol.
//!
//! # Lifecycle
//!
//! 1. [`SessionDriver::initialize_communication`] binds the channel, returns
//!    the port for the worker, and runs the handshake in the background once
//!    the worker connects.
//! 2. The caller starts the worker with that port and waits on
//!    [`SessionDriver::wait_for_connection`].
//! 3. Discovery and run requests send one request and then listen until a
//!    completion arrives or [`SessionDriver::abort_test_run`] is called.
//! 4. [`SessionDriver::end_session`] tells the worker to exit and closes the
//!    channel.
//!
//! A session runs one operation at a time. Requests are refused with
//! [`AppError::Handshake`] until the handshake has succeeded.
//!
//! An aborted operation leaves its last receive waiting on the channel. Until
//! the worker sends one more frame, which that receive discards, new
//! operations are refused with [`AppError::InvalidState`] and
//! [`SessionDriver::has_abandoned_receive`] reports `true`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::channel::Channel;
use crate::process::host::TestHostLauncher;
use crate::protocol::message::{
    message_type, DiscoveryRequestPayload, Message, MessageLevel, TestCase,
    TestRunRequestPayload,
};
use crate::session::handshake;
use crate::session::listen::{self, ReceiveTracker, DISCOVERY_ABORTED, RUN_ABORTED};
use crate::session::{
    DiscoveryEventsHandler, DiscoveryResult, HandshakeState, OperationKind, RunEventsHandler,
    RunResult,
};
use crate::{AppError, Result};

/// State of the operation currently in flight.
#[derive(Debug)]
struct OperationState {
    kind: OperationKind,
    abort: CancellationToken,
}

/// Clears the in-flight operation when the operation's future completes or
/// is dropped.
struct OperationGuard<'a> {
    slot: &'a Mutex<Option<OperationState>>,
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = None;
        }
    }
}

/// Client-side request sender for one worker session.
pub struct SessionDriver {
    channel: Arc<dyn Channel>,
    port: OnceLock<u16>,
    handshake: Arc<watch::Sender<HandshakeState>>,
    operation: Mutex<Option<OperationState>>,
    receive: ReceiveTracker,
    ended: AtomicBool,
}

impl std::fmt::Debug for SessionDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionDriver")
            .field("port", &self.port.get())
            .field("handshake", &*self.handshake.borrow())
            .field("receive_pending", &self.receive.is_pending())
            .field("ended", &self.ended.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl SessionDriver {
    /// Create a driver that talks over `channel`.
    #[must_use]
    pub fn new(channel: Arc<dyn Channel>) -> Self {
        let (handshake, _) = watch::channel(HandshakeState::NotStarted);
        Self {
            channel,
            port: OnceLock::new(),
            handshake: Arc::new(handshake),
            operation: Mutex::new(None),
            receive: ReceiveTracker::new(),
            ended: AtomicBool::new(false),
        }
    }

    /// Port returned by [`SessionDriver::initialize_communication`].
    #[must_use]
    pub fn port(&self) -> Option<u16> {
        self.port.get().copied()
    }

    /// Current handshake progress.
    #[must_use]
    pub fn handshake_state(&self) -> HandshakeState {
        *self.handshake.borrow()
    }

    /// Kind of the operation in flight, if any.
    #[must_use]
    pub fn current_operation(&self) -> Option<OperationKind> {
        self.operation
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().map(|op| op.kind))
    }

    /// `true` when no operation is in flight but an aborted one still has a
    /// receive waiting for the worker's next frame.
    #[must_use]
    pub fn has_abandoned_receive(&self) -> bool {
        self.current_operation().is_none() && self.receive.is_pending()
    }

    /// Open the channel, start accepting the worker, and negotiate with it in
    /// the background once it connects. Returns the port the worker must be
    /// started with.
    ///
    /// # Errors
    ///
    /// - `AppError::InvalidState` if communication was already initialized.
    /// - `AppError::Transport` if the channel cannot listen.
    pub async fn initialize_communication(&self) -> Result<u16> {
        let started = self.handshake.send_if_modified(|state| {
            if *state == HandshakeState::NotStarted {
                *state = HandshakeState::Negotiating;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(AppError::InvalidState(
                "communication was already initialized".into(),
            ));
        }

        let port = match self.channel.listen().await {
            Ok(port) => port,
            Err(err) => {
                self.handshake.send_replace(HandshakeState::Failed);
                return Err(err);
            }
        };
        // `started` guarantees this is the only initialization.
        let _ = self.port.set(port);

        self.channel.accept_async();

        let channel = Arc::clone(&self.channel);
        let handshake = Arc::clone(&self.handshake);
        tokio::spawn(
            async move {
                if !channel.wait_for_connection(Duration::MAX).await {
                    warn!("worker never connected");
                    handshake.send_replace(HandshakeState::Failed);
                    return;
                }

                match handshake::negotiate(channel.as_ref()).await {
                    Ok(()) => {
                        handshake.send_replace(HandshakeState::Succeeded);
                    }
                    Err(err) => {
                        error!(%err, "handshake with worker failed");
                        handshake.send_replace(HandshakeState::Failed);
                    }
                }
            }
            .instrument(info_span!("handshake", port)),
        );

        info!(port, "communication initialized");
        Ok(port)
    }

    /// Wait up to `timeout` for the handshake to finish. Returns `true` only
    /// if it finished in time and succeeded.
    pub async fn wait_for_connection(&self, timeout: Duration) -> bool {
        let mut rx = self.handshake.subscribe();
        let finished = rx.wait_for(|state| {
            matches!(state, HandshakeState::Succeeded | HandshakeState::Failed)
        });
        if let Ok(Ok(state)) = tokio::time::timeout(timeout, finished).await {
            return *state == HandshakeState::Succeeded;
        }
        false
    }

    /// Ask the worker to load extensions from `paths`. No reply is expected.
    ///
    /// # Errors
    ///
    /// - `AppError::Handshake` if the handshake has not succeeded.
    /// - `AppError::Transport` if sending fails.
    pub async fn initialize_extensions(&self, paths: &[String]) -> Result<()> {
        self.ensure_ready()?;
        let message = Message::new(message_type::EXTENSIONS_INITIALIZE, &paths)?;
        self.channel.send(message).await?;
        debug!(count = paths.len(), "extensions initialize sent");
        Ok(())
    }

    /// Discover tests in `sources`, reporting progress to `handler`.
    ///
    /// Transport failures and aborts do not fail the call: they are reported
    /// as an aborted [`DiscoveryResult`] plus an error log message.
    ///
    /// # Errors
    ///
    /// - `AppError::Handshake` if the handshake has not succeeded.
    /// - `AppError::InvalidState` if the session ended, another operation is
    ///   in flight, or an aborted operation still has a receive pending.
    pub async fn discover_tests<H>(
        &self,
        sources: &[String],
        run_settings: Option<&str>,
        handler: &mut H,
    ) -> Result<DiscoveryResult>
    where
        H: DiscoveryEventsHandler + ?Sized,
    {
        self.ensure_ready()?;
        let (abort, _guard) = self.begin_operation(OperationKind::Discovery)?;

        let payload = DiscoveryRequestPayload {
            sources: sources.to_vec(),
            run_settings: run_settings.map(str::to_owned),
        };
        let request = Message::new(message_type::START_DISCOVERY, &payload)?;

        info!(sources = sources.len(), "starting discovery");
        if let Err(err) = self.channel.send(request).await {
            handler.handle_log_message(
                MessageLevel::Error,
                &format!("{DISCOVERY_ABORTED} Reason: {err}"),
            );
            let result = DiscoveryResult::aborted();
            handler.handle_discovery_complete(&result);
            return Ok(result);
        }

        Ok(listen::listen_for_discovery(&self.channel, &abort, &self.receive, handler).await)
    }

    /// Run every test in `sources` with the worker's default test host.
    ///
    /// # Errors
    ///
    /// Same as [`SessionDriver::discover_tests`].
    pub async fn start_test_run<H>(
        &self,
        sources: &[String],
        run_settings: Option<&str>,
        handler: &mut H,
    ) -> Result<RunResult>
    where
        H: RunEventsHandler + ?Sized,
    {
        let payload = TestRunRequestPayload {
            sources: Some(sources.to_vec()),
            test_cases: None,
            run_settings: run_settings.map(str::to_owned),
            debugging_enabled: false,
        };
        self.run(
            message_type::TEST_RUN_ALL_SOURCES_WITH_DEFAULT_HOST,
            &payload,
            handler,
            None,
        )
        .await
    }

    /// Run the given previously discovered `test_cases` with the worker's
    /// default test host.
    ///
    /// # Errors
    ///
    /// Same as [`SessionDriver::discover_tests`].
    pub async fn start_test_run_with_test_cases<H>(
        &self,
        test_cases: &[TestCase],
        run_settings: Option<&str>,
        handler: &mut H,
    ) -> Result<RunResult>
    where
        H: RunEventsHandler + ?Sized,
    {
        let payload = TestRunRequestPayload {
            sources: None,
            test_cases: Some(test_cases.to_vec()),
            run_settings: run_settings.map(str::to_owned),
            debugging_enabled: false,
        };
        self.run(
            message_type::TEST_RUN_SELECTED_TEST_CASES_DEFAULT_HOST,
            &payload,
            handler,
            None,
        )
        .await
    }

    /// Run every test in `sources` in a test host that `launcher` starts
    /// when the worker asks for it.
    ///
    /// # Errors
    ///
    /// Same as [`SessionDriver::discover_tests`].
    pub async fn start_test_run_with_custom_host<H>(
        &self,
        sources: &[String],
        run_settings: Option<&str>,
        handler: &mut H,
        launcher: &mut dyn TestHostLauncher,
    ) -> Result<RunResult>
    where
        H: RunEventsHandler + ?Sized,
    {
        let payload = TestRunRequestPayload {
            sources: Some(sources.to_vec()),
            test_cases: None,
            run_settings: run_settings.map(str::to_owned),
            debugging_enabled: launcher.is_debug(),
        };
        self.run(
            message_type::GET_TEST_RUNNER_PROCESS_START_INFO_FOR_RUN_ALL,
            &payload,
            handler,
            Some(launcher),
        )
        .await
    }

    /// Run the given `test_cases` in a test host that `launcher` starts when
    /// the worker asks for it.
    ///
    /// # Errors
    ///
    /// Same as [`SessionDriver::discover_tests`].
    pub async fn start_test_run_with_test_cases_and_custom_host<H>(
        &self,
        test_cases: &[TestCase],
        run_settings: Option<&str>,
        handler: &mut H,
        launcher: &mut dyn TestHostLauncher,
    ) -> Result<RunResult>
    where
        H: RunEventsHandler + ?Sized,
    {
        let payload = TestRunRequestPayload {
            sources: None,
            test_cases: Some(test_cases.to_vec()),
            run_settings: run_settings.map(str::to_owned),
            debugging_enabled: launcher.is_debug(),
        };
        self.run(
            message_type::GET_TEST_RUNNER_PROCESS_START_INFO_FOR_RUN_SELECTED,
            &payload,
            handler,
            Some(launcher),
        )
        .await
    }

    /// Ask the worker to cancel the current run. Best effort: this does not
    /// unblock a caller waiting on the run.
    ///
    /// # Errors
    ///
    /// - `AppError::Handshake` if the handshake has not succeeded.
    /// - `AppError::Transport` if sending fails.
    pub async fn cancel_test_run(&self) -> Result<()> {
        self.ensure_ready()?;
        self.channel
            .send(Message::empty(message_type::CANCEL_TEST_RUN))
            .await?;
        info!("cancel test run sent");
        Ok(())
    }

    /// Unblock the caller of the operation in flight. The operation finishes
    /// with an aborted result; the worker is not told.
    pub fn abort_test_run(&self) {
        let Ok(slot) = self.operation.lock() else {
            return;
        };
        match slot.as_ref() {
            Some(op) => {
                info!(operation = ?op.kind, "abort requested");
                op.abort.cancel();
            }
            None => debug!("abort requested with no operation in flight"),
        }
    }

    /// Tell the worker the session is over and close the channel.
    ///
    /// Safe to call at any point; a failed send is logged and the channel is
    /// closed regardless.
    pub async fn end_session(&self) {
        if self.ended.swap(true, Ordering::AcqRel) {
            return;
        }

        if self.handshake_state() == HandshakeState::Succeeded {
            if let Err(err) = self
                .channel
                .send(Message::empty(message_type::SESSION_END))
                .await
            {
                warn!(%err, "failed to send session end");
            }
        }

        self.channel.close().await;
        info!("session ended");
    }

    /// Close the channel without telling the worker.
    pub async fn close(&self) {
        self.ended.store(true, Ordering::Release);
        self.channel.close().await;
    }

    // ── Private helpers ──────────────────────────────────────────────────────

    async fn run<H>(
        &self,
        request_type: &str,
        payload: &TestRunRequestPayload,
        handler: &mut H,
        launcher: Option<&mut (dyn TestHostLauncher + '_)>,
    ) -> Result<RunResult>
    where
        H: RunEventsHandler + ?Sized,
    {
        self.ensure_ready()?;
        let (abort, _guard) = self.begin_operation(OperationKind::Run)?;
        let request = Message::new(request_type, payload)?;

        info!(request_type, "starting test run");
        if let Err(err) = self.channel.send(request).await {
            let reason = format!("{RUN_ABORTED} Reason: {err}");
            handler.handle_log_message(MessageLevel::Error, &reason);
            let result = RunResult::aborted(&reason);
            handler.handle_test_run_complete(&result);
            return Ok(result);
        }

        Ok(listen::listen_for_run(&self.channel, &abort, &self.receive, handler, launcher).await)
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.ended.load(Ordering::Acquire) {
            return Err(AppError::InvalidState("session has ended".into()));
        }
        match self.handshake_state() {
            HandshakeState::Succeeded => Ok(()),
            state => Err(AppError::Handshake(format!(
                "handshake with the worker has not succeeded (state: {state:?})"
            ))),
        }
    }

    fn begin_operation(
        &self,
        kind: OperationKind,
    ) -> Result<(CancellationToken, OperationGuard<'_>)> {
        let mut slot = self
            .operation
            .lock()
            .map_err(|_| AppError::InvalidState("operation state lock poisoned".into()))?;

        if let Some(ref current) = *slot {
            return Err(AppError::InvalidState(format!(
                "{:?} operation already in progress",
                current.kind
            )));
        }
        if self.receive.is_pending() {
            return Err(AppError::InvalidState(
                "an aborted operation is still waiting for the worker's next message".into(),
            ));
        }

        let abort = CancellationToken::new();
        *slot = Some(OperationState {
            kind,
            abort: abort.clone(),
        });

        Ok((
            abort,
            OperationGuard {
                slot: &self.operation,
            },
        ))
    }
}
