//! Listen loop: turns the worker's message stream into handler callbacks.
//!
//! Each iteration spawns one background receive and races its result against
//! the operation's abort token. Only one receive is outstanding at a time, so
//! handlers see messages in the order the worker sent them.
//!
//! When the abort token wins, the pending receive is abandoned rather than
//! cancelled. It keeps waiting on the channel; once it completes it finds its
//! result channel closed, drops whatever it read, and exits. Closing the
//! channel ends it immediately.
//!
//! An abandoned receive still owns the next frame on the wire. The
//! [`ReceiveTracker`] shared with the driver stays pending until that frame
//! arrives, and no new operation may start while it is pending.
//!
//! | Message type               | Discovery                      | Run                              |
//! |----------------------------|--------------------------------|----------------------------------|
//! | `TestCasesFound`           | `handle_discovered_tests`      | skipped                          |
//! | `DiscoveryComplete`        | `handle_discovery_complete`, end | skipped                        |
//! | `TestRunStatsChange`       | skipped                        | `handle_test_run_stats_change`   |
//! | `ExecutionComplete`        | skipped                        | `handle_test_run_complete`, end  |
//! | `TestMessage`              | `handle_log_message`           | `handle_log_message`             |
//! | `CustomTestHostLaunch`     | skipped                        | launcher, then reply             |
//! | *(any other)*              | skipped; logged at `WARN`      | skipped; logged at `WARN`        |

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, error, warn, Instrument};

use crate::channel::Channel;
use crate::process::host::TestHostLauncher;
use crate::protocol::message::{
    message_type, CustomHostLaunchAckPayload, DiscoveryCompletePayload, Message, MessageLevel,
    TestCase, TestMessagePayload, TestRunCompletePayload,
};
use crate::session::{DiscoveryEventsHandler, DiscoveryResult, RunEventsHandler, RunResult};
use crate::{AppError, Result};

/// Log text reported when the caller aborts discovery.
pub const DISCOVERY_ABORTED: &str = "The active test discovery was aborted.";

/// Log text reported when the caller aborts a run.
pub const RUN_ABORTED: &str = "The active test run was aborted.";

/// Outcome of one receive raced against an abort.
#[derive(Debug)]
pub enum ReceiveOutcome {
    /// A complete message arrived first.
    Message(Message),
    /// The abort token fired first.
    Aborted,
    /// Receiving failed.
    Failed(AppError),
}

/// Whether a background receive is still reading from the channel.
#[derive(Debug, Clone, Default)]
pub struct ReceiveTracker {
    pending: Arc<AtomicBool>,
}

impl ReceiveTracker {
    /// Create a tracker with no receive outstanding.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` while a receive task has not yet finished reading.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }
}

/// Receive one message in a background task, or return early on `abort`.
///
/// `tracker` is marked pending until the task has read its frame, whether or
/// not the caller is still waiting for it.
pub async fn receive_or_abort(
    channel: &Arc<dyn Channel>,
    abort: &CancellationToken,
    tracker: &ReceiveTracker,
) -> ReceiveOutcome {
    let (ready_tx, ready_rx) = oneshot::channel();
    let receiver = Arc::clone(channel);
    let pending = Arc::clone(&tracker.pending);
    pending.store(true, Ordering::Release);

    tokio::spawn(
        async move {
            let result = receiver.receive().await;
            // Cleared before delivery so the caller never observes a stale flag.
            pending.store(false, Ordering::Release);
            if let Err(unclaimed) = ready_tx.send(result) {
                match unclaimed {
                    Ok(message) => debug!(
                        message_type = message.message_type,
                        "abandoned receive completed; message dropped"
                    ),
                    Err(err) => debug!(%err, "abandoned receive ended"),
                }
            }
        }
        .instrument(debug_span!("receive")),
    );

    tokio::select! {
        () = abort.cancelled() => ReceiveOutcome::Aborted,
        ready = ready_rx => match ready {
            Ok(Ok(message)) => ReceiveOutcome::Message(message),
            Ok(Err(err)) => ReceiveOutcome::Failed(err),
            Err(_) => ReceiveOutcome::Failed(AppError::Transport(
                "receive task ended without a result".into(),
            )),
        },
    }
}

/// Listen until discovery completes, is aborted, or the channel fails.
pub async fn listen_for_discovery<H>(
    channel: &Arc<dyn Channel>,
    abort: &CancellationToken,
    tracker: &ReceiveTracker,
    handler: &mut H,
) -> DiscoveryResult
where
    H: DiscoveryEventsHandler + ?Sized,
{
    loop {
        let message = match receive_or_abort(channel, abort, tracker).await {
            ReceiveOutcome::Message(message) => message,
            ReceiveOutcome::Aborted => return abort_discovery(handler, DISCOVERY_ABORTED),
            ReceiveOutcome::Failed(err) => {
                return abort_discovery(handler, &format!("{DISCOVERY_ABORTED} Reason: {err}"));
            }
        };

        match dispatch_discovery(&message, handler) {
            Ok(Some(result)) => return result,
            Ok(None) => {}
            Err(err) => {
                return abort_discovery(handler, &format!("{DISCOVERY_ABORTED} Reason: {err}"));
            }
        }
    }
}

/// Listen until the run completes, is aborted, or the channel fails.
///
/// `launcher` services `CustomTestHostLaunch` requests; without one the
/// worker is told the launch failed.
pub async fn listen_for_run<H>(
    channel: &Arc<dyn Channel>,
    abort: &CancellationToken,
    tracker: &ReceiveTracker,
    handler: &mut H,
    mut launcher: Option<&mut (dyn TestHostLauncher + '_)>,
) -> RunResult
where
    H: RunEventsHandler + ?Sized,
{
    loop {
        let message = match receive_or_abort(channel, abort, tracker).await {
            ReceiveOutcome::Message(message) => message,
            ReceiveOutcome::Aborted => return abort_run(handler, RUN_ABORTED),
            ReceiveOutcome::Failed(err) => {
                return abort_run(handler, &format!("{RUN_ABORTED} Reason: {err}"));
            }
        };

        let step = if message.is(message_type::CUSTOM_TEST_HOST_LAUNCH) {
            handle_custom_host_launch(channel, &message, launcher.as_deref_mut())
                .await
                .map(|()| None)
        } else {
            dispatch_run(&message, handler)
        };

        match step {
            Ok(Some(result)) => return result,
            Ok(None) => {}
            Err(err) => return abort_run(handler, &format!("{RUN_ABORTED} Reason: {err}")),
        }
    }
}

// ── Dispatch ─────────────────────────────────────────────────────────────────

fn dispatch_discovery<H>(message: &Message, handler: &mut H) -> Result<Option<DiscoveryResult>>
where
    H: DiscoveryEventsHandler + ?Sized,
{
    match message.message_type.as_str() {
        message_type::TEST_CASES_FOUND => {
            let test_cases: Vec<TestCase> = message.payload_as()?;
            debug!(count = test_cases.len(), "discovery: tests found");
            handler.handle_discovered_tests(test_cases);
            Ok(None)
        }
        message_type::DISCOVERY_COMPLETE => {
            let payload: DiscoveryCompletePayload = message.payload_as()?;
            let result = DiscoveryResult::from(payload);
            debug!(
                total = result.total_count,
                aborted = result.is_aborted,
                "discovery: complete"
            );
            handler.handle_discovery_complete(&result);
            Ok(Some(result))
        }
        message_type::TEST_MESSAGE => {
            let payload: TestMessagePayload = message.payload_as()?;
            handler.handle_log_message(payload.message_level, &payload.message);
            Ok(None)
        }
        other => {
            warn!(message_type = other, "discovery: skipping unexpected message");
            Ok(None)
        }
    }
}

fn dispatch_run<H>(message: &Message, handler: &mut H) -> Result<Option<RunResult>>
where
    H: RunEventsHandler + ?Sized,
{
    match message.message_type.as_str() {
        message_type::TEST_RUN_STATS_CHANGE => {
            handler.handle_test_run_stats_change(message.payload.clone());
            Ok(None)
        }
        message_type::EXECUTION_COMPLETE => {
            let payload: TestRunCompletePayload = message.payload_as()?;
            let result = RunResult::from(payload);
            debug!(
                aborted = result.completion_args.is_aborted,
                canceled = result.completion_args.is_canceled,
                "run: complete"
            );
            handler.handle_test_run_complete(&result);
            Ok(Some(result))
        }
        message_type::TEST_MESSAGE => {
            let payload: TestMessagePayload = message.payload_as()?;
            handler.handle_log_message(payload.message_level, &payload.message);
            Ok(None)
        }
        other => {
            warn!(message_type = other, "run: skipping unexpected message");
            Ok(None)
        }
    }
}

/// Launch the requested host and report its process id back to the worker.
///
/// Launch failures are reported to the worker with process id `-1`; only a
/// failure to send the reply is returned as an error.
async fn handle_custom_host_launch(
    channel: &Arc<dyn Channel>,
    message: &Message,
    launcher: Option<&mut (dyn TestHostLauncher + '_)>,
) -> Result<()> {
    let ack = match launcher {
        Some(launcher) => match launcher.launch_test_host(&message.payload) {
            Ok(process_id) => CustomHostLaunchAckPayload {
                process_id,
                error_message: None,
            },
            Err(err) => {
                warn!(%err, "custom test host launch failed");
                CustomHostLaunchAckPayload {
                    process_id: -1,
                    error_message: Some(err.to_string()),
                }
            }
        },
        None => {
            warn!("custom test host requested but no launcher was supplied");
            CustomHostLaunchAckPayload {
                process_id: -1,
                error_message: Some("no custom test host launcher was supplied".into()),
            }
        }
    };

    debug!(process_id = ack.process_id, "run: replying to custom host launch");
    let reply = Message::new(message_type::CUSTOM_TEST_HOST_LAUNCH_CALLBACK, &ack)?;
    channel.send(reply).await
}

// ── Synthesised completions ──────────────────────────────────────────────────

fn abort_discovery<H>(handler: &mut H, reason: &str) -> DiscoveryResult
where
    H: DiscoveryEventsHandler + ?Sized,
{
    error!(reason, "discovery aborted");
    handler.handle_log_message(MessageLevel::Error, reason);
    let result = DiscoveryResult::aborted();
    handler.handle_discovery_complete(&result);
    result
}

fn abort_run<H>(handler: &mut H, reason: &str) -> RunResult
where
    H: RunEventsHandler + ?Sized,
{
    error!(reason, "run aborted");
    handler.handle_log_message(MessageLevel::Error, reason);
    let result = RunResult::aborted(reason);
    handler.handle_test_run_complete(&result);
    result
}
