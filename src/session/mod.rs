//! Out-of-process session with a worker.
//!
//! - `driver`: [`SessionDriver`](driver::SessionDriver), the request sender
//!   that owns the channel and runs discovery and run requests.
//! - `handshake`: the version negotiation performed once per session.
//! - `listen`: the per-operation receive-and-dispatch loop.
//!
//! Callers observe an operation through the handler traits below, which are
//! passed at call time and dropped when the call returns.

pub mod driver;
pub mod handshake;
pub mod listen;

use crate::protocol::message::{
    AttachmentSet, DiscoveryCompletePayload, MessageLevel, TestCase, TestRunCompleteArgs,
    TestRunCompletePayload,
};

/// Progress of the version handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// `initialize_communication` has not been called.
    NotStarted,
    /// Listening for the worker or exchanging handshake messages.
    Negotiating,
    /// The worker speaks a supported protocol version.
    Succeeded,
    /// The handshake failed; the session cannot be used.
    Failed,
}

/// Kind of the operation in flight on a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    /// Test discovery.
    Discovery,
    /// Test run.
    Run,
}

/// Terminal value of a discovery operation.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryResult {
    /// Total number of discovered tests; `-1` when aborted by the client.
    pub total_count: i64,
    /// Final batch of tests not delivered through `handle_discovered_tests`.
    pub last_chunk: Option<Vec<TestCase>>,
    /// Whether discovery was aborted.
    pub is_aborted: bool,
}

impl DiscoveryResult {
    /// Result reported when the client aborts discovery or loses the worker.
    #[must_use]
    pub fn aborted() -> Self {
        Self {
            total_count: -1,
            last_chunk: None,
            is_aborted: true,
        }
    }
}

impl From<DiscoveryCompletePayload> for DiscoveryResult {
    fn from(payload: DiscoveryCompletePayload) -> Self {
        Self {
            total_count: payload.total_tests,
            last_chunk: payload.last_discovered_tests,
            is_aborted: payload.is_aborted,
        }
    }
}

/// Terminal value of a run operation.
#[derive(Debug, Clone, PartialEq)]
pub struct RunResult {
    /// Run completion arguments.
    pub completion_args: TestRunCompleteArgs,
    /// Final batch of results not delivered through stats changes.
    pub last_chunk_results: Option<serde_json::Value>,
    /// Attachments produced by the run.
    pub attachments: Vec<AttachmentSet>,
    /// Executors that ran tests.
    pub executor_uris: Vec<String>,
}

impl RunResult {
    /// Result reported when the client aborts the run or loses the worker.
    #[must_use]
    pub fn aborted(reason: &str) -> Self {
        Self {
            completion_args: TestRunCompleteArgs::aborted(reason),
            last_chunk_results: None,
            attachments: Vec::new(),
            executor_uris: Vec::new(),
        }
    }
}

impl From<TestRunCompletePayload> for RunResult {
    fn from(payload: TestRunCompletePayload) -> Self {
        Self {
            completion_args: payload.test_run_complete_args,
            last_chunk_results: payload.last_run_tests,
            attachments: payload.run_attachments,
            executor_uris: payload.executor_uris,
        }
    }
}

/// Receives log messages emitted during an operation.
pub trait TestMessageHandler {
    /// A worker log message, or a client-side error describing an abort.
    fn handle_log_message(&mut self, level: MessageLevel, message: &str);
}

/// Receives discovery progress and completion.
pub trait DiscoveryEventsHandler: TestMessageHandler + Send {
    /// A batch of discovered tests, in the order the worker sent them.
    fn handle_discovered_tests(&mut self, test_cases: Vec<TestCase>);

    /// Discovery finished. Called exactly once per discovery operation.
    fn handle_discovery_complete(&mut self, result: &DiscoveryResult);
}

/// Receives run progress and completion.
pub trait RunEventsHandler: TestMessageHandler + Send {
    /// Run statistics changed; `stats` is the worker's opaque change set.
    fn handle_test_run_stats_change(&mut self, stats: serde_json::Value);

    /// The run finished. Called exactly once per run operation.
    fn handle_test_run_complete(&mut self, result: &RunResult);
}
