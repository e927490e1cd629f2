//! Message envelope, message-type catalog, and typed payloads.
//!
//! Every frame on the channel is one [`Message`]. Only
//! [`Message::message_type`] is inspected for dispatch; the payload stays an
//! opaque [`serde_json::Value`] until the receiver asks for a typed view via
//! [`Message::payload_as`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{AppError, Result};

/// Protocol version the client accepts during the handshake.
pub const PROTOCOL_VERSION: i32 = 1;

/// Opaque test case description produced and consumed by the worker.
pub type TestCase = Value;

/// Opaque test attachment set reported at run completion.
pub type AttachmentSet = Value;

/// Opaque process start description sent by a custom host launch request.
pub type TestProcessStartInfo = Value;

/// Wire names of every message type exchanged with the worker.
pub mod message_type {
    /// Worker → client: channel connected, first message of a session.
    pub const SESSION_CONNECTED: &str = "TestSession.Connected";
    /// Both directions: version check request (client) and reply (worker).
    pub const VERSION_CHECK: &str = "ProtocolVersion";
    /// Client → worker: load extensions from the given paths.
    pub const EXTENSIONS_INITIALIZE: &str = "Extensions.Initialize";
    /// Client → worker: discover tests in sources.
    pub const START_DISCOVERY: &str = "TestDiscovery.Start";
    /// Worker → client: a batch of discovered tests.
    pub const TEST_CASES_FOUND: &str = "TestDiscovery.TestFound";
    /// Worker → client: discovery finished.
    pub const DISCOVERY_COMPLETE: &str = "TestDiscovery.Completed";
    /// Client → worker: run all tests in sources with the default host.
    pub const TEST_RUN_ALL_SOURCES_WITH_DEFAULT_HOST: &str =
        "TestExecution.RunAllWithDefaultHost";
    /// Client → worker: run selected test cases with the default host.
    pub const TEST_RUN_SELECTED_TEST_CASES_DEFAULT_HOST: &str =
        "TestExecution.RunSelectedWithDefaultHost";
    /// Client → worker: run all tests in sources with a client-launched host.
    pub const GET_TEST_RUNNER_PROCESS_START_INFO_FOR_RUN_ALL: &str =
        "TestExecution.GetTestRunnerProcessStartInfoForRunAll";
    /// Client → worker: run selected test cases with a client-launched host.
    pub const GET_TEST_RUNNER_PROCESS_START_INFO_FOR_RUN_SELECTED: &str =
        "TestExecution.GetTestRunnerProcessStartInfoForRunSelected";
    /// Worker → client: run statistics changed.
    pub const TEST_RUN_STATS_CHANGE: &str = "TestExecution.StatsChange";
    /// Worker → client: run finished.
    pub const EXECUTION_COMPLETE: &str = "TestExecution.Completed";
    /// Worker → client: ask the client to launch a custom test host.
    pub const CUSTOM_TEST_HOST_LAUNCH: &str = "TestExecution.CustomTestHostLaunch";
    /// Client → worker: reply to a custom test host launch request.
    pub const CUSTOM_TEST_HOST_LAUNCH_CALLBACK: &str =
        "TestExecution.CustomTestHostLaunchCallback";
    /// Client → worker: best-effort request to cancel the current run.
    pub const CANCEL_TEST_RUN: &str = "TestExecution.Cancel";
    /// Worker → client: log message.
    pub const TEST_MESSAGE: &str = "TestSession.Message";
    /// Client → worker: end the session.
    pub const SESSION_END: &str = "TestSession.Terminate";
}

/// Typed, versioned envelope around an opaque payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Message {
    /// Dispatch tag; one of the [`message_type`] constants or an unknown tag.
    pub message_type: String,
    /// Protocol version; meaningful only for the handshake.
    #[serde(default)]
    pub version: i32,
    /// Opaque payload.
    #[serde(default)]
    pub payload: Value,
}

impl Message {
    /// Build a message with no payload.
    #[must_use]
    pub fn empty(message_type: &str) -> Self {
        Self {
            message_type: message_type.to_owned(),
            version: 0,
            payload: Value::Null,
        }
    }

    /// Build a message carrying `payload`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if `payload` cannot be serialised.
    pub fn new(message_type: &str, payload: &impl Serialize) -> Result<Self> {
        Self::versioned(message_type, 0, payload)
    }

    /// Build a message carrying `payload` and an explicit protocol version.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if `payload` cannot be serialised.
    pub fn versioned(message_type: &str, version: i32, payload: &impl Serialize) -> Result<Self> {
        let payload = serde_json::to_value(payload).map_err(|err| {
            AppError::Protocol(format!("failed to serialise {message_type} payload: {err}"))
        })?;

        Ok(Self {
            message_type: message_type.to_owned(),
            version,
            payload,
        })
    }

    /// Deserialise the payload into `T`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if the payload does not match `T`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone()).map_err(|err| {
            AppError::Protocol(format!(
                "invalid {} payload: {err}",
                self.message_type
            ))
        })
    }

    /// Whether this message carries the given type tag.
    #[must_use]
    pub fn is(&self, message_type: &str) -> bool {
        self.message_type == message_type
    }
}

// ── Payloads ──────────────────────────────────────────────────────────────────

/// `StartDiscovery` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DiscoveryRequestPayload {
    /// Test containers to inspect.
    pub sources: Vec<String>,
    /// Opaque run settings document.
    #[serde(default)]
    pub run_settings: Option<String>,
}

/// Payload shared by the four run request message types.
///
/// Exactly one of `sources` and `test_cases` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TestRunRequestPayload {
    /// Test containers to run in full.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<String>>,
    /// Previously discovered test cases to run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_cases: Option<Vec<TestCase>>,
    /// Opaque run settings document.
    #[serde(default)]
    pub run_settings: Option<String>,
    /// Whether the client intends to attach a debugger to the custom host.
    #[serde(default)]
    pub debugging_enabled: bool,
}

/// `DiscoveryComplete` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DiscoveryCompletePayload {
    /// Total number of discovered tests; `-1` when aborted locally.
    pub total_tests: i64,
    /// Final batch of tests not yet reported through `TestCasesFound`.
    #[serde(default)]
    pub last_discovered_tests: Option<Vec<TestCase>>,
    /// Whether discovery was aborted.
    #[serde(default)]
    pub is_aborted: bool,
}

/// Completion arguments of a test run.
///
/// Only the flags the client acts on are typed; every other field the worker
/// sends is preserved in `extra`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TestRunCompleteArgs {
    /// Whether the run was cancelled.
    #[serde(default)]
    pub is_canceled: bool,
    /// Whether the run was aborted.
    #[serde(default)]
    pub is_aborted: bool,
    /// Error that ended the run, if any.
    #[serde(default)]
    pub error: Option<String>,
    /// Remaining worker-defined fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TestRunCompleteArgs {
    /// Completion arguments for a run aborted on the client side.
    #[must_use]
    pub fn aborted(reason: &str) -> Self {
        Self {
            is_canceled: false,
            is_aborted: true,
            error: Some(reason.to_owned()),
            extra: Map::new(),
        }
    }
}

/// `ExecutionComplete` payload.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TestRunCompletePayload {
    /// Run completion arguments.
    pub test_run_complete_args: TestRunCompleteArgs,
    /// Last batch of results not yet reported through `TestRunStatsChange`.
    #[serde(default)]
    pub last_run_tests: Option<Value>,
    /// Attachments produced by the run.
    #[serde(default)]
    pub run_attachments: Vec<AttachmentSet>,
    /// Executors that ran tests.
    #[serde(default)]
    pub executor_uris: Vec<String>,
}

/// Severity of a `TestMessage`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageLevel {
    /// Informational output.
    Informational,
    /// Warning output.
    Warning,
    /// Error output.
    Error,
}

/// `TestMessage` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TestMessagePayload {
    /// Severity.
    pub message_level: MessageLevel,
    /// Message text.
    pub message: String,
}

/// `CustomTestHostLaunchCallback` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CustomHostLaunchAckPayload {
    /// Id of the launched host process; `-1` when the launch failed.
    pub process_id: i32,
    /// Launch failure description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}
