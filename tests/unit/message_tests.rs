//! Unit tests for the message envelope, typed payloads, and terminal results.

use serde_json::json;

use testhost_bridge::protocol::message::{
    message_type, DiscoveryCompletePayload, Message, MessageLevel, TestMessagePayload,
    TestRunCompletePayload, TestRunRequestPayload,
};
use testhost_bridge::session::{DiscoveryResult, RunResult};
use testhost_bridge::AppError;

// ── Envelope ─────────────────────────────────────────────────────────────────

/// A payload that does not match the requested type is a protocol error
/// naming the message type.
#[test]
fn mismatched_payload_is_protocol_error() {
    let message = Message::new(message_type::DISCOVERY_COMPLETE, &"not an object").expect("build");

    let err = message
        .payload_as::<DiscoveryCompletePayload>()
        .expect_err("mismatch must fail");
    assert!(
        matches!(err, AppError::Protocol(ref msg) if msg.contains(message_type::DISCOVERY_COMPLETE)),
        "got {err:?}"
    );
}

/// `empty` messages carry a null payload and version zero.
#[test]
fn empty_message_has_null_payload() {
    let message = Message::empty(message_type::SESSION_END);
    assert!(message.payload.is_null());
    assert_eq!(message.version, 0);
}

// ── Payloads ─────────────────────────────────────────────────────────────────

/// Run requests by source omit the test case list on the wire.
#[test]
fn run_request_by_source_omits_test_cases() {
    let payload = TestRunRequestPayload {
        sources: Some(vec!["a.dll".into()]),
        test_cases: None,
        run_settings: None,
        debugging_enabled: false,
    };

    let value = serde_json::to_value(&payload).expect("serialise");
    assert_eq!(value["Sources"], json!(["a.dll"]));
    assert!(value.get("TestCases").is_none(), "{value}");
    assert_eq!(value["DebuggingEnabled"], json!(false));
}

/// Log levels use their variant names on the wire.
#[test]
fn test_message_payload_wire_shape() {
    let payload: TestMessagePayload =
        serde_json::from_value(json!({ "MessageLevel": "Warning", "Message": "slow test" }))
            .expect("deserialise");
    assert_eq!(payload.message_level, MessageLevel::Warning);
    assert_eq!(payload.message, "slow test");
}

// ── Terminal results ─────────────────────────────────────────────────────────

#[test]
fn aborted_discovery_result_reports_minus_one() {
    let result = DiscoveryResult::aborted();
    assert_eq!(result.total_count, -1);
    assert!(result.last_chunk.is_none());
    assert!(result.is_aborted);
}

#[test]
fn aborted_run_result_carries_reason() {
    let result = RunResult::aborted("worker went away");
    assert!(result.completion_args.is_aborted);
    assert!(!result.completion_args.is_canceled);
    assert_eq!(result.completion_args.error.as_deref(), Some("worker went away"));
    assert!(result.attachments.is_empty());
    assert!(result.executor_uris.is_empty());
}

#[test]
fn discovery_result_from_complete_payload() {
    let payload: DiscoveryCompletePayload = serde_json::from_value(json!({
        "TotalTests": 4,
        "LastDiscoveredTests": [{ "FullyQualifiedName": "t4" }],
        "IsAborted": false
    }))
    .expect("deserialise");

    let result = DiscoveryResult::from(payload);
    assert_eq!(result.total_count, 4);
    assert_eq!(result.last_chunk.map(|chunk| chunk.len()), Some(1));
    assert!(!result.is_aborted);
}

#[test]
fn run_result_from_complete_payload() {
    let payload: TestRunCompletePayload = serde_json::from_value(json!({
        "TestRunCompleteArgs": { "IsCanceled": true, "IsAborted": false },
        "RunAttachments": [{ "Uri": "attachment://1" }],
        "ExecutorUris": ["executor://x"]
    }))
    .expect("deserialise");

    let result = RunResult::from(payload);
    assert!(result.completion_args.is_canceled);
    assert_eq!(result.attachments.len(), 1);
    assert_eq!(result.executor_uris, vec!["executor://x"]);
    assert!(result.last_chunk_results.is_none());
}
