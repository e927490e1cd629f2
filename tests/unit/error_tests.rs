//! Unit tests for `AppError` display and conversions.

use testhost_bridge::AppError;

#[test]
fn display_prefixes_kind() {
    let cases = [
        (AppError::Config("bad".into()), "config: bad"),
        (AppError::Transport("gone".into()), "transport: gone"),
        (AppError::Handshake("v2".into()), "handshake: v2"),
        (AppError::Protocol("junk".into()), "protocol: junk"),
        (AppError::Process("spawn".into()), "process: spawn"),
        (AppError::InvalidState("busy".into()), "invalid state: busy"),
    ];

    for (err, expected) in cases {
        assert_eq!(err.to_string(), expected);
    }
}

#[test]
fn json_errors_become_protocol_errors() {
    let json_err = serde_json::from_str::<serde_json::Value>("{").expect_err("invalid json");
    let err = AppError::from(json_err);
    assert!(matches!(err, AppError::Protocol(_)), "got {err:?}");
}

#[test]
fn io_errors_become_transport_errors() {
    let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
    let err = AppError::from(io_err);
    assert!(matches!(err, AppError::Transport(ref msg) if msg.contains("pipe closed")));
}

#[test]
fn toml_errors_become_config_errors() {
    let toml_err = toml::from_str::<toml::Value>("= nope").expect_err("invalid toml");
    let err = AppError::from(toml_err);
    assert!(matches!(err, AppError::Config(_)), "got {err:?}");
}
