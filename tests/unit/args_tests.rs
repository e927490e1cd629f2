//! Unit tests for worker command-line arguments.

use std::path::PathBuf;

use testhost_bridge::process::args::{format_port_argument, parse_port_argument, ConsoleParameters};
use testhost_bridge::{AppError, BridgeConfig};

#[test]
fn port_only_parameters_render_single_argument() {
    assert_eq!(ConsoleParameters::for_port(51234).to_args(), vec!["/port:51234"]);
}

#[test]
fn default_config_passes_port_only() {
    let config = BridgeConfig::new("/opt/worker");
    let params = ConsoleParameters::from_config(4242, &config);
    assert_eq!(params.parent_process_id, None);
    assert_eq!(params.to_args(), vec!["/port:4242"]);
}

#[test]
fn inherited_parent_id_is_this_process() {
    let mut config = BridgeConfig::new("/opt/worker");
    config.inherit_parent_process_id = true;
    let params = ConsoleParameters::from_config(4242, &config);
    assert_eq!(
        params.to_args(),
        vec![format!("/parentprocessid:{}", std::process::id()), "/port:4242".to_owned()]
    );
}

#[test]
fn diag_follows_port_without_parent() {
    let params = ConsoleParameters {
        port: 9,
        parent_process_id: None,
        log_file_path: Some(PathBuf::from("worker.log")),
    };
    assert_eq!(params.to_args(), vec!["/port:9", "/diag:worker.log"]);
}

#[test]
fn formatted_port_parses_back() {
    let arg = format_port_argument(40000);
    assert_eq!(parse_port_argument(&arg).expect("parse"), 40000);
}

#[test]
fn zero_port_is_rejected() {
    let err = parse_port_argument("/port:0").expect_err("port 0 must fail");
    assert!(matches!(err, AppError::Config(_)));
}

#[test]
fn out_of_range_port_is_rejected() {
    assert!(parse_port_argument("/port:70000").is_err());
    assert!(parse_port_argument("/port:abc").is_err());
}

#[test]
fn other_arguments_are_not_ports() {
    assert!(parse_port_argument("/parentprocessid:12").is_err());
    assert!(parse_port_argument("/po").is_err());
}
