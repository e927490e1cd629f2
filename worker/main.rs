#![forbid(unsafe_code)]

//! `testhost-bridge-worker`: reference worker for the session protocol.
//!
//! Connects back to the client on the port given as `/port:<n>`, completes
//! the handshake, and answers discovery and run requests with synthetic test
//! cases: one per source. Used by the end-to-end tests and as a protocol
//! reference for real workers.

use clap::{Parser, ValueEnum};
use futures_util::{FutureExt, SinkExt, StreamExt};
use serde_json::{json, Map, Value};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use testhost_bridge::process::args::parse_port_argument;
use testhost_bridge::protocol::codec::MessageCodec;
use testhost_bridge::protocol::message::{
    message_type, CustomHostLaunchAckPayload, DiscoveryCompletePayload, DiscoveryRequestPayload,
    Message, MessageLevel, TestCase, TestMessagePayload, TestRunCompleteArgs,
    TestRunCompletePayload, TestRunRequestPayload, PROTOCOL_VERSION,
};
use testhost_bridge::{AppError, Result};

type Connection = Framed<TcpStream, MessageCodec>;

const EXECUTOR_URI: &str = "executor://testhost-bridge/reference";

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(
    name = "testhost-bridge-worker",
    about = "Reference worker for the testhost-bridge session protocol",
    version,
    long_about = None
)]
struct Cli {
    /// Protocol version reported in the version check reply.
    #[arg(long, default_value_t = PROTOCOL_VERSION)]
    protocol_version: i32,

    /// Exit after completing this many discovery or run requests.
    #[arg(long)]
    exit_after_requests: Option<usize>,

    /// Complete the handshake, then read requests without ever answering.
    #[arg(long)]
    ignore_requests: bool,

    /// Log output format (text or json). Logs go to stderr.
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Protocol arguments: `/port:<n>`, `/parentprocessid:<pid>`, `/diag:<path>`.
    protocol_args: Vec<String>,
}

/// Whether the request loop keeps going after a message.
enum Flow {
    Continue,
    Completed,
    Exit,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format)?;

    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    let port = cli
        .protocol_args
        .iter()
        .find_map(|arg| parse_port_argument(arg).ok())
        .ok_or_else(|| AppError::Config("missing /port:<n> argument".into()))?;
    info!(port, args = ?cli.protocol_args, "worker starting");

    let stream = TcpStream::connect(("127.0.0.1", port))
        .await
        .map_err(|err| AppError::Transport(format!("failed to connect to client: {err}")))?;
    let mut conn = Framed::new(stream, MessageCodec::new());

    conn.send(Message::empty(message_type::SESSION_CONNECTED))
        .await?;

    let mut completed = 0_usize;
    while let Some(frame) = conn.next().await {
        let message = frame?;
        debug!(message_type = message.message_type, "request received");

        if cli.ignore_requests
            && !message.is(message_type::VERSION_CHECK)
            && !message.is(message_type::SESSION_END)
        {
            debug!(message_type = message.message_type, "request ignored");
            continue;
        }

        match handle_request(&mut conn, &message, cli.protocol_version).await? {
            Flow::Continue => {}
            Flow::Completed => completed += 1,
            Flow::Exit => break,
        }

        if cli.exit_after_requests == Some(completed) {
            info!(completed, "request limit reached");
            break;
        }
    }

    info!("worker exiting");
    Ok(())
}

async fn handle_request(conn: &mut Connection, message: &Message, version: i32) -> Result<Flow> {
    match message.message_type.as_str() {
        message_type::VERSION_CHECK => {
            let reply = Message::versioned(message_type::VERSION_CHECK, version, &version)?;
            conn.send(reply).await?;
            Ok(Flow::Continue)
        }
        message_type::EXTENSIONS_INITIALIZE => {
            let paths: Vec<String> = message.payload_as()?;
            info!(count = paths.len(), "extensions initialized");
            Ok(Flow::Continue)
        }
        message_type::START_DISCOVERY => {
            let request: DiscoveryRequestPayload = message.payload_as()?;
            discover(conn, &request).await
        }
        message_type::TEST_RUN_ALL_SOURCES_WITH_DEFAULT_HOST
        | message_type::TEST_RUN_SELECTED_TEST_CASES_DEFAULT_HOST => {
            let request: TestRunRequestPayload = message.payload_as()?;
            execute(conn, &request, false).await
        }
        message_type::GET_TEST_RUNNER_PROCESS_START_INFO_FOR_RUN_ALL
        | message_type::GET_TEST_RUNNER_PROCESS_START_INFO_FOR_RUN_SELECTED => {
            let request: TestRunRequestPayload = message.payload_as()?;
            execute(conn, &request, true).await
        }
        message_type::CANCEL_TEST_RUN => {
            debug!("cancel received with no run in flight");
            Ok(Flow::Continue)
        }
        message_type::SESSION_END => Ok(Flow::Exit),
        other => {
            warn!(message_type = other, "ignoring unexpected request");
            Ok(Flow::Continue)
        }
    }
}

async fn discover(conn: &mut Connection, request: &DiscoveryRequestPayload) -> Result<Flow> {
    for source in &request.sources {
        let found = vec![test_case_for(source)];
        conn.send(Message::new(message_type::TEST_CASES_FOUND, &found)?)
            .await?;
    }

    let total = request.sources.len();
    send_log(
        conn,
        MessageLevel::Informational,
        &format!("Discovered {total} test(s)."),
    )
    .await?;

    let complete = DiscoveryCompletePayload {
        total_tests: i64::try_from(total).unwrap_or(i64::MAX),
        last_discovered_tests: None,
        is_aborted: false,
    };
    conn.send(Message::new(message_type::DISCOVERY_COMPLETE, &complete)?)
        .await?;
    Ok(Flow::Completed)
}

async fn execute(
    conn: &mut Connection,
    request: &TestRunRequestPayload,
    custom_host: bool,
) -> Result<Flow> {
    let tests: Vec<TestCase> = match (&request.test_cases, &request.sources) {
        (Some(cases), _) => cases.clone(),
        (None, Some(sources)) => sources.iter().map(|s| test_case_for(s)).collect(),
        (None, None) => Vec::new(),
    };

    let mut canceled = false;
    if custom_host {
        match launch_custom_host(conn, request.debugging_enabled).await? {
            Some(ack) if ack.process_id > 0 => info!(pid = ack.process_id, "custom host launched"),
            Some(ack) => {
                let reason = ack.error_message.unwrap_or_default();
                send_log(
                    conn,
                    MessageLevel::Warning,
                    &format!("Custom test host launch failed: {reason}"),
                )
                .await?;
            }
            None => canceled = true,
        }
    }

    for (index, test) in tests.iter().enumerate() {
        if canceled || cancel_requested(conn)? {
            canceled = true;
            break;
        }
        let stats = json!({
            "NewTestResults": [{ "TestCase": test, "Outcome": "Passed" }],
            "TestRunStatistics": { "ExecutedTests": index + 1 },
        });
        conn.send(Message::new(message_type::TEST_RUN_STATS_CHANGE, &stats)?)
            .await?;
    }

    let mut extra = Map::new();
    extra.insert("ExecutedTests".into(), Value::from(tests.len()));
    let complete = TestRunCompletePayload {
        test_run_complete_args: TestRunCompleteArgs {
            is_canceled: canceled,
            is_aborted: false,
            error: None,
            extra,
        },
        last_run_tests: None,
        run_attachments: Vec::new(),
        executor_uris: vec![EXECUTOR_URI.to_owned()],
    };
    conn.send(Message::new(message_type::EXECUTION_COMPLETE, &complete)?)
        .await?;
    Ok(Flow::Completed)
}

/// Ask the client to start a test host and wait for its reply. Returns `None`
/// if the run was cancelled first.
async fn launch_custom_host(
    conn: &mut Connection,
    debugging_enabled: bool,
) -> Result<Option<CustomHostLaunchAckPayload>> {
    let arguments = if debugging_enabled { "--debug" } else { "" };
    let start_info = json!({
        "FileName": "testhost",
        "Arguments": arguments,
        "WorkingDirectory": null,
        "EnvironmentVariables": {},
    });
    conn.send(Message::new(message_type::CUSTOM_TEST_HOST_LAUNCH, &start_info)?)
        .await?;

    while let Some(frame) = conn.next().await {
        let message = frame?;
        match message.message_type.as_str() {
            message_type::CUSTOM_TEST_HOST_LAUNCH_CALLBACK => return message.payload_as().map(Some),
            message_type::CANCEL_TEST_RUN => return Ok(None),
            other => warn!(message_type = other, "ignoring message while awaiting host launch"),
        }
    }

    Err(AppError::Transport(
        "client disconnected while awaiting host launch".into(),
    ))
}

/// Check for a cancel request without waiting.
fn cancel_requested(conn: &mut Connection) -> Result<bool> {
    match conn.next().now_or_never() {
        Some(Some(frame)) => {
            let message = frame?;
            if message.is(message_type::CANCEL_TEST_RUN) {
                info!("run cancelled by client");
                return Ok(true);
            }
            warn!(message_type = message.message_type, "ignoring message during run");
            Ok(false)
        }
        Some(None) => Err(AppError::Transport("client disconnected during run".into())),
        None => Ok(false),
    }
}

async fn send_log(conn: &mut Connection, level: MessageLevel, text: &str) -> Result<()> {
    let payload = TestMessagePayload {
        message_level: level,
        message: text.to_owned(),
    };
    conn.send(Message::new(message_type::TEST_MESSAGE, &payload)?)
        .await
}

fn test_case_for(source: &str) -> TestCase {
    json!({
        "FullyQualifiedName": format!("{source}::passes"),
        "Source": source,
    })
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter).with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
