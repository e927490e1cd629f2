//! Version handshake with a freshly connected worker.
//!
//! The client never speaks first:
//!
//! 1. worker → client `SessionConnected`
//! 2. client → worker `VersionCheck` (no payload)
//! 3. worker → client `VersionCheck` with the negotiated version as payload
//!
//! Only [`PROTOCOL_VERSION`] is accepted.

use tracing::{debug, info};

use crate::channel::Channel;
use crate::protocol::message::{message_type, Message, PROTOCOL_VERSION};
use crate::{AppError, Result};

/// Run the handshake over a connected `channel`.
///
/// # Errors
///
/// - `AppError::Handshake` if the worker sends an unexpected message, the
///   version check cannot be sent, or the negotiated version is unsupported.
/// - `AppError::Transport` / `AppError::Protocol` if receiving fails.
pub async fn negotiate(channel: &dyn Channel) -> Result<()> {
    let connected = channel.receive().await?;
    if !connected.is(message_type::SESSION_CONNECTED) {
        return Err(AppError::Handshake(format!(
            "expected {} as first message, got {}",
            message_type::SESSION_CONNECTED,
            connected.message_type
        )));
    }
    debug!("handshake: session connected");

    channel
        .send(Message::empty(message_type::VERSION_CHECK))
        .await
        .map_err(|err| AppError::Handshake(format!("failed to send version check: {err}")))?;
    debug!("handshake: version check sent");

    let reply = channel.receive().await?;
    if !reply.is(message_type::VERSION_CHECK) {
        return Err(AppError::Handshake(format!(
            "expected {} reply, got {}",
            message_type::VERSION_CHECK,
            reply.message_type
        )));
    }

    let version: i32 = reply
        .payload_as()
        .map_err(|err| AppError::Handshake(format!("invalid version check reply: {err}")))?;
    if version != PROTOCOL_VERSION {
        return Err(AppError::Handshake(format!(
            "worker negotiated protocol version {version}, client supports {PROTOCOL_VERSION}"
        )));
    }

    info!(version, "handshake: protocol version accepted");
    Ok(())
}
