//! Duplex message transport between the client and one worker.
//!
//! The [`Channel`] trait is the seam between the session driver and the
//! concrete transport. [`socket::SocketChannel`] is the loopback TCP
//! implementation used for real workers.

pub mod socket;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use crate::protocol::message::Message;
use crate::Result;

/// Boxed future returned by [`Channel`] methods.
pub type ChannelFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Transport contract for a single client/worker conversation.
///
/// A channel listens once, accepts exactly one peer, and then carries whole
/// [`Message`]s in both directions. Implementations must never hand a partial
/// message to [`Channel::receive`] callers.
pub trait Channel: Send + Sync {
    /// Start listening and return the port the worker must connect to.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Transport`](crate::AppError::Transport) if the
    /// listener cannot be created.
    fn listen(&self) -> ChannelFuture<'_, Result<u16>>;

    /// Begin accepting one peer in the background. Returns immediately.
    fn accept_async(&self);

    /// Wait up to `timeout` for the peer accepted by
    /// [`Channel::accept_async`]. Returns `true` once connected.
    fn wait_for_connection(&self, timeout: Duration) -> ChannelFuture<'_, bool>;

    /// Send one message.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Transport`](crate::AppError::Transport) if no peer
    /// is connected, the channel is closed, or the write fails.
    fn send(&self, message: Message) -> ChannelFuture<'_, Result<()>>;

    /// Wait until one complete message is available and return it.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Transport`](crate::AppError::Transport) if the peer
    /// disconnected, the channel was closed, or the read fails, and
    /// [`AppError::Protocol`](crate::AppError::Protocol) if the frame is not a
    /// valid envelope.
    fn receive(&self) -> ChannelFuture<'_, Result<Message>>;

    /// Close the channel. Idempotent.
    fn close(&self) -> ChannelFuture<'_, ()>;
}
