//! Loopback TCP implementation of [`Channel`].
//!
//! The client binds `127.0.0.1:0`, reports the chosen port, and accepts a
//! single worker connection. The accepted stream is split so that a pending
//! receive never blocks a send: the read half sits behind one async mutex and
//! the write half behind another, each wrapped in a [`MessageCodec`] frame.
//!
//! Closing the channel cancels a shared token. Every pending accept or
//! receive observes it and returns, so a receive abandoned by an aborted
//! operation does not outlive the channel.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::channel::{Channel, ChannelFuture};
use crate::protocol::codec::MessageCodec;
use crate::protocol::message::Message;
use crate::{AppError, Result};

/// Connection progress: `None` while accepting, `Some(true)` once a worker
/// connected, `Some(false)` if accepting failed or the channel closed first.
type ConnectionState = Option<bool>;

/// Loopback TCP [`Channel`]. Cheap to clone; clones share one connection.
#[derive(Debug, Clone)]
pub struct SocketChannel {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    listener: Mutex<Option<TcpListener>>,
    reader: AsyncMutex<Option<FramedRead<OwnedReadHalf, MessageCodec>>>,
    writer: AsyncMutex<Option<FramedWrite<OwnedWriteHalf, MessageCodec>>>,
    connected: watch::Sender<ConnectionState>,
    closed: CancellationToken,
}

impl SocketChannel {
    /// Create an idle channel. Call [`Channel::listen`] to bind it.
    #[must_use]
    pub fn new() -> Self {
        let (connected, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                listener: Mutex::new(None),
                reader: AsyncMutex::new(None),
                writer: AsyncMutex::new(None),
                connected,
                closed: CancellationToken::new(),
            }),
        }
    }

    /// Whether [`Channel::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }
}

impl Default for SocketChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    fn take_listener(&self) -> Option<TcpListener> {
        self.listener.lock().ok().and_then(|mut guard| guard.take())
    }

    async fn accept_one(&self) {
        let Some(listener) = self.take_listener() else {
            warn!("accept requested before listen");
            self.connected.send_replace(Some(false));
            return;
        };

        tokio::select! {
            () = self.closed.cancelled() => {
                debug!("channel closed while accepting");
                self.connected.send_replace(Some(false));
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if let Err(err) = stream.set_nodelay(true) {
                        debug!(%err, "failed to set TCP_NODELAY");
                    }
                    let (read_half, write_half) = stream.into_split();
                    *self.reader.lock().await = Some(FramedRead::new(read_half, MessageCodec::new()));
                    *self.writer.lock().await = Some(FramedWrite::new(write_half, MessageCodec::new()));
                    self.connected.send_replace(Some(true));
                    info!(%peer, "worker connected");
                }
                Err(err) => {
                    warn!(%err, "accept failed");
                    self.connected.send_replace(Some(false));
                }
            }
        }
    }

    async fn read_next(&self) -> Result<Message> {
        let mut guard = self.reader.lock().await;
        let Some(framed) = guard.as_mut() else {
            return Err(AppError::Transport("no worker connected".into()));
        };

        match framed.next().await {
            Some(Ok(message)) => Ok(message),
            Some(Err(err)) => Err(err),
            None => Err(AppError::Transport("connection closed by worker".into())),
        }
    }
}

impl Channel for SocketChannel {
    fn listen(&self) -> ChannelFuture<'_, Result<u16>> {
        Box::pin(async move {
            if self.is_closed() {
                return Err(AppError::Transport("channel closed".into()));
            }

            let listener = TcpListener::bind(("127.0.0.1", 0))
                .await
                .map_err(|err| AppError::Transport(format!("failed to bind listener: {err}")))?;
            let port = listener
                .local_addr()
                .map_err(|err| AppError::Transport(format!("failed to read local address: {err}")))?
                .port();

            let mut slot = self
                .inner
                .listener
                .lock()
                .map_err(|_| AppError::Transport("listener lock poisoned".into()))?;
            *slot = Some(listener);

            info!(port, "channel listening");
            Ok(port)
        })
    }

    fn accept_async(&self) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(
            async move { inner.accept_one().await }.instrument(info_span!("channel_accept")),
        );
    }

    fn wait_for_connection(&self, timeout: Duration) -> ChannelFuture<'_, bool> {
        Box::pin(async move {
            let mut rx = self.inner.connected.subscribe();
            let settled = rx.wait_for(Option::is_some);
            if let Ok(Ok(state)) = tokio::time::timeout(timeout, settled).await {
                return *state == Some(true);
            }
            false
        })
    }

    fn send(&self, message: Message) -> ChannelFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.is_closed() {
                return Err(AppError::Transport("channel closed".into()));
            }

            let mut guard = self.inner.writer.lock().await;
            let Some(framed) = guard.as_mut() else {
                return Err(AppError::Transport("no worker connected".into()));
            };

            let message_type = message.message_type.clone();
            framed.send(message).await.map_err(|err| {
                warn!(message_type, %err, "channel send failed");
                err
            })?;
            debug!(message_type, "message sent");
            Ok(())
        })
    }

    fn receive(&self) -> ChannelFuture<'_, Result<Message>> {
        Box::pin(async move {
            tokio::select! {
                () = self.inner.closed.cancelled() => {
                    Err(AppError::Transport("channel closed".into()))
                }
                result = self.inner.read_next() => result,
            }
        })
    }

    fn close(&self) -> ChannelFuture<'_, ()> {
        Box::pin(async move {
            if self.inner.closed.is_cancelled() {
                return;
            }
            self.inner.closed.cancel();
            drop(self.inner.take_listener());
            self.inner.connected.send_if_modified(|state| {
                if state.is_none() {
                    *state = Some(false);
                    true
                } else {
                    false
                }
            });

            if let Some(mut writer) = self.inner.writer.lock().await.take() {
                if let Err(err) = writer.close().await {
                    debug!(%err, "error shutting down channel writer");
                }
            }
            drop(self.inner.reader.lock().await.take());

            info!("channel closed");
        })
    }
}
