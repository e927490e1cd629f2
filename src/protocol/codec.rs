//! Newline-delimited JSON codec for session channels.
//!
//! Wraps [`tokio_util::codec::LinesCodec`] with a maximum frame length and
//! converts each complete line to and from a [`Message`]. A frame is only
//! yielded once its terminating `\n` has arrived, so receivers never observe
//! a partial message.
//!
//! Use [`MessageCodec`] as the codec parameter for
//! [`tokio_util::codec::FramedRead`] and [`tokio_util::codec::FramedWrite`].

use bytes::BytesMut;
use serde::Serialize;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use crate::protocol::message::Message;
use crate::{AppError, Result};

/// Maximum encoded message length accepted on the inbound side: 16 MiB.
///
/// Discovery batches for large test containers are big, but a frame past this
/// limit means a broken or hostile peer.
pub const MAX_FRAME_BYTES: usize = 16 * 1_048_576;

/// Encode an envelope built from its parts into a single frame, without the
/// trailing delimiter.
///
/// # Errors
///
/// Returns `AppError::Protocol` if `payload` cannot be serialised.
pub fn encode(message_type: &str, version: i32, payload: &impl Serialize) -> Result<String> {
    let message = Message::versioned(message_type, version, payload)?;
    encode_message(&message)
}

/// Encode a [`Message`] into a single frame, without the trailing delimiter.
///
/// # Errors
///
/// Returns `AppError::Protocol` if serialisation fails.
pub fn encode_message(message: &Message) -> Result<String> {
    serde_json::to_string(message).map_err(|err| {
        AppError::Protocol(format!(
            "failed to encode {} message: {err}",
            message.message_type
        ))
    })
}

/// Decode one frame into a [`Message`].
///
/// # Errors
///
/// Returns `AppError::Protocol` if the frame is not a valid envelope.
pub fn decode(frame: &str) -> Result<Message> {
    serde_json::from_str(frame.trim())
        .map_err(|err| AppError::Protocol(format!("malformed message: {err}")))
}

/// Codec yielding one [`Message`] per newline-terminated JSON line.
///
/// Blank lines are skipped. Lines over [`MAX_FRAME_BYTES`] and lines that are
/// not valid envelopes return [`AppError::Protocol`]; I/O failures return
/// [`AppError::Transport`].
#[derive(Debug)]
pub struct MessageCodec(LinesCodec);

impl MessageCodec {
    /// Create a codec with the default [`MAX_FRAME_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self(LinesCodec::new_with_max_length(MAX_FRAME_BYTES))
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            match self.0.decode(src).map_err(map_codec_error)? {
                None => return Ok(None),
                Some(line) if line.trim().is_empty() => {}
                Some(line) => return decode(&line).map(Some),
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            match self.0.decode_eof(src).map_err(map_codec_error)? {
                None => return Ok(None),
                Some(line) if line.trim().is_empty() => {}
                Some(line) => return decode(&line).map(Some),
            }
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = AppError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<()> {
        let line = encode_message(&item)?;
        self.0.encode(line, dst).map_err(map_codec_error)
    }
}

fn map_codec_error(e: LinesCodecError) -> AppError {
    match e {
        LinesCodecError::MaxLineLengthExceeded => {
            AppError::Protocol(format!("frame too long: exceeded {MAX_FRAME_BYTES} bytes"))
        }
        LinesCodecError::Io(io_err) => AppError::Transport(io_err.to_string()),
    }
}
