//! Wire protocol spoken between the client and the worker process.
//!
//! - `message`: the [`Message`](message::Message) envelope, the message-type
//!   catalog, and the typed payloads the client reads or writes.
//! - `codec`: newline-delimited JSON framing for channels.

pub mod codec;
pub mod message;
