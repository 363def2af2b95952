//! Codec boundary consumed by the connection engine.
//!
//! A codec is split into a reader half and a writer half so the connection can read and write
//! independently. The reader yields one [`Header`] at a time followed by its body; the writer
//! emits whole `(Header, Body)` messages.

use std::future::Future;

use crate::{Body, Header};

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("I/O error: {message}")]
    Io { message: String },

    #[error("allocation failed: {message}")]
    AllocationFailed { message: String },

    #[error("frame too large: {len} > {max}")]
    FrameTooLarge { len: u32, max: u32 },

    #[error("decode error: {message}")]
    Decode { message: String },

    #[error("encode error: {message}")]
    Encode { message: String },

    #[error("protocol violation: {message}")]
    ProtocolViolation { message: String },

    /// The peer closed the stream at a message boundary.
    #[error("connection closed")]
    Closed,
}

impl CodecError {
    /// Whether the error is an orderly end of stream rather than a failure.
    pub fn is_closed(&self) -> bool {
        matches!(self, CodecError::Closed)
    }
}

impl From<std::io::Error> for CodecError {
    fn from(err: std::io::Error) -> Self {
        CodecError::Io {
            message: err.to_string(),
        }
    }
}

/// Reading half of a codec.
pub trait MessageReader: Send + 'static {
    /// Reads the next message header.
    ///
    /// Errors here are fatal for the stream: the caller must stop reading.
    fn read_header(&mut self) -> impl Future<Output = Result<Header, CodecError>> + Send;

    /// Reads the body of the message whose header was returned last.
    ///
    /// Must be called exactly once per header, even when the body is going to be discarded, so
    /// the stream stays positioned on the next message.
    fn read_body(
        &mut self,
        is_request: bool,
    ) -> impl Future<Output = Result<Body, CodecError>> + Send;
}

/// Writing half of a codec.
pub trait MessageWriter: Send + 'static {
    fn write_message(
        &mut self,
        header: &Header,
        body: &Body,
    ) -> impl Future<Output = Result<(), CodecError>> + Send;

    /// Flushes and shuts down the underlying stream. The peer observes end of stream.
    fn close(&mut self) -> impl Future<Output = Result<(), CodecError>> + Send;
}

/// A symmetric codec: the same type encodes requests and replies in both directions.
pub trait Codec: Send + 'static {
    type Reader: MessageReader;
    type Writer: MessageWriter;

    fn into_split(self) -> (Self::Reader, Self::Writer);
}
