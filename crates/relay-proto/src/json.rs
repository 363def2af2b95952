//! Length-prefixed JSON codec.
//!
//! Each message is a u32 little-endian length prefix followed by a single JSON object:
//!
//! ```json
//! {"request-id":1,"type":"Application","version":2,"id":"","request":"Deploy","params":{}}
//! {"request-id":1,"response":{"results":[]}}
//! {"request-id":2,"error":"unknown object type \"Foo\"","error-code":"not implemented"}
//! ```
//!
//! The whole message is read when its header is requested, so a body that later fails to decode
//! into its target type never leaves the stream half-consumed.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

use crate::codec::{Codec, CodecError, MessageReader, MessageWriter};
use crate::{Body, Header, Request, RequestId, DEFAULT_MAX_FRAME_LEN, PROTOCOL_VERSION};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct InMessage {
    #[serde(rename = "request-id")]
    request_id: RequestId,
    #[serde(rename = "type")]
    type_name: String,
    version: i64,
    id: String,
    request: String,
    params: Body,
    error: String,
    #[serde(rename = "error-code")]
    error_code: String,
    response: Body,
}

#[derive(Debug, Serialize)]
struct OutMessage<'a> {
    #[serde(rename = "request-id")]
    request_id: RequestId,
    #[serde(rename = "type", skip_serializing_if = "is_empty_str")]
    type_name: &'a str,
    #[serde(skip_serializing_if = "is_zero")]
    version: i64,
    #[serde(skip_serializing_if = "is_empty_str")]
    id: &'a str,
    #[serde(skip_serializing_if = "is_empty_str")]
    request: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<&'a Body>,
    #[serde(skip_serializing_if = "is_empty_str")]
    error: &'a str,
    #[serde(rename = "error-code", skip_serializing_if = "is_empty_str")]
    error_code: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    response: Option<&'a Body>,
}

fn is_empty_str(value: &&str) -> bool {
    value.is_empty()
}

fn is_zero(value: &i64) -> bool {
    *value == 0
}

impl<'a> OutMessage<'a> {
    fn new(header: &'a Header, body: &'a Body) -> Self {
        let body = (!body.is_null()).then_some(body);
        let is_request = header.is_request();
        Self {
            request_id: header.request_id,
            type_name: &header.request.type_name,
            version: header.request.version,
            id: &header.request.id,
            request: &header.request.action,
            params: body.filter(|_| is_request),
            error: &header.error,
            error_code: &header.error_code,
            response: body.filter(|_| !is_request),
        }
    }
}

/// A codec over a single bidirectional stream.
pub struct JsonCodec<S> {
    stream: S,
    max_frame_len: u32,
}

impl<S> JsonCodec<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    /// Caps the size of frames in both directions. Oversized frames are rejected before any
    /// buffer is allocated.
    pub fn with_max_frame_len(mut self, max_frame_len: u32) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }
}

impl<S> Codec for JsonCodec<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Reader = JsonReader<ReadHalf<S>>;
    type Writer = JsonWriter<WriteHalf<S>>;

    fn into_split(self) -> (Self::Reader, Self::Writer) {
        let (read_half, write_half) = tokio::io::split(self.stream);
        (
            JsonReader::new(read_half).with_max_frame_len(self.max_frame_len),
            JsonWriter::new(write_half).with_max_frame_len(self.max_frame_len),
        )
    }
}

/// A codec assembled from separately owned halves, e.g. `TcpStream::into_split`.
pub struct JsonHalves<R, W> {
    pub reader: JsonReader<R>,
    pub writer: JsonWriter<W>,
}

impl<R, W> Codec for JsonHalves<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    type Reader = JsonReader<R>;
    type Writer = JsonWriter<W>;

    fn into_split(self) -> (Self::Reader, Self::Writer) {
        (self.reader, self.writer)
    }
}

#[derive(Debug)]
struct UnreadBody {
    params: Body,
    response: Body,
}

pub struct JsonReader<R> {
    inner: R,
    max_frame_len: u32,
    body: Option<UnreadBody>,
}

impl<R> JsonReader<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            body: None,
        }
    }

    pub fn with_max_frame_len(mut self, max_frame_len: u32) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }
}

impl<R> MessageReader for JsonReader<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    async fn read_header(&mut self) -> Result<Header, CodecError> {
        if self.body.take().is_some() {
            tracing::debug!(target: "relay.proto", "discarding unread message body");
        }

        let frame = read_frame(&mut self.inner, self.max_frame_len).await?;
        let message: InMessage =
            serde_json::from_slice(&frame).map_err(|err| CodecError::Decode {
                message: err.to_string(),
            })?;

        self.body = Some(UnreadBody {
            params: message.params,
            response: message.response,
        });
        Ok(Header {
            request_id: message.request_id,
            request: Request {
                type_name: message.type_name,
                version: message.version,
                id: message.id,
                action: message.request,
            },
            version: PROTOCOL_VERSION,
            error: message.error,
            error_code: message.error_code,
        })
    }

    async fn read_body(&mut self, is_request: bool) -> Result<Body, CodecError> {
        let Some(body) = self.body.take() else {
            return Err(CodecError::ProtocolViolation {
                message: "message body read without a preceding header".into(),
            });
        };
        Ok(if is_request { body.params } else { body.response })
    }
}

pub struct JsonWriter<W> {
    inner: W,
    max_frame_len: u32,
}

impl<W> JsonWriter<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    pub fn with_max_frame_len(mut self, max_frame_len: u32) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }
}

impl<W> MessageWriter for JsonWriter<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn write_message(&mut self, header: &Header, body: &Body) -> Result<(), CodecError> {
        let payload = serde_json::to_vec(&OutMessage::new(header, body)).map_err(|err| {
            CodecError::Encode {
                message: err.to_string(),
            }
        })?;
        write_frame(&mut self.inner, self.max_frame_len, &payload).await
    }

    async fn close(&mut self) -> Result<(), CodecError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

async fn write_frame(
    stream: &mut (impl AsyncWrite + Unpin),
    max_frame_len: u32,
    payload: &[u8],
) -> Result<(), CodecError> {
    let len: u32 = payload
        .len()
        .try_into()
        .map_err(|_| CodecError::FrameTooLarge {
            len: u32::MAX,
            max: max_frame_len,
        })?;
    if len > max_frame_len {
        return Err(CodecError::FrameTooLarge {
            len,
            max: max_frame_len,
        });
    }

    stream.write_u32_le(len).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_frame(
    stream: &mut (impl AsyncRead + Unpin),
    max_frame_len: u32,
) -> Result<Vec<u8>, CodecError> {
    let len = match stream.read_u32_le().await {
        Ok(len) => len,
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(CodecError::Closed)
        }
        Err(err) => return Err(err.into()),
    };
    if len > max_frame_len {
        return Err(CodecError::FrameTooLarge {
            len,
            max: max_frame_len,
        });
    }

    // Reserve fallibly so allocation failure surfaces as an error instead of aborting the process.
    let len_usize = len as usize;
    let mut buf = Vec::new();
    buf.try_reserve_exact(len_usize)
        .map_err(|err| CodecError::AllocationFailed {
            message: format!("allocate frame buffer ({len} bytes): {err}"),
        })?;
    buf.resize(len_usize, 0);
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}
