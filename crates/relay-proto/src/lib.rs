//! Wire model for Relay RPC connections.
//!
//! Every message exchanged over a connection is a `(Header, Body)` pair. A request message
//! carries a fully populated [`Request`] in its header and the action parameters in its body; a
//! reply carries only the request id it answers, plus either a result body or an error in the
//! header.
//!
//! The connection engine never assumes an encoding. It talks to the transport through the
//! [`codec`] traits; [`json::JsonCodec`] is the codec shipped with this crate.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub mod codec;
pub mod json;

pub use codec::{Codec, CodecError, MessageReader, MessageWriter};
pub use json::{JsonCodec, JsonHalves, JsonReader, JsonWriter};

/// Protocol version stamped on every header a connection writes.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum size of a single encoded message (not including the 4-byte length prefix).
pub const DEFAULT_MAX_FRAME_LEN: u32 = 64 * 1024 * 1024; // 64 MiB

pub type RequestId = u64;

/// A message body: a self-describing document. `Null` stands for an absent body.
pub type Body = serde_json::Value;

/// Identifies the target object (`type_name`, `id`, `version`) and the operation (`action`) of a
/// call.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Request {
    /// Name of the facade type, e.g. `"Application"`.
    #[serde(rename = "type")]
    pub type_name: String,
    /// Facade version. Method sets are looked up exactly for this version; there is no
    /// fallback, so negative or unregistered versions resolve to "unknown version".
    pub version: i64,
    /// Object instance id, interpreted by the facade's object factory.
    pub id: String,
    /// Name of the action to invoke on the resolved object.
    #[serde(rename = "request")]
    pub action: String,
}

impl Request {
    pub fn new(
        type_name: impl Into<String>,
        version: i64,
        id: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            type_name: type_name.into(),
            version,
            id: id.into(),
            action: action.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.type_name.is_empty() && self.action.is_empty()
    }
}

/// The envelope correlating a request and its eventual reply.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Header {
    /// Assigned by the side that initiates the call and echoed back in the reply.
    pub request_id: RequestId,
    /// Populated for requests, empty for replies.
    pub request: Request,
    /// Codec protocol version, see [`PROTOCOL_VERSION`].
    pub version: u32,
    /// Error message; empty on success.
    pub error: String,
    /// Error classification code; empty when the error carries no code.
    pub error_code: String,
}

impl Header {
    pub fn request(request_id: RequestId, request: Request) -> Self {
        Self {
            request_id,
            request,
            version: PROTOCOL_VERSION,
            ..Self::default()
        }
    }

    pub fn reply(request_id: RequestId) -> Self {
        Self {
            request_id,
            version: PROTOCOL_VERSION,
            ..Self::default()
        }
    }

    /// Whether this header starts a call (as opposed to answering one).
    pub fn is_request(&self) -> bool {
        !self.request.is_empty()
    }

    pub fn is_error(&self) -> bool {
        !self.error.is_empty()
    }
}

/// The "no parameters / no result" shape. Encodes as `{}` and decodes from any object or from an
/// absent body.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Empty {}

/// Encodes a typed value into a message body.
pub fn encode_body<T: Serialize + ?Sized>(value: &T) -> Result<Body, serde_json::Error> {
    serde_json::to_value(value)
}

/// Decodes a message body into a typed value.
///
/// An absent body that does not decode as-is is retried as an empty object, so callers that send
/// no parameters reach a handler with the zero value of its parameter type, and replies without a
/// result decode into struct-shaped result types.
pub fn decode_body<T: DeserializeOwned>(body: Body) -> Result<T, serde_json::Error> {
    if !body.is_null() {
        return serde_json::from_value(body);
    }
    match serde_json::from_value(Body::Null) {
        Ok(value) => Ok(value),
        Err(err) => serde_json::from_value(Body::Object(serde_json::Map::new())).map_err(|_| err),
    }
}
