//! Error model.
//!
//! Errors come in two tiers. Protocol errors (no service, [`NotImplementedError`], parameter
//! decoding, result encoding, shutdown) are produced by the connection itself and reach the peer
//! verbatim. Application errors ([`ApplicationError`]) come from object factories and handlers;
//! they pass through the connection's [`ErrorTransformer`], when one is installed, exactly once
//! before being written.

use std::fmt;
use std::sync::Arc;

use relay_proto::CodecError;

/// Code carried by every resolution failure: unknown type, version or method.
pub const CODE_NOT_IMPLEMENTED: &str = "not implemented";

pub(crate) const SHUTDOWN_MESSAGE: &str = "connection is shut down";
pub(crate) const NO_SERVICE_MESSAGE: &str = "no service";

/// An error that carries a classification code.
pub trait ErrorCoder {
    /// The code, or the empty string when the error is unclassified.
    fn error_code(&self) -> &str;
}

/// An error reported by the remote side of a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestError {
    pub message: String,
    pub code: String,
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.code.is_empty() {
            f.write_str(&self.message)
        } else {
            write!(f, "{} ({})", self.message, self.code)
        }
    }
}

impl std::error::Error for RequestError {}

impl ErrorCoder for RequestError {
    fn error_code(&self) -> &str {
        &self.code
    }
}

/// A resolution failure: the requested API surface does not exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotImplementedError {
    UnknownType {
        type_name: String,
    },
    UnknownVersion {
        type_name: String,
        version: i64,
    },
    UnknownMethod {
        type_name: String,
        version: i64,
        action: String,
    },
}

impl fmt::Display for NotImplementedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotImplementedError::UnknownType { type_name } => {
                write!(f, "unknown object type {type_name:?}")
            }
            NotImplementedError::UnknownVersion { type_name, version } => {
                write!(f, "unknown version ({version}) of interface {type_name:?}")
            }
            NotImplementedError::UnknownMethod {
                type_name,
                version: 0,
                action,
            } => write!(
                f,
                "no such request - method {type_name}.{action} is not implemented"
            ),
            NotImplementedError::UnknownMethod {
                type_name,
                version,
                action,
            } => write!(
                f,
                "no such request - method {type_name}({version}).{action} is not implemented"
            ),
        }
    }
}

impl std::error::Error for NotImplementedError {}

impl ErrorCoder for NotImplementedError {
    fn error_code(&self) -> &str {
        CODE_NOT_IMPLEMENTED
    }
}

/// A plain message with a code, for handlers that want to classify their errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodedError {
    pub message: String,
    pub code: String,
}

impl CodedError {
    pub fn new(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: code.into(),
        }
    }
}

impl fmt::Display for CodedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for CodedError {}

impl ErrorCoder for CodedError {
    fn error_code(&self) -> &str {
        &self.code
    }
}

/// An error produced by application code: an object factory or a handler.
///
/// Any `std::error::Error` converts into it, so handlers can use `?` freely. Codes are captured
/// from the error types defined in this crate; use [`ApplicationError::coded`] for other
/// [`ErrorCoder`] implementations.
#[derive(Debug)]
pub struct ApplicationError {
    inner: anyhow::Error,
    code: Option<String>,
}

impl ApplicationError {
    pub fn new<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::from_anyhow(anyhow::Error::new(err))
    }

    /// Wraps an error and records its code.
    pub fn coded<E>(err: E) -> Self
    where
        E: std::error::Error + ErrorCoder + Send + Sync + 'static,
    {
        let code = non_empty(err.error_code());
        Self {
            inner: anyhow::Error::new(err),
            code,
        }
    }

    pub fn msg<M>(message: M) -> Self
    where
        M: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        Self {
            inner: anyhow::Error::msg(message),
            code: None,
        }
    }

    pub fn from_anyhow(err: anyhow::Error) -> Self {
        let code = known_code(&err);
        Self { inner: err, code }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = non_empty(&code.into());
        self
    }

    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    pub fn message(&self) -> String {
        self.inner.to_string()
    }

    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.inner.downcast_ref::<E>()
    }

    pub fn into_anyhow(self) -> anyhow::Error {
        self.inner
    }

    pub(crate) fn to_request_error(&self) -> RequestError {
        RequestError {
            message: self.message(),
            code: self.code.clone().unwrap_or_default(),
        }
    }
}

impl fmt::Display for ApplicationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner, f)
    }
}

impl<E> From<E> for ApplicationError
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(err: E) -> Self {
        Self::new(err)
    }
}

fn non_empty(code: &str) -> Option<String> {
    (!code.is_empty()).then(|| code.to_owned())
}

fn known_code(err: &anyhow::Error) -> Option<String> {
    if let Some(err) = err.downcast_ref::<CodedError>() {
        return non_empty(err.error_code());
    }
    if let Some(err) = err.downcast_ref::<RequestError>() {
        return non_empty(err.error_code());
    }
    if let Some(err) = err.downcast_ref::<RpcError>() {
        return non_empty(err.error_code());
    }
    if let Some(err) = err.downcast_ref::<NotImplementedError>() {
        return non_empty(err.error_code());
    }
    None
}

/// Rewrites application errors before they are sent to the peer.
#[derive(Clone)]
pub struct ErrorTransformer(Arc<dyn Fn(ApplicationError) -> ApplicationError + Send + Sync>);

impl ErrorTransformer {
    pub fn new<F>(transform: F) -> Self
    where
        F: Fn(ApplicationError) -> ApplicationError + Send + Sync + 'static,
    {
        Self(Arc::new(transform))
    }

    pub fn apply(&self, err: ApplicationError) -> ApplicationError {
        (self.0)(err)
    }
}

impl fmt::Debug for ErrorTransformer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ErrorTransformer")
    }
}

/// Failure of a resolved [`crate::MethodCaller`].
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    /// The parameters did not decode into the method's parameter type.
    #[error("{message}")]
    Decode { message: String },

    /// The method's result could not be encoded.
    #[error("{message}")]
    Encode { message: String },

    #[error("{0}")]
    Application(ApplicationError),
}

impl From<ApplicationError> for CallError {
    fn from(err: ApplicationError) -> Self {
        CallError::Application(err)
    }
}

/// The error returned to a caller of [`crate::Connection::call`].
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// The peer answered with an error.
    #[error(transparent)]
    Request(#[from] RequestError),

    #[error("connection is shut down")]
    Shutdown,

    #[error("request canceled")]
    Canceled,

    #[error("encode error: {message}")]
    Encode { message: String },

    #[error("decode error: {message}")]
    Decode { message: String },

    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl RpcError {
    /// Whether the call failed because either end of the connection was shutting down.
    pub fn is_shutdown(&self) -> bool {
        match self {
            RpcError::Shutdown => true,
            RpcError::Request(err) => err.code.is_empty() && err.message == SHUTDOWN_MESSAGE,
            _ => false,
        }
    }

    pub fn is_not_implemented(&self) -> bool {
        self.error_code() == CODE_NOT_IMPLEMENTED
    }

    /// The code of a remote error, or the empty string.
    pub fn code(&self) -> &str {
        self.error_code()
    }
}

impl ErrorCoder for RpcError {
    fn error_code(&self) -> &str {
        match self {
            RpcError::Request(err) => err.error_code(),
            _ => "",
        }
    }
}
