//! Bidirectional RPC connections.
//!
//! A [`Connection`] wraps a [`relay_proto::Codec`] and lets both ends issue calls over it at the
//! same time. Outbound calls are correlated with their replies by request id; inbound requests are
//! resolved against the [`Root`] installed with [`Connection::serve`] and run concurrently, each in
//! its own task.
//!
//! This crate implements:
//! - request id allocation and reply routing for any number of in-flight calls
//! - capability resolution by `(type, version, action)` with exact per-version method sets
//! - two-tier errors: protocol errors reach the peer as-is, application errors pass through an
//!   optional [`ErrorTransformer`]
//! - graceful close: handlers are cancelled and drained before the codec is closed
//! - per-request observer hooks
//!
//! ```ignore
//! let registry = Registry::builder()
//!     .register("Greeter", 0, |_: &str| Ok(Arc::new(Greeter)), greeter_methods())
//!     .build();
//! let conn = Connection::new(JsonCodec::new(stream), Arc::new(TracingObserver));
//! conn.serve(registry, None);
//! conn.start();
//!
//! let reply: String = conn.call(Request::new("Greeter", 0, "", "Hello"), &"world").await?;
//! ```

mod conn;
mod context;
mod dispatch;
mod error;
mod observer;
mod pending;
mod poison;
mod root;

pub use conn::{Connection, ConnectionState};
pub use context::CallContext;
pub use error::{
    ApplicationError, CallError, CodedError, ErrorCoder, ErrorTransformer, NotImplementedError,
    RequestError, RpcError, CODE_NOT_IMPLEMENTED,
};
pub use observer::{NoopObserver, Observer, ObserverFactory, ObserverMultiplexer, TracingObserver};
pub use root::{
    BoxFuture, MethodCaller, MethodTable, ObjectFactory, Registry, RegistryBuilder, ResolveError,
    Root,
};

pub use relay_config::ConnectionConfig;
pub use relay_proto::{Body, Empty, Header, Request, RequestId};
pub use tokio_util::sync::CancellationToken;
