//! Per-request notification hooks.
//!
//! A connection asks its [`ObserverFactory`] for a fresh [`Observer`] for every inbound request,
//! then reports the request before dispatch and the reply after it has been written. Observers are
//! informational: they cannot alter the call, and they may be invoked concurrently from different
//! dispatch tasks.

use std::sync::Arc;

use relay_proto::{Body, Header, Request};

pub trait Observer: Send + Sync {
    /// Called before dispatch. `body` is `None` when the request could not be resolved or its body
    /// could not be read.
    fn server_request(&self, header: &Header, body: Option<&Body>);

    /// Called after the reply has been handed to the codec. `body` is `Null` for error replies.
    fn server_reply(&self, request: &Request, header: &Header, body: &Body);
}

pub trait ObserverFactory: Send + Sync {
    fn rpc_observer(&self) -> Arc<dyn Observer>;
}

/// Discards every notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl Observer for NoopObserver {
    fn server_request(&self, _header: &Header, _body: Option<&Body>) {}

    fn server_reply(&self, _request: &Request, _header: &Header, _body: &Body) {}
}

impl ObserverFactory for NoopObserver {
    fn rpc_observer(&self) -> Arc<dyn Observer> {
        Arc::new(NoopObserver)
    }
}

/// Logs requests and replies at `debug` under the `relay.rpc` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn server_request(&self, header: &Header, body: Option<&Body>) {
        tracing::debug!(
            target: "relay.rpc",
            request_id = header.request_id,
            type_name = %header.request.type_name,
            version = header.request.version,
            id = %header.request.id,
            action = %header.request.action,
            resolved = body.is_some(),
            "server request"
        );
    }

    fn server_reply(&self, request: &Request, header: &Header, _body: &Body) {
        if header.is_error() {
            tracing::debug!(
                target: "relay.rpc",
                request_id = header.request_id,
                type_name = %request.type_name,
                action = %request.action,
                error = %header.error,
                error_code = %header.error_code,
                "server reply"
            );
        } else {
            tracing::debug!(
                target: "relay.rpc",
                request_id = header.request_id,
                type_name = %request.type_name,
                action = %request.action,
                "server reply"
            );
        }
    }
}

impl ObserverFactory for TracingObserver {
    fn rpc_observer(&self) -> Arc<dyn Observer> {
        Arc::new(TracingObserver)
    }
}

/// Fans notifications out to several factories.
#[derive(Clone, Default)]
pub struct ObserverMultiplexer {
    factories: Vec<Arc<dyn ObserverFactory>>,
}

impl ObserverMultiplexer {
    pub fn new(factories: Vec<Arc<dyn ObserverFactory>>) -> Self {
        Self { factories }
    }

    pub fn push(&mut self, factory: Arc<dyn ObserverFactory>) {
        self.factories.push(factory);
    }
}

impl ObserverFactory for ObserverMultiplexer {
    fn rpc_observer(&self) -> Arc<dyn Observer> {
        Arc::new(MultiObserver {
            observers: self
                .factories
                .iter()
                .map(|factory| factory.rpc_observer())
                .collect(),
        })
    }
}

struct MultiObserver {
    observers: Vec<Arc<dyn Observer>>,
}

impl Observer for MultiObserver {
    fn server_request(&self, header: &Header, body: Option<&Body>) {
        for observer in &self.observers {
            observer.server_request(header, body);
        }
    }

    fn server_reply(&self, request: &Request, header: &Header, body: &Body) {
        for observer in &self.observers {
            observer.server_reply(request, header, body);
        }
    }
}
