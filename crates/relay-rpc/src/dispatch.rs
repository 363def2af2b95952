use std::sync::{Arc, Weak};

use relay_proto::{Body, CodecError, Header, MessageReader, MessageWriter, Request};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::conn::{ConnectionState, Inner, DISPATCHING};
use crate::error::{
    ApplicationError, CallError, ErrorCoder, ErrorTransformer, RequestError, RpcError,
    NO_SERVICE_MESSAGE, SHUTDOWN_MESSAGE,
};
use crate::observer::Observer;
use crate::poison::{lock, read};
use crate::root::{MethodCaller, ResolveError};
use crate::{CallContext, Connection};

pub(crate) enum WriterCommand {
    Message {
        header: Header,
        body: Body,
        done: oneshot::Sender<Result<(), CodecError>>,
    },
    Close {
        done: oneshot::Sender<Result<(), CodecError>>,
    },
}

/// Owns the writing half of the codec. Messages are written one at a time in queue order.
///
/// Once `stop` fires, a write that cannot complete immediately is abandoned. Its sender and every
/// later one see the writer hang up, which callers report as a shutdown.
pub(crate) async fn write_loop<W: MessageWriter>(
    mut writer: W,
    mut rx: mpsc::Receiver<WriterCommand>,
    stop: CancellationToken,
) {
    // After an I/O failure the stream is unusable; later writes report the same error.
    let mut broken: Option<CodecError> = None;
    // A frame was cut off midway; nothing more may be written.
    let mut abandoned = false;

    while let Some(command) = rx.recv().await {
        match command {
            WriterCommand::Message { .. } if abandoned => {}
            WriterCommand::Message { header, body, done } => {
                let result = match &broken {
                    Some(err) => Err(err.clone()),
                    None => tokio::select! {
                        biased;
                        result = writer.write_message(&header, &body) => result,
                        _ = stop.cancelled() => {
                            tracing::debug!(
                                target: "relay.rpc",
                                request_id = header.request_id,
                                "peer is not reading; abandoning write"
                            );
                            abandoned = true;
                            continue;
                        }
                    },
                };
                if let Err(err) = &result {
                    tracing::debug!(
                        target: "relay.rpc",
                        request_id = header.request_id,
                        error = %err,
                        "write failed"
                    );
                    if broken.is_none() && matches!(err, CodecError::Io { .. }) {
                        broken = Some(err.clone());
                    }
                }
                let _ = done.send(result);
            }
            WriterCommand::Close { done } => {
                let result = tokio::select! {
                    biased;
                    result = writer.close() => result,
                    _ = stop.cancelled() => Ok(()),
                };
                let _ = done.send(result);
                return;
            }
        }
    }

    // Every handle was dropped without closing.
    let _ = writer.close().await;
}

/// Owns the reading half of the codec. Headers are read strictly in order; requests are handed
/// to dispatch tasks and replies to the pending table, so the loop never waits on a handler.
pub(crate) async fn read_loop<R: MessageReader>(inner: Weak<Inner>, mut reader: R) {
    let Some(inner) = inner.upgrade() else {
        return;
    };

    let result = loop {
        let header = tokio::select! {
            biased;
            _ = inner.reader_stop.cancelled() => break Ok(()),
            header = reader.read_header() => header,
        };
        let header = match header {
            Ok(header) => header,
            Err(err) => break Err(err),
        };

        let is_request = header.is_request();
        let body = match reader.read_body(is_request).await {
            Ok(body) => Ok(body),
            // A body that fails to decode only affects its own message.
            Err(err @ CodecError::Decode { .. }) => Err(err),
            Err(err) => break Err(err),
        };

        if is_request {
            handle_request(&inner, header, body).await;
        } else {
            handle_reply(&inner, header, body);
        }
    };

    match result {
        Ok(()) => {}
        Err(err) if err.is_closed() => {
            tracing::debug!(target: "relay.rpc", "peer closed the connection");
        }
        Err(err) if inner.state() != ConnectionState::Serving => {
            tracing::debug!(target: "relay.rpc", error = %err, "read failed while closing");
        }
        Err(err) => {
            tracing::warn!(target: "relay.rpc", error = %err, "reading from connection failed");
            *lock(&inner.termination, "read_loop") = Some(RpcError::Codec(err));
        }
    }

    let failed = inner.pending.shutdown();
    if failed > 0 {
        tracing::debug!(target: "relay.rpc", failed, "reader stopped with calls outstanding");
    }
    if inner.begin_closing() {
        inner.spawn_close();
    }
}

fn handle_reply(inner: &Inner, header: Header, body: Result<Body, CodecError>) {
    let reply = if header.is_error() {
        Err(RpcError::Request(RequestError {
            message: header.error,
            code: header.error_code,
        }))
    } else {
        body.map_err(|err| RpcError::Decode {
            message: err.to_string(),
        })
    };

    if !inner.pending.complete(header.request_id, reply) {
        tracing::debug!(
            target: "relay.rpc",
            request_id = header.request_id,
            "discarding reply with no waiting call"
        );
    }
}

fn is_closing(state: ConnectionState) -> bool {
    matches!(state, ConnectionState::Dying | ConnectionState::Dead)
}

fn shutdown_error() -> RequestError {
    RequestError {
        message: SHUTDOWN_MESSAGE.to_owned(),
        code: String::new(),
    }
}

async fn handle_request(inner: &Arc<Inner>, header: Header, body: Result<Body, CodecError>) {
    let observer = inner.observers.rpc_observer();

    let body = match body {
        Ok(body) => body,
        Err(err) => {
            observer.server_request(&header, None);
            let err = RequestError {
                message: err.to_string(),
                code: String::new(),
            };
            reply_error(inner, observer.as_ref(), &header, err).await;
            return;
        }
    };

    if is_closing(inner.state()) {
        observer.server_request(&header, None);
        reply_error(inner, observer.as_ref(), &header, shutdown_error()).await;
        return;
    }

    let served = read(&inner.served, "dispatch.resolve").clone();
    let request = &header.request;
    let resolved = match &served {
        None => Err(RequestError {
            message: NO_SERVICE_MESSAGE.to_owned(),
            code: String::new(),
        }),
        Some(served) => served
            .root
            .find_method(&request.type_name, request.version, &request.action)
            .map_err(|err| match err {
                ResolveError::NotImplemented(err) => RequestError {
                    message: err.to_string(),
                    code: err.error_code().to_owned(),
                },
                ResolveError::Application(err) => {
                    transform(err, served.transform.as_ref()).to_request_error()
                }
            }),
    };
    let caller = match resolved {
        Ok(caller) => caller,
        Err(err) => {
            tracing::debug!(
                target: "relay.rpc",
                request_id = header.request_id,
                type_name = %request.type_name,
                version = request.version,
                action = %request.action,
                error = %err,
                "request not resolved"
            );
            observer.server_request(&header, None);
            reply_error(inner, observer.as_ref(), &header, err).await;
            return;
        }
    };

    observer.server_request(&header, Some(&body));

    // Spawning under the state lock keeps close from missing a dispatch it must wait for.
    let spawned = {
        let state = lock(&inner.state, "dispatch.spawn");
        if is_closing(*state) {
            false
        } else {
            inner.dispatches.spawn(dispatch(
                inner.clone(),
                header.clone(),
                caller,
                body,
                served.and_then(|served| served.transform),
                observer.clone(),
            ));
            true
        }
    };
    if !spawned {
        reply_error(inner, observer.as_ref(), &header, shutdown_error()).await;
    }
}

async fn dispatch(
    inner: Arc<Inner>,
    header: Header,
    caller: Arc<dyn MethodCaller>,
    body: Body,
    transformer: Option<ErrorTransformer>,
    observer: Arc<dyn Observer>,
) {
    let cancel = inner.shutdown.child_token();
    let ctx = CallContext::new(
        header.request_id,
        header.request.clone(),
        Connection {
            inner: inner.clone(),
        },
        cancel.clone(),
    );

    // The handler's context stays live until its reply has been sent.
    let _cancel_after_reply = cancel.drop_guard();
    let call = DISPATCHING.scope(
        inner.key(),
        caller.call(ctx, header.request.id.clone(), body),
    );
    let outcome = tokio::select! {
        result = call => Some(result),
        _ = inner.abort.cancelled() => None,
    };

    match outcome {
        Some(Ok(result)) => {
            send_reply(
                &inner,
                observer.as_ref(),
                &header.request,
                Header::reply(header.request_id),
                result,
            )
            .await;
        }
        Some(Err(err)) => {
            let err = match err {
                CallError::Decode { message } | CallError::Encode { message } => RequestError {
                    message,
                    code: String::new(),
                },
                CallError::Application(err) => {
                    transform(err, transformer.as_ref()).to_request_error()
                }
            };
            tracing::debug!(
                target: "relay.rpc",
                request_id = header.request_id,
                action = %header.request.action,
                error = %err,
                "handler failed"
            );
            reply_error(&inner, observer.as_ref(), &header, err).await;
        }
        None => {
            tracing::debug!(
                target: "relay.rpc",
                request_id = header.request_id,
                action = %header.request.action,
                "handler cancelled by drain timeout"
            );
            reply_error(&inner, observer.as_ref(), &header, shutdown_error()).await;
        }
    }
}

fn transform(err: ApplicationError, transformer: Option<&ErrorTransformer>) -> ApplicationError {
    match transformer {
        Some(transformer) => transformer.apply(err),
        None => err,
    }
}

async fn reply_error(inner: &Inner, observer: &dyn Observer, request: &Header, err: RequestError) {
    let mut reply = Header::reply(request.request_id);
    reply.error = err.message;
    reply.error_code = err.code;
    send_reply(inner, observer, &request.request, reply, Body::Null).await;
}

async fn send_reply(
    inner: &Inner,
    observer: &dyn Observer,
    request: &Request,
    reply: Header,
    body: Body,
) {
    let (reply, body) = match inner.write(reply.clone(), body.clone()).await {
        Ok(()) => (reply, body),
        // The result could not be framed; the caller still gets an answer.
        Err(RpcError::Codec(
            err @ (CodecError::Encode { .. } | CodecError::FrameTooLarge { .. }),
        )) if !reply.is_error() => {
            tracing::debug!(
                target: "relay.rpc",
                request_id = reply.request_id,
                error = %err,
                "reply not encodable; sending error instead"
            );
            let mut fallback = Header::reply(reply.request_id);
            fallback.error = err.to_string();
            if let Err(err) = inner.write(fallback.clone(), Body::Null).await {
                tracing::debug!(
                    target: "relay.rpc",
                    request_id = fallback.request_id,
                    error = %err,
                    "reply not delivered"
                );
            }
            (fallback, Body::Null)
        }
        Err(err) => {
            tracing::debug!(
                target: "relay.rpc",
                request_id = reply.request_id,
                error = %err,
                "reply not delivered"
            );
            (reply, body)
        }
    };
    observer.server_reply(request, &reply, &body);
}
