//! Shared fixtures: a client/server pair over an in-memory stream, a recording observer, and a
//! set of facades exercising every handler shape.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use relay_proto::JsonCodec;
use relay_rpc::{
    ApplicationError, Body, CallContext, CancellationToken, CodedError, Connection,
    ConnectionConfig, Empty, ErrorTransformer, Header, MethodTable, NoopObserver, Observer,
    ObserverFactory, Registry, Request,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Notify};


pub(crate) const TIMEOUT: Duration = Duration::from_secs(5);

/// Awaits `fut`, failing the test if it takes longer than [`TIMEOUT`].
pub(crate) async fn within<F: Future>(what: &str, fut: F) -> F::Output {
    tokio::time::timeout(TIMEOUT, fut)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

/// Polls `check` until it holds.
pub(crate) async fn wait_for(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct StringVal {
    #[serde(rename = "Val")]
    pub(crate) val: String,
}

impl StringVal {
    pub(crate) fn new(val: impl Into<String>) -> Self {
        Self { val: val.into() }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct Int64Val {
    #[serde(rename = "I")]
    pub(crate) i: i64,
}

#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct SliceArg {
    #[serde(rename = "X", default)]
    x: Vec<String>,
}

// ---------------------------------------------------------------------------------------------
// Connections
// ---------------------------------------------------------------------------------------------

/// A client and a server joined by an in-memory stream. Only the server records observer events.
pub(crate) struct Pair {
    pub(crate) client: Connection,
    pub(crate) server: Connection,
    pub(crate) events: Recorder,
}

impl Pair {
    pub(crate) fn unstarted(config: ConnectionConfig) -> Self {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let events = Recorder::default();
        let client = Connection::with_config(
            JsonCodec::new(client_io),
            Arc::new(NoopObserver),
            config.clone(),
        );
        let server = Connection::with_config(
            JsonCodec::new(server_io),
            Arc::new(events.clone()),
            config,
        );
        Self {
            client,
            server,
            events,
        }
    }

    pub(crate) fn start(&self) {
        self.client.start();
        self.server.start();
    }

    /// Closes the client, then checks that the server followed it down cleanly.
    pub(crate) async fn shutdown(self) {
        within("client close", self.client.close())
            .await
            .expect("client close");
        within("server death", self.server.dead()).await;
        self.server.close().await.expect("server close");
    }
}

/// Starts a pair whose server serves `root`.
pub(crate) fn serve(root: Registry, transform: Option<ErrorTransformer>) -> Pair {
    let pair = Pair::unstarted(ConnectionConfig::default());
    pair.server.serve(root, transform);
    pair.start();
    pair
}

pub(crate) fn simple_request(action: &str) -> Request {
    Request::new("SimpleMethods", 0, "a99", action)
}

// ---------------------------------------------------------------------------------------------
// Observer
// ---------------------------------------------------------------------------------------------

#[derive(Default)]
struct Events {
    requests: Vec<(Header, Option<Body>)>,
    replies: Vec<(Request, Header, Body)>,
}

#[derive(Clone, Default)]
pub(crate) struct Recorder {
    events: Arc<Mutex<Events>>,
}

impl Recorder {
    pub(crate) fn reset(&self) {
        *self.events.lock().unwrap() = Events::default();
    }

    pub(crate) fn requests(&self) -> Vec<(Header, Option<Body>)> {
        self.events.lock().unwrap().requests.clone()
    }

    pub(crate) fn replies(&self) -> Vec<(Request, Header, Body)> {
        self.events.lock().unwrap().replies.clone()
    }

    /// Waits until `count` replies have been reported; replies are reported after they are
    /// written, so the caller may see its result first.
    pub(crate) async fn wait_for_replies(&self, count: usize) -> Vec<(Request, Header, Body)> {
        wait_for("server reply notification", || {
            self.events.lock().unwrap().replies.len() >= count
        })
        .await;
        self.replies()
    }
}

impl Observer for Recorder {
    fn server_request(&self, header: &Header, body: Option<&Body>) {
        self.events
            .lock()
            .unwrap()
            .requests
            .push((header.clone(), body.cloned()));
    }

    fn server_reply(&self, request: &Request, header: &Header, body: &Body) {
        self.events
            .lock()
            .unwrap()
            .replies
            .push((request.clone(), header.clone(), body.clone()));
    }
}

impl ObserverFactory for Recorder {
    fn rpc_observer(&self) -> Arc<dyn Observer> {
        Arc::new(self.clone())
    }
}

// ---------------------------------------------------------------------------------------------
// Facades
// ---------------------------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CallInfo {
    pub(crate) object: String,
    pub(crate) method: &'static str,
    pub(crate) arg: Option<StringVal>,
}

/// Server-side state shared by the facades of one test.
#[derive(Default)]
pub(crate) struct State {
    calls: Mutex<Vec<CallInfo>>,
    return_err: AtomicBool,
    simple_ids: Mutex<Vec<String>>,
    delayed: Mutex<HashMap<String, Arc<Delayed>>>,
    error_methods: Mutex<Option<ErrorMethods>>,
    context: Mutex<Option<Arc<ContextMethods>>>,
}

impl State {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// State with one `SimpleMethods` object, `a99`.
    pub(crate) fn simple() -> Arc<Self> {
        let state = Self::new();
        state.add_simple("a99");
        state
    }

    pub(crate) fn add_simple(&self, id: &str) {
        self.simple_ids.lock().unwrap().push(id.to_owned());
    }

    pub(crate) fn set_return_err(&self, return_err: bool) {
        self.return_err.store(return_err, Ordering::SeqCst);
    }

    pub(crate) fn take_calls(&self) -> Vec<CallInfo> {
        std::mem::take(&mut *self.calls.lock().unwrap())
    }

    pub(crate) fn add_delayed(&self, id: &str) -> DelayedHandle {
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let delayed = Delayed {
            ready: ready_tx,
            done: tokio::sync::Mutex::new(done_rx),
        };
        self.delayed
            .lock()
            .unwrap()
            .insert(id.to_owned(), Arc::new(delayed));
        DelayedHandle {
            ready: ready_rx,
            done: done_tx,
        }
    }

    pub(crate) fn set_error_methods(&self, methods: Option<ErrorMethods>) {
        *self.error_methods.lock().unwrap() = methods;
    }

    pub(crate) fn set_context_methods(&self) -> Arc<ContextMethods> {
        let methods = Arc::new(ContextMethods::default());
        *self.context.lock().unwrap() = Some(methods.clone());
        methods
    }

    fn record(&self, call: CallInfo) {
        self.calls.lock().unwrap().push(call);
    }

    fn simple_object(self: &Arc<Self>, id: &str) -> Result<Arc<Simple>, ApplicationError> {
        if !self.simple_ids.lock().unwrap().iter().any(|known| known == id) {
            return Err(ApplicationError::msg("unknown SimpleMethods id"));
        }
        Ok(Arc::new(Simple {
            state: self.clone(),
            id: id.to_owned(),
        }))
    }

    fn delayed_object(&self, id: &str) -> Result<Arc<Delayed>, ApplicationError> {
        self.delayed
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| ApplicationError::msg("unknown DelayedMethods id"))
    }

    fn error_object(&self) -> Result<Arc<ErrorMethods>, ApplicationError> {
        self.error_methods
            .lock()
            .unwrap()
            .clone()
            .map(Arc::new)
            .ok_or_else(|| ApplicationError::msg("no error methods"))
    }

    fn context_object(&self) -> Result<Arc<ContextMethods>, ApplicationError> {
        self.context
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| ApplicationError::msg("no context methods"))
    }
}

/// The standard test root.
///
/// `MultiVersion` exposes a different slice of `SimpleMethods` at each of versions 0, 1 and 2.
pub(crate) fn registry(state: &Arc<State>) -> Registry {
    let simple = {
        let state = state.clone();
        move |id: &str| state.simple_object(id)
    };
    let delayed = {
        let state = state.clone();
        move |id: &str| state.delayed_object(id)
    };
    let errors = {
        let state = state.clone();
        move |_: &str| state.error_object()
    };
    let context = {
        let state = state.clone();
        move |_: &str| state.context_object()
    };

    Registry::builder()
        .register("SimpleMethods", 0, simple.clone(), simple_methods())
        .register(
            "MultiVersion",
            0,
            simple.clone(),
            only(simple_methods(), &["Call0r1"]),
        )
        .register(
            "MultiVersion",
            1,
            simple.clone(),
            only(simple_methods(), &["Call1r1"]),
        )
        .register(
            "MultiVersion",
            2,
            simple,
            only(simple_methods(), &["Call1r1e"]),
        )
        .register("DelayedMethods", 0, delayed, delayed_methods())
        .register("ErrorMethods", 0, errors, error_methods())
        .register("ContextMethods", 0, context, context_methods())
        .register(
            "CallbackMethods",
            0,
            |_: &str| Ok(Arc::new(Callback)),
            callback_methods(),
        )
        .register(
            "ChangeAPIMethods",
            0,
            |_: &str| Ok(Arc::new(ChangeApi)),
            change_api_methods(),
        )
        .build()
}

/// The root installed by `ChangeAPIMethods.ChangeAPI`.
pub(crate) fn changed_api() -> Registry {
    let table = MethodTable::new().method(
        "NewMethod",
        |_: Arc<NewlyAvailable>, _: CallContext, _: Empty| async {
            Ok::<_, ApplicationError>(StringVal::new("new method result"))
        },
    );
    Registry::builder()
        .register(
            "NewlyAvailable",
            0,
            |_: &str| Ok(Arc::new(NewlyAvailable)),
            table,
        )
        .build()
}

/// Prefixes every application error with "transformed: ", keeping codes (also prefixed).
pub(crate) fn transformed() -> ErrorTransformer {
    ErrorTransformer::new(|err| match err.downcast_ref::<CodedError>() {
        Some(coded) => ApplicationError::from(CodedError::new(
            format!("transformed: {}", coded.message),
            format!("transformed: {}", coded.code),
        )),
        None => ApplicationError::msg(format!("transformed: {err}")),
    })
}

fn only<T: Send + Sync + 'static>(table: MethodTable<T>, keep: &[&str]) -> MethodTable<T> {
    let dropped: Vec<String> = table
        .actions()
        .filter(|action| !keep.contains(action))
        .map(str::to_owned)
        .collect();
    dropped
        .iter()
        .fold(table, |table, action| table.without(action))
}

pub(crate) struct Simple {
    state: Arc<State>,
    id: String,
}

impl Simple {
    fn called(&self, method: &'static str, arg: Option<StringVal>) {
        self.state.record(CallInfo {
            object: self.id.clone(),
            method,
            arg,
        });
    }

    fn call_error(&self, method: &str) -> Result<(), ApplicationError> {
        if self.state.return_err.load(Ordering::SeqCst) {
            return Err(ApplicationError::msg(format!("error calling {method}")));
        }
        Ok(())
    }
}

// Actions are named Call<args>r<results>[e]: the number of parameters, the number of results and
// whether the action can fail.
fn simple_methods() -> MethodTable<Simple> {
    MethodTable::new()
        .method("Call0r0", |obj: Arc<Simple>, _: CallContext, _: Empty| async move {
            obj.called("Call0r0", None);
            Ok::<_, ApplicationError>(())
        })
        .method("Call0r1", |obj: Arc<Simple>, _: CallContext, _: Empty| async move {
            obj.called("Call0r1", None);
            Ok::<_, ApplicationError>(StringVal::new("Call0r1 ret"))
        })
        .method("Call0r1e", |obj: Arc<Simple>, _: CallContext, _: Empty| async move {
            obj.called("Call0r1e", None);
            obj.call_error("Call0r1e")?;
            Ok::<_, ApplicationError>(StringVal::new("Call0r1e ret"))
        })
        .method("Call0r0e", |obj: Arc<Simple>, _: CallContext, _: Empty| async move {
            obj.called("Call0r0e", None);
            obj.call_error("Call0r0e")
        })
        .method("Call1r0", |obj: Arc<Simple>, _: CallContext, s: StringVal| async move {
            obj.called("Call1r0", Some(s));
            Ok::<_, ApplicationError>(())
        })
        .method("Call1r1", |obj: Arc<Simple>, _: CallContext, s: StringVal| async move {
            obj.called("Call1r1", Some(s));
            Ok::<_, ApplicationError>(StringVal::new("Call1r1 ret"))
        })
        .method("Call1r1e", |obj: Arc<Simple>, _: CallContext, s: StringVal| async move {
            obj.called("Call1r1e", Some(s));
            obj.call_error("Call1r1e")?;
            Ok::<_, ApplicationError>(StringVal::new("Call1r1e ret"))
        })
        .method("Call1r0e", |obj: Arc<Simple>, _: CallContext, s: StringVal| async move {
            obj.called("Call1r0e", Some(s));
            obj.call_error("Call1r0e")
        })
        .method("SliceArg", |_: Arc<Simple>, _: CallContext, _: SliceArg| async {
            Ok::<_, ApplicationError>(StringVal::new("SliceArg ret"))
        })
}

/// A handler that blocks until the test releases it.
pub(crate) struct Delayed {
    ready: mpsc::UnboundedSender<()>,
    done: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<String, String>>>,
}

pub(crate) struct DelayedHandle {
    ready: mpsc::UnboundedReceiver<()>,
    done: mpsc::UnboundedSender<Result<String, String>>,
}

impl DelayedHandle {
    /// Waits until a `Delay` call is running.
    pub(crate) async fn ready(&mut self) {
        within("Delay to start", self.ready.recv())
            .await
            .expect("delayed object dropped");
    }

    pub(crate) fn succeed(&self, val: &str) {
        self.done.send(Ok(val.to_owned())).expect("delayed object dropped");
    }

    pub(crate) fn fail(&self, message: &str) {
        self.done
            .send(Err(message.to_owned()))
            .expect("delayed object dropped");
    }
}

fn delayed_methods() -> MethodTable<Delayed> {
    MethodTable::new().method(
        "Delay",
        |obj: Arc<Delayed>, _: CallContext, _: Empty| async move {
            let _ = obj.ready.send(());
            let outcome = obj.done.lock().await.recv().await;
            match outcome {
                Some(Ok(val)) => Ok(StringVal::new(val)),
                Some(Err(message)) => Err(ApplicationError::msg(message)),
                None => Err(ApplicationError::msg("delay abandoned")),
            }
        },
    )
}

#[derive(Clone)]
pub(crate) struct ErrorMethods {
    pub(crate) err: Option<CodedError>,
}

fn error_methods() -> MethodTable<ErrorMethods> {
    MethodTable::new().method(
        "Call",
        |obj: Arc<ErrorMethods>, _: CallContext, _: Empty| async move {
            match &obj.err {
                Some(err) => Err(ApplicationError::from(err.clone())),
                None => Ok(()),
            }
        },
    )
}

#[derive(Default)]
pub(crate) struct ContextMethods {
    calls: Mutex<Vec<(&'static str, Option<StringVal>)>>,
    seen: Mutex<Option<CancellationToken>>,
    pub(crate) waiting: Notify,
}

impl ContextMethods {
    fn called(&self, method: &'static str, arg: Option<StringVal>, ctx: &CallContext) {
        self.calls.lock().unwrap().push((method, arg));
        *self.seen.lock().unwrap() = Some(ctx.cancellation());
    }

    pub(crate) fn take_calls(&self) -> Vec<(&'static str, Option<StringVal>)> {
        std::mem::take(&mut *self.calls.lock().unwrap())
    }

    /// The cancellation token of the most recent call.
    pub(crate) fn seen(&self) -> Option<CancellationToken> {
        self.seen.lock().unwrap().clone()
    }
}

async fn check_context(ctx: &CallContext) -> Result<(), ApplicationError> {
    tokio::select! {
        _ = ctx.cancelled() => Err(ApplicationError::msg("context canceled")),
        _ = tokio::time::sleep(Duration::from_millis(20)) => Ok(()),
    }
}

fn context_methods() -> MethodTable<ContextMethods> {
    MethodTable::new()
        .method(
            "Call0",
            |obj: Arc<ContextMethods>, ctx: CallContext, _: Empty| async move {
                obj.called("Call0", None, &ctx);
                check_context(&ctx).await
            },
        )
        .method(
            "Call1",
            |obj: Arc<ContextMethods>, ctx: CallContext, s: StringVal| async move {
                obj.called("Call1", Some(s), &ctx);
                check_context(&ctx).await
            },
        )
        .method(
            "Wait",
            |obj: Arc<ContextMethods>, ctx: CallContext, _: Empty| async move {
                obj.called("Wait", None, &ctx);
                obj.waiting.notify_one();
                tokio::select! {
                    _ = ctx.cancelled() => Err::<(), _>(ApplicationError::msg("context canceled")),
                    _ = tokio::time::sleep(TIMEOUT * 2) => {
                        Err(ApplicationError::msg("expected context to be cancelled"))
                    }
                }
            },
        )
}

pub(crate) struct Callback;

fn callback_methods() -> MethodTable<Callback> {
    MethodTable::new().method(
        "Factorial",
        |_: Arc<Callback>, ctx: CallContext, x: Int64Val| async move {
            if x.i <= 1 {
                return Ok(Int64Val { i: 1 });
            }
            let r: Int64Val = ctx
                .connection()
                .call(
                    Request::new("CallbackMethods", 0, "", "Factorial"),
                    &Int64Val { i: x.i - 1 },
                )
                .await?;
            Ok::<_, ApplicationError>(Int64Val { i: x.i * r.i })
        },
    )
}

pub(crate) struct ChangeApi;

fn change_api_methods() -> MethodTable<ChangeApi> {
    MethodTable::new()
        .method(
            "ChangeAPI",
            |_: Arc<ChangeApi>, ctx: CallContext, _: Empty| async move {
                ctx.connection().serve(changed_api(), None);
                Ok::<_, ApplicationError>(())
            },
        )
        .method(
            "RemoveAPI",
            |_: Arc<ChangeApi>, ctx: CallContext, _: Empty| async move {
                ctx.connection().stop_serving();
                Ok::<_, ApplicationError>(())
            },
        )
        .method(
            "CloseConnection",
            |_: Arc<ChangeApi>, ctx: CallContext, _: Empty| async move {
                ctx.connection().close().await?;
                Ok::<_, ApplicationError>(())
            },
        )
}

pub(crate) struct NewlyAvailable;
