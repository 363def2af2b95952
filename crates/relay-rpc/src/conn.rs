use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use relay_config::ConnectionConfig;
use relay_proto::{decode_body, encode_body, Body, Codec, Header, Request, RequestId};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::dispatch::{read_loop, write_loop, WriterCommand};
use crate::error::{ErrorTransformer, RpcError};
use crate::observer::ObserverFactory;
use crate::pending::PendingCalls;
use crate::poison::{lock, write};
use crate::root::{BoxFuture, Root};

/// Lifecycle of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Codec attached, reader not started.
    Idle,
    /// Reading; calls may be issued and accepted.
    Serving,
    /// Close requested. New calls and requests are refused; running handlers finish.
    Dying,
    /// Codec closed and every task joined.
    Dead,
}

tokio::task_local! {
    /// Set while a handler runs: the [`Inner::key`] of the connection that dispatched it.
    pub(crate) static DISPATCHING: usize;
}

/// The root and transformer a dispatch resolves against, replaced together by `serve`.
#[derive(Clone)]
pub(crate) struct Served {
    pub(crate) root: Arc<dyn Root>,
    pub(crate) transform: Option<ErrorTransformer>,
}

pub(crate) struct Inner {
    pub(crate) config: ConnectionConfig,
    next_request_id: AtomicU64,
    pub(crate) pending: PendingCalls,
    pub(crate) served: RwLock<Option<Served>>,
    pub(crate) observers: Arc<dyn ObserverFactory>,
    writer_tx: mpsc::Sender<WriterCommand>,
    pub(crate) state: Mutex<ConnectionState>,

    /// Parent of every dispatch context; cancelled when closing starts.
    pub(crate) shutdown: CancellationToken,
    /// Drops handlers still running after the drain timeout.
    pub(crate) abort: CancellationToken,
    pub(crate) reader_stop: CancellationToken,
    /// Abandons a write the peer is not draining, so a stalled stream cannot hold up close.
    writer_stop: CancellationToken,
    dead: CancellationToken,

    pub(crate) dispatches: TaskTracker,
    unstarted_reader: Mutex<Option<BoxFuture<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// The codec error that ended the reader, if it did not end cleanly.
    pub(crate) termination: Mutex<Option<RpcError>>,
}

impl Inner {
    /// Queues a message on the writer task and waits until it has been written.
    pub(crate) async fn write(&self, header: Header, body: Body) -> Result<(), RpcError> {
        let (done, written) = oneshot::channel();
        self.writer_tx
            .send(WriterCommand::Message { header, body, done })
            .await
            .map_err(|_| RpcError::Shutdown)?;
        written
            .await
            .map_err(|_| RpcError::Shutdown)?
            .map_err(RpcError::Codec)
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *lock(&self.state, "connection.state")
    }

    /// Identifies this connection to [`DISPATCHING`].
    pub(crate) fn key(&self) -> usize {
        self as *const Inner as usize
    }

    /// Whether the current task is a handler dispatched by this connection.
    fn is_dispatching(&self) -> bool {
        DISPATCHING
            .try_with(|key| *key == self.key())
            .unwrap_or(false)
    }

    /// Moves to `Dying`. Returns `true` for the caller that made the transition.
    pub(crate) fn begin_closing(&self) -> bool {
        let mut state = lock(&self.state, "connection.begin_closing");
        match *state {
            ConnectionState::Dying | ConnectionState::Dead => false,
            ConnectionState::Idle | ConnectionState::Serving => {
                *state = ConnectionState::Dying;
                true
            }
        }
    }

    pub(crate) fn spawn_close(self: &Arc<Self>) {
        let inner = self.clone();
        tokio::spawn(async move { inner.finish_close().await });
    }

    async fn finish_close(self: Arc<Self>) {
        tracing::debug!(target: "relay.rpc", "connection closing");
        self.shutdown.cancel();
        lock(&self.unstarted_reader, "connection.close").take();

        self.dispatches.close();
        match self.config.drain_timeout() {
            Some(limit) => {
                if tokio::time::timeout(limit, self.dispatches.wait())
                    .await
                    .is_err()
                {
                    tracing::warn!(
                        target: "relay.rpc",
                        outstanding = self.dispatches.len(),
                        timeout_ms = limit.as_millis() as u64,
                        "drain timeout elapsed; cancelling outstanding handlers"
                    );
                    self.abort.cancel();
                    self.writer_stop.cancel();
                    self.dispatches.wait().await;
                }
            }
            None => self.dispatches.wait().await,
        }

        let served = write(&self.served, "connection.close").take();
        if let Some(served) = served {
            served.root.kill();
        }

        self.writer_stop.cancel();
        let (done, closed) = oneshot::channel();
        if self
            .writer_tx
            .send(WriterCommand::Close { done })
            .await
            .is_ok()
        {
            if let Ok(Err(err)) = closed.await {
                tracing::debug!(target: "relay.rpc", error = %err, "closing codec failed");
            }
        }

        self.reader_stop.cancel();
        let failed = self.pending.shutdown();
        if failed > 0 {
            tracing::debug!(target: "relay.rpc", failed, "failed unanswered calls on close");
        }

        let tasks = std::mem::take(&mut *lock(&self.tasks, "connection.close"));
        for task in tasks {
            if let Err(err) = task.await {
                if err.is_panic() {
                    tracing::error!(target: "relay.rpc", error = %err, "connection task panicked");
                }
            }
        }

        *lock(&self.state, "connection.close") = ConnectionState::Dead;
        self.dead.cancel();
        tracing::debug!(target: "relay.rpc", "connection dead");
    }
}

/// A bidirectional RPC connection over one codec.
///
/// Either side may issue calls; inbound requests are resolved against the root installed with
/// [`Connection::serve`]. Clones share the same connection.
#[derive(Clone)]
pub struct Connection {
    pub(crate) inner: Arc<Inner>,
}

impl Connection {
    /// Attaches `codec` with the default [`ConnectionConfig`].
    ///
    /// Must be called from within a Tokio runtime: the writer task starts immediately. Nothing is
    /// read until [`Connection::start`].
    pub fn new<C: Codec>(codec: C, observers: Arc<dyn ObserverFactory>) -> Self {
        Self::with_config(codec, observers, ConnectionConfig::default())
    }

    /// Attaches `codec`. Frame limits are a property of the codec itself, so
    /// `config.max_frame_len` should be applied when constructing it.
    pub fn with_config<C: Codec>(
        codec: C,
        observers: Arc<dyn ObserverFactory>,
        config: ConnectionConfig,
    ) -> Self {
        let (reader, writer) = codec.into_split();
        let (writer_tx, writer_rx) = mpsc::channel(config.write_queue_capacity.max(1));

        let inner = Arc::new(Inner {
            config,
            next_request_id: AtomicU64::new(0),
            pending: PendingCalls::default(),
            served: RwLock::new(None),
            observers,
            writer_tx,
            state: Mutex::new(ConnectionState::Idle),
            shutdown: CancellationToken::new(),
            abort: CancellationToken::new(),
            reader_stop: CancellationToken::new(),
            writer_stop: CancellationToken::new(),
            dead: CancellationToken::new(),
            dispatches: TaskTracker::new(),
            unstarted_reader: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            termination: Mutex::new(None),
        });

        let writer_task = tokio::spawn(write_loop(
            writer,
            writer_rx,
            inner.writer_stop.clone(),
        ));
        lock(&inner.tasks, "connection.new").push(writer_task);
        *lock(&inner.unstarted_reader, "connection.new") =
            Some(Box::pin(read_loop(Arc::downgrade(&inner), reader)));

        Self { inner }
    }

    /// Starts reading. Calling it again, or after close, does nothing.
    pub fn start(&self) {
        let Some(reader) = lock(&self.inner.unstarted_reader, "connection.start").take() else {
            return;
        };
        {
            let mut state = lock(&self.inner.state, "connection.start");
            if *state != ConnectionState::Idle {
                return;
            }
            *state = ConnectionState::Serving;
        }
        let task = tokio::spawn(reader);
        lock(&self.inner.tasks, "connection.start").push(task);
    }

    /// Serves `root` to the peer. Requests already dispatched keep the root and transformer they
    /// were resolved with.
    pub fn serve<R: Root>(&self, root: R, transform: Option<ErrorTransformer>) {
        self.serve_shared(Some(Arc::new(root)), transform);
    }

    /// Replaces the served root. `None` answers every later request with "no service".
    pub fn serve_shared(&self, root: Option<Arc<dyn Root>>, transform: Option<ErrorTransformer>) {
        let served = root.map(|root| Served { root, transform });
        *write(&self.inner.served, "connection.serve") = served;
    }

    pub fn stop_serving(&self) {
        self.serve_shared(None, None);
    }

    /// Calls `request` with `params` and decodes the reply into `R`.
    ///
    /// Pass `&()` when the action takes no parameters, and use `()`,
    /// [`relay_proto::Empty`] or `serde::de::IgnoredAny` for `R` when no result is wanted.
    pub async fn call<P, R>(&self, request: Request, params: &P) -> Result<R, RpcError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let body = encode_params(params)?;
        decode_result(self.call_inner(request, body, None).await?)
    }

    /// Like [`Connection::call`], but gives up with [`RpcError::Canceled`] when `cancel` fires.
    /// The connection stays usable; a late reply is discarded.
    pub async fn call_with_cancel<P, R>(
        &self,
        request: Request,
        params: &P,
        cancel: &CancellationToken,
    ) -> Result<R, RpcError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let body = encode_params(params)?;
        decode_result(self.call_inner(request, body, Some(cancel)).await?)
    }

    pub async fn call_raw(&self, request: Request, params: Body) -> Result<Body, RpcError> {
        self.call_inner(request, params, None).await
    }

    async fn call_inner(
        &self,
        request: Request,
        params: Body,
        cancel: Option<&CancellationToken>,
    ) -> Result<Body, RpcError> {
        if matches!(
            self.inner.state(),
            ConnectionState::Dying | ConnectionState::Dead
        ) {
            return Err(RpcError::Shutdown);
        }

        let request_id = self.inner.next_request_id.fetch_add(1, Ordering::Relaxed) + 1;
        let reply = self.inner.pending.insert(request_id)?;
        tracing::trace!(
            target: "relay.rpc",
            request_id,
            type_name = %request.type_name,
            version = request.version,
            action = %request.action,
            "client request"
        );

        let call = async {
            if let Err(err) = self
                .inner
                .write(Header::request(request_id, request), params)
                .await
            {
                self.inner.pending.remove(request_id);
                return Err(err);
            }
            reply.await.unwrap_or(Err(RpcError::Shutdown))
        };

        // Cancellation covers the write too: a peer that stops reading must not pin the caller.
        match cancel {
            Some(cancel) => tokio::select! {
                result = call => result,
                _ = cancel.cancelled() => {
                    tracing::debug!(target: "relay.rpc", request_id, "client request canceled");
                    self.inner.pending.remove(request_id);
                    Err(RpcError::Canceled)
                }
            },
            None => call.await,
        }
    }

    /// Closes the connection and waits until it is dead.
    ///
    /// New outbound calls fail immediately; requests that arrive from now on are answered with a
    /// shutdown error. Handlers already running see their context cancelled and are waited for
    /// (up to the configured drain timeout). Then the root is killed, the codec closed and any
    /// unanswered outbound call fails with [`RpcError::Shutdown`].
    ///
    /// Returns the codec error that ended the reader, if any. Idempotent.
    ///
    /// A handler running on this connection cannot wait for its own dispatch to drain, so from
    /// there close only starts the shutdown and returns `Ok(())` at once.
    pub async fn close(&self) -> Result<(), RpcError> {
        if self.inner.begin_closing() {
            self.inner.spawn_close();
        }
        if self.inner.is_dispatching() {
            return Ok(());
        }
        self.dead().await;
        match lock(&self.inner.termination, "connection.close").clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Resolves once the connection is dead, whether it was closed locally or by the peer.
    pub fn dead(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let dead = self.inner.dead.clone();
        async move { dead.cancelled().await }
    }

    pub fn is_dead(&self) -> bool {
        self.inner.dead.is_cancelled()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// The id of the most recent outbound call, or 0 when none was made.
    pub fn last_request_id(&self) -> RequestId {
        self.inner.next_request_id.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .field("last_request_id", &self.last_request_id())
            .finish_non_exhaustive()
    }
}

fn encode_params<P: Serialize + ?Sized>(params: &P) -> Result<Body, RpcError> {
    encode_body(params).map_err(|err| RpcError::Encode {
        message: err.to_string(),
    })
}

fn decode_result<R: DeserializeOwned>(body: Body) -> Result<R, RpcError> {
    decode_body(body).map_err(|err| RpcError::Decode {
        message: err.to_string(),
    })
}
