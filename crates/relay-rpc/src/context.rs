use relay_proto::{Request, RequestId};
use tokio_util::sync::CancellationToken;

use crate::Connection;

/// Per-request state handed to a handler.
///
/// The cancellation token fires once the handler has returned, or earlier when the connection
/// starts closing. Handlers that wait on external events should select on
/// [`CallContext::cancelled`].
#[derive(Clone)]
pub struct CallContext {
    request_id: RequestId,
    request: Request,
    conn: Connection,
    cancel: CancellationToken,
}

impl CallContext {
    pub(crate) fn new(
        request_id: RequestId,
        request: Request,
        conn: Connection,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            request_id,
            request,
            conn,
            cancel,
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    /// The connection the request arrived on. Calls made through it go back to the peer that
    /// issued this request.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

impl std::fmt::Debug for CallContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallContext")
            .field("request_id", &self.request_id)
            .field("request", &self.request)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}
