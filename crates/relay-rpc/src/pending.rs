use std::collections::HashMap;
use std::sync::Mutex;

use relay_proto::{Body, RequestId};
use tokio::sync::oneshot;

use crate::poison::lock;
use crate::RpcError;

pub(crate) type Reply = Result<Body, RpcError>;

/// Outbound calls waiting for their reply.
///
/// Every entry leaves the table exactly once: through [`PendingCalls::complete`] when the reply
/// arrives, [`PendingCalls::remove`] when the request could not be written, or
/// [`PendingCalls::shutdown`] when the connection dies. Once shut, the table refuses new entries.
#[derive(Default)]
pub(crate) struct PendingCalls {
    state: Mutex<PendingState>,
}

#[derive(Default)]
struct PendingState {
    calls: HashMap<RequestId, oneshot::Sender<Reply>>,
    shut: bool,
}

impl PendingCalls {
    pub(crate) fn insert(&self, request_id: RequestId) -> Result<oneshot::Receiver<Reply>, RpcError> {
        let mut state = lock(&self.state, "pending.insert");
        if state.shut {
            return Err(RpcError::Shutdown);
        }
        let (tx, rx) = oneshot::channel();
        state.calls.insert(request_id, tx);
        Ok(rx)
    }

    pub(crate) fn remove(&self, request_id: RequestId) -> bool {
        lock(&self.state, "pending.remove")
            .calls
            .remove(&request_id)
            .is_some()
    }

    /// Delivers a reply. Returns `false` when no call is waiting under `request_id`.
    pub(crate) fn complete(&self, request_id: RequestId, reply: Reply) -> bool {
        let tx = lock(&self.state, "pending.complete")
            .calls
            .remove(&request_id);
        match tx {
            Some(tx) => {
                // The caller may have stopped waiting after a cancellation.
                let _ = tx.send(reply);
                true
            }
            None => false,
        }
    }

    /// Fails every waiting call with [`RpcError::Shutdown`] and refuses later inserts.
    pub(crate) fn shutdown(&self) -> usize {
        let calls = {
            let mut state = lock(&self.state, "pending.shutdown");
            state.shut = true;
            std::mem::take(&mut state.calls)
        };
        let failed = calls.len();
        for (_, tx) in calls {
            let _ = tx.send(Err(RpcError::Shutdown));
        }
        failed
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        lock(&self.state, "pending.len").calls.len()
    }
}
