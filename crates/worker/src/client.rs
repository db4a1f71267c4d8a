//! Multiplexing RPC client for a connected worker.
//!
//! [`WorkerClient`] is a cheap, cloneable handle onto one live connection.
//! Each [`call`](WorkerClient::call) gets a fresh id, is queued for the
//! connection task as a [`Frame::Call`], and resolves when the matching
//! `result` or `error` frame is routed back through
//! [`resolve_call`](WorkerClient::resolve_call). Any number of calls may be
//! in flight at once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::messages::{ExecuteCellParams, Frame, EXECUTE_CELL};

type PendingCall = oneshot::Sender<Result<Value, WorkerCallError>>;

/// Handle for issuing calls over one worker connection.
#[derive(Clone)]
pub struct WorkerClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    outgoing: mpsc::UnboundedSender<Frame>,
    pending: Mutex<HashMap<u64, PendingCall>>,
    next_id: AtomicU64,
}

impl WorkerClient {
    /// Create a client whose outbound frames are written to `outgoing`.
    ///
    /// The receiving half belongs to the connection task.
    pub fn new(outgoing: mpsc::UnboundedSender<Frame>) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                outgoing,
                pending: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Issue `method(args...)` and wait for its response.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, WorkerCallError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending().insert(id, tx);

        let frame = Frame::Call {
            id,
            method: method.to_string(),
            args,
        };
        if self.inner.outgoing.send(frame).is_err() {
            self.pending().remove(&id);
            return Err(WorkerCallError::ConnectionClosed);
        }

        tracing::trace!(id, method, "Worker call sent");

        // A dropped sender means the connection went away before a response.
        rx.await.unwrap_or(Err(WorkerCallError::ConnectionClosed))
    }

    /// `executeCell(path, cellId, languageId, source)`.
    pub async fn execute_cell(&self, params: &ExecuteCellParams) -> Result<Value, WorkerCallError> {
        self.call(EXECUTE_CELL, params.to_args()).await
    }

    /// Deliver the response for call `id`.
    ///
    /// Returns `false` if no call with that id is waiting (already answered,
    /// or never issued by this client).
    pub fn resolve_call(&self, id: u64, response: Result<Value, WorkerCallError>) -> bool {
        match self.pending().remove(&id) {
            Some(tx) => {
                // The caller may have stopped waiting; nothing to do then.
                let _ = tx.send(response);
                true
            }
            None => false,
        }
    }

    /// Fail every outstanding call with [`WorkerCallError::ConnectionClosed`].
    ///
    /// Returns the number of calls failed.
    pub fn fail_pending(&self) -> usize {
        let drained: Vec<PendingCall> = self.pending().drain().map(|(_, tx)| tx).collect();
        let count = drained.len();
        for tx in drained {
            let _ = tx.send(Err(WorkerCallError::ConnectionClosed));
        }
        count
    }

    pub fn pending_calls(&self) -> usize {
        self.pending().len()
    }

    /// Whether the connection task has stopped reading outbound frames.
    pub fn is_closed(&self) -> bool {
        self.inner.outgoing.is_closed()
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<u64, PendingCall>> {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for WorkerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerClient")
            .field("pending_calls", &self.pending_calls())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Errors a worker call can resolve to.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkerCallError {
    /// There is no connected worker client to send the call on.
    #[error("Worker unavailable: no connected test-runner client")]
    Unavailable,

    /// The connection closed before the call was answered.
    #[error("Worker connection closed before the call completed")]
    ConnectionClosed,

    /// The worker answered with an error frame.
    #[error("{0}")]
    Remote(String),
}
