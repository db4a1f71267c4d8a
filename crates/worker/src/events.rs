//! Lifecycle events emitted by the worker supervisor.
//!
//! These describe the state of the worker process and its API connection,
//! not individual cell runs. Subscribe with
//! [`WorkerProcess::subscribe`](crate::supervisor::WorkerProcess::subscribe).

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerLifecycle {
    /// The worker process was started.
    Spawned { pid: Option<u32> },

    /// The API connection was established and a client is available.
    Connected,

    /// The API connection was lost; no client is available.
    Disconnected,

    /// The worker process exited. It is not relaunched.
    Exited { code: Option<i32> },

    /// The worker process could not be started at all.
    LaunchFailed { error: String },
}

impl WorkerLifecycle {
    /// Whether in-flight executions can no longer complete.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Exited { .. })
    }
}
