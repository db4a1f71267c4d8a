//! Wires the worker, dispatcher and correlator together.
//!
//! [`Kernel::start`] registers the worker event handlers, spawns the
//! correlator task and a lifecycle forwarder, and launches the worker. A
//! launch failure does not prevent construction: the kernel stays usable,
//! every dispatched cell fails as unavailable, and the error is kept in
//! [`Kernel::launch_error`].

use std::path::PathBuf;
use std::sync::Arc;

use testbook_worker::messages::{
    EndCellExecution, StartCellExecution, END_CELL_EXECUTION, START_CELL_EXECUTION,
};
use testbook_worker::{WorkerConfig, WorkerLifecycle, WorkerProcess, WorkerProcessError};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::correlator::{self, Correlator, KernelMessage};
use crate::dispatcher::{ClientSource, Dispatcher};
use crate::host::{NotebookCell, NotebookHost};

pub struct Kernel {
    worker: Arc<WorkerProcess>,
    dispatcher: Dispatcher,
    messages: mpsc::UnboundedSender<KernelMessage>,
    cancel: CancellationToken,
    correlator_task: JoinHandle<Correlator>,
    lifecycle_task: JoinHandle<()>,
    launch_error: Option<WorkerProcessError>,
}

impl Kernel {
    /// Start a kernel for one workspace. Must be called within a Tokio runtime.
    pub fn start(config: WorkerConfig, host: Arc<dyn NotebookHost>) -> Self {
        let worker = Arc::new(WorkerProcess::new(config));
        let (messages, inbox) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        register_event_handlers(&worker, &messages);
        let lifecycle_task = tokio::spawn(forward_lifecycle(
            worker.subscribe(),
            messages.clone(),
            cancel.clone(),
        ));
        let correlator_task = tokio::spawn(correlator::run(
            Correlator::new(Arc::clone(&host)),
            inbox,
            cancel.clone(),
        ));

        let launch_error = worker.start().err();
        if launch_error.is_none() {
            tracing::info!(
                workspace = %worker.config().workspace.display(),
                "Kernel started"
            );
        }

        let dispatcher = Dispatcher::new(
            Arc::clone(&worker) as Arc<dyn ClientSource>,
            host,
            messages.clone(),
        );

        Self {
            worker,
            dispatcher,
            messages,
            cancel,
            correlator_task,
            lifecycle_task,
            launch_error,
        }
    }

    /// Execute a batch of cells. See [`Dispatcher::execute_all`].
    pub fn execute_all(&self, cells: Vec<NotebookCell>) -> Vec<JoinHandle<()>> {
        self.dispatcher.execute_all(cells)
    }

    /// Notify the kernel that the document at `path` was closed.
    pub fn document_closed(&self, path: impl Into<PathBuf>) {
        let _ = self.messages.send(KernelMessage::DocumentClosed(path.into()));
    }

    pub fn worker(&self) -> &Arc<WorkerProcess> {
        &self.worker
    }

    /// The error the worker failed to launch with, if it did.
    pub fn launch_error(&self) -> Option<&WorkerProcessError> {
        self.launch_error.as_ref()
    }

    /// Stop the worker and the kernel tasks. Pending runs end as failed.
    ///
    /// Returns the last execution order handed out.
    pub async fn shutdown(self) -> u64 {
        self.worker.shutdown().await;
        self.cancel.cancel();

        if let Err(e) = self.lifecycle_task.await {
            tracing::warn!(error = %e, "Lifecycle forwarder panicked");
        }
        match self.correlator_task.await {
            Ok(correlator) => {
                tracing::info!(executions = correlator.execution_order(), "Kernel stopped");
                correlator.execution_order()
            }
            Err(e) => {
                tracing::error!(error = %e, "Correlator task panicked");
                0
            }
        }
    }
}

/// Turn the worker's cell events into kernel messages.
///
/// Handlers run on the connection task; they only parse and enqueue.
fn register_event_handlers(worker: &WorkerProcess, messages: &mpsc::UnboundedSender<KernelMessage>) {
    let tx = messages.clone();
    worker.on(START_CELL_EXECUTION, move |args| {
        match StartCellExecution::from_args(args) {
            Ok(start) => {
                let _ = tx.send(KernelMessage::CellStarted(start));
            }
            Err(e) => tracing::warn!(error = %e, "Malformed startCellExecution event"),
        }
    });

    let tx = messages.clone();
    worker.on(END_CELL_EXECUTION, move |args| {
        match EndCellExecution::from_args(args) {
            Ok(end) => {
                let _ = tx.send(KernelMessage::CellEnded(end));
            }
            Err(e) => tracing::warn!(error = %e, "Malformed endCellExecution event"),
        }
    });
}

async fn forward_lifecycle(
    mut events: broadcast::Receiver<WorkerLifecycle>,
    messages: mpsc::UnboundedSender<KernelMessage>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(event) if event.is_connection_loss() => {
                tracing::debug!(?event, "Worker connection lost");
                if messages.send(KernelMessage::WorkerDisconnected).is_err() {
                    break;
                }
            }
            Ok(event) => tracing::debug!(?event, "Worker lifecycle event"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Lifecycle forwarder lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
