//! Reconciles worker events with open documents and in-flight runs.
//!
//! Everything that can change an execution's state arrives as a
//! [`KernelMessage`] on one channel and is applied by [`run`], in order, on a
//! single task. That task owns the [`Correlator`] and with it the registry
//! and the execution-order counter.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use testbook_core::{ExecutionKey, OutputItem};
use testbook_worker::messages::{EndCellExecution, StartCellExecution};
use testbook_worker::WorkerCallError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::host::{report_cell_failure, NotebookCell, NotebookHost};
use crate::registry::{ExecutionHandle, ExecutionRegistry};

/// Input to the correlator task.
#[derive(Debug, Clone)]
pub enum KernelMessage {
    /// The worker began running a cell.
    CellStarted(StartCellExecution),
    /// The worker finished a cell.
    CellEnded(EndCellExecution),
    /// An `executeCell` call for `key` is about to go out.
    CallSent { call: u64, key: ExecutionKey },
    /// The worker acknowledged `call`.
    CallAcknowledged { call: u64 },
    /// The `executeCell` call for `cell` failed.
    DispatchFailed {
        call: u64,
        cell: NotebookCell,
        error: WorkerCallError,
    },
    /// A notebook document was closed in the UI.
    DocumentClosed(PathBuf),
    /// The worker connection was lost or the process exited.
    WorkerDisconnected,
}

pub struct Correlator {
    host: Arc<dyn NotebookHost>,
    registry: ExecutionRegistry,
    execution_order: u64,
    /// Unanswered `executeCell` calls by dispatch id.
    calls: HashMap<u64, ExecutionKey>,
    /// Unanswered calls whose run a disconnect sweep already failed.
    swept_calls: HashSet<u64>,
}

impl Correlator {
    pub fn new(host: Arc<dyn NotebookHost>) -> Self {
        Self {
            host,
            registry: ExecutionRegistry::new(),
            execution_order: 0,
            calls: HashMap::new(),
            swept_calls: HashSet::new(),
        }
    }

    pub fn registry(&self) -> &ExecutionRegistry {
        &self.registry
    }

    /// Last execution order handed out; 0 before the first run.
    pub fn execution_order(&self) -> u64 {
        self.execution_order
    }

    pub async fn handle(&mut self, message: KernelMessage) {
        match message {
            KernelMessage::CellStarted(start) => {
                self.on_start(start.key).await;
            }
            KernelMessage::CellEnded(end) => {
                self.on_end(end);
            }
            KernelMessage::CallSent { call, key } => self.on_call_sent(call, key),
            KernelMessage::CallAcknowledged { call } => self.on_call_acknowledged(call),
            KernelMessage::DispatchFailed { call, cell, error } => {
                self.on_dispatch_failed(call, &cell, &error);
            }
            KernelMessage::DocumentClosed(path) => {
                self.on_document_closed(&path);
            }
            KernelMessage::WorkerDisconnected => {
                self.on_worker_disconnected();
            }
        }
    }

    /// Open a run for `key` if its cell is in an open document.
    ///
    /// Returns the order assigned, or `None` if the event was dropped.
    pub async fn on_start(&mut self, key: ExecutionKey) -> Option<u64> {
        let host = Arc::clone(&self.host);
        let Some(cell) = host.find_cell(&key.path, &key.cell_id).await else {
            tracing::debug!(
                path = %key.path.display(),
                cell_id = %key.cell_id,
                "Start event for a cell that is not open, dropping"
            );
            return None;
        };

        if let Some(mut previous) = self.registry.remove(&key) {
            tracing::info!(
                path = %key.path.display(),
                cell_id = %key.cell_id,
                order = previous.order,
                "Superseding pending execution"
            );
            previous.finish(
                vec![OutputItem::error_named(
                    "Superseded",
                    "Execution was superseded by a newer run of this cell",
                )],
                false,
            );
        }

        self.execution_order += 1;
        let order = self.execution_order;
        let execution = self.host.create_execution(&cell);
        self.registry
            .create(ExecutionHandle::start(key.clone(), order, execution));

        tracing::info!(
            path = %key.path.display(),
            cell_id = %key.cell_id,
            order,
            "Execution started"
        );
        Some(order)
    }

    /// Finalize the run for the ended cell. Stale or duplicate ends are ignored.
    pub fn on_end(&mut self, end: EndCellExecution) -> Option<ExecutionHandle> {
        let EndCellExecution {
            key,
            mut outputs,
            error,
        } = end;
        let success = error.is_none();
        if let Some(error) = error {
            outputs.push(OutputItem::error(error));
        }

        let Some(handle) = self.registry.complete(&key, outputs, success) else {
            tracing::debug!(
                path = %key.path.display(),
                cell_id = %key.cell_id,
                "End event without a pending execution, ignoring"
            );
            return None;
        };

        tracing::info!(
            path = %key.path.display(),
            cell_id = %key.cell_id,
            order = handle.order,
            success,
            outputs = handle.outputs.len(),
            "Execution completed"
        );
        Some(handle)
    }

    pub fn on_call_sent(&mut self, call: u64, key: ExecutionKey) {
        self.calls.insert(call, key);
    }

    pub fn on_call_acknowledged(&mut self, call: u64) {
        self.calls.remove(&call);
        self.swept_calls.remove(&call);
    }

    /// Fail `cell` after its `executeCell` call failed.
    ///
    /// A pending run is completed as failed. Otherwise the failure is shown
    /// on a fresh UI execution that takes no order number, unless this call
    /// closed with a connection whose sweep already failed its run.
    pub fn on_dispatch_failed(
        &mut self,
        call: u64,
        cell: &NotebookCell,
        error: &WorkerCallError,
    ) {
        self.calls.remove(&call);
        let swept = self.swept_calls.remove(&call);
        if swept && *error == WorkerCallError::ConnectionClosed {
            tracing::debug!(
                path = %cell.key.path.display(),
                cell_id = %cell.key.cell_id,
                "Call closed with the connection, run already failed"
            );
            return;
        }

        tracing::warn!(
            path = %cell.key.path.display(),
            cell_id = %cell.key.cell_id,
            error = %error,
            "executeCell failed"
        );
        let output = OutputItem::error(error);
        if self.registry.complete(&cell.key, vec![output.clone()], false).is_none() {
            report_cell_failure(self.host.as_ref(), cell, output);
        }
    }

    /// Fail every pending run of the closed document.
    pub fn on_document_closed(&mut self, path: &Path) -> usize {
        let drained = self.registry.drain_document(path);
        let count = fail_all(drained, "Notebook document was closed");
        if count > 0 {
            tracing::info!(path = %path.display(), count, "Swept executions of closed document");
        }
        count
    }

    /// Fail every pending run; none of them can complete any more.
    pub fn on_worker_disconnected(&mut self) -> usize {
        let drained = self.registry.drain_all();
        let keys: HashSet<&ExecutionKey> = drained.iter().map(|handle| &handle.key).collect();
        self.swept_calls.extend(
            self.calls
                .iter()
                .filter(|(_, key)| keys.contains(key))
                .map(|(call, _)| *call),
        );
        let count = fail_all(drained, "Worker disconnected");
        if count > 0 {
            tracing::warn!(count, "Failed pending executions after worker disconnect");
        }
        count
    }
}

fn fail_all(handles: Vec<ExecutionHandle>, reason: &str) -> usize {
    let count = handles.len();
    for mut handle in handles {
        handle.finish(vec![OutputItem::error(reason)], false);
    }
    count
}

/// Apply messages until the channel closes or `cancel` fires.
///
/// Runs still pending at that point are failed. The correlator is handed
/// back so callers can inspect the final state.
pub async fn run(
    mut correlator: Correlator,
    mut messages: mpsc::UnboundedReceiver<KernelMessage>,
    cancel: CancellationToken,
) -> Correlator {
    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            message = messages.recv() => message,
        };
        let Some(message) = message else { break };
        correlator.handle(message).await;
    }

    let count = fail_all(correlator.registry.drain_all(), "Kernel shut down");
    tracing::debug!(failed = count, "Correlator stopped");
    correlator
}

#[cfg(test)]
mod tests {
    use testbook_core::notebook::deserialize_notebook;
    use testbook_core::ExecutionStatus;

    use super::*;
    use crate::memory::MemoryHost;

    const DOC: &str = "/ws/a.tsnb";

    fn host() -> Arc<MemoryHost> {
        let host = MemoryHost::new();
        host.open(
            DOC,
            deserialize_notebook(
                br#"{"cells":[
                    {"kind":2,"language":"typescript","value":"1","metadata":{"id":"a"}},
                    {"kind":2,"language":"typescript","value":"2","metadata":{"id":"b"}}
                ]}"#,
            ),
        );
        Arc::new(host)
    }

    fn key(cell: &str) -> ExecutionKey {
        ExecutionKey::new(DOC, cell)
    }

    fn end(cell: &str, outputs: Vec<OutputItem>, error: Option<&str>) -> EndCellExecution {
        EndCellExecution {
            key: key(cell),
            outputs,
            error: error.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn start_then_end_succeeds_with_outputs() {
        let host = host();
        let mut correlator = Correlator::new(host.clone());

        assert_eq!(correlator.on_start(key("a")).await, Some(1));
        assert!(correlator.registry().contains(&key("a")));

        let done = correlator
            .on_end(end("a", vec![OutputItem::text("ok")], None))
            .unwrap();
        assert_eq!(done.status, ExecutionStatus::Success);
        assert_eq!(done.outputs, vec![OutputItem::text("ok")]);
        assert!(correlator.registry().is_empty());

        let records = host.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].order, Some(1));
        assert_eq!(records[0].success, Some(true));
    }

    #[tokio::test]
    async fn start_for_unknown_cell_is_dropped() {
        let host = host();
        let mut correlator = Correlator::new(host.clone());

        assert_eq!(correlator.on_start(key("missing")).await, None);
        assert_eq!(
            correlator
                .on_start(ExecutionKey::new("/ws/closed.tsnb", "a"))
                .await,
            None
        );
        assert_eq!(correlator.execution_order(), 0);
        assert!(host.records().is_empty());
    }

    #[tokio::test]
    async fn end_with_error_fails_and_appends_error_output() {
        let host = host();
        let mut correlator = Correlator::new(host.clone());
        correlator.on_start(key("a")).await;

        let done = correlator
            .on_end(end("a", vec![OutputItem::text("partial")], Some("boom")))
            .unwrap();
        assert_eq!(done.status, ExecutionStatus::Failure);
        assert_eq!(done.outputs.len(), 2);
        assert_eq!(done.outputs[0], OutputItem::text("partial"));
        assert!(done.outputs[1].is_error());
        assert_eq!(host.records()[0].success, Some(false));
    }

    #[tokio::test]
    async fn duplicate_start_supersedes_previous_run() {
        let host = host();
        let mut correlator = Correlator::new(host.clone());

        assert_eq!(correlator.on_start(key("a")).await, Some(1));
        assert_eq!(correlator.on_start(key("a")).await, Some(2));
        assert_eq!(correlator.registry().len(), 1);
        assert_eq!(correlator.registry().get(&key("a")).unwrap().order, 2);

        let records = host.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].success, Some(false));
        assert!(records[0].outputs[0].is_error());
        assert_eq!(records[1].success, None);
    }

    #[tokio::test]
    async fn dispatch_failure_without_pending_run_uses_fresh_execution() {
        let host = host();
        let mut correlator = Correlator::new(host.clone());
        let cell = host.find_cell(Path::new(DOC), "b").await.unwrap();

        correlator.on_call_sent(1, key("b"));
        correlator.on_dispatch_failed(1, &cell, &WorkerCallError::Remote("no such test".into()));

        assert!(correlator.registry().is_empty());
        assert_eq!(correlator.execution_order(), 0);
        let records = host.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].order, None);
        assert_eq!(records[0].success, Some(false));
        assert_eq!(records[0].end_calls, 1);
    }

    #[tokio::test]
    async fn dispatch_failure_fails_pending_run() {
        let host = host();
        let mut correlator = Correlator::new(host.clone());
        correlator.on_start(key("b")).await;
        let cell = host.find_cell(Path::new(DOC), "b").await.unwrap();

        correlator.on_dispatch_failed(1, &cell, &WorkerCallError::Remote("rejected".into()));

        assert!(correlator.registry().is_empty());
        let records = host.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].order, Some(1));
        assert_eq!(records[0].success, Some(false));
    }

    #[tokio::test]
    async fn closed_call_after_disconnect_sweep_is_not_reported_twice() {
        let host = host();
        let mut correlator = Correlator::new(host.clone());
        correlator.on_call_sent(1, key("a"));
        correlator.on_call_sent(2, key("b"));
        correlator.on_start(key("a")).await;
        assert_eq!(correlator.on_worker_disconnected(), 1);

        let a = host.find_cell(Path::new(DOC), "a").await.unwrap();
        correlator.on_dispatch_failed(1, &a, &WorkerCallError::ConnectionClosed);
        assert_eq!(host.records().len(), 1);

        // A cell that never started still gets its failure shown.
        let b = host.find_cell(Path::new(DOC), "b").await.unwrap();
        correlator.on_dispatch_failed(2, &b, &WorkerCallError::ConnectionClosed);
        let records = host.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].key, key("b"));
        assert_eq!(records[1].success, Some(false));
        assert!(correlator.calls.is_empty());
        assert!(correlator.swept_calls.is_empty());
    }

    #[tokio::test]
    async fn rerun_after_acknowledged_sweep_still_reports_closed_call() {
        let host = host();
        let mut correlator = Correlator::new(host.clone());
        let a = host.find_cell(Path::new(DOC), "a").await.unwrap();

        correlator.on_call_sent(1, key("a"));
        correlator.on_start(key("a")).await;
        correlator.on_call_acknowledged(1);
        assert_eq!(correlator.on_worker_disconnected(), 1);
        assert!(correlator.swept_calls.is_empty());

        // The cell is run again after a reconnect and that call closes too.
        correlator.on_call_sent(2, key("a"));
        correlator.on_dispatch_failed(2, &a, &WorkerCallError::ConnectionClosed);

        let records = host.records_for(&key("a"));
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].order, None);
        assert_eq!(records[1].success, Some(false));
        assert!(records[1].outputs[0]
            .as_text()
            .unwrap()
            .contains("connection closed"));
    }

    #[tokio::test]
    async fn document_close_fails_only_runs_of_that_document() {
        let host = host();
        host.open(
            "/ws/other.tsnb",
            deserialize_notebook(
                br#"{"cells":[{"kind":2,"language":"typescript","value":"3","metadata":{"id":"c"}}]}"#,
            ),
        );
        let mut correlator = Correlator::new(host.clone());
        correlator.on_start(key("a")).await;
        correlator.on_start(key("b")).await;
        correlator
            .on_start(ExecutionKey::new("/ws/other.tsnb", "c"))
            .await;

        assert_eq!(correlator.on_document_closed(Path::new(DOC)), 2);
        assert_eq!(correlator.registry().len(), 1);
        assert!(correlator
            .registry()
            .contains(&ExecutionKey::new("/ws/other.tsnb", "c")));

        for cell in ["a", "b"] {
            let records = host.records_for(&key(cell));
            assert_eq!(records.len(), 1);
            assert_eq!(records[0].success, Some(false));
            assert!(records[0].outputs[0]
                .as_text()
                .unwrap()
                .contains("document was closed"));
        }
        assert_eq!(correlator.on_document_closed(Path::new(DOC)), 0);
    }

    #[tokio::test]
    async fn run_fails_pending_work_when_channel_closes() {
        let host = host();
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(Correlator::new(host.clone()), rx, CancellationToken::new()));

        tx.send(KernelMessage::CellStarted(StartCellExecution { key: key("a") }))
            .unwrap();
        drop(tx);
        let correlator = task.await.unwrap();

        assert!(correlator.registry().is_empty());
        assert_eq!(correlator.execution_order(), 1);
        assert_eq!(host.records()[0].success, Some(false));
    }
}
