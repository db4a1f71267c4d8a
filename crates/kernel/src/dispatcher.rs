//! Fire-and-forget `executeCell` dispatch.
//!
//! Each requested cell gets its own task and its own call, so a slow or
//! failing cell never holds up the rest of the batch. The call's result is
//! only an acknowledgment; outputs come back later as worker events.
//!
//! Every call is numbered, and the correlator hears when it goes out and
//! how it was answered.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use testbook_core::OutputItem;
use testbook_worker::messages::ExecuteCellParams;
use testbook_worker::{WorkerCallError, WorkerClient, WorkerProcess};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::correlator::KernelMessage;
use crate::host::{report_cell_failure, NotebookCell, NotebookHost};

/// Where the dispatcher gets the current worker client from.
pub trait ClientSource: Send + Sync {
    fn client(&self) -> Option<WorkerClient>;
}

impl ClientSource for WorkerProcess {
    fn client(&self) -> Option<WorkerClient> {
        WorkerProcess::client(self)
    }
}

pub struct Dispatcher {
    workers: Arc<dyn ClientSource>,
    host: Arc<dyn NotebookHost>,
    messages: mpsc::UnboundedSender<KernelMessage>,
    next_call: AtomicU64,
}

impl Dispatcher {
    pub fn new(
        workers: Arc<dyn ClientSource>,
        host: Arc<dyn NotebookHost>,
        messages: mpsc::UnboundedSender<KernelMessage>,
    ) -> Self {
        Self {
            workers,
            host,
            messages,
            next_call: AtomicU64::new(1),
        }
    }

    /// Dispatch every cell independently.
    ///
    /// The returned handles finish once each call has been answered; the
    /// cells themselves finish when the worker reports back.
    pub fn execute_all(&self, cells: Vec<NotebookCell>) -> Vec<JoinHandle<()>> {
        tracing::debug!(count = cells.len(), "Dispatching cells");
        cells.into_iter().map(|cell| self.execute(cell)).collect()
    }

    pub fn execute(&self, cell: NotebookCell) -> JoinHandle<()> {
        let client = self.workers.client();
        let host = Arc::clone(&self.host);
        let messages = self.messages.clone();

        // Must be queued before the call frame goes out.
        let call = client.as_ref().map(|_| {
            let call = self.next_call.fetch_add(1, Ordering::Relaxed);
            notify(
                &messages,
                KernelMessage::CallSent {
                    call,
                    key: cell.key.clone(),
                },
            );
            call
        });

        tokio::spawn(async move {
            let Some((client, call)) = client.zip(call) else {
                tracing::warn!(
                    path = %cell.key.path.display(),
                    cell_id = %cell.key.cell_id,
                    "No worker client, failing cell"
                );
                report_cell_failure(
                    host.as_ref(),
                    &cell,
                    OutputItem::error(WorkerCallError::Unavailable),
                );
                return;
            };

            let params = ExecuteCellParams {
                key: cell.key.clone(),
                language_id: cell.language.clone(),
                source: cell.source.clone(),
            };
            match client.execute_cell(&params).await {
                Ok(ack) => {
                    tracing::debug!(
                        path = %cell.key.path.display(),
                        cell_id = %cell.key.cell_id,
                        call,
                        %ack,
                        "executeCell acknowledged"
                    );
                    notify(&messages, KernelMessage::CallAcknowledged { call });
                }
                Err(error) => {
                    notify(&messages, KernelMessage::DispatchFailed { call, cell, error });
                }
            }
        })
    }
}

fn notify(messages: &mpsc::UnboundedSender<KernelMessage>, message: KernelMessage) {
    if messages.send(message).is_err() {
        tracing::debug!("Kernel stopped, dropping dispatch notice");
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use assert_matches::assert_matches;
    use serde_json::json;
    use testbook_core::notebook::deserialize_notebook;
    use testbook_worker::messages::Frame;

    use super::*;
    use crate::memory::MemoryHost;

    struct Fixed(Option<WorkerClient>);

    impl ClientSource for Fixed {
        fn client(&self) -> Option<WorkerClient> {
            self.0.clone()
        }
    }

    fn host() -> Arc<MemoryHost> {
        let host = MemoryHost::new();
        host.open(
            "/ws/a.tsnb",
            deserialize_notebook(
                br#"{"cells":[
                    {"kind":2,"language":"typescript","value":"one","metadata":{"id":"a"}},
                    {"kind":2,"language":"typescript","value":"two","metadata":{"id":"b"}}
                ]}"#,
            ),
        );
        Arc::new(host)
    }

    #[tokio::test]
    async fn no_client_fails_each_cell_without_order() {
        let host = host();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(Arc::new(Fixed(None)), host.clone(), tx);

        for task in dispatcher.execute_all(host.code_cells(Path::new("/ws/a.tsnb"))) {
            task.await.unwrap();
        }

        let records = host.records();
        assert_eq!(records.len(), 2);
        for record in &records {
            assert_eq!(record.order, None);
            assert_eq!(record.success, Some(false));
            assert!(record.outputs[0].is_error());
            assert!(record.outputs[0]
                .as_text()
                .unwrap()
                .contains("Worker unavailable"));
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn calls_carry_cell_fields_and_rejections_are_forwarded() {
        let host = host();
        let (frames_tx, mut frames_rx) = mpsc::unbounded_channel();
        let client = WorkerClient::new(frames_tx);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(Arc::new(Fixed(Some(client.clone()))), host.clone(), tx);

        let cell = host.find_cell(Path::new("/ws/a.tsnb"), "b").await.unwrap();
        let task = dispatcher.execute(cell.clone());

        let frame = frames_rx.recv().await.unwrap();
        let id = assert_matches!(frame, Frame::Call { id, method, args } => {
            assert_eq!(method, "executeCell");
            assert_eq!(args, vec![json!("/ws/a.tsnb"), json!("b"), json!("typescript"), json!("two")]);
            id
        });
        client.resolve_call(id, Err(WorkerCallError::Remote("no such test".into())));
        task.await.unwrap();

        let sent = assert_matches!(
            rx.recv().await,
            Some(KernelMessage::CallSent { call, key }) => {
                assert_eq!(key, cell.key);
                call
            }
        );
        assert_matches!(
            rx.recv().await,
            Some(KernelMessage::DispatchFailed { call, cell: failed, error: WorkerCallError::Remote(msg) }) => {
                assert_eq!(call, sent);
                assert_eq!(failed, cell);
                assert_eq!(msg, "no such test");
            }
        );
        assert!(host.records().is_empty());
    }

    #[tokio::test]
    async fn calls_are_numbered_and_acknowledgments_forwarded() {
        let host = host();
        let (frames_tx, mut frames_rx) = mpsc::unbounded_channel();
        let client = WorkerClient::new(frames_tx);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(Arc::new(Fixed(Some(client.clone()))), host.clone(), tx);

        let cells = host.code_cells(Path::new("/ws/a.tsnb"));
        let tasks = dispatcher.execute_all(cells);
        for _ in 0..2 {
            let Some(Frame::Call { id, .. }) = frames_rx.recv().await else {
                panic!("expected a call frame");
            };
            client.resolve_call(id, Ok(json!(null)));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let mut sent = Vec::new();
        let mut acknowledged = Vec::new();
        while let Ok(message) = rx.try_recv() {
            match message {
                KernelMessage::CallSent { call, .. } => sent.push(call),
                KernelMessage::CallAcknowledged { call } => acknowledged.push(call),
                other => panic!("unexpected message {other:?}"),
            }
        }
        acknowledged.sort_unstable();
        assert_eq!(sent, vec![1, 2]);
        assert_eq!(acknowledged, vec![1, 2]);
        assert!(host.records().is_empty());
    }
}
