//! In-memory [`NotebookHost`].
//!
//! Keeps open notebook documents in a map and records every UI execution
//! call instead of rendering it. The console runner prints from these
//! records; tests assert on them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use testbook_core::notebook::{NotebookCellData, NotebookData};
use testbook_core::{ExecutionKey, OutputItem, Timestamp};
use tokio::sync::mpsc;

use crate::host::{CellExecution, NotebookCell, NotebookHost};

/// Everything the kernel told the UI about one execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRecord {
    pub key: ExecutionKey,
    pub order: Option<u64>,
    pub started_at: Option<Timestamp>,
    pub ended_at: Option<Timestamp>,
    pub success: Option<bool>,
    pub outputs: Vec<OutputItem>,
    /// How many times `end` was called. Anything above one is a bug.
    pub end_calls: u32,
}

impl ExecutionRecord {
    fn new(key: ExecutionKey) -> Self {
        Self {
            key,
            order: None,
            started_at: None,
            ended_at: None,
            success: None,
            outputs: Vec::new(),
            end_calls: 0,
        }
    }
}

type Records = Arc<Mutex<Vec<ExecutionRecord>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
pub struct MemoryHost {
    documents: Mutex<HashMap<PathBuf, NotebookData>>,
    records: Records,
    finished_tx: Option<mpsc::UnboundedSender<ExecutionRecord>>,
}

impl MemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// A host that also sends each execution's record when it ends.
    pub fn with_completions() -> (Self, mpsc::UnboundedReceiver<ExecutionRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let host = Self {
            finished_tx: Some(tx),
            ..Self::default()
        };
        (host, rx)
    }

    /// Open (or replace) the document at `path`.
    pub fn open(&self, path: impl Into<PathBuf>, notebook: NotebookData) {
        lock(&self.documents).insert(path.into(), notebook);
    }

    /// Close the document at `path`. Returns whether it was open.
    pub fn close(&self, path: &Path) -> bool {
        lock(&self.documents).remove(path).is_some()
    }

    /// Every code cell of the document at `path`, in document order.
    pub fn code_cells(&self, path: &Path) -> Vec<NotebookCell> {
        lock(&self.documents)
            .get(path)
            .map(|notebook| {
                notebook
                    .cells
                    .iter()
                    .filter(|cell| cell.is_code())
                    .map(|cell| to_cell(path, cell))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Snapshot of every execution created so far, in creation order.
    pub fn records(&self) -> Vec<ExecutionRecord> {
        lock(&self.records).clone()
    }

    pub fn records_for(&self, key: &ExecutionKey) -> Vec<ExecutionRecord> {
        lock(&self.records)
            .iter()
            .filter(|r| &r.key == key)
            .cloned()
            .collect()
    }
}

fn to_cell(path: &Path, cell: &NotebookCellData) -> NotebookCell {
    NotebookCell {
        key: ExecutionKey::new(path, cell.id()),
        language: cell.language.clone(),
        source: cell.value.clone(),
    }
}

#[async_trait]
impl NotebookHost for MemoryHost {
    async fn find_cell(&self, path: &Path, cell_id: &str) -> Option<NotebookCell> {
        let documents = lock(&self.documents);
        let notebook = documents.get(path)?;
        notebook.cell(cell_id).map(|cell| to_cell(path, cell))
    }

    fn create_execution(&self, cell: &NotebookCell) -> Box<dyn CellExecution> {
        let mut records = lock(&self.records);
        records.push(ExecutionRecord::new(cell.key.clone()));
        Box::new(MemoryExecution {
            index: records.len() - 1,
            records: Arc::clone(&self.records),
            finished_tx: self.finished_tx.clone(),
        })
    }
}

struct MemoryExecution {
    index: usize,
    records: Records,
    finished_tx: Option<mpsc::UnboundedSender<ExecutionRecord>>,
}

impl MemoryExecution {
    fn update(&self, f: impl FnOnce(&mut ExecutionRecord)) -> ExecutionRecord {
        let mut records = lock(&self.records);
        let record = &mut records[self.index];
        f(record);
        record.clone()
    }
}

impl CellExecution for MemoryExecution {
    fn set_execution_order(&mut self, order: Option<u64>) {
        self.update(|r| r.order = order);
    }

    fn start(&mut self, at: Timestamp) {
        self.update(|r| r.started_at = Some(at));
    }

    fn replace_output(&mut self, items: Vec<OutputItem>) {
        self.update(|r| r.outputs = items);
    }

    fn end(&mut self, success: bool, at: Timestamp) {
        let record = self.update(|r| {
            r.success = Some(success);
            r.ended_at = Some(at);
            r.end_calls += 1;
        });
        if let Some(tx) = &self.finished_tx {
            let _ = tx.send(record);
        }
    }
}
