//! Seams to the notebook UI.
//!
//! The kernel never renders anything itself. It asks a [`NotebookHost`] to
//! resolve cells of open documents and to create a [`CellExecution`] for a
//! cell, then drives that execution through start, output replacement and
//! end.

use std::path::Path;

use async_trait::async_trait;
use testbook_core::{ExecutionKey, OutputItem, Timestamp};

/// A cell of an open notebook, as handed to the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotebookCell {
    pub key: ExecutionKey,
    /// Language identifier, e.g. `typescript`.
    pub language: String,
    pub source: String,
}

/// UI-side handle of one cell run.
pub trait CellExecution: Send {
    /// Order number shown next to the cell; `None` for runs that never
    /// reached the worker.
    fn set_execution_order(&mut self, order: Option<u64>);

    fn start(&mut self, at: Timestamp);

    fn replace_output(&mut self, items: Vec<OutputItem>);

    fn end(&mut self, success: bool, at: Timestamp);
}

/// The notebook UI the kernel reports into.
#[async_trait]
pub trait NotebookHost: Send + Sync {
    /// Find cell `cell_id` in the open document at `path`.
    ///
    /// `None` if the document is not open or has no such cell. May need to
    /// load the document, hence async.
    async fn find_cell(&self, path: &Path, cell_id: &str) -> Option<NotebookCell>;

    /// Create the UI execution for `cell`.
    fn create_execution(&self, cell: &NotebookCell) -> Box<dyn CellExecution>;
}

/// Show a failed run on `cell` that never got a tracked execution.
///
/// Used when a cell cannot be handed to the worker at all. No execution
/// order is consumed.
pub fn report_cell_failure(host: &dyn NotebookHost, cell: &NotebookCell, output: OutputItem) {
    let mut execution = host.create_execution(cell);
    let now = chrono::Utc::now();
    execution.set_execution_order(None);
    execution.start(now);
    execution.replace_output(vec![output]);
    execution.end(false, now);
}
