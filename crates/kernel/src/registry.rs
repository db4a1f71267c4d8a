//! In-flight cell executions, keyed by [`ExecutionKey`].
//!
//! The registry is owned by the correlator task and is never shared, so it
//! holds no locks. An [`ExecutionHandle`] lives here from its correlated
//! start event until it is finalized; whoever removes it owns it after that.

use std::collections::HashMap;
use std::path::Path;

use testbook_core::{ExecutionKey, ExecutionStatus, OutputItem, Timestamp};

use crate::host::CellExecution;

/// One cell run and the UI execution it drives.
pub struct ExecutionHandle {
    pub key: ExecutionKey,
    pub order: u64,
    pub started_at: Timestamp,
    pub ended_at: Option<Timestamp>,
    pub status: ExecutionStatus,
    pub outputs: Vec<OutputItem>,
    execution: Box<dyn CellExecution>,
}

impl ExecutionHandle {
    /// Begin a run: show `order` on the cell and mark it started now.
    pub fn start(key: ExecutionKey, order: u64, mut execution: Box<dyn CellExecution>) -> Self {
        let started_at = chrono::Utc::now();
        execution.set_execution_order(Some(order));
        execution.start(started_at);
        Self {
            key,
            order,
            started_at,
            ended_at: None,
            status: ExecutionStatus::Pending,
            outputs: Vec::new(),
            execution,
        }
    }

    /// Move to a terminal state and push the result to the UI.
    ///
    /// Calling this on a handle that already ended does nothing.
    pub fn finish(&mut self, outputs: Vec<OutputItem>, success: bool) {
        if self.status.is_terminal() {
            return;
        }
        let now = chrono::Utc::now();
        self.status = ExecutionStatus::from_success(success);
        self.ended_at = Some(now);
        self.outputs = outputs;
        self.execution.replace_output(self.outputs.clone());
        self.execution.end(success, now);
    }

    pub fn is_pending(&self) -> bool {
        self.status == ExecutionStatus::Pending
    }
}

impl std::fmt::Debug for ExecutionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionHandle")
            .field("key", &self.key)
            .field("order", &self.order)
            .field("started_at", &self.started_at)
            .field("ended_at", &self.ended_at)
            .field("status", &self.status)
            .field("outputs", &self.outputs.len())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct ExecutionRegistry {
    entries: HashMap<ExecutionKey, ExecutionHandle>,
}

impl ExecutionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `handle` under its key.
    ///
    /// Returns the handle previously registered for that key, untouched.
    pub fn create(&mut self, handle: ExecutionHandle) -> Option<ExecutionHandle> {
        self.entries.insert(handle.key.clone(), handle)
    }

    pub fn get(&self, key: &ExecutionKey) -> Option<&ExecutionHandle> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &ExecutionKey) -> Option<&mut ExecutionHandle> {
        self.entries.get_mut(key)
    }

    /// Finalize the run for `key` and remove it.
    ///
    /// `None` if nothing is pending for `key`, e.g. a duplicate end event.
    pub fn complete(
        &mut self,
        key: &ExecutionKey,
        outputs: Vec<OutputItem>,
        success: bool,
    ) -> Option<ExecutionHandle> {
        let mut handle = self.entries.remove(key)?;
        handle.finish(outputs, success);
        Some(handle)
    }

    /// Remove without finalizing.
    pub fn remove(&mut self, key: &ExecutionKey) -> Option<ExecutionHandle> {
        self.entries.remove(key)
    }

    /// Remove every entry belonging to the document at `path`.
    pub fn drain_document(&mut self, path: &Path) -> Vec<ExecutionHandle> {
        let keys: Vec<ExecutionKey> = self
            .entries
            .keys()
            .filter(|key| key.in_document(path))
            .cloned()
            .collect();
        let mut drained: Vec<ExecutionHandle> = keys
            .iter()
            .filter_map(|key| self.entries.remove(key))
            .collect();
        drained.sort_by_key(|handle| handle.order);
        drained
    }

    /// Remove every entry, lowest order first.
    pub fn drain_all(&mut self) -> Vec<ExecutionHandle> {
        let mut drained: Vec<ExecutionHandle> = self.entries.drain().map(|(_, h)| h).collect();
        drained.sort_by_key(|handle| handle.order);
        drained
    }

    pub fn contains(&self, key: &ExecutionKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use assert_matches::assert_matches;

    use super::*;

    #[derive(Debug, Default)]
    struct Calls {
        order: Option<u64>,
        started: bool,
        outputs: Vec<OutputItem>,
        ended: Vec<bool>,
    }

    struct Probe(Arc<Mutex<Calls>>);

    impl CellExecution for Probe {
        fn set_execution_order(&mut self, order: Option<u64>) {
            self.0.lock().unwrap().order = order;
        }
        fn start(&mut self, _at: Timestamp) {
            self.0.lock().unwrap().started = true;
        }
        fn replace_output(&mut self, items: Vec<OutputItem>) {
            self.0.lock().unwrap().outputs = items;
        }
        fn end(&mut self, success: bool, _at: Timestamp) {
            self.0.lock().unwrap().ended.push(success);
        }
    }

    fn handle(path: &str, cell: &str, order: u64) -> (ExecutionHandle, Arc<Mutex<Calls>>) {
        let calls = Arc::new(Mutex::new(Calls::default()));
        let handle = ExecutionHandle::start(
            ExecutionKey::new(path, cell),
            order,
            Box::new(Probe(Arc::clone(&calls))),
        );
        (handle, calls)
    }

    #[test]
    fn start_drives_ui_execution() {
        let (handle, calls) = handle("/a.tsnb", "c1", 3);
        assert!(handle.is_pending());
        let calls = calls.lock().unwrap();
        assert_eq!(calls.order, Some(3));
        assert!(calls.started);
        assert!(calls.ended.is_empty());
    }

    #[test]
    fn complete_finalizes_and_removes() {
        let mut registry = ExecutionRegistry::new();
        let (h, calls) = handle("/a.tsnb", "c1", 1);
        let key = h.key.clone();
        assert!(registry.create(h).is_none());

        let done = registry
            .complete(&key, vec![OutputItem::text("hi")], true)
            .unwrap();
        assert_eq!(done.status, ExecutionStatus::Success);
        assert!(done.ended_at.is_some());
        assert!(registry.is_empty());

        let calls = calls.lock().unwrap();
        assert_eq!(calls.outputs, vec![OutputItem::text("hi")]);
        assert_eq!(calls.ended, vec![true]);
    }

    #[test]
    fn complete_unknown_key_is_none() {
        let mut registry = ExecutionRegistry::new();
        assert!(registry
            .complete(&ExecutionKey::new("/a.tsnb", "nope"), vec![], true)
            .is_none());
    }

    #[test]
    fn finish_twice_ends_once() {
        let (mut h, calls) = handle("/a.tsnb", "c1", 1);
        h.finish(vec![], false);
        h.finish(vec![OutputItem::text("late")], true);
        assert_eq!(h.status, ExecutionStatus::Failure);
        assert_eq!(calls.lock().unwrap().ended, vec![false]);
    }

    #[test]
    fn create_returns_displaced_handle() {
        let mut registry = ExecutionRegistry::new();
        let (first, _) = handle("/a.tsnb", "c1", 1);
        let (second, _) = handle("/a.tsnb", "c1", 2);
        registry.create(first);
        let displaced = registry.create(second);
        assert_matches!(displaced, Some(h) if h.order == 1);
        assert_eq!(registry.get(&ExecutionKey::new("/a.tsnb", "c1")).unwrap().order, 2);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn drain_document_only_touches_that_document() {
        let mut registry = ExecutionRegistry::new();
        for (path, cell, order) in [("/a.tsnb", "x", 2), ("/b.tsnb", "y", 1), ("/a.tsnb", "z", 3)] {
            registry.create(handle(path, cell, order).0);
        }

        let drained = registry.drain_document(Path::new("/a.tsnb"));
        let orders: Vec<u64> = drained.iter().map(|h| h.order).collect();
        assert_eq!(orders, vec![2, 3]);
        assert!(registry.contains(&ExecutionKey::new("/b.tsnb", "y")));
        assert_eq!(registry.len(), 1);

        assert_eq!(registry.drain_all().len(), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn remove_does_not_finalize() {
        let mut registry = ExecutionRegistry::new();
        let (h, calls) = handle("/a.tsnb", "c1", 1);
        let key = h.key.clone();
        registry.create(h);
        let removed = registry.remove(&key).unwrap();
        assert!(removed.is_pending());
        assert!(calls.lock().unwrap().ended.is_empty());
        assert!(registry.get_mut(&key).is_none());
    }
}
