//! Inbound event handler table.
//!
//! Maps an event name to the ordered list of closures registered for it.
//! The connection task calls [`EventHandlers::dispatch`] once per inbound
//! `event` frame; handlers run synchronously, in registration order, on that
//! task. Handlers must not block: the kernel's handlers only enqueue.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value;

/// A registered event callback. Receives the frame's positional arguments.
pub type EventHandler = Arc<dyn Fn(&[Value]) + Send + Sync>;

#[derive(Default)]
pub struct EventHandlers {
    table: RwLock<HashMap<String, Vec<EventHandler>>>,
}

impl EventHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for events named `name`.
    pub fn on<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(&[Value]) + Send + Sync + 'static,
    {
        self.table
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.into())
            .or_default()
            .push(Arc::new(handler));
    }

    /// Invoke every handler registered for `name`, in registration order.
    ///
    /// Returns how many handlers ran. The table lock is released before any
    /// handler is called, so handlers may register further handlers.
    pub fn dispatch(&self, name: &str, args: &[Value]) -> usize {
        let handlers: Vec<EventHandler> = self
            .table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .unwrap_or_default();

        for handler in &handlers {
            handler(args);
        }
        handlers.len()
    }

    pub fn handler_count(&self, name: &str) -> usize {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map_or(0, Vec::len)
    }
}

impl std::fmt::Debug for EventHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<_> = table.iter().map(|(k, v)| (k.as_str(), v.len())).collect();
        names.sort_unstable();
        f.debug_struct("EventHandlers").field("table", &names).finish()
    }
}
