//! `testbook-kernel` library crate.
//!
//! Correlates cell executions requested from a notebook UI with the start
//! and end events reported by the test-runner worker. The `testbook`
//! binary entrypoint lives in `main.rs`.

pub mod config;
pub mod console;
pub mod correlator;
pub mod dispatcher;
pub mod host;
pub mod kernel;
pub mod memory;
pub mod registry;

pub use config::{ConfigError, KernelConfig};
pub use correlator::{Correlator, KernelMessage};
pub use dispatcher::Dispatcher;
pub use host::{CellExecution, NotebookCell, NotebookHost};
pub use kernel::Kernel;
pub use memory::{ExecutionRecord, MemoryHost};
pub use registry::{ExecutionHandle, ExecutionRegistry};
