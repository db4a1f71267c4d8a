//! Shared domain types for the testbook notebook kernel.
//!
//! - [`types`] -- execution keys, timestamps and execution status.
//! - [`output`] -- opaque MIME-tagged cell output payloads.
//! - [`notebook`] -- notebook document (de)serialization.

pub mod error;
pub mod notebook;
pub mod output;
pub mod types;

pub use output::OutputItem;
pub use types::{ExecutionKey, ExecutionStatus, Timestamp};
