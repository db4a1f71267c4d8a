//! Test-runner worker process supervision and RPC client.
//!
//! Provides the worker process handle ([`supervisor::WorkerProcess`]), typed
//! frame parsing for the worker's WebSocket API, a multiplexing RPC client,
//! the inbound event handler table, connection retry logic and lifecycle
//! events for the rest of the kernel to observe.

pub mod client;
pub mod connection;
pub mod events;
pub mod handlers;
pub mod messages;
pub mod process;
pub mod processor;
pub mod reconnect;
pub mod supervisor;

pub use client::{WorkerCallError, WorkerClient};
pub use events::WorkerLifecycle;
pub use handlers::EventHandlers;
pub use supervisor::{WorkerConfig, WorkerProcess, WorkerProcessError, WorkerState};
