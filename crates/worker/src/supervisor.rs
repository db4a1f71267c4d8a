//! Worker process handle.
//!
//! [`WorkerProcess`] supervises exactly one external test-runner process.
//! [`start`](WorkerProcess::start) spawns it and a supervision task that
//! connects to its API socket (retrying while the worker boots), serves the
//! connection, reconnects if the socket drops while the process lives, and
//! records the exit. The process is never relaunched.
//!
//! Connection readiness is observed through [`client`](WorkerProcess::client)
//! returning `Some`. Lifecycle changes are broadcast as
//! [`WorkerLifecycle`] events; call [`subscribe`](WorkerProcess::subscribe)
//! to receive them.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::process::Child;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::client::WorkerClient;
use crate::connection::WorkerEndpoint;
use crate::events::WorkerLifecycle;
use crate::handlers::EventHandlers;
use crate::process::{spawn_worker, WorkerCommand};
use crate::processor::{process_frames, ConnectionEnd};
use crate::reconnect::{connect_with_backoff, ReconnectConfig};

/// Port the test runner's API server listens on unless configured otherwise.
pub const DEFAULT_API_PORT: u16 = 51204;

/// Broadcast channel capacity for lifecycle events.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// How long [`WorkerProcess::shutdown`] waits for the supervision task.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything needed to launch and reach the worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Working directory of the worker process.
    pub workspace: PathBuf,
    pub command: WorkerCommand,
    pub api_host: String,
    pub api_port: u16,
    pub reconnect: ReconnectConfig,
}

impl WorkerConfig {
    /// Defaults for `workspace`: the resolved test runner on the default port.
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        let workspace = workspace.into();
        Self {
            command: WorkerCommand::resolve(&workspace),
            workspace,
            api_host: "127.0.0.1".to_string(),
            api_port: DEFAULT_API_PORT,
            reconnect: ReconnectConfig::default(),
        }
    }

    pub fn endpoint(&self) -> WorkerEndpoint {
        WorkerEndpoint::for_api(&self.api_host, self.api_port)
    }
}

/// Externally visible state of the handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// `start` has not been called.
    Idle,
    /// The supervision task is running (connected or not).
    Running,
    /// The process could not be launched. Permanent.
    Failed,
    /// `shutdown` was called.
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerProcessError {
    #[error("Failed to launch worker process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Worker process failed to launch earlier; restart the kernel")]
    AlreadyFailed,

    #[error("Worker process handle has been shut down")]
    ShutDown,
}

/// Client availability as seen by callers.
#[derive(Clone)]
enum Link {
    /// Not connected yet, or reconnecting.
    Pending,
    Connected(WorkerClient),
    /// Will never connect again.
    Closed,
}

enum Supervision {
    Idle,
    Running(JoinHandle<()>),
    Failed,
    Stopped,
}

/// Handle owning one worker process and its API connection.
pub struct WorkerProcess {
    config: WorkerConfig,
    handlers: Arc<EventHandlers>,
    link_tx: Arc<watch::Sender<Link>>,
    lifecycle_tx: broadcast::Sender<WorkerLifecycle>,
    supervision: Mutex<Supervision>,
    cancel: CancellationToken,
}

impl WorkerProcess {
    pub fn new(config: WorkerConfig) -> Self {
        let (link_tx, _) = watch::channel(Link::Pending);
        let (lifecycle_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            handlers: Arc::new(EventHandlers::new()),
            link_tx: Arc::new(link_tx),
            lifecycle_tx,
            supervision: Mutex::new(Supervision::Idle),
            cancel: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// The inbound event handler table shared with every connection.
    pub fn handlers(&self) -> &Arc<EventHandlers> {
        &self.handlers
    }

    /// Register a handler for inbound events named `name`.
    pub fn on<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(&[Value]) + Send + Sync + 'static,
    {
        self.handlers.on(name, handler);
    }

    /// Subscribe to worker lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerLifecycle> {
        self.lifecycle_tx.subscribe()
    }

    /// The connected client, or `None` while not connected.
    pub fn client(&self) -> Option<WorkerClient> {
        match &*self.link_tx.borrow() {
            Link::Connected(client) => Some(client.clone()),
            Link::Pending | Link::Closed => None,
        }
    }

    /// Wait until a client is connected.
    ///
    /// Returns `None` once the worker can no longer connect (launch failed,
    /// process exited, or the handle was shut down).
    pub async fn wait_for_client(&self) -> Option<WorkerClient> {
        let mut rx = self.link_tx.subscribe();
        let link = rx
            .wait_for(|link| !matches!(link, Link::Pending))
            .await
            .ok()?;
        match &*link {
            Link::Connected(client) => Some(client.clone()),
            Link::Pending | Link::Closed => None,
        }
    }

    pub fn state(&self) -> WorkerState {
        match &*self.lock_supervision() {
            Supervision::Idle => WorkerState::Idle,
            Supervision::Running(_) => WorkerState::Running,
            Supervision::Failed => WorkerState::Failed,
            Supervision::Stopped => WorkerState::Stopped,
        }
    }

    /// Launch the worker and begin connecting to it.
    ///
    /// Returns as soon as the process is spawned; the connection is made in
    /// the background. Calling `start` again while running is a no-op. A
    /// launch failure is reported here once and leaves the handle
    /// permanently failed. Must be called from within a Tokio runtime.
    pub fn start(&self) -> Result<(), WorkerProcessError> {
        let mut supervision = self.lock_supervision();
        match &*supervision {
            Supervision::Running(_) => {
                tracing::debug!("Worker process already started");
                return Ok(());
            }
            Supervision::Failed => return Err(WorkerProcessError::AlreadyFailed),
            Supervision::Stopped => return Err(WorkerProcessError::ShutDown),
            Supervision::Idle => {}
        }

        let config = &self.config;
        let child = match spawn_worker(
            &config.command,
            &config.workspace,
            &config.api_host,
            config.api_port,
        ) {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(
                    command = %config.command,
                    workspace = %config.workspace.display(),
                    error = %e,
                    "Failed to launch worker process",
                );
                *supervision = Supervision::Failed;
                self.link_tx.send_replace(Link::Closed);
                let _ = self.lifecycle_tx.send(WorkerLifecycle::LaunchFailed {
                    error: e.to_string(),
                });
                return Err(WorkerProcessError::Spawn(e));
            }
        };

        let pid = child.id();
        tracing::info!(
            pid,
            command = %config.command,
            ws_url = %config.endpoint().ws_url(),
            "Worker process spawned",
        );
        let _ = self.lifecycle_tx.send(WorkerLifecycle::Spawned { pid });

        let ctx = SupervisorContext {
            endpoint: config.endpoint(),
            reconnect: config.reconnect.clone(),
            handlers: Arc::clone(&self.handlers),
            link_tx: Arc::clone(&self.link_tx),
            lifecycle_tx: self.lifecycle_tx.clone(),
            cancel: self.cancel.clone(),
        };
        *supervision = Supervision::Running(tokio::spawn(supervise(child, ctx)));
        Ok(())
    }

    /// Stop the worker: close the connection, kill the process and wait
    /// (bounded) for the supervision task to finish.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down worker process");
        self.cancel.cancel();

        let task = match std::mem::replace(&mut *self.lock_supervision(), Supervision::Stopped) {
            Supervision::Running(task) => Some(task),
            _ => None,
        };
        if let Some(task) = task {
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, task).await.is_err() {
                tracing::warn!("Worker supervision task did not stop in time");
            }
        }
        self.link_tx.send_replace(Link::Closed);
    }

    fn lock_supervision(&self) -> MutexGuard<'_, Supervision> {
        self.supervision.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// State moved into the supervision task.
struct SupervisorContext {
    endpoint: WorkerEndpoint,
    reconnect: ReconnectConfig,
    handlers: Arc<EventHandlers>,
    link_tx: Arc<watch::Sender<Link>>,
    lifecycle_tx: broadcast::Sender<WorkerLifecycle>,
    cancel: CancellationToken,
}

enum Connecting {
    Connected(crate::connection::WorkerConnection),
    Exited(std::io::Result<std::process::ExitStatus>),
    Cancelled,
}

enum Serving {
    Ended(ConnectionEnd),
    Exited(std::io::Result<std::process::ExitStatus>),
}

/// Core supervision loop: connect -> serve -> reconnect, until the process
/// exits or the handle is shut down.
async fn supervise(mut child: Child, ctx: SupervisorContext) {
    let code = loop {
        let connecting = tokio::select! {
            status = child.wait() => Connecting::Exited(status),
            conn = connect_with_backoff(&ctx.endpoint, &ctx.reconnect, &ctx.cancel) => match conn {
                Some(conn) => Connecting::Connected(conn),
                None => Connecting::Cancelled,
            },
        };
        let conn = match connecting {
            Connecting::Connected(conn) => conn,
            Connecting::Exited(status) => break exit_code(status),
            Connecting::Cancelled => break stop_child(&mut child).await,
        };

        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel();
        let client = WorkerClient::new(outgoing_tx);
        ctx.link_tx.send_replace(Link::Connected(client.clone()));
        let _ = ctx.lifecycle_tx.send(WorkerLifecycle::Connected);

        let serving = tokio::select! {
            status = child.wait() => Serving::Exited(status),
            end = process_frames(conn.ws_stream, &client, &mut outgoing_rx, &ctx.handlers, &ctx.cancel) => {
                Serving::Ended(end)
            }
        };

        ctx.link_tx.send_replace(Link::Pending);
        client.fail_pending();
        let _ = ctx.lifecycle_tx.send(WorkerLifecycle::Disconnected);

        match serving {
            Serving::Exited(status) => break exit_code(status),
            Serving::Ended(ConnectionEnd::Cancelled) => break stop_child(&mut child).await,
            Serving::Ended(end) => {
                tracing::warn!(?end, "Worker connection lost, reconnecting");
            }
        }
    };

    ctx.link_tx.send_replace(Link::Closed);
    tracing::info!(code, "Worker process exited");
    let _ = ctx.lifecycle_tx.send(WorkerLifecycle::Exited { code });
}

fn exit_code(status: std::io::Result<std::process::ExitStatus>) -> Option<i32> {
    status.ok().and_then(|s| s.code())
}

async fn stop_child(child: &mut Child) -> Option<i32> {
    if let Err(e) = child.kill().await {
        tracing::warn!(error = %e, "Failed to kill worker process");
    }
    None
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn config_with(command: WorkerCommand) -> WorkerConfig {
        let dir = std::env::temp_dir();
        WorkerConfig {
            command,
            ..WorkerConfig::new(dir)
        }
    }

    #[tokio::test]
    async fn launch_failure_is_permanent() {
        let worker = WorkerProcess::new(config_with(WorkerCommand::new(
            "definitely-not-a-real-program-4c1d",
            std::iter::empty::<String>(),
        )));
        let mut events = worker.subscribe();

        assert_matches!(worker.start(), Err(WorkerProcessError::Spawn(_)));
        assert_eq!(worker.state(), WorkerState::Failed);
        assert_matches!(worker.start(), Err(WorkerProcessError::AlreadyFailed));
        assert!(worker.client().is_none());
        assert!(worker.wait_for_client().await.is_none());
        assert_matches!(
            events.recv().await.unwrap(),
            WorkerLifecycle::LaunchFailed { .. }
        );
    }

    #[test]
    fn new_handle_is_idle_without_client() {
        let worker = WorkerProcess::new(WorkerConfig::new(std::env::temp_dir()));
        assert_eq!(worker.state(), WorkerState::Idle);
        assert!(worker.client().is_none());
    }

    #[test]
    fn handlers_registered_on_the_handle_are_shared() {
        let worker = WorkerProcess::new(WorkerConfig::new(std::env::temp_dir()));
        worker.on("startCellExecution", |_| {});
        assert_eq!(worker.handlers().handler_count("startCellExecution"), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn start_is_idempotent_and_shutdown_stops() {
        // A live process whose API port has no listener: stays unconnected.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut config = config_with(WorkerCommand::new("sleep", ["30"]));
        config.api_port = port;
        let worker = WorkerProcess::new(config);
        let mut events = worker.subscribe();

        worker.start().unwrap();
        worker.start().unwrap();
        assert_eq!(worker.state(), WorkerState::Running);
        assert_matches!(events.recv().await.unwrap(), WorkerLifecycle::Spawned { .. });
        assert!(worker.client().is_none());

        worker.shutdown().await;
        assert_eq!(worker.state(), WorkerState::Stopped);
        assert_matches!(worker.start(), Err(WorkerProcessError::ShutDown));
        assert_matches!(events.recv().await.unwrap(), WorkerLifecycle::Exited { .. });
        assert!(worker.wait_for_client().await.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_exit_closes_the_link() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut config = config_with(WorkerCommand::new("true", std::iter::empty::<String>()));
        config.api_port = port;
        let worker = WorkerProcess::new(config);

        worker.start().unwrap();
        let client = tokio::time::timeout(Duration::from_secs(5), worker.wait_for_client())
            .await
            .expect("link should close when the process exits");
        assert!(client.is_none());
    }
}
