//! WebSocket endpoint of a worker's API server.
//!
//! [`WorkerEndpoint`] holds where to reach the worker. Call
//! [`WorkerEndpoint::connect`] to establish a live [`WorkerConnection`].

use tokio_tungstenite::{connect_async, MaybeTlsStream};

/// Path the test runner serves its API WebSocket on.
pub const API_PATH: &str = "/__vitest_api__";

/// WebSocket stream type of an established worker connection.
pub type WorkerStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Address of one worker's API server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerEndpoint {
    ws_url: String,
}

/// A live WebSocket connection to a worker.
pub struct WorkerConnection {
    pub ws_url: String,
    pub ws_stream: WorkerStream,
}

impl WorkerEndpoint {
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
        }
    }

    /// Endpoint at `ws://{host}:{port}/__vitest_api__`.
    pub fn for_api(host: &str, port: u16) -> Self {
        Self::new(format!("ws://{host}:{port}{API_PATH}"))
    }

    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    /// Open the WebSocket.
    pub async fn connect(&self) -> Result<WorkerConnection, WorkerConnectError> {
        let (ws_stream, _response) = connect_async(self.ws_url.as_str()).await.map_err(|e| {
            WorkerConnectError::Connection(format!(
                "Failed to connect to worker at {}: {e}",
                self.ws_url
            ))
        })?;

        tracing::info!(ws_url = %self.ws_url, "Connected to worker");

        Ok(WorkerConnection {
            ws_url: self.ws_url.clone(),
            ws_stream,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerConnectError {
    /// Failed to establish the WebSocket connection.
    #[error("Connection error: {0}")]
    Connection(String),
}
