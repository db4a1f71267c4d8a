//! Worker connection processing loop.
//!
//! Pumps frames in both directions over one WebSocket: outbound calls queued
//! by a [`WorkerClient`] are written to the socket, inbound responses are
//! routed back to the client, and inbound events are handed to the
//! [`EventHandlers`] table.

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;

use crate::client::{WorkerCallError, WorkerClient};
use crate::handlers::EventHandlers;
use crate::messages::{parse_frame, Frame};

/// Why [`process_frames`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEnd {
    /// The worker closed the socket or the stream ended.
    Closed,
    /// Reading or writing the socket failed.
    Failed,
    /// The cancellation token fired.
    Cancelled,
}

/// Process frames on `ws_stream` until it closes, fails, or `cancel` fires.
///
/// `outgoing` is the receiving half of the channel `client` writes calls
/// to. On return every call still waiting on `client` has been failed with
/// [`WorkerCallError::ConnectionClosed`].
pub async fn process_frames<S>(
    mut ws_stream: S,
    client: &WorkerClient,
    outgoing: &mut mpsc::UnboundedReceiver<Frame>,
    handlers: &EventHandlers,
    cancel: &CancellationToken,
) -> ConnectionEnd
where
    S: Stream<Item = Result<Message, tungstenite::Error>>
        + Sink<Message, Error = tungstenite::Error>
        + Unpin,
{
    let end = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = ws_stream.close().await;
                break ConnectionEnd::Cancelled;
            }
            Some(frame) = outgoing.recv() => {
                if let Err(e) = send_frame(&mut ws_stream, &frame).await {
                    tracing::error!(error = %e, "Failed to write frame to worker");
                    break ConnectionEnd::Failed;
                }
            }
            msg_result = ws_stream.next() => match msg_result {
                Some(Ok(Message::Text(text))) => {
                    if let Some(reply) = handle_text_frame(&text, client, handlers) {
                        if let Err(e) = send_frame(&mut ws_stream, &reply).await {
                            tracing::error!(error = %e, "Failed to write frame to worker");
                            break ConnectionEnd::Failed;
                        }
                    }
                }
                Some(Ok(Message::Binary(_))) => {
                    tracing::trace!("Ignoring binary frame from worker");
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                    // Handled automatically by tungstenite.
                }
                Some(Ok(Message::Close(frame))) => {
                    tracing::info!(?frame, "Worker closed the connection");
                    break ConnectionEnd::Closed;
                }
                Some(Ok(Message::Frame(_))) => {}
                Some(Err(e)) => {
                    tracing::error!(error = %e, "Worker connection receive error");
                    break ConnectionEnd::Failed;
                }
                None => break ConnectionEnd::Closed,
            },
        }
    };

    let failed = client.fail_pending();
    if failed > 0 {
        tracing::warn!(failed, "Failed calls still waiting on the closed connection");
    }
    end
}

async fn send_frame<S>(ws_stream: &mut S, frame: &Frame) -> Result<(), tungstenite::Error>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    // Frame only holds JSON values and strings, so encoding cannot fail.
    let text = serde_json::to_string(frame).unwrap_or_default();
    ws_stream.send(Message::Text(text)).await
}

/// Route one text frame. Returns a frame to send back, if any.
fn handle_text_frame(text: &str, client: &WorkerClient, handlers: &EventHandlers) -> Option<Frame> {
    let frame = match parse_frame(text) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!(error = %e, raw_message = %text, "Failed to parse worker frame");
            return None;
        }
    };

    match frame {
        Frame::Result { id, result } => {
            if !client.resolve_call(id, Ok(result)) {
                tracing::debug!(id, "Result for a call that is no longer waiting");
            }
            None
        }
        Frame::Error { id, message } => {
            if !client.resolve_call(id, Err(WorkerCallError::Remote(message))) {
                tracing::debug!(id, "Error for a call that is no longer waiting");
            }
            None
        }
        Frame::Event { name, args } => {
            let ran = handlers.dispatch(&name, &args);
            if ran == 0 {
                tracing::debug!(event = %name, "No handler registered for worker event");
            }
            None
        }
        Frame::Call { id, method, .. } => {
            tracing::warn!(id, method = %method, "Worker issued a call; kernel serves none");
            Some(Frame::Error {
                id,
                message: format!("method '{method}' is not served by the kernel"),
            })
        }
    }
}
