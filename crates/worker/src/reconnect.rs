//! Retry schedule for reaching the worker's API socket.
//!
//! A freshly spawned test runner needs a moment before its API server
//! listens, and a dropped socket may come back while the process lives.
//! [`connect_with_backoff`] keeps dialing on an exponential [`Backoff`]
//! schedule until it gets through or the [`CancellationToken`] fires.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::connection::{WorkerConnection, WorkerEndpoint};

#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Wait after the first failed attempt.
    pub initial_delay: Duration,
    /// Longest wait between attempts.
    pub max_delay: Duration,
    /// Growth factor applied after every failed attempt.
    pub multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl ReconnectConfig {
    /// A fresh delay schedule starting at `initial_delay`.
    pub fn backoff(&self) -> Backoff {
        Backoff {
            next: self.initial_delay,
            max: self.max_delay,
            multiplier: self.multiplier,
        }
    }
}

/// Endless sequence of retry delays, each `multiplier` times the previous
/// one and never above the configured maximum.
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    max: Duration,
    multiplier: f64,
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let current = self.next.min(self.max);
        self.next = Duration::try_from_secs_f64(current.as_secs_f64() * self.multiplier)
            .unwrap_or(self.max)
            .min(self.max);
        Some(current)
    }
}

/// Dial `endpoint` until it answers.
///
/// `None` means `cancel` fired first.
pub async fn connect_with_backoff(
    endpoint: &WorkerEndpoint,
    config: &ReconnectConfig,
    cancel: &CancellationToken,
) -> Option<WorkerConnection> {
    let mut delays = config.backoff();

    for attempt in 1u32.. {
        let outcome = tokio::select! {
            _ = cancel.cancelled() => None,
            result = endpoint.connect() => Some(result),
        };
        let error = match outcome {
            None => {
                tracing::debug!(ws_url = endpoint.ws_url(), "Connection attempts cancelled");
                return None;
            }
            Some(Ok(conn)) => {
                tracing::info!(ws_url = endpoint.ws_url(), attempt, "Worker API reachable");
                return Some(conn);
            }
            Some(Err(e)) => e,
        };

        let delay = delays.next().unwrap_or(config.max_delay);
        tracing::debug!(
            ws_url = endpoint.ws_url(),
            attempt,
            error = %error,
            delay_ms = delay.as_millis() as u64,
            "Worker API not reachable yet",
        );

        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    None
}
