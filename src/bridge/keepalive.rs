//! Keepalive monitor for idle remote connections.
//!
//! A silently dropped SSH connection (NAT timeout, dead peer) is only
//! noticed when something is written to it. The monitor pings the
//! connection on a fixed period; after `max_failures` consecutive failed
//! keepalives it closes the connection, which surfaces to the bridge as EOF on
//! the session's output streams.
//!
//! There is no backoff: requests run at a fixed interval until the failure
//! ceiling is hit or the stop signal fires.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::remote::RemoteConnection;

/// Why the monitor task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveOutcome {
    /// The stop signal fired.
    Stopped,
    /// Too many consecutive keepalives failed; the connection was closed.
    ConnectionClosed,
}

/// Handle to a running keepalive task.
#[derive(Debug)]
pub struct KeepaliveMonitor {
    stop: CancellationToken,
    task: JoinHandle<KeepaliveOutcome>,
}

impl KeepaliveMonitor {
    /// Start probing `connection` every `interval`.
    ///
    /// Returns `None` (no task) when `interval` is zero.
    pub fn spawn(
        connection: Arc<dyn RemoteConnection>,
        interval: Duration,
        max_failures: u32,
    ) -> Option<Self> {
        if interval.is_zero() {
            return None;
        }

        let stop = CancellationToken::new();
        let task = tokio::spawn(run(connection, interval, max_failures, stop.clone()));
        Some(Self { stop, task })
    }

    /// Signal the task to stop and wait for it.
    ///
    /// Returns the outcome, which is `ConnectionClosed` if the monitor had
    /// already given up before the signal.
    pub async fn stop(self) -> KeepaliveOutcome {
        self.stop.cancel();
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                log::warn!("[Keepalive] Task ended abnormally: {e}");
                KeepaliveOutcome::Stopped
            }
        }
    }
}

/// Keepalive loop.
///
/// The first request is sent one full `interval` after start.
pub async fn run(
    connection: Arc<dyn RemoteConnection>,
    interval: Duration,
    max_failures: u32,
    stop: CancellationToken,
) -> KeepaliveOutcome {
    let max_failures = max_failures.max(1);
    let Some(first_tick) = Instant::now().checked_add(interval) else {
        log::warn!("[Keepalive] Interval {interval:?} out of range, not probing");
        stop.cancelled().await;
        return KeepaliveOutcome::Stopped;
    };
    let mut ticker = interval_at(first_tick, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut failures = 0u32;

    loop {
        tokio::select! {
            () = stop.cancelled() => return KeepaliveOutcome::Stopped,
            _ = ticker.tick() => {}
        }

        let outcome = tokio::select! {
            () = stop.cancelled() => return KeepaliveOutcome::Stopped,
            outcome = connection.send_keepalive() => outcome,
        };

        match outcome {
            Ok(()) => failures = 0,
            Err(e) => {
                failures += 1;
                log::warn!("[Keepalive] Keepalive failed ({failures}/{max_failures}): {e}");
                if failures >= max_failures {
                    log::warn!("[Keepalive] Max failures reached, closing connection");
                    connection.close().await;
                    return KeepaliveOutcome::ConnectionClosed;
                }
            }
        }
    }
}
