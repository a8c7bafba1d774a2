//! Per-connection liveness watchdog.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::connection::Liveness;

/// Outcome of the heartbeat loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// Nothing heard from the peer for longer than the timeout.
    TimedOut,
    /// The connection ended for some other reason first.
    Cancelled,
}

/// Check `liveness` every `check_interval` and return once the peer has been
/// silent for more than `timeout`.
///
/// Detection lags the actual expiry by at most one `check_interval`.
pub async fn run_heartbeat(
    liveness: Arc<Liveness>,
    check_interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) -> HeartbeatResult {
    let mut checks = time::interval_at(Instant::now() + check_interval, check_interval);
    checks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = checks.tick() => {
                if liveness.elapsed() > timeout {
                    return HeartbeatResult::TimedOut;
                }
            }
            () = cancel.cancelled() => {
                return HeartbeatResult::Cancelled;
            }
        }
    }
}
