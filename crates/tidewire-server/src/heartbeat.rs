//! Periodic liveness sweeps.
//!
//! Connections record activity on every decoded frame. The monitor walks
//! the registry on a fixed interval and stops any connection that has been
//! silent for longer than its heartbeat timeout.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::connection::ConnId;
use crate::metrics::HEARTBEAT_EVICTIONS_TOTAL;
use crate::registry::ConnectionRegistry;

/// Stop every timed-out connection in `registry`. Returns the stopped ids.
pub fn sweep(registry: &ConnectionRegistry) -> Vec<ConnId> {
    let mut evicted = Vec::new();
    for conn in registry.snapshot() {
        if conn.is_heartbeat_timeout() {
            info!(
                conn_id = conn.id(),
                remote_addr = %conn.remote_addr(),
                "heartbeat timed out, stopping connection"
            );
            conn.stop();
            evicted.push(conn.id());
        }
    }
    if !evicted.is_empty() {
        counter!(HEARTBEAT_EVICTIONS_TOTAL).increment(evicted.len() as u64);
    }
    evicted
}

/// Sweep `registry` every `interval` until `cancel` fires. Returns the total
/// number of connections stopped.
pub async fn run_liveness_monitor(
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
    cancel: CancellationToken,
) -> usize {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; nothing can be stale yet.
    let _ = ticker.tick().await;

    let mut total = 0;
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                debug!(total, "liveness monitor cancelled");
                return total;
            }
            _ = ticker.tick() => {
                total += sweep(&registry).len();
            }
        }
    }
}
