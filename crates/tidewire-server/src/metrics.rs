//! Prometheus recorder and metric names.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the global Prometheus recorder.
///
/// Returns the handle used to render `/metrics`. Call once at startup,
/// before anything is recorded.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

/// Connections started (counter).
pub const CONNECTIONS_TOTAL: &str = "tidewire_connections_total";
/// Connections currently running (gauge).
pub const CONNECTIONS_ACTIVE: &str = "tidewire_connections_active";
/// Started connections that have stopped (counter).
pub const DISCONNECTIONS_TOTAL: &str = "tidewire_disconnections_total";
/// Sessions refused at the connection limit (counter).
pub const CONNECTIONS_REJECTED_TOTAL: &str = "tidewire_connections_rejected_total";
/// Frames decoded from clients (counter).
pub const FRAMES_RECEIVED_TOTAL: &str = "tidewire_frames_received_total";
/// Frames written to clients (counter).
pub const FRAMES_SENT_TOTAL: &str = "tidewire_frames_sent_total";
/// Frames that failed to decode (counter).
pub const DECODE_ERRORS_TOTAL: &str = "tidewire_decode_errors_total";
/// Messages with no registered handler (counter).
pub const UNKNOWN_MSG_TOTAL: &str = "tidewire_unknown_msg_total";
/// Handler invocations that panicked (counter).
pub const HANDLER_PANICS_TOTAL: &str = "tidewire_handler_panics_total";
/// Handler invocations cut off by the deadline (counter).
pub const HANDLER_TIMEOUTS_TOTAL: &str = "tidewire_handler_timeouts_total";
/// Handler wall time (histogram).
pub const HANDLER_DURATION_SECONDS: &str = "tidewire_handler_duration_seconds";
/// Broadcast frames dropped on full queues (counter).
pub const BROADCAST_DROPS_TOTAL: &str = "tidewire_broadcast_drops_total";
/// Connections stopped by the liveness monitor (counter).
pub const HEARTBEAT_EVICTIONS_TOTAL: &str = "tidewire_heartbeat_evictions_total";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_without_global_install() {
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let output = render(&handle);
        assert!(output.is_empty() || output.contains('\n'));
    }

    #[test]
    fn metric_constants_are_snake_case() {
        let names = [
            CONNECTIONS_TOTAL,
            CONNECTIONS_ACTIVE,
            DISCONNECTIONS_TOTAL,
            CONNECTIONS_REJECTED_TOTAL,
            FRAMES_RECEIVED_TOTAL,
            FRAMES_SENT_TOTAL,
            DECODE_ERRORS_TOTAL,
            UNKNOWN_MSG_TOTAL,
            HANDLER_PANICS_TOTAL,
            HANDLER_TIMEOUTS_TOTAL,
            HANDLER_DURATION_SECONDS,
            BROADCAST_DROPS_TOTAL,
            HEARTBEAT_EVICTIONS_TOTAL,
        ];
        for name in names {
            assert!(
                name.starts_with("tidewire_")
                    && name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "metric name '{name}' must be snake_case with the tidewire_ prefix"
            );
        }
    }
}
