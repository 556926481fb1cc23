//! `/health` endpoint body.

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tidewire_core::FrameMode;

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// `"ok"` while accepting sessions, `"shutting_down"` afterwards.
    pub status: &'static str,
    /// Wall-clock start time, RFC 3339.
    pub started_at: String,
    /// Seconds since start.
    pub uptime_secs: u64,
    /// Registered connections.
    pub connections: usize,
    /// Dispatch workers, `0` in direct mode.
    pub workers: usize,
    /// Transport framing in use.
    pub frame_mode: FrameMode,
}

/// Snapshot of the server's state for `/health`.
#[derive(Debug, Clone, Copy)]
pub struct HealthInputs {
    /// Monotonic start instant, for uptime.
    pub start_time: Instant,
    /// Wall-clock start time.
    pub started_at: DateTime<Utc>,
    /// Registered connections.
    pub connections: usize,
    /// Dispatch workers.
    pub workers: usize,
    /// Transport framing.
    pub frame_mode: FrameMode,
    /// Whether shutdown has begun.
    pub shutting_down: bool,
}

/// Build the response.
pub fn health_check(inputs: HealthInputs) -> HealthResponse {
    HealthResponse {
        status: if inputs.shutting_down { "shutting_down" } else { "ok" },
        started_at: inputs.started_at.to_rfc3339(),
        uptime_secs: inputs.start_time.elapsed().as_secs(),
        connections: inputs.connections,
        workers: inputs.workers,
        frame_mode: inputs.frame_mode,
    }
}
