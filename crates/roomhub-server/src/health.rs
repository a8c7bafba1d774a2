//! `/health` endpoint.

use std::time::Instant;

use roomhub_telemetry::MetricsSnapshot;
use serde::Serialize;

use crate::hub::HubStats;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// `"ok"` while the hub answers, `"degraded"` otherwise.
    pub status: &'static str,
    pub uptime_secs: u64,
    pub connections: usize,
    pub rooms: usize,
    pub metrics: MetricsSnapshot,
}

impl HealthResponse {
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// Build a health response. `stats` is `None` when the hub did not answer.
pub fn health_check(
    start_time: Instant,
    stats: Option<HubStats>,
    metrics: MetricsSnapshot,
) -> HealthResponse {
    let (status, stats) = match stats {
        Some(stats) => ("ok", stats),
        None => ("degraded", HubStats::default()),
    };
    HealthResponse {
        status,
        uptime_secs: start_time.elapsed().as_secs(),
        connections: stats.connections,
        rooms: stats.rooms,
        metrics,
    }
}
