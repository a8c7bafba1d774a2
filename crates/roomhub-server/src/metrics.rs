//! Metric names recorded by the server.

pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
pub const HUB_ROOMS_ACTIVE: &str = "hub_rooms_active";
pub const HUB_BROADCASTS_TOTAL: &str = "hub_broadcasts_total";
pub const HUB_FRAMES_DELIVERED_TOTAL: &str = "hub_frames_delivered_total";
pub const HUB_EVICTIONS_TOTAL: &str = "hub_evictions_total";
pub const HUB_DROPPED_BROADCASTS_TOTAL: &str = "hub_dropped_broadcasts_total";
pub const FRAMES_REJECTED_TOTAL: &str = "frames_rejected_total";
pub const LIVENESS_TIMEOUTS_TOTAL: &str = "liveness_timeouts_total";
