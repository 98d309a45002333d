use chrono::{DateTime, Utc};
use serde::Serialize;

/// Pool statistics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub total_proxies: usize,
    pub blocked_proxies: usize,
    pub available_proxies: usize,
    pub port_range_start: u16,
    pub port_range_end: u16,
    /// Formatted as `start-end`
    pub port_range: String,
    pub blocked: Vec<BlockedEndpoint>,
}

/// An endpoint currently excluded from selection
#[derive(Debug, Clone, Serialize)]
pub struct BlockedEndpoint {
    pub endpoint: String,
    pub blocked_at: DateTime<Utc>,
    pub expires_in_secs: u64,
}
