//! Read model exposed to the operator surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Snapshot of one polling loop, published atomically at tick boundaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingStatus {
    pub loop_name: String,
    pub enabled: bool,
    pub interval_secs: u64,
    pub last_tick_started_at: Option<DateTime<Utc>>,
    pub last_tick_ended_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_errors: u32,
    pub tick_count: u64,
}

impl PollingStatus {
    #[must_use]
    pub fn new(loop_name: &str, interval_secs: u64, enabled: bool) -> Self {
        Self {
            loop_name: loop_name.to_string(),
            enabled,
            interval_secs,
            last_tick_started_at: None,
            last_tick_ended_at: None,
            last_error: None,
            consecutive_errors: 0,
            tick_count: 0,
        }
    }
}
