use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Per-request statistics, frozen once the request completes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMetrics {
    pub duration: Duration,
    pub tools_used: Vec<String>,
    pub truncated: bool,
    pub limit_hit: bool,
    pub error: bool,
}

impl RequestMetrics {
    pub fn duration_ms(&self) -> u64 {
        u64::try_from(self.duration.as_millis()).unwrap_or(u64::MAX)
    }
}
