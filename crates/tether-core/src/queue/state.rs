//! Queue observability snapshot.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Tasks in the durable queue (including in-flight ones).
    pub pending: usize,
    /// Currently dispatched.
    pub in_flight: usize,
    /// Eligible for dispatch right now.
    pub ready: usize,
    /// Waiting for a future `retry_at`.
    pub scheduled: usize,
}

impl QueueStats {
    pub fn is_idle(&self) -> bool {
        self.pending == 0 && self.in_flight == 0
    }
}
