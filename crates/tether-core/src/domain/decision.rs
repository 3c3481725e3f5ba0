//! Decision model: what the queue does with a task after a failed attempt.
//!
//! Produced by `RetryPolicy::decide` (a pure function); carried out by the queue.

use std::time::Duration;

use super::{AbandonReason, EpochMillis};

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Keep the task and make it eligible again at `retry_at`.
    Retry {
        /// Value `retry_count` takes after this failure.
        retry_count: u32,
        delay: Duration,
        retry_at: EpochMillis,
    },

    /// Remove the task from the queue.
    Abandon { reason: AbandonReason },
}

impl Decision {
    pub fn is_retry(&self) -> bool {
        matches!(self, Decision::Retry { .. })
    }
}
