//! Queue module: durable task queue, processing loop and retry policy.

mod persistent;
pub mod retry;
mod state;

pub use persistent::{PersistentQueue, QueueConfig};
pub use retry::{RetryConfig, RetryOverride, RetryPolicy, classify, compute_delay};
pub use state::QueueStats;

use async_trait::async_trait;

use crate::domain::{ErrorInfo, PersistenceTask};

/// Outcome of a failed dispatch, handed back to the queue.
///
/// The processor never decides retry eligibility: it only says whether the
/// failure is worth retrying at all (`retryable`), the queue's `RetryPolicy`
/// decides the rest.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessFailure {
    pub error: ErrorInfo,
    pub retryable: bool,
}

impl ProcessFailure {
    /// Transient failure, subject to the retry policy.
    pub fn retryable(error: ErrorInfo) -> Self {
        Self {
            error,
            retryable: true,
        }
    }

    /// Configuration defect or similar: abandon without consuming retries.
    pub fn fatal(error: ErrorInfo) -> Self {
        Self {
            error,
            retryable: false,
        }
    }
}

/// Handler the queue calls for every dispatched task.
///
/// Design intent:
/// - Queue owns scheduling and state transitions (retry_at, removal).
/// - Processor performs the side effect and reports the result.
#[async_trait]
pub trait TaskProcessor<T: Send + Sync>: Send + Sync {
    async fn process(&self, task: &PersistenceTask<T>) -> Result<(), ProcessFailure>;
}
