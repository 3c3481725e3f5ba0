//! Retry policy: error classification, backoff delays and retry decisions.
//!
//! Everything here is pure (no I/O, time is passed in).

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{
    AbandonReason, Decision, EntityType, EpochMillis, ErrorCode, ErrorInfo, PersistError,
    PersistenceTask,
};

use super::ProcessFailure;

/// Backoff configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,

    /// Delay before the first retry.
    pub initial_delay_ms: u64,

    pub multiplier: f64,

    /// Upper bound of any single delay. `None` means unbounded.
    pub max_delay_ms: Option<u64>,

    /// Fail-safe by default. When `false`, failures classified as 4xx are not retried.
    pub retry_client_errors: bool,
}

impl Default for RetryConfig {
    /// 30s, 120s, 480s, then capped at 600s.
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 30_000,
            multiplier: 4.0,
            max_delay_ms: Some(600_000),
            retry_client_errors: true,
        }
    }
}

/// Per entity type override, shallow-merged over the global config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryOverride {
    pub max_retries: Option<u32>,
    pub initial_delay_ms: Option<u64>,
    pub multiplier: Option<f64>,
    pub max_delay_ms: Option<u64>,
    pub retry_client_errors: Option<bool>,
}

impl RetryOverride {
    pub fn apply(&self, base: &RetryConfig) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries.unwrap_or(base.max_retries),
            initial_delay_ms: self.initial_delay_ms.unwrap_or(base.initial_delay_ms),
            multiplier: self.multiplier.unwrap_or(base.multiplier),
            max_delay_ms: self.max_delay_ms.or(base.max_delay_ms),
            retry_client_errors: self.retry_client_errors.unwrap_or(base.retry_client_errors),
        }
    }
}

/// Delay before retry number `retry_count`.
///
/// `initial_delay * multiplier^(retry_count - 1)`, clamped to `max_delay`.
///
/// Example with initial=30s, multiplier=4, max=600s:
/// - retry 1: 30s
/// - retry 2: 120s
/// - retry 3: 480s
/// - retry 4: 600s (1920s clamped)
pub fn compute_delay(retry_count: u32, config: &RetryConfig) -> Duration {
    if retry_count == 0 {
        return Duration::ZERO;
    }
    let exponent = i32::try_from(retry_count - 1).unwrap_or(i32::MAX);
    let raw = config.initial_delay_ms as f64 * config.multiplier.powi(exponent);
    let capped = match config.max_delay_ms {
        Some(max) => raw.min(max as f64),
        None => raw,
    };
    // `as` saturates: NaN -> 0, inf -> u64::MAX
    Duration::from_millis(capped.max(0.0) as u64)
}

/// Best-effort categorization for diagnostics.
pub fn classify(error: &PersistError) -> ErrorInfo {
    match error {
        PersistError::Network(message) => ErrorInfo::new(ErrorCode::Network, message.clone()),
        PersistError::Timeout(message) => ErrorInfo::new(ErrorCode::Timeout, message.clone()),
        PersistError::Http { status, message } => {
            let code = match status {
                408 => ErrorCode::Timeout,
                400..=499 => ErrorCode::ClientError,
                500..=599 => ErrorCode::ServerError,
                _ => ErrorCode::Unknown,
            };
            ErrorInfo::new(code, message.clone()).with_status(*status)
        }
        PersistError::InvalidPayload(message) => {
            ErrorInfo::new(ErrorCode::Configuration, message.clone())
        }
        PersistError::Other(message) => ErrorInfo::new(classify_message(message), message.clone()),
    }
}

fn classify_message(message: &str) -> ErrorCode {
    let lower = message.to_ascii_lowercase();
    if lower.contains("timeout") || lower.contains("timed out") {
        ErrorCode::Timeout
    } else if lower.contains("network")
        || lower.contains("connection")
        || lower.contains("fetch")
        || lower.contains("offline")
    {
        ErrorCode::Network
    } else {
        ErrorCode::Unknown
    }
}

/// Global config + per entity type overrides.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    global: RetryConfig,
    overrides: HashMap<EntityType, RetryOverride>,
}

impl RetryPolicy {
    pub fn new(global: RetryConfig) -> Self {
        Self {
            global,
            overrides: HashMap::new(),
        }
    }

    pub fn with_override(mut self, entity_type: EntityType, config: RetryOverride) -> Self {
        self.overrides.insert(entity_type, config);
        self
    }

    /// Effective config for an entity type.
    pub fn config_for(&self, entity_type: &EntityType) -> RetryConfig {
        match self.overrides.get(entity_type) {
            Some(config) => config.apply(&self.global),
            None => self.global.clone(),
        }
    }

    /// False once the task has expired or used its retry budget.
    pub fn should_retry<T>(&self, task: &PersistenceTask<T>, now: EpochMillis) -> bool {
        !task.is_expired(now) && task.retry_count < task.max_retries
    }

    /// Decide what happens to a task after a failed attempt.
    ///
    /// Order matters: a non-retryable failure beats everything, expiry beats
    /// the remaining retry budget.
    pub fn decide<T>(
        &self,
        task: &PersistenceTask<T>,
        failure: &ProcessFailure,
        now: EpochMillis,
    ) -> Decision {
        if !failure.retryable {
            return Decision::Abandon {
                reason: AbandonReason::NonRetryable,
            };
        }
        if task.is_expired(now) {
            return Decision::Abandon {
                reason: AbandonReason::Expired,
            };
        }
        if !self.should_retry(task, now) {
            return Decision::Abandon {
                reason: AbandonReason::RetriesExhausted {
                    retry_count: task.retry_count,
                    max_retries: task.max_retries,
                },
            };
        }

        let config = self.config_for(&task.entity_type);
        if !config.retry_client_errors && failure.error.code == ErrorCode::ClientError {
            return Decision::Abandon {
                reason: AbandonReason::NonRetryable,
            };
        }

        let retry_count = task.retry_count + 1;
        let delay = compute_delay(retry_count, &config);
        let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
        Decision::Retry {
            retry_count,
            delay,
            retry_at: now.saturating_add(delay_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FrontId, Operation, PersistenceMetadata, TaskId, TaskPayload};
    use rstest::rstest;

    fn task(retry_count: u32, max_retries: u32) -> PersistenceTask<()> {
        PersistenceTask {
            id: TaskId::new("task-1"),
            entity_type: EntityType::new("note"),
            operation: Operation::Create,
            payload: TaskPayload::new(None, PersistenceMetadata::new(FrontId::new("front-a"), 3)),
            priority: 0,
            created_at: 0,
            retry_count,
            max_retries,
            retry_at: None,
            expires_at: None,
            max_age: None,
        }
    }

    fn transient() -> ProcessFailure {
        ProcessFailure::retryable(ErrorInfo::new(ErrorCode::Network, "connection reset"))
    }

    #[test]
    fn default_config_has_documented_values() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.initial_delay_ms, 30_000);
        assert_eq!(config.multiplier, 4.0);
        assert_eq!(config.max_delay_ms, Some(600_000));
        assert!(config.retry_client_errors);
    }

    #[rstest]
    #[case(0, 0)]
    #[case(1, 30_000)]
    #[case(2, 120_000)]
    #[case(3, 480_000)]
    #[case(4, 600_000)]
    #[case(50, 600_000)]
    fn default_backoff_sequence(#[case] retry_count: u32, #[case] expected_ms: u64) {
        let delay = compute_delay(retry_count, &RetryConfig::default());
        assert_eq!(delay, Duration::from_millis(expected_ms));
    }

    #[test]
    fn backoff_is_monotonic_and_bounded() {
        let config = RetryConfig {
            initial_delay_ms: 250,
            multiplier: 1.7,
            max_delay_ms: Some(90_000),
            ..RetryConfig::default()
        };
        let mut previous = Duration::ZERO;
        for n in 0..200 {
            let delay = compute_delay(n, &config);
            assert!(delay >= previous, "delay({n}) decreased");
            assert!(delay <= Duration::from_millis(90_000));
            previous = delay;
        }
    }

    #[test]
    fn unbounded_backoff_saturates_instead_of_overflowing() {
        let config = RetryConfig {
            max_delay_ms: None,
            ..RetryConfig::default()
        };
        assert_eq!(compute_delay(10_000, &config), Duration::from_millis(u64::MAX));
    }

    #[test]
    fn overrides_are_shallow_merged() {
        let policy = RetryPolicy::new(RetryConfig::default()).with_override(
            EntityType::new("tag"),
            RetryOverride {
                max_retries: Some(5),
                initial_delay_ms: Some(1_000),
                ..RetryOverride::default()
            },
        );

        let tag = policy.config_for(&EntityType::new("tag"));
        assert_eq!(tag.max_retries, 5);
        assert_eq!(tag.initial_delay_ms, 1_000);
        assert_eq!(tag.multiplier, 4.0);
        assert_eq!(tag.max_delay_ms, Some(600_000));

        let note = policy.config_for(&EntityType::new("note"));
        assert_eq!(note, RetryConfig::default());
    }

    #[rstest]
    #[case(PersistError::Network("down".into()), ErrorCode::Network, None)]
    #[case(PersistError::Timeout("30s".into()), ErrorCode::Timeout, None)]
    #[case(PersistError::Http { status: 404, message: "not found".into() }, ErrorCode::ClientError, Some(404))]
    #[case(PersistError::Http { status: 408, message: "slow".into() }, ErrorCode::Timeout, Some(408))]
    #[case(PersistError::Http { status: 503, message: "unavailable".into() }, ErrorCode::ServerError, Some(503))]
    #[case(PersistError::Other("Failed to fetch".into()), ErrorCode::Network, None)]
    #[case(PersistError::Other("operation timed out".into()), ErrorCode::Timeout, None)]
    #[case(PersistError::Other("boom".into()), ErrorCode::Unknown, None)]
    fn classify_errors(
        #[case] error: PersistError,
        #[case] code: ErrorCode,
        #[case] status: Option<u16>,
    ) {
        let info = classify(&error);
        assert_eq!(info.code, code);
        assert_eq!(info.http_status, status);
    }

    #[test]
    fn should_retry_respects_budget_and_expiry() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(&task(0, 3), 0));
        assert!(policy.should_retry(&task(2, 3), 0));
        assert!(!policy.should_retry(&task(3, 3), 0));

        let mut expiring = task(0, 3);
        expiring.expires_at = Some(100);
        assert!(policy.should_retry(&expiring, 100));
        assert!(!policy.should_retry(&expiring, 101));
    }

    #[test]
    fn decide_schedules_retry_with_backoff() {
        let policy = RetryPolicy::default();
        let decision = policy.decide(&task(1, 3), &transient(), 1_000);
        assert_eq!(
            decision,
            Decision::Retry {
                retry_count: 2,
                delay: Duration::from_millis(120_000),
                retry_at: 121_000,
            }
        );
    }

    #[test]
    fn client_errors_are_retried_by_default() {
        let policy = RetryPolicy::default();
        let failure = ProcessFailure::retryable(
            ErrorInfo::new(ErrorCode::ClientError, "bad request").with_status(400),
        );
        assert!(policy.decide(&task(0, 3), &failure, 0).is_retry());
    }

    #[test]
    fn client_errors_can_be_made_terminal_per_entity_type() {
        let policy = RetryPolicy::default().with_override(
            EntityType::new("note"),
            RetryOverride {
                retry_client_errors: Some(false),
                ..RetryOverride::default()
            },
        );
        let failure = ProcessFailure::retryable(
            ErrorInfo::new(ErrorCode::ClientError, "bad request").with_status(400),
        );
        assert_eq!(
            policy.decide(&task(0, 3), &failure, 0),
            Decision::Abandon {
                reason: AbandonReason::NonRetryable
            }
        );
        // server errors still retry
        assert!(policy.decide(&task(0, 3), &transient(), 0).is_retry());
    }

    #[test]
    fn expiry_takes_precedence_over_remaining_budget() {
        let policy = RetryPolicy::default();
        let mut t = task(0, 3);
        t.created_at = 0;
        t.max_age = Some(1_000);
        assert_eq!(
            policy.decide(&t, &transient(), 1_001),
            Decision::Abandon {
                reason: AbandonReason::Expired
            }
        );
    }

    #[test]
    fn exhausted_budget_abandons() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.decide(&task(2, 2), &transient(), 0),
            Decision::Abandon {
                reason: AbandonReason::RetriesExhausted {
                    retry_count: 2,
                    max_retries: 2
                }
            }
        );
    }

    #[test]
    fn non_retryable_failures_abandon_immediately() {
        let policy = RetryPolicy::default();
        let failure = ProcessFailure::fatal(ErrorInfo::new(ErrorCode::Configuration, "no strategy"));
        assert_eq!(
            policy.decide(&task(0, 3), &failure, 0),
            Decision::Abandon {
                reason: AbandonReason::NonRetryable
            }
        );
    }
}
