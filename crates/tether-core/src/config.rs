//! PipelineConfig - 設定の読み込みと検証
//!
//! すべてのフィールドにデフォルトがあり、JSON では必要な部分だけ書けばよい。
//!
//! ```json
//! {
//!   "retry": { "max_retries": 5, "initial_delay_ms": 1000 },
//!   "entity_retry": { "tag": { "retry_client_errors": false } },
//!   "queue": { "max_concurrent": 2 },
//!   "tasks": { "default_max_age_ms": 86400000 }
//! }
//! ```

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::domain::{ConfigError, EntityType};
use crate::queue::{QueueConfig, RetryConfig, RetryOverride, RetryPolicy};

/// Defaults stamped onto every new task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskDefaults {
    pub default_priority: i32,

    /// `None`: tasks never expire.
    pub default_max_age_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub retry: RetryConfig,

    /// Per entity type overrides keyed by entity type name.
    pub entity_retry: HashMap<String, RetryOverride>,

    pub queue: QueueConfig,

    pub tasks: TaskDefaults,
}

impl PipelineConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = tokio::fs::read_to_string(path).await?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_retry("retry", &self.retry)?;
        for (entity_type, over) in &self.entity_retry {
            validate_retry(&format!("entity_retry.{entity_type}"), &over.apply(&self.retry))?;
        }

        let queue = &self.queue;
        if queue.max_concurrent == 0 {
            return Err(invalid("queue.max_concurrent must be at least 1"));
        }
        if queue.max_queue_size == 0 {
            return Err(invalid("queue.max_queue_size must be at least 1"));
        }
        if queue.in_flight_poll_ms == 0 {
            return Err(invalid("queue.in_flight_poll_ms must be at least 1"));
        }
        if queue.storage_key.trim().is_empty() {
            return Err(invalid("queue.storage_key must not be empty"));
        }
        Ok(())
    }

    /// Global retry config with every per entity type override applied.
    pub fn retry_policy(&self) -> RetryPolicy {
        self.entity_retry.iter().fold(
            RetryPolicy::new(self.retry.clone()),
            |policy, (entity_type, over)| {
                policy.with_override(EntityType::new(entity_type.as_str()), over.clone())
            },
        )
    }
}

fn validate_retry(section: &str, retry: &RetryConfig) -> Result<(), ConfigError> {
    if !retry.multiplier.is_finite() || retry.multiplier < 1.0 {
        return Err(invalid(format!("{section}.multiplier must be a finite number >= 1")));
    }
    if let Some(max) = retry.max_delay_ms {
        if max < retry.initial_delay_ms {
            return Err(invalid(format!(
                "{section}.max_delay_ms ({max}) is below initial_delay_ms ({})",
                retry.initial_delay_ms
            )));
        }
    }
    Ok(())
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}
