//! Errors - エラー型
//!
//! - QueueError: 永続キューの操作エラー（容量超過・重複・シンク障害）
//! - SinkError: durable sink の I/O・シリアライズエラー
//! - PersistError: Strategy（リモート呼び出し）の失敗
//! - SyncError / HandlerError: Sync Adapter とイベントハンドラの失敗
//! - ConfigError / BuildError: 起動時の設定・構築エラー

use thiserror::Error;

use super::{EntityType, TaskId};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue is full: {size}/{max} tasks pending")]
    Capacity { size: usize, max: usize },

    #[error("task {0} is already queued")]
    Duplicate(TaskId),

    #[error("durable sink failed: {0}")]
    Sink(#[from] SinkError),
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

/// Failure of a remote persistence call.
///
/// Opaque to the core: only `queue::retry::classify` looks inside, and only for diagnostics.
#[derive(Debug, Clone, Error)]
pub enum PersistError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("http {status}: {message}")]
    Http { status: u16, message: String },

    /// Payload could not be decoded into the entity's type.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("reconciliation failed for {front_id}: {message}")]
    Reconcile { front_id: String, message: String },

    #[error("{0}")]
    Other(String),
}

/// Failure reported by an event bus handler. Logged by the bus, never propagated.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("missing strategies for entity types: {0:?}. These types were expected but not registered.")]
    MissingStrategies(Vec<String>),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to load pending tasks: {0}")]
    Queue(#[from] QueueError),
}

impl BuildError {
    pub fn missing(types: impl IntoIterator<Item = EntityType>) -> Self {
        Self::MissingStrategies(types.into_iter().map(|t| t.as_str().to_string()).collect())
    }
}
