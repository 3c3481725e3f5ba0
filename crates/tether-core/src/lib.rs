//! tether-core
//!
//! Offline-first persistence pipeline: an event-driven write-back queue that
//! durably buffers local entity mutations, replays them against a remote API
//! with non-blocking exponential backoff, and reconciles server-assigned ids
//! back into local state.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task, metadata, events, outcome, decision, errors）
//! - **ports**: 抽象化レイヤー（Clock, IdGenerator, KeyValueSink, PersistenceStrategy, SyncAdapter）
//! - **bus**: 型付き EventBus
//! - **queue**: 永続キュー、処理ループ、リトライポリシー
//! - **app**: PipelineBuilder, Orchestrator, TaskFactory
//! - **typed**: 型付き Entity API（Entity trait, EntityStrategy, EntitySyncAdapter）
//! - **impls**: ports の実装（MemorySink, FileSink）
//! - **config**: PipelineConfig

pub mod app;
pub mod bus;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod queue;
pub mod typed;

pub use app::{Orchestrator, Pipeline, PipelineBuilder};
pub use bus::{EventBus, Subscription};
pub use config::{PipelineConfig, TaskDefaults};
pub use queue::{PersistentQueue, QueueConfig, QueueStats, RetryConfig, RetryPolicy};
