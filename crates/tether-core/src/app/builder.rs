//! PipelineBuilder - パイプラインの構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）
//! - Composition root: 生成したインスタンスはすべて `Pipeline` が所有する

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{info, warn};

use crate::app::{Orchestrator, TaskFactory};
use crate::bus::EventBus;
use crate::config::PipelineConfig;
use crate::domain::{BuildError, EntityType, Event};
use crate::impls::MemorySink;
use crate::ports::{
    Clock, IdGenerator, KeyValueSink, PersistenceStrategy, SyncAdapter, SystemClock, UlidGenerator,
};
use crate::queue::{PersistentQueue, QueueStats};
use crate::typed::{Entity, EntityStrategy, EntitySyncAdapter, TypedStrategy, TypedSyncAdapter};

/// PipelineBuilder はパイプラインを構築
///
/// # 使用例
/// ```ignore
/// let pipeline = PipelineBuilder::<Value>::new()
///     .config(config)
///     .sink(Arc::new(FileSink::open("./data").await?))
///     .register::<Note, _>(NoteApi::new(client))
///     .register_sync_adapter::<Note, _>(NoteStore::new(store))
///     .expect_entity_types(&[Note::TYPE, Tag::TYPE])
///     .build()
///     .await?;
/// ```
///
/// # Fail-fast 設計
/// - expect_entity_types() で期待される entity_type を登録
/// - build() 時に「期待集合 ⊆ 登録済み集合」をチェック
/// - 不足があれば BuildError::MissingStrategies を返す
pub struct PipelineBuilder<T: Send + Sync> {
    config: PipelineConfig,
    sink: Option<Arc<dyn KeyValueSink>>,
    clock: Arc<dyn Clock>,
    ids: Option<Arc<dyn IdGenerator>>,
    bus: Option<EventBus<T>>,
    strategies: Vec<(EntityType, Arc<dyn PersistenceStrategy<T>>)>,
    adapters: Vec<(EntityType, Arc<dyn SyncAdapter<T>>)>,
    expected: Option<Vec<EntityType>>,
}

impl<T> PipelineBuilder<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            config: PipelineConfig::default(),
            sink: None,
            clock: Arc::new(SystemClock),
            ids: None,
            bus: None,
            strategies: Vec::new(),
            adapters: Vec::new(),
            expected: None,
        }
    }

    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Durable storage for the queue. Defaults to a `MemorySink`.
    pub fn sink(mut self, sink: Arc<dyn KeyValueSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Use an existing bus, e.g. one the UI layer already publishes on.
    pub fn bus(mut self, bus: EventBus<T>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn strategy(
        mut self,
        entity_type: impl Into<EntityType>,
        strategy: Arc<dyn PersistenceStrategy<T>>,
    ) -> Self {
        self.strategies.push((entity_type.into(), strategy));
        self
    }

    pub fn sync_adapter(
        mut self,
        entity_type: impl Into<EntityType>,
        adapter: Arc<dyn SyncAdapter<T>>,
    ) -> Self {
        self.adapters.push((entity_type.into(), adapter));
        self
    }

    /// 期待される entity_type のリストを設定
    pub fn expect_entity_types(mut self, entity_types: &[&str]) -> Self {
        self.expected = Some(entity_types.iter().map(|&t| EntityType::new(t)).collect());
        self
    }

    /// Validate, load pending tasks from the sink and wire everything.
    ///
    /// Must be awaited inside a tokio runtime. Restored tasks resume
    /// processing immediately.
    pub async fn build(self) -> Result<Pipeline<T>, BuildError> {
        self.config.validate()?;

        if let Some(expected) = &self.expected {
            let missing: Vec<EntityType> = expected
                .iter()
                .filter(|t| !self.strategies.iter().any(|(registered, _)| registered == *t))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::missing(missing));
            }
        }

        let sink: Arc<dyn KeyValueSink> = match self.sink {
            Some(sink) => sink,
            None => {
                warn!("no durable sink configured, pending tasks will not survive a restart");
                Arc::new(MemorySink::new())
            }
        };
        let ids: Arc<dyn IdGenerator> = match self.ids {
            Some(ids) => ids,
            None => Arc::new(UlidGenerator::new(self.clock.clone())),
        };
        let bus = self.bus.unwrap_or_default();
        let retry = self.config.retry_policy();

        let queue = PersistentQueue::load(
            sink,
            self.config.queue.clone(),
            retry.clone(),
            self.clock.clone(),
            bus.clone(),
        )
        .await?;
        let factory = TaskFactory::new(ids, self.clock.clone(), self.config.tasks.clone(), retry);
        let orchestrator = Orchestrator::new(bus.clone(), queue.clone(), factory, self.clock);

        for (entity_type, strategy) in self.strategies {
            orchestrator.register_strategy(entity_type, strategy);
        }
        for (entity_type, adapter) in self.adapters {
            orchestrator.register_sync_adapter(entity_type, adapter);
        }
        orchestrator.initialize_processor().await;
        info!(
            entity_types = ?orchestrator
                .registered_entity_types()
                .iter()
                .map(EntityType::as_str)
                .collect::<Vec<_>>(),
            "persistence pipeline ready"
        );

        Ok(Pipeline {
            bus,
            queue,
            orchestrator,
            poll: Duration::from_millis(self.config.queue.in_flight_poll_ms),
        })
    }
}

impl PipelineBuilder<Value> {
    /// Register a typed strategy for `E::TYPE`.
    pub fn register<E: Entity, S: EntityStrategy<E> + 'static>(self, strategy: S) -> Self {
        self.strategy(E::TYPE, Arc::new(TypedStrategy::<E, S>::new(strategy)))
    }

    /// Register a typed sync adapter for `E::TYPE`.
    pub fn register_sync_adapter<E: Entity, A: EntitySyncAdapter<E> + 'static>(
        self,
        adapter: A,
    ) -> Self {
        self.sync_adapter(E::TYPE, Arc::new(TypedSyncAdapter::<E, A>::new(adapter)))
    }
}

impl<T> Default for PipelineBuilder<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// A wired pipeline. Dropping it tears it down like `destroy`.
pub struct Pipeline<T: Send + Sync> {
    bus: EventBus<T>,
    queue: PersistentQueue<T>,
    orchestrator: Orchestrator<T>,
    poll: Duration,
}

impl<T> Pipeline<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn bus(&self) -> &EventBus<T> {
        &self.bus
    }

    pub fn queue(&self) -> &PersistentQueue<T> {
        &self.queue
    }

    pub fn orchestrator(&self) -> &Orchestrator<T> {
        &self.orchestrator
    }

    pub fn publish(&self, event: Event<T>) {
        self.bus.publish(event);
    }

    pub async fn stats(&self) -> QueueStats {
        self.queue.stats().await
    }

    /// Resolve once the queue is empty and nothing is mid-dispatch.
    ///
    /// Events published right before the call may still be in the intake;
    /// `settle` first when that matters.
    pub async fn wait_idle(&self) {
        while !self.queue.is_empty().await {
            tokio::time::sleep(self.poll).await;
        }
    }

    /// Give the intake a chance to enqueue recently published events.
    pub async fn settle(&self) {
        tokio::time::sleep(self.poll).await;
    }

    pub fn destroy(&self) {
        self.orchestrator.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ConfigError, EntityRef, PersistError, PersistenceMetadata};
    use crate::ports::Persisted;
    use crate::typed::entity::fixtures::{Note, Tag};
    use async_trait::async_trait;

    struct NoteApi;

    #[async_trait]
    impl EntityStrategy<Note> for NoteApi {
        async fn create(
            &self,
            entity: Note,
            _metadata: &PersistenceMetadata,
        ) -> Result<Persisted<Note>, PersistError> {
            Ok(Persisted::new(Some(entity), None))
        }

        async fn update(
            &self,
            entity: Note,
            _metadata: &PersistenceMetadata,
        ) -> Result<Persisted<Note>, PersistError> {
            Ok(Persisted::new(Some(entity), None))
        }

        async fn delete(&self, _target: &EntityRef) -> Result<(), PersistError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn build_success() {
        let pipeline = PipelineBuilder::<Value>::new()
            .register::<Note, _>(NoteApi)
            .expect_entity_types(&[Note::TYPE])
            .build()
            .await;
        assert!(pipeline.is_ok());
    }

    #[tokio::test]
    async fn build_missing_entity_types() {
        let pipeline = PipelineBuilder::<Value>::new()
            .register::<Note, _>(NoteApi)
            .expect_entity_types(&[Note::TYPE, Tag::TYPE])
            .build()
            .await;
        assert!(matches!(
            pipeline,
            Err(BuildError::MissingStrategies(missing)) if missing == vec![Tag::TYPE.to_string()]
        ));
    }

    #[tokio::test]
    async fn build_without_expectations() {
        let pipeline = PipelineBuilder::<Value>::new().build().await.unwrap();
        assert!(pipeline.orchestrator().registered_entity_types().is_empty());
        pipeline.destroy();
        assert!(pipeline.orchestrator().is_destroyed());
    }

    #[tokio::test]
    async fn build_rejects_invalid_config() {
        let mut config = PipelineConfig::default();
        config.queue.max_concurrent = 0;
        let pipeline = PipelineBuilder::<Value>::new().config(config).build().await;
        assert!(matches!(
            pipeline,
            Err(BuildError::Config(ConfigError::Invalid(_)))
        ));
    }

    #[tokio::test]
    async fn build_fails_on_corrupt_storage() {
        let sink = MemorySink::new();
        sink.write("persistence-queue", "not json".to_string())
            .await
            .unwrap();
        let pipeline = PipelineBuilder::<Value>::new()
            .sink(Arc::new(sink))
            .build()
            .await;
        assert!(matches!(pipeline, Err(BuildError::Queue(_))));
    }
}
