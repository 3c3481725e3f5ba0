//! Orchestrator - エンティティイベントとキューの橋渡し
//!
//! # 流れ
//! 1. `entity:created/updated/deleted` を購読し、TaskFactory で task を作る
//! 2. task は intake チャネルへ送られ、単一の intake タスクが発行順に enqueue する
//! 3. キューの processor（Dispatcher）が Strategy を呼び、結果をイベントで通知する
//! 4. `entity:persisted` と失敗イベントは Sync Adapter に転送される
//!
//! Sync Adapter はバスを持たないので、照合（reconciliation）が
//! 新しい mutation イベントを生むことはない。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::app::TaskFactory;
use crate::bus::{EventBus, Subscription};
use crate::domain::{
    EntityType, ErrorCode, ErrorInfo, Event, EventKind, HandlerError, Operation, PersistenceTask,
    TaskPayload,
};
use crate::ports::{Clock, PersistenceStrategy, Persisted, SyncAdapter};
use crate::queue::{PersistentQueue, ProcessFailure, TaskProcessor, classify};

type Strategies<T> = RwLock<HashMap<EntityType, Arc<dyn PersistenceStrategy<T>>>>;
type Adapters<T> = RwLock<HashMap<EntityType, Arc<dyn SyncAdapter<T>>>>;

/// Processor handed to the queue: one remote call per dispatched task.
struct Dispatcher<T: Send + Sync> {
    strategies: Strategies<T>,
    bus: EventBus<T>,
    clock: Arc<dyn Clock>,
}

impl<T> Dispatcher<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn strategy(&self, entity_type: &EntityType) -> Option<Arc<dyn PersistenceStrategy<T>>> {
        self.strategies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(entity_type)
            .cloned()
    }

    async fn call(
        &self,
        strategy: &dyn PersistenceStrategy<T>,
        task: &PersistenceTask<T>,
        payload: &TaskPayload<T>,
    ) -> Result<Persisted<T>, crate::domain::PersistError> {
        match task.operation {
            Operation::Create => strategy.persist_create(payload).await,
            Operation::Update => strategy.persist_update(payload).await,
            Operation::Delete => strategy
                .persist_delete(&payload.identity(), &task.entity_type)
                .await
                .map(|()| Persisted::empty()),
        }
    }
}

#[async_trait]
impl<T> TaskProcessor<T> for Dispatcher<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn process(&self, task: &PersistenceTask<T>) -> Result<(), ProcessFailure> {
        let Some(strategy) = self.strategy(&task.entity_type) else {
            error!(
                task_id = %task.id,
                entity_type = %task.entity_type,
                "no persistence strategy registered"
            );
            return Err(ProcessFailure::fatal(ErrorInfo::new(
                ErrorCode::Configuration,
                format!(
                    "no persistence strategy registered for entity type '{}'",
                    task.entity_type
                ),
            )));
        };

        if task.operation != Operation::Delete && task.payload.data.is_none() {
            error!(task_id = %task.id, operation = %task.operation, "task has no entity data");
            return Err(ProcessFailure::fatal(ErrorInfo::new(
                ErrorCode::Configuration,
                format!("{} task carries no entity data", task.operation),
            )));
        }

        let syncing = task.payload.with_metadata(task.payload.metadata.syncing());
        self.bus.publish(Event::TaskProcessing {
            task_id: task.id.clone(),
            entity_type: task.entity_type.clone(),
            operation: task.operation,
            attempt: task.retry_count + 1,
        });

        match self.call(strategy.as_ref(), task, &syncing).await {
            Ok(persisted) => {
                let metadata = syncing
                    .metadata
                    .synced(persisted.backend_id, self.clock.now_millis());
                let data = persisted.data.or_else(|| syncing.data.clone());
                debug!(
                    task_id = %task.id,
                    backend_id = ?metadata.backend_id.as_ref().map(|id| id.as_str()),
                    "entity persisted"
                );
                self.bus.publish(Event::EntityPersisted {
                    task_id: task.id.clone(),
                    entity_type: task.entity_type.clone(),
                    operation: task.operation,
                    original: task.payload.clone(),
                    persisted: TaskPayload::new(data, metadata),
                });
                self.bus.publish(Event::TaskCompleted {
                    task_id: task.id.clone(),
                    entity_type: task.entity_type.clone(),
                    operation: task.operation,
                });
                Ok(())
            }
            Err(e) => {
                let info = classify(&e);
                warn!(
                    task_id = %task.id,
                    entity_type = %task.entity_type,
                    operation = %task.operation,
                    attempt = task.retry_count + 1,
                    error = %info,
                    "persistence failed"
                );
                self.bus.publish(Event::EntityFailed {
                    task_id: task.id.clone(),
                    entity_type: task.entity_type.clone(),
                    operation: task.operation,
                    payload: syncing.with_metadata(syncing.metadata.errored(info.message.clone())),
                    error: info.clone(),
                });
                self.bus.publish(Event::TaskFailed {
                    task_id: task.id.clone(),
                    entity_type: task.entity_type.clone(),
                    operation: task.operation,
                    error: info.clone(),
                });
                // undecodable payloads never succeed on replay
                if info.code == ErrorCode::Configuration {
                    Err(ProcessFailure::fatal(info))
                } else {
                    Err(ProcessFailure::retryable(info))
                }
            }
        }
    }
}

/// Subscribes to entity lifecycle events and drives the queue.
///
/// Must be created inside a tokio runtime (it spawns the intake task).
pub struct Orchestrator<T: Send + Sync> {
    bus: EventBus<T>,
    queue: PersistentQueue<T>,
    dispatcher: Arc<Dispatcher<T>>,
    adapters: Arc<Adapters<T>>,
    subscriptions: Mutex<Vec<Subscription>>,
    intake: Mutex<Option<mpsc::UnboundedSender<PersistenceTask<T>>>>,
    destroyed: AtomicBool,
}

impl<T> Orchestrator<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(
        bus: EventBus<T>,
        queue: PersistentQueue<T>,
        factory: TaskFactory,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_intake(queue.clone(), bus.clone(), rx));

        let orchestrator = Self {
            dispatcher: Arc::new(Dispatcher {
                strategies: RwLock::new(HashMap::new()),
                bus: bus.clone(),
                clock,
            }),
            adapters: Arc::new(RwLock::new(HashMap::new())),
            bus,
            queue,
            subscriptions: Mutex::new(Vec::new()),
            intake: Mutex::new(Some(tx.clone())),
            destroyed: AtomicBool::new(false),
        };
        orchestrator.subscribe_mutations(Arc::new(factory), tx);
        orchestrator.subscribe_adapters();
        orchestrator
    }

    /// Last registration for an entity type wins.
    pub fn register_strategy(
        &self,
        entity_type: impl Into<EntityType>,
        strategy: Arc<dyn PersistenceStrategy<T>>,
    ) {
        let entity_type = entity_type.into();
        let previous = self
            .dispatcher
            .strategies
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entity_type.clone(), strategy);
        if previous.is_some() {
            debug!(entity_type = %entity_type, "persistence strategy replaced");
        }
    }

    /// Last registration for an entity type wins.
    pub fn register_sync_adapter(
        &self,
        entity_type: impl Into<EntityType>,
        adapter: Arc<dyn SyncAdapter<T>>,
    ) {
        let entity_type = entity_type.into();
        let previous = self
            .adapters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entity_type.clone(), adapter);
        if previous.is_some() {
            debug!(entity_type = %entity_type, "sync adapter replaced");
        }
    }

    pub fn registered_entity_types(&self) -> Vec<EntityType> {
        let mut types: Vec<EntityType> = self
            .dispatcher
            .strategies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        types.sort();
        types
    }

    /// Hand the dispatcher to the queue and resume any restored tasks.
    ///
    /// Strategies registered afterwards are still picked up.
    pub async fn initialize_processor(&self) {
        if self.is_destroyed() {
            warn!("initialize_processor called on a destroyed orchestrator");
            return;
        }
        self.queue.set_processor(self.dispatcher.clone());
        self.queue.restart().await;
        info!(
            pending = self.queue.size().await,
            "persistence processor initialized"
        );
    }

    pub fn bus(&self) -> &EventBus<T> {
        &self.bus
    }

    pub fn queue(&self) -> &PersistentQueue<T> {
        &self.queue
    }

    fn keep(&self, subscription: Subscription) {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(subscription);
    }

    fn subscribe_mutations(
        &self,
        factory: Arc<TaskFactory>,
        intake: mpsc::UnboundedSender<PersistenceTask<T>>,
    ) {
        for kind in [
            EventKind::EntityCreated,
            EventKind::EntityUpdated,
            EventKind::EntityDeleted,
        ] {
            let factory = factory.clone();
            let intake = intake.clone();
            let subscription = self.bus.subscribe(kind, move |event| {
                let Some(task) = factory.from_event(event) else {
                    return Ok(());
                };
                intake
                    .send(task)
                    .map_err(|_| HandlerError::Other("persistence intake is closed".to_string()))
            });
            self.keep(subscription);
        }
    }

    fn subscribe_adapters(&self) {
        let adapters = self.adapters.clone();
        let subscription = self
            .bus
            .subscribe_async(EventKind::EntityPersisted, move |event| {
                let adapters = adapters.clone();
                async move {
                    let Event::EntityPersisted {
                        entity_type,
                        original,
                        persisted,
                        ..
                    } = event
                    else {
                        return Ok(());
                    };
                    let Some(adapter) = lookup(&adapters, &entity_type) else {
                        return Ok(());
                    };
                    adapter.sync_entity(&original, &persisted).await?;
                    Ok(())
                }
            });
        self.keep(subscription);

        for kind in [
            EventKind::EntityPersistError,
            EventKind::EntityUpdateError,
            EventKind::EntityDeleteError,
            EventKind::TaskAbandoned,
        ] {
            let adapters = self.adapters.clone();
            let subscription = self.bus.subscribe_async(kind, move |event| {
                let adapters = adapters.clone();
                async move {
                    let (entity_type, payload, error) = match event {
                        Event::EntityFailed {
                            entity_type,
                            payload,
                            error,
                            ..
                        }
                        | Event::TaskAbandoned {
                            entity_type,
                            payload,
                            error,
                            ..
                        } => (entity_type, payload, error),
                        _ => return Ok(()),
                    };
                    if let Some(adapter) = lookup(&adapters, &entity_type) {
                        adapter.on_error(&error, &payload).await;
                    }
                    Ok(())
                }
            });
            self.keep(subscription);
        }
    }
}

impl<T: Send + Sync> Orchestrator<T> {
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Unsubscribe every listener, close the intake and stop the queue.
    /// Idempotent.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        let subscriptions =
            std::mem::take(&mut *self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner));
        for subscription in &subscriptions {
            subscription.unsubscribe();
        }
        // the intake task exits once every sender is gone
        self.intake
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.queue.stop();
        debug!(listeners = subscriptions.len(), "orchestrator destroyed");
    }
}

impl<T: Send + Sync> Drop for Orchestrator<T> {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn lookup<T: Send + Sync>(
    adapters: &Adapters<T>,
    entity_type: &EntityType,
) -> Option<Arc<dyn SyncAdapter<T>>> {
    adapters
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(entity_type)
        .cloned()
}

/// Enqueue tasks strictly in the order their events were published.
async fn run_intake<T>(
    queue: PersistentQueue<T>,
    bus: EventBus<T>,
    mut rx: mpsc::UnboundedReceiver<PersistenceTask<T>>,
) where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    while let Some(task) = rx.recv().await {
        let (task_id, entity_type, operation) =
            (task.id.clone(), task.entity_type.clone(), task.operation);
        match queue.enqueue(task).await {
            Ok(()) => bus.publish(Event::TaskEnqueued {
                task_id,
                entity_type,
                operation,
            }),
            Err(e) => error!(
                task_id = %task_id,
                entity_type = %entity_type,
                error = %e,
                "failed to enqueue persistence task"
            ),
        }
    }
    debug!("persistence intake closed");
}
