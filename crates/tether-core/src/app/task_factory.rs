//! TaskFactory - エンティティイベントから PersistenceTask を組み立てる
//!
//! 純粋な変換（時刻と ID は注入された Clock / IdGenerator から）。
//! キューへの投入はしない。

use std::sync::Arc;

use crate::config::TaskDefaults;
use crate::domain::{
    EntityRef, EntityType, Event, FrontId, Operation, PersistenceMetadata, PersistenceTask,
    TaskPayload,
};
use crate::ports::{Clock, IdGenerator};
use crate::queue::RetryPolicy;

pub struct TaskFactory {
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    defaults: TaskDefaults,
    retry: RetryPolicy,
}

impl TaskFactory {
    pub fn new(
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
        defaults: TaskDefaults,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            ids,
            clock,
            defaults,
            retry,
        }
    }

    /// Task for a mutation event, `None` for every other event kind.
    pub fn from_event<T: Clone>(&self, event: &Event<T>) -> Option<PersistenceTask<T>> {
        match event {
            Event::EntityCreated {
                entity_type,
                front_id,
                data,
            } => Some(self.create(entity_type, front_id.clone(), data.clone())),
            Event::EntityUpdated {
                entity_type,
                target,
                data,
            } => Some(self.update(entity_type, target, data.clone())),
            Event::EntityDeleted {
                entity_type,
                target,
            } => Some(self.delete(entity_type, target)),
            _ => None,
        }
    }

    /// `front_id` is synthesized when the caller did not provide one.
    pub fn create<T>(
        &self,
        entity_type: &EntityType,
        front_id: Option<FrontId>,
        data: T,
    ) -> PersistenceTask<T> {
        let front_id = front_id.unwrap_or_else(|| self.ids.generate_front_id());
        let metadata = PersistenceMetadata::new(front_id, self.max_retries(entity_type));
        self.build(entity_type, Operation::Create, TaskPayload::new(Some(data), metadata))
    }

    pub fn update<T>(&self, entity_type: &EntityType, target: &EntityRef, data: T) -> PersistenceTask<T> {
        let metadata = PersistenceMetadata::for_ref(target, self.max_retries(entity_type));
        self.build(entity_type, Operation::Update, TaskPayload::new(Some(data), metadata))
    }

    pub fn delete<T>(&self, entity_type: &EntityType, target: &EntityRef) -> PersistenceTask<T> {
        let metadata = PersistenceMetadata::for_ref(target, self.max_retries(entity_type));
        self.build(entity_type, Operation::Delete, TaskPayload::new(None, metadata))
    }

    fn max_retries(&self, entity_type: &EntityType) -> u32 {
        self.retry.config_for(entity_type).max_retries
    }

    fn build<T>(
        &self,
        entity_type: &EntityType,
        operation: Operation,
        payload: TaskPayload<T>,
    ) -> PersistenceTask<T> {
        let now = self.clock.now_millis();
        let id = self
            .ids
            .generate_task_id(operation, entity_type, &payload.metadata.front_id, now);
        let max_retries = payload.metadata.max_retries;
        PersistenceTask {
            id,
            entity_type: entity_type.clone(),
            operation,
            payload,
            priority: self.defaults.default_priority,
            created_at: now,
            retry_count: 0,
            max_retries,
            retry_at: None,
            expires_at: None,
            max_age: self.defaults.default_max_age_ms,
        }
    }
}
