//! Events - パイプライン上を流れるイベント
//!
//! - entity:* は UI 側のミューテーション通知と永続化結果
//! - queue:* はタスクのライフサイクル
//!
//! `EventKind` が購読キー、`Event<T>` が中身です。

use serde::{Deserialize, Serialize};
use std::fmt;

use super::{
    EntityRef, EntityType, EpochMillis, ErrorInfo, FrontId, Operation, TaskId, TaskPayload,
};

/// Subscription key of the event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    EntityCreated,
    EntityUpdated,
    EntityDeleted,
    EntityPersisted,
    EntityPersistError,
    EntityUpdateError,
    EntityDeleteError,
    TaskEnqueued,
    TaskProcessing,
    TaskCompleted,
    TaskFailed,
    TaskRetryScheduled,
    TaskAbandoned,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::EntityCreated => "entity:created",
            EventKind::EntityUpdated => "entity:updated",
            EventKind::EntityDeleted => "entity:deleted",
            EventKind::EntityPersisted => "entity:persisted",
            EventKind::EntityPersistError => "entity:persist-error",
            EventKind::EntityUpdateError => "entity:update-error",
            EventKind::EntityDeleteError => "entity:delete-error",
            EventKind::TaskEnqueued => "queue:task-enqueued",
            EventKind::TaskProcessing => "queue:task-processing",
            EventKind::TaskCompleted => "queue:task-completed",
            EventKind::TaskFailed => "queue:task-failed",
            EventKind::TaskRetryScheduled => "queue:task-retry-scheduled",
            EventKind::TaskAbandoned => "queue:task-abandoned",
        }
    }

    /// Operation-specific error event.
    pub fn error_for(operation: Operation) -> Self {
        match operation {
            Operation::Create => EventKind::EntityPersistError,
            Operation::Update => EventKind::EntityUpdateError,
            Operation::Delete => EventKind::EntityDeleteError,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a task left the queue without succeeding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum AbandonReason {
    Expired,
    RetriesExhausted { retry_count: u32, max_retries: u32 },
    NonRetryable,
}

impl fmt::Display for AbandonReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbandonReason::Expired => f.write_str("expired"),
            AbandonReason::RetriesExhausted {
                retry_count,
                max_retries,
            } => write!(f, "retries exhausted ({retry_count}/{max_retries})"),
            AbandonReason::NonRetryable => f.write_str("non-retryable"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event<T> {
    /// A new entity exists locally. `front_id` is synthesized when absent.
    EntityCreated {
        entity_type: EntityType,
        front_id: Option<FrontId>,
        data: T,
    },

    /// Partial data for an existing entity.
    EntityUpdated {
        entity_type: EntityType,
        target: EntityRef,
        data: T,
    },

    EntityDeleted {
        entity_type: EntityType,
        target: EntityRef,
    },

    /// Remote accepted the mutation. `persisted.metadata` is `synced` and
    /// carries the backend id when one was assigned.
    EntityPersisted {
        task_id: TaskId,
        entity_type: EntityType,
        operation: Operation,
        original: TaskPayload<T>,
        persisted: TaskPayload<T>,
    },

    /// Remote call failed. Published as `entity:persist-error`,
    /// `entity:update-error` or `entity:delete-error` depending on `operation`.
    EntityFailed {
        task_id: TaskId,
        entity_type: EntityType,
        operation: Operation,
        payload: TaskPayload<T>,
        error: ErrorInfo,
    },

    TaskEnqueued {
        task_id: TaskId,
        entity_type: EntityType,
        operation: Operation,
    },

    TaskProcessing {
        task_id: TaskId,
        entity_type: EntityType,
        operation: Operation,
        attempt: u32,
    },

    TaskCompleted {
        task_id: TaskId,
        entity_type: EntityType,
        operation: Operation,
    },

    TaskFailed {
        task_id: TaskId,
        entity_type: EntityType,
        operation: Operation,
        error: ErrorInfo,
    },

    TaskRetryScheduled {
        task_id: TaskId,
        entity_type: EntityType,
        retry_count: u32,
        retry_at: EpochMillis,
    },

    /// Terminal failure: the task has been removed from the queue.
    TaskAbandoned {
        task_id: TaskId,
        entity_type: EntityType,
        operation: Operation,
        reason: AbandonReason,
        payload: TaskPayload<T>,
        error: ErrorInfo,
    },
}

impl<T> Event<T> {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::EntityCreated { .. } => EventKind::EntityCreated,
            Event::EntityUpdated { .. } => EventKind::EntityUpdated,
            Event::EntityDeleted { .. } => EventKind::EntityDeleted,
            Event::EntityPersisted { .. } => EventKind::EntityPersisted,
            Event::EntityFailed { operation, .. } => EventKind::error_for(*operation),
            Event::TaskEnqueued { .. } => EventKind::TaskEnqueued,
            Event::TaskProcessing { .. } => EventKind::TaskProcessing,
            Event::TaskCompleted { .. } => EventKind::TaskCompleted,
            Event::TaskFailed { .. } => EventKind::TaskFailed,
            Event::TaskRetryScheduled { .. } => EventKind::TaskRetryScheduled,
            Event::TaskAbandoned { .. } => EventKind::TaskAbandoned,
        }
    }

    pub fn entity_type(&self) -> &EntityType {
        match self {
            Event::EntityCreated { entity_type, .. }
            | Event::EntityUpdated { entity_type, .. }
            | Event::EntityDeleted { entity_type, .. }
            | Event::EntityPersisted { entity_type, .. }
            | Event::EntityFailed { entity_type, .. }
            | Event::TaskEnqueued { entity_type, .. }
            | Event::TaskProcessing { entity_type, .. }
            | Event::TaskCompleted { entity_type, .. }
            | Event::TaskFailed { entity_type, .. }
            | Event::TaskRetryScheduled { entity_type, .. }
            | Event::TaskAbandoned { entity_type, .. } => entity_type,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PersistenceMetadata;

    #[test]
    fn failure_event_kind_follows_operation() {
        let payload: TaskPayload<()> =
            TaskPayload::new(None, PersistenceMetadata::new(FrontId::new("front-a"), 3));
        let event = |operation| Event::EntityFailed {
            task_id: TaskId::new("task-1"),
            entity_type: EntityType::new("note"),
            operation,
            payload: payload.clone(),
            error: ErrorInfo::expired(),
        };

        assert_eq!(event(Operation::Create).kind().as_str(), "entity:persist-error");
        assert_eq!(event(Operation::Update).kind().as_str(), "entity:update-error");
        assert_eq!(event(Operation::Delete).kind().as_str(), "entity:delete-error");
    }
}
