//! PersistenceStrategy port - リモート永続化の境界
//!
//! エンティティ種別ごとに 1 実装。REST 呼び出しなどの詳細はこの向こう側。
//! タイムアウトも Strategy 側の責務です（コアは呼び出しに期限を付けない）。

use async_trait::async_trait;

use crate::domain::{BackendId, EntityRef, EntityType, PersistError, TaskPayload};

/// What the remote returned for a create/update.
#[derive(Debug, Clone, PartialEq)]
pub struct Persisted<T> {
    /// Entity as the remote stored it, if it echoed it back.
    pub data: Option<T>,
    /// Identity assigned (or confirmed) by the remote.
    pub backend_id: Option<BackendId>,
}

impl<T> Persisted<T> {
    pub fn new(data: Option<T>, backend_id: Option<BackendId>) -> Self {
        Self { data, backend_id }
    }

    pub fn empty() -> Self {
        Self {
            data: None,
            backend_id: None,
        }
    }
}

#[async_trait]
pub trait PersistenceStrategy<T: Send + Sync>: Send + Sync {
    async fn persist_create(&self, payload: &TaskPayload<T>) -> Result<Persisted<T>, PersistError>;

    /// `payload.data` holds the partial data of the update.
    async fn persist_update(&self, payload: &TaskPayload<T>) -> Result<Persisted<T>, PersistError>;

    async fn persist_delete(
        &self,
        target: &EntityRef,
        entity_type: &EntityType,
    ) -> Result<(), PersistError>;

    /// Merge hook for future conflict handling. Unused by the core.
    fn merge(&self, _local: &T, _remote: &T) -> Option<T> {
        None
    }

    /// Conflict hook for future conflict handling. Unused by the core.
    fn resolve_conflict(&self, _local: &TaskPayload<T>, _remote: &T) -> Option<T> {
        None
    }
}
