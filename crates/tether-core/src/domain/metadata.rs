//! Per-entity sync bookkeeping and its state transitions.
//!
//! Transitions are pure: each helper returns a new `PersistenceMetadata`
//! and leaves the input untouched, so the orchestrator can describe a
//! transition in an event while the queue decides what gets persisted.

use serde::{Deserialize, Serialize};

use super::{BackendId, EntityRef, EpochMillis, FrontId};

/// Sync status of an entity.
///
/// State transitions:
/// - Pending -> Syncing -> Synced
/// - Pending -> Syncing -> Error -> Syncing -> ... (until retries run out)
/// - Conflict is reserved for merge/conflict resolution and never set by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Pending,
    Syncing,
    Synced,
    Error,
    Conflict,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Synced => "synced",
            SyncStatus::Error => "error",
            SyncStatus::Conflict => "conflict",
        }
    }
}

/// Durable record of an entity's sync history.
///
/// Independent of the task's own retry fields: the task drives scheduling,
/// the metadata travels with the entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistenceMetadata {
    pub front_id: FrontId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_id: Option<BackendId>,

    pub sync_status: SyncStatus,

    #[serde(default)]
    pub retry_count: u32,

    #[serde(default)]
    pub max_retries: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_at: Option<EpochMillis>,

    /// Reserved for optimistic locking.
    #[serde(default)]
    pub version: u64,

    /// Last failure detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PersistenceMetadata {
    pub fn new(front_id: FrontId, max_retries: u32) -> Self {
        Self {
            front_id,
            backend_id: None,
            sync_status: SyncStatus::Pending,
            retry_count: 0,
            max_retries,
            last_sync_at: None,
            version: 0,
            error: None,
        }
    }

    /// Metadata for an entity that already has an identity (update/delete).
    pub fn for_ref(target: &EntityRef, max_retries: u32) -> Self {
        let mut metadata = Self::new(target.front_id.clone(), max_retries);
        metadata.backend_id = target.backend_id.clone();
        metadata
    }

    pub fn identity(&self) -> EntityRef {
        EntityRef {
            front_id: self.front_id.clone(),
            backend_id: self.backend_id.clone(),
        }
    }

    /// Dispatched to the remote.
    pub fn syncing(&self) -> Self {
        Self {
            sync_status: SyncStatus::Syncing,
            ..self.clone()
        }
    }

    /// Persisted remotely. Absorbs the backend id when the remote assigned one
    /// and keeps the known one otherwise.
    pub fn synced(&self, backend_id: Option<BackendId>, now: EpochMillis) -> Self {
        Self {
            backend_id: backend_id.or_else(|| self.backend_id.clone()),
            sync_status: SyncStatus::Synced,
            last_sync_at: Some(now),
            error: None,
            ..self.clone()
        }
    }

    /// Remote call failed.
    pub fn errored(&self, error: impl Into<String>) -> Self {
        Self {
            sync_status: SyncStatus::Error,
            retry_count: self.retry_count.saturating_add(1),
            error: Some(error.into()),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> PersistenceMetadata {
        PersistenceMetadata::new(FrontId::new("front-a"), 3)
    }

    #[test]
    fn new_metadata_is_pending() {
        let m = metadata();
        assert_eq!(m.sync_status, SyncStatus::Pending);
        assert_eq!(m.retry_count, 0);
        assert_eq!(m.max_retries, 3);
        assert!(m.backend_id.is_none());
    }

    #[test]
    fn error_then_sync_clears_error_and_absorbs_backend_id() {
        let failed = metadata().syncing().errored("503 service unavailable");
        assert_eq!(failed.sync_status, SyncStatus::Error);
        assert_eq!(failed.retry_count, 1);
        assert_eq!(failed.error.as_deref(), Some("503 service unavailable"));

        let synced = failed.syncing().synced(Some(BackendId::new("b-1")), 1_000);
        assert_eq!(synced.sync_status, SyncStatus::Synced);
        assert_eq!(synced.error, None);
        assert_eq!(synced.backend_id, Some(BackendId::new("b-1")));
        assert_eq!(synced.last_sync_at, Some(1_000));
        // history is kept
        assert_eq!(synced.retry_count, 1);
        assert_eq!(synced.front_id, FrontId::new("front-a"));
    }

    #[test]
    fn synced_without_backend_id_keeps_the_known_one() {
        let target = EntityRef::new(FrontId::new("front-a")).with_backend_id(BackendId::new("b-9"));
        let m = PersistenceMetadata::for_ref(&target, 3).synced(None, 5);
        assert_eq!(m.backend_id, Some(BackendId::new("b-9")));
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&SyncStatus::Syncing).unwrap();
        assert_eq!(json, "\"syncing\"");
    }
}
