//! EntityStrategy / EntitySyncAdapter - 型付きの境界
//!
//! # 二層構造
//! - **表層（Typed）**: `EntityStrategy<E>`, `EntitySyncAdapter<E>` - 型安全
//! - **内部（Dyn）**: `PersistenceStrategy<Value>`, `SyncAdapter<Value>` - キューが扱う形
//!
//! `TypedStrategy<E, S>` / `TypedSyncAdapter<E, A>` がその間を変換します。
//! デコードできない payload は `PersistError::InvalidPayload`（リトライしない）。

use std::marker::PhantomData;

use async_trait::async_trait;
use serde_json::Value;

use super::entity::{Entity, decode_payload};
use crate::domain::{
    EntityRef, EntityType, ErrorInfo, PersistError, PersistenceMetadata, SyncError, TaskPayload,
};
use crate::ports::{PersistenceStrategy, Persisted, SyncAdapter};

/// Remote persistence for one entity type.
#[async_trait]
pub trait EntityStrategy<E: Entity>: Send + Sync {
    async fn create(
        &self,
        entity: E,
        metadata: &PersistenceMetadata,
    ) -> Result<Persisted<E>, PersistError>;

    async fn update(
        &self,
        entity: E,
        metadata: &PersistenceMetadata,
    ) -> Result<Persisted<E>, PersistError>;

    async fn delete(&self, target: &EntityRef) -> Result<(), PersistError>;
}

/// Local reconciliation for one entity type.
#[async_trait]
pub trait EntitySyncAdapter<E: Entity>: Send + Sync {
    async fn sync_entity(
        &self,
        original: TaskPayload<E>,
        persisted: TaskPayload<E>,
    ) -> Result<(), SyncError>;

    async fn on_error(&self, _error: &ErrorInfo, _metadata: &PersistenceMetadata) {}
}

pub struct TypedStrategy<E, S> {
    inner: S,
    _marker: PhantomData<fn() -> E>,
}

impl<E: Entity, S: EntityStrategy<E>> TypedStrategy<E, S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            _marker: PhantomData,
        }
    }

    fn entity(payload: &TaskPayload<Value>) -> Result<E, PersistError> {
        decode_payload::<E>(payload)
            .map_err(|e| PersistError::InvalidPayload(format!("{}: {e}", E::TYPE)))?
            .data
            .ok_or_else(|| PersistError::InvalidPayload(format!("{}: missing data", E::TYPE)))
    }

    fn erase(persisted: Persisted<E>) -> Result<Persisted<Value>, PersistError> {
        let data = persisted
            .data
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| PersistError::InvalidPayload(format!("{}: {e}", E::TYPE)))?;
        Ok(Persisted::new(data, persisted.backend_id))
    }
}

#[async_trait]
impl<E: Entity, S: EntityStrategy<E>> PersistenceStrategy<Value> for TypedStrategy<E, S> {
    async fn persist_create(
        &self,
        payload: &TaskPayload<Value>,
    ) -> Result<Persisted<Value>, PersistError> {
        let entity = Self::entity(payload)?;
        Self::erase(self.inner.create(entity, &payload.metadata).await?)
    }

    async fn persist_update(
        &self,
        payload: &TaskPayload<Value>,
    ) -> Result<Persisted<Value>, PersistError> {
        let entity = Self::entity(payload)?;
        Self::erase(self.inner.update(entity, &payload.metadata).await?)
    }

    async fn persist_delete(
        &self,
        target: &EntityRef,
        _entity_type: &EntityType,
    ) -> Result<(), PersistError> {
        self.inner.delete(target).await
    }
}

pub struct TypedSyncAdapter<E, A> {
    inner: A,
    _marker: PhantomData<fn() -> E>,
}

impl<E: Entity, A: EntitySyncAdapter<E>> TypedSyncAdapter<E, A> {
    pub fn new(inner: A) -> Self {
        Self {
            inner,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<E: Entity, A: EntitySyncAdapter<E>> SyncAdapter<Value> for TypedSyncAdapter<E, A> {
    async fn sync_entity(
        &self,
        original: &TaskPayload<Value>,
        persisted: &TaskPayload<Value>,
    ) -> Result<(), SyncError> {
        let decode = |payload: &TaskPayload<Value>| {
            decode_payload::<E>(payload).map_err(|e| SyncError::Reconcile {
                front_id: payload.metadata.front_id.to_string(),
                message: e.to_string(),
            })
        };
        let original = decode(original)?;
        let persisted = decode(persisted)?;
        self.inner.sync_entity(original, persisted).await
    }

    async fn on_error(&self, error: &ErrorInfo, payload: &TaskPayload<Value>) {
        self.inner.on_error(error, &payload.metadata).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BackendId, FrontId};
    use crate::typed::entity::fixtures::Note;
    use serde_json::json;
    use std::sync::Mutex;

    struct EchoNotes;

    #[async_trait]
    impl EntityStrategy<Note> for EchoNotes {
        async fn create(
            &self,
            entity: Note,
            _metadata: &PersistenceMetadata,
        ) -> Result<Persisted<Note>, PersistError> {
            Ok(Persisted::new(Some(entity), Some(BackendId::new("srv-1"))))
        }

        async fn update(
            &self,
            _entity: Note,
            _metadata: &PersistenceMetadata,
        ) -> Result<Persisted<Note>, PersistError> {
            Err(PersistError::Http {
                status: 503,
                message: "maintenance".into(),
            })
        }

        async fn delete(&self, _target: &EntityRef) -> Result<(), PersistError> {
            Ok(())
        }
    }

    fn payload(data: Option<Value>) -> TaskPayload<Value> {
        TaskPayload::new(data, PersistenceMetadata::new(FrontId::new("front-a"), 3))
    }

    #[tokio::test]
    async fn typed_strategy_round_trips_through_value() {
        let strategy = TypedStrategy::<Note, _>::new(EchoNotes);
        let persisted = strategy
            .persist_create(&payload(Some(json!({"title": "hi"}))))
            .await
            .unwrap();

        assert_eq!(persisted.backend_id, Some(BackendId::new("srv-1")));
        assert_eq!(persisted.data, Some(json!({"title": "hi", "body": ""})));
    }

    #[tokio::test]
    async fn typed_strategy_passes_remote_errors_through() {
        let strategy = TypedStrategy::<Note, _>::new(EchoNotes);
        let err = strategy
            .persist_update(&payload(Some(json!({"title": "hi"}))))
            .await
            .unwrap_err();
        assert!(matches!(err, PersistError::Http { status: 503, .. }));
    }

    #[tokio::test]
    async fn undecodable_payload_is_invalid() {
        let strategy = TypedStrategy::<Note, _>::new(EchoNotes);
        let err = strategy
            .persist_create(&payload(Some(json!({"nope": true}))))
            .await
            .unwrap_err();
        assert!(matches!(err, PersistError::InvalidPayload(_)));

        let err = strategy.persist_create(&payload(None)).await.unwrap_err();
        assert!(matches!(err, PersistError::InvalidPayload(_)));
    }

    #[derive(Default)]
    struct Recording(Mutex<Vec<(Option<String>, Option<String>)>>);

    #[async_trait]
    impl EntitySyncAdapter<Note> for Recording {
        async fn sync_entity(
            &self,
            original: TaskPayload<Note>,
            persisted: TaskPayload<Note>,
        ) -> Result<(), SyncError> {
            self.0.lock().unwrap().push((
                original.data.map(|n| n.title),
                persisted.metadata.backend_id.map(|id| id.to_string()),
            ));
            Ok(())
        }
    }

    #[tokio::test]
    async fn typed_adapter_decodes_both_payloads() {
        let adapter = TypedSyncAdapter::<Note, _>::new(Recording::default());
        let original = payload(Some(json!({"title": "hi"})));
        let persisted = original.with_metadata(
            original
                .metadata
                .synced(Some(BackendId::new("srv-9")), 1_000),
        );

        adapter.sync_entity(&original, &persisted).await.unwrap();
        assert_eq!(
            *adapter.inner.0.lock().unwrap(),
            vec![(Some("hi".to_string()), Some("srv-9".to_string()))]
        );

        let broken = payload(Some(json!(42)));
        assert!(matches!(
            adapter.sync_entity(&broken, &persisted).await,
            Err(SyncError::Reconcile { .. })
        ));
    }
}
