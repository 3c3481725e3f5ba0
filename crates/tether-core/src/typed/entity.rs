//! Entity trait - エンティティ型と entity_type の対応付け
//!
//! # 学習ポイント
//! - Associated Constants (`const TYPE`)
//! - 型付きの値 ⇔ `serde_json::Value` の境界をここに閉じ込める

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::domain::{EntityRef, EntityType, Event, FrontId, TaskPayload};

/// Entity は entity_type と Rust の型を対応付ける
///
/// # 使用例
/// ```ignore
/// #[derive(Clone, Serialize, Deserialize)]
/// struct Note {
///     title: String,
/// }
///
/// impl Entity for Note {
///     const TYPE: &'static str = "note";
/// }
///
/// bus.publish(note.created(None)?);
/// ```
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Strategy / Sync Adapter の選択キー
    const TYPE: &'static str;

    fn entity_type() -> EntityType {
        EntityType::new(Self::TYPE)
    }

    /// `entity:created`. `front_id` is synthesized downstream when `None`.
    fn created(&self, front_id: Option<FrontId>) -> Result<Event<Value>, serde_json::Error> {
        Ok(Event::EntityCreated {
            entity_type: Self::entity_type(),
            front_id,
            data: serde_json::to_value(self)?,
        })
    }

    /// `entity:updated` carrying `self` as the update data.
    fn updated(&self, target: EntityRef) -> Result<Event<Value>, serde_json::Error> {
        Ok(Event::EntityUpdated {
            entity_type: Self::entity_type(),
            target,
            data: serde_json::to_value(self)?,
        })
    }

    fn deleted(target: EntityRef) -> Event<Value> {
        Event::EntityDeleted {
            entity_type: Self::entity_type(),
            target,
        }
    }
}

/// Decode an erased payload into the entity's type.
pub fn decode_payload<E: Entity>(
    payload: &TaskPayload<Value>,
) -> Result<TaskPayload<E>, serde_json::Error> {
    let data = payload
        .data
        .as_ref()
        .map(|value| E::deserialize(value))
        .transpose()?;
    Ok(TaskPayload::new(data, payload.metadata.clone()))
}


#[cfg(test)]
mod tests {
    use super::fixtures::{Note, Tag};
    use super::*;
    use crate::domain::{EventKind, PersistenceMetadata};
    use serde_json::json;

    #[test]
    fn events_carry_the_entity_type() {
        let note = Note {
            title: "hello".into(),
            body: String::new(),
        };
        let event = note.created(None).unwrap();
        assert_eq!(event.kind(), EventKind::EntityCreated);
        assert_eq!(event.entity_type(), &EntityType::new("note"));

        let deleted = Tag::deleted(EntityRef::new(FrontId::new("front-t")));
        assert_eq!(deleted.entity_type(), &EntityType::new("tag"));
    }

    #[test]
    fn decode_payload_maps_data_and_keeps_metadata() {
        let metadata = PersistenceMetadata::new(FrontId::new("front-a"), 3);
        let payload = TaskPayload::new(Some(json!({"title": "t"})), metadata.clone());

        let typed: TaskPayload<Note> = decode_payload(&payload).unwrap();
        assert_eq!(typed.data.unwrap().title, "t");
        assert_eq!(typed.metadata, metadata);

        let empty = TaskPayload::<Value>::new(None, metadata);
        assert!(decode_payload::<Note>(&empty).unwrap().data.is_none());
    }

    #[test]
    fn decode_payload_rejects_mismatched_shapes() {
        let payload = TaskPayload::new(
            Some(json!({"label": 1})),
            PersistenceMetadata::new(FrontId::new("front-a"), 3),
        );
        assert!(decode_payload::<Tag>(&payload).is_err());
    }
}
