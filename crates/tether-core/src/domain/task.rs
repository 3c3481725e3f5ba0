use serde::{Deserialize, Serialize};
use std::fmt;

use super::{EntityRef, EntityType, EpochMillis, PersistenceMetadata, TaskId};

/// Kind of mutation a task replays against the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Entity snapshot + its sync metadata. `data` is absent for deletes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPayload<T> {
    // no `default` here: it would add a `T: Default` bound to Deserialize
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    pub metadata: PersistenceMetadata,
}

impl<T> TaskPayload<T> {
    pub fn new(data: Option<T>, metadata: PersistenceMetadata) -> Self {
        Self { data, metadata }
    }

    pub fn identity(&self) -> EntityRef {
        self.metadata.identity()
    }

    pub fn with_metadata(&self, metadata: PersistenceMetadata) -> Self
    where
        T: Clone,
    {
        Self {
            data: self.data.clone(),
            metadata,
        }
    }
}

/// A durable unit of deferred persistence work for one entity mutation.
///
/// Design:
/// - The queue owns every instance; changes go through `enqueue` / `update` / `dequeue`.
/// - `retry_count` / `retry_at` drive scheduling; `payload.metadata` is the entity's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistenceTask<T> {
    pub id: TaskId,
    pub entity_type: EntityType,
    pub operation: Operation,
    pub payload: TaskPayload<T>,

    /// Higher dequeues first; equal priorities keep insertion order.
    pub priority: i32,

    pub created_at: EpochMillis,

    pub retry_count: u32,
    pub max_retries: u32,

    /// Not eligible for dispatch before this instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_at: Option<EpochMillis>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<EpochMillis>,

    /// Lifetime in milliseconds, used to derive `expires_at` when it is missing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age: Option<u64>,
}

impl<T> PersistenceTask<T> {
    /// `expires_at`, or `created_at + max_age` when only the age is known.
    pub fn effective_expires_at(&self) -> Option<EpochMillis> {
        self.expires_at.or_else(|| {
            self.max_age
                .map(|age| self.created_at.saturating_add(i64::try_from(age).unwrap_or(i64::MAX)))
        })
    }

    pub fn is_expired(&self, now: EpochMillis) -> bool {
        self.effective_expires_at()
            .is_some_and(|expires_at| now > expires_at)
    }

    /// `retry_at` unset or elapsed.
    pub fn is_due(&self, now: EpochMillis) -> bool {
        self.retry_at.is_none_or(|retry_at| retry_at <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::FrontId;

    fn task(created_at: EpochMillis) -> PersistenceTask<serde_json::Value> {
        PersistenceTask {
            id: TaskId::new("task-create-note-front-a-0"),
            entity_type: EntityType::new("note"),
            operation: Operation::Create,
            payload: TaskPayload::new(
                Some(serde_json::json!({"title": "hello"})),
                PersistenceMetadata::new(FrontId::new("front-a"), 3),
            ),
            priority: 0,
            created_at,
            retry_count: 0,
            max_retries: 3,
            retry_at: None,
            expires_at: None,
            max_age: None,
        }
    }

    #[test]
    fn without_expiry_never_expires() {
        assert!(!task(0).is_expired(i64::MAX));
    }

    #[test]
    fn max_age_derives_expiry() {
        let mut t = task(1_000);
        t.max_age = Some(1_000);
        assert_eq!(t.effective_expires_at(), Some(2_000));
        assert!(!t.is_expired(2_000));
        assert!(t.is_expired(2_001));
    }

    #[test]
    fn explicit_expiry_wins_over_max_age() {
        let mut t = task(1_000);
        t.max_age = Some(1_000);
        t.expires_at = Some(1_500);
        assert!(t.is_expired(1_501));
    }

    #[test]
    fn due_when_retry_at_elapsed() {
        let mut t = task(0);
        assert!(t.is_due(0));
        t.retry_at = Some(500);
        assert!(!t.is_due(499));
        assert!(t.is_due(500));
    }

    #[test]
    fn delete_payload_omits_data() {
        let mut t = task(0);
        t.operation = Operation::Delete;
        t.payload.data = None;
        let json = serde_json::to_value(&t).unwrap();
        assert!(json["payload"].get("data").is_none());
        assert_eq!(json["operation"], "delete");

        let back: PersistenceTask<serde_json::Value> = serde_json::from_value(json).unwrap();
        assert_eq!(back.payload.data, None);
    }

    fn decode<T: serde::de::DeserializeOwned>(raw: &str) -> PersistenceTask<T> {
        serde_json::from_str(raw).unwrap()
    }

    #[test]
    fn entity_types_without_default_decode() {
        #[derive(Debug, PartialEq, Deserialize)]
        struct Title {
            title: String,
        }

        let mut t = task(0);
        let with_data = serde_json::to_string(&t).unwrap();
        let created: PersistenceTask<Title> = decode(&with_data);
        assert_eq!(
            created.payload.data,
            Some(Title {
                title: "hello".into()
            })
        );

        t.operation = Operation::Delete;
        t.payload.data = None;
        let deleted: PersistenceTask<Title> = decode(&serde_json::to_string(&t).unwrap());
        assert_eq!(deleted.payload.data, None);
    }
}
