//! IdGenerator port - ID 生成の抽象化
//!
//! # 実装
//! - **UlidGenerator**: ULID ベース（本番用）
//!
//! task_id は `task-{operation}-{entity_type}-{front_id}-{timestamp}-{random}` 形式。
//! 同じミリ秒に同じエンティティへ複数の変更が来ても、ランダム部分で衝突しません。

use crate::domain::ids::{Front, IdMarker, Task};
use crate::domain::{EntityType, EpochMillis, FrontId, Operation, TaskId};
use crate::ports::Clock;
use ulid::Ulid;

pub trait IdGenerator: Send + Sync {
    /// エンティティの front_id を生成
    fn generate_front_id(&self) -> FrontId;

    /// Task ID を生成
    fn generate_task_id(
        &self,
        operation: Operation,
        entity_type: &EntityType,
        front_id: &FrontId,
        timestamp: EpochMillis,
    ) -> TaskId;
}

/// UlidGenerator は ULID ベースの ID 生成器
///
/// Clock を使って現在時刻ベースの ULID を生成します。
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_front_id(&self) -> FrontId {
        let timestamp_ms = u64::try_from(self.clock.now_millis()).unwrap_or_default();
        let ulid = Ulid::from_parts(timestamp_ms, rand::random());
        FrontId::new(format!("{}{}", Front::prefix(), ulid))
    }

    fn generate_task_id(
        &self,
        operation: Operation,
        entity_type: &EntityType,
        front_id: &FrontId,
        timestamp: EpochMillis,
    ) -> TaskId {
        let suffix: u32 = rand::random();
        TaskId::new(format!(
            "{}{}-{}-{}-{}-{:08x}",
            Task::prefix(),
            operation,
            entity_type,
            front_id,
            timestamp,
            suffix
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{FixedClock, SystemClock};
    use chrono::{TimeZone, Utc};

    #[test]
    fn front_ids_are_unique() {
        let id_gen = UlidGenerator::new(SystemClock);

        let id1 = id_gen.generate_front_id();
        let id2 = id_gen.generate_front_id();

        assert_ne!(id1, id2);
        assert!(id1.as_str().starts_with("front-"));
    }

    #[test]
    fn front_id_timestamp_follows_clock() {
        let fixed_time = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let id_gen = UlidGenerator::new(FixedClock::new(fixed_time));

        let id = id_gen.generate_front_id();
        let ulid = Ulid::from_string(id.as_str().trim_start_matches("front-")).unwrap();
        assert_eq!(ulid.timestamp_ms(), fixed_time.timestamp_millis() as u64);
    }

    #[test]
    fn task_ids_encode_their_origin_and_never_collide() {
        let id_gen = UlidGenerator::new(SystemClock);
        let entity_type = EntityType::new("note");
        let front_id = FrontId::new("front-a");

        let id1 = id_gen.generate_task_id(Operation::Update, &entity_type, &front_id, 1_700);
        let id2 = id_gen.generate_task_id(Operation::Update, &entity_type, &front_id, 1_700);

        assert!(id1.as_str().starts_with("task-update-note-front-a-1700-"));
        assert_ne!(id1, id2);
    }
}
