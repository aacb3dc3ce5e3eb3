//! IdGenerator port - ID 生成の抽象化
//!
//! ケース・ワークアイテム・ワークレット・チェックポイントの ID を払い出す。
//! テスト容易性のために trait として抽象化している。
//!
//! # 実装
//! - **UlidGenerator**: ULID ベース（Clock の時刻をタイムスタンプに使う）

use ulid::Ulid;

use crate::domain::ids::{CaseId, CheckpointId, EngineId, Id, IdMarker, WorkItemId, WorkletCaseId};
use crate::ports::Clock;

/// IdGenerator はエンジン内の ID を生成
///
/// # Thread Safety
/// - `Send + Sync` を要求（複数タスクから使える）
pub trait IdGenerator: Send + Sync {
    fn case_id(&self) -> CaseId;

    fn work_item_id(&self) -> WorkItemId;

    fn worklet_case_id(&self) -> WorkletCaseId;

    fn checkpoint_id(&self) -> CheckpointId;

    fn engine_id(&self) -> EngineId;
}

/// UlidGenerator は ULID ベースの ID 生成器
///
/// FixedClock を渡すと timestamp 部分が固定される（ランダム部分は毎回異なる）。
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next<T: IdMarker>(&self) -> Id<T> {
        let timestamp_ms = self.clock.now().timestamp_millis() as u64;
        Id::from(Ulid::from_parts(timestamp_ms, rand::random()))
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn case_id(&self) -> CaseId {
        self.next()
    }

    fn work_item_id(&self) -> WorkItemId {
        self.next()
    }

    fn worklet_case_id(&self) -> WorkletCaseId {
        self.next()
    }

    fn checkpoint_id(&self) -> CheckpointId {
        self.next()
    }

    fn engine_id(&self) -> EngineId {
        self.next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{FixedClock, SystemClock};
    use chrono::{TimeZone, Utc};

    #[test]
    fn ulid_generator_generates_unique_ids() {
        let id_gen = UlidGenerator::new(SystemClock);

        let id1 = id_gen.case_id();
        let id2 = id_gen.case_id();
        let id3 = id_gen.case_id();

        assert_ne!(id1, id2);
        assert_ne!(id2, id3);
        assert_ne!(id1, id3);
    }

    #[test]
    fn ulid_generator_with_fixed_clock_pins_timestamp() {
        let fixed_time = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let id_gen = UlidGenerator::new(FixedClock::new(fixed_time));

        let id1 = id_gen.work_item_id();
        let id2 = id_gen.work_item_id();

        // ランダム部分があるので ID は異なる
        assert_ne!(id1, id2);

        // timestamp 部分は同じ
        assert_eq!(id1.as_ulid().timestamp_ms(), id2.as_ulid().timestamp_ms());
        assert_eq!(
            id1.as_ulid().timestamp_ms(),
            fixed_time.timestamp_millis() as u64
        );
    }

    #[test]
    fn prefixes_follow_id_type() {
        let id_gen = UlidGenerator::new(SystemClock);

        assert!(id_gen.case_id().to_string().starts_with("case-"));
        assert!(id_gen.work_item_id().to_string().starts_with("item-"));
        assert!(id_gen.worklet_case_id().to_string().starts_with("worklet-"));
        assert!(id_gen.checkpoint_id().to_string().starts_with("ckpt-"));
    }
}
