//! ResourceDirectory port - 参加者（人・システム）の検索
//!
//! 同期・副作用なしの前提。エンジンはケースのロックを持たずに呼ぶ。

use crate::domain::errors::EngineError;
use crate::domain::participant::{Participant, ResourcingSpec};

/// ResourceDirectory は resourcing 条件に合う参加者を返す
pub trait ResourceDirectory: Send + Sync {
    /// 条件に合う参加者（順序は実装依存、FirstAvailable はこの順で先頭を選ぶ）
    fn find_participants(&self, query: &ResourcingSpec) -> Result<Vec<Participant>, EngineError>;

    fn participant(&self, id: &str) -> Option<Participant>;
}
