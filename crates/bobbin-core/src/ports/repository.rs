//! Repository port - 永続化の抽象化
//!
//! エンジンはメモリ上のレジストリを正本として動き、コミットのたびに
//! Repository へ書き出す（write-through）。バックエンドは問わない。
//!
//! # 実装
//! - InMemoryRepository（開発・テスト用）

use std::fmt::Display;
use std::hash::Hash;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::case::{Case, CaseStatus};
use crate::domain::checkpoint::Checkpoint;
use crate::domain::errors::EngineError;
use crate::domain::ids::{CaseId, CheckpointId, SpecificationId, WorkItemId, WorkletCaseId};
use crate::domain::spec::Specification;
use crate::domain::work_item::{WorkItem, WorkItemStatus};
use crate::domain::worklet::WorkletCase;

/// 永続化できるエンティティ
pub trait Entity: Clone + Send + Sync + 'static {
    type Key: Clone + Eq + Hash + Ord + Display + Send + Sync + 'static;

    /// エラーメッセージ用の種別名
    const KIND: &'static str;

    fn key(&self) -> Self::Key;
}

/// Repository は1種類のエンティティを保存する
#[async_trait]
pub trait Repository<E: Entity>: Send + Sync {
    /// 同じキーがあれば上書き
    async fn save(&self, entity: E) -> Result<(), EngineError>;

    async fn get(&self, key: &E::Key) -> Result<Option<E>, EngineError>;

    /// 削除したら true
    async fn delete(&self, key: &E::Key) -> Result<bool, EngineError>;

    async fn get_all(&self) -> Result<Vec<E>, EngineError>;

    async fn exists(&self, key: &E::Key) -> Result<bool, EngineError> {
        Ok(self.get(key).await?.is_some())
    }
}

/// ケース用の検索
#[async_trait]
pub trait CaseQueries: Repository<Case> {
    async fn by_specification(&self, id: &SpecificationId) -> Result<Vec<Case>, EngineError>;

    async fn by_status(&self, status: CaseStatus) -> Result<Vec<Case>, EngineError>;

    /// `from <= created_at < to`
    async fn created_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Case>, EngineError>;
}

/// ワークアイテム用の検索
#[async_trait]
pub trait WorkItemQueries: Repository<WorkItem> {
    async fn by_case(&self, case_id: CaseId) -> Result<Vec<WorkItem>, EngineError>;

    async fn by_status(&self, status: WorkItemStatus) -> Result<Vec<WorkItem>, EngineError>;

    /// offer 先または割り当て先に participant を含むもの
    async fn by_participant(&self, participant: &str) -> Result<Vec<WorkItem>, EngineError>;
}

impl Entity for Case {
    type Key = CaseId;
    const KIND: &'static str = "case";

    fn key(&self) -> CaseId {
        self.id
    }
}

impl Entity for WorkItem {
    type Key = WorkItemId;
    const KIND: &'static str = "work item";

    fn key(&self) -> WorkItemId {
        self.id
    }
}

impl Entity for Specification {
    type Key = SpecificationId;
    const KIND: &'static str = "specification";

    fn key(&self) -> SpecificationId {
        self.id().clone()
    }
}

impl Entity for Checkpoint {
    type Key = CheckpointId;
    const KIND: &'static str = "checkpoint";

    fn key(&self) -> CheckpointId {
        self.id
    }
}

impl Entity for WorkletCase {
    type Key = WorkletCaseId;
    const KIND: &'static str = "worklet case";

    fn key(&self) -> WorkletCaseId {
        self.id
    }
}
