//! WorkletHost port - ワークレットからエンジンへのコールバック
//!
//! WorkletExecutor はエンジンを直接知らない。アクションはすべてこの trait を
//! 経由して実行され、エンジンが実装する。呼び出し時にケースのロックは持たない。

use async_trait::async_trait;

use crate::domain::data::DataMap;
use crate::domain::errors::EngineError;
use crate::domain::ids::{CaseId, SpecificationId, WorkItemId, WorkletCaseId};

/// WorkletHost はワークレットのアクションを受け付ける
#[async_trait]
pub trait WorkletHost: Send + Sync {
    async fn suspend_case(&self, case_id: CaseId) -> Result<(), EngineError>;

    async fn resume_case(&self, case_id: CaseId) -> Result<(), EngineError>;

    async fn cancel_case(&self, case_id: CaseId, reason: &str) -> Result<(), EngineError>;

    async fn fail_case(&self, case_id: CaseId, reason: &str) -> Result<(), EngineError>;

    async fn suspend_item(&self, case_id: CaseId, item: WorkItemId) -> Result<(), EngineError>;

    async fn resume_item(&self, case_id: CaseId, item: WorkItemId) -> Result<(), EngineError>;

    async fn cancel_item(
        &self,
        case_id: CaseId,
        item: WorkItemId,
        reason: &str,
    ) -> Result<(), EngineError>;

    async fn fail_item(
        &self,
        case_id: CaseId,
        item: WorkItemId,
        reason: &str,
    ) -> Result<(), EngineError>;

    async fn force_complete_item(
        &self,
        case_id: CaseId,
        item: WorkItemId,
    ) -> Result<(), EngineError>;

    async fn update_case_data(&self, case_id: CaseId, data: DataMap) -> Result<(), EngineError>;

    /// 補償用のケースを起動する（完了はエンジンが executor に通知）
    async fn launch_compensation(
        &self,
        specification: &SpecificationId,
        data: DataMap,
        launched_by: WorkletCaseId,
    ) -> Result<CaseId, EngineError>;
}
