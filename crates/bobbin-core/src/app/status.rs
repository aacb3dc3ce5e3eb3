//! Status - ステータスクエリ
//!
//! ケースやエンジンの「いまどうなっているか」を説明する読み取り専用ビュー。
//! どれも Serialize できるので CLI や外部 API でそのまま出力できる。

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::case::{Case, CaseStatus};
use crate::domain::ids::{CaseId, EngineId, SpecificationId, WorkItemId};
use crate::domain::work_item::{WorkItem, WorkItemStatus};

/// 稼働中アイテムの要約
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItemSummary {
    pub id: WorkItemId,
    pub task_id: String,
    pub status: WorkItemStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub offered_to: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timer_deadline: Option<DateTime<Utc>>,
}

impl From<&WorkItem> for WorkItemSummary {
    fn from(item: &WorkItem) -> Self {
        Self {
            id: item.id,
            task_id: item.task_id.clone(),
            status: item.status(),
            offered_to: item.offered_to().iter().cloned().collect(),
            resource_id: item.resource_id().map(str::to_string),
            timer_deadline: item.timer_deadline,
        }
    }
}

/// CaseStatusView はケースが止まっている理由を説明する
///
/// - `marking`: どの条件にトークンがあるか
/// - `enabled_tasks`: 次に発火できるタスク
/// - `active_items`: 誰の手元で止まっているか
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseStatusView {
    pub case_id: CaseId,
    pub specification_id: SpecificationId,
    pub net_id: String,
    pub status: CaseStatus,
    pub marking: BTreeMap<String, u32>,
    pub enabled_tasks: Vec<String>,
    pub active_items: Vec<WorkItemSummary>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_cases: Vec<CaseId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_case: Option<CaseId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl CaseStatusView {
    pub fn new(case: &Case, enabled_tasks: Vec<String>) -> Self {
        Self {
            case_id: case.id,
            specification_id: case.specification_id.clone(),
            net_id: case.net_id.clone(),
            status: case.status(),
            marking: case
                .marking
                .marked()
                .map(|(c, n)| (c.to_string(), n))
                .collect(),
            enabled_tasks,
            active_items: case.active_items().map(WorkItemSummary::from).collect(),
            sub_cases: case.sub_cases.keys().copied().collect(),
            parent_case: case.parent.map(|p| p.case_id),
            failure_reason: case.failure_reason.clone(),
            started_at: case.started_at,
            finished_at: case.finished_at,
        }
    }
}

/// ケース数をステータス別に数えたもの
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseCounts {
    pub created: usize,
    pub running: usize,
    pub suspended: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub deadlocked: usize,
}

impl CaseCounts {
    pub fn record(&mut self, status: CaseStatus) {
        let slot = match status {
            CaseStatus::Created => &mut self.created,
            CaseStatus::Running => &mut self.running,
            CaseStatus::Suspended => &mut self.suspended,
            CaseStatus::Completed => &mut self.completed,
            CaseStatus::Failed => &mut self.failed,
            CaseStatus::Cancelled => &mut self.cancelled,
            CaseStatus::Deadlocked => &mut self.deadlocked,
        };
        *slot += 1;
    }
}

/// EngineStatus はエンジン全体の概況
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineStatus {
    pub engine_id: EngineId,
    pub running: bool,
    pub specifications: Vec<SpecificationId>,
    pub cases: CaseCounts,
    pub active_work_items: usize,
    pub worklet_cases: usize,
    pub checkpoints: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::data::DataMap;

    #[test]
    fn view_lists_marking_and_active_items() {
        let now = Utc::now();
        let mut case = Case::new(
            CaseId::generate(),
            SpecificationId::new("s"),
            "main",
            "start",
            DataMap::new(),
            now,
        );
        let mut item = WorkItem::new(WorkItemId::generate(), case.id, "main", "approve", DataMap::new(), now);
        item.fire(now).unwrap();
        item.offer(["alice".to_string()], now).unwrap();
        case.insert_item(item);

        let view = CaseStatusView::new(&case, vec!["approve".into()]);
        assert_eq!(view.marking.get("start"), Some(&1));
        assert_eq!(view.active_items.len(), 1);
        assert_eq!(view.active_items[0].offered_to, vec!["alice"]);
        assert_eq!(view.status, CaseStatus::Created);
    }

    #[test]
    fn counts_per_status() {
        let mut counts = CaseCounts::default();
        counts.record(CaseStatus::Running);
        counts.record(CaseStatus::Running);
        counts.record(CaseStatus::Deadlocked);
        assert_eq!(counts.running, 2);
        assert_eq!(counts.deadlocked, 1);
    }
}
