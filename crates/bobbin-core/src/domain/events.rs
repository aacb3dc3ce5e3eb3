//! Events - ドメインイベント
//!
//! エンジンの状態変化はすべて [`DomainEvent`] として EventSink に送られる。
//! serde の tag 付き enum なので、そのまま JSON ログや監査ログに流せる。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::case::CaseStatus;
use super::checkpoint::{CheckpointStatus, CheckpointType};
use super::exception::ExceptionType;
use super::ids::{CaseId, CheckpointId, SpecificationId, WorkItemId, WorkletCaseId};
use super::spec::SpecificationStatus;
use super::work_item::WorkItemStatus;

/// DomainEvent はエンジン内で発生したイベント
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    SpecificationStatusChanged {
        specification_id: SpecificationId,
        status: SpecificationStatus,
    },
    SpecificationUnloaded {
        specification_id: SpecificationId,
    },
    CaseStatusChanged {
        case_id: CaseId,
        status: CaseStatus,
    },
    TaskFired {
        case_id: CaseId,
        task_id: String,
        /// 空タスクの場合は `None`
        work_item_id: Option<WorkItemId>,
    },
    TaskCompleted {
        case_id: CaseId,
        task_id: String,
    },
    WorkItemStatusChanged {
        case_id: CaseId,
        work_item_id: WorkItemId,
        task_id: String,
        status: WorkItemStatus,
    },
    ExceptionRaised {
        case_id: CaseId,
        exception: ExceptionType,
        task_id: Option<String>,
    },
    WorkletStarted {
        worklet_case_id: WorkletCaseId,
        worklet_id: String,
        case_id: CaseId,
    },
    WorkletFinished {
        worklet_case_id: WorkletCaseId,
        success: bool,
    },
    CheckpointChanged {
        checkpoint_id: CheckpointId,
        checkpoint_type: CheckpointType,
        status: CheckpointStatus,
    },
}

/// 発生時刻付きのイベント
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: DomainEvent,
}

impl DomainEvent {
    /// ログ用のイベント名
    pub fn name(&self) -> &'static str {
        match self {
            DomainEvent::SpecificationStatusChanged { .. } => "specification_status_changed",
            DomainEvent::SpecificationUnloaded { .. } => "specification_unloaded",
            DomainEvent::CaseStatusChanged { .. } => "case_status_changed",
            DomainEvent::TaskFired { .. } => "task_fired",
            DomainEvent::TaskCompleted { .. } => "task_completed",
            DomainEvent::WorkItemStatusChanged { .. } => "work_item_status_changed",
            DomainEvent::ExceptionRaised { .. } => "exception_raised",
            DomainEvent::WorkletStarted { .. } => "worklet_started",
            DomainEvent::WorkletFinished { .. } => "worklet_finished",
            DomainEvent::CheckpointChanged { .. } => "checkpoint_changed",
        }
    }

    /// 関連するケース（あれば）
    pub fn case_id(&self) -> Option<CaseId> {
        match self {
            DomainEvent::CaseStatusChanged { case_id, .. }
            | DomainEvent::TaskFired { case_id, .. }
            | DomainEvent::TaskCompleted { case_id, .. }
            | DomainEvent::WorkItemStatusChanged { case_id, .. }
            | DomainEvent::ExceptionRaised { case_id, .. }
            | DomainEvent::WorkletStarted { case_id, .. } => Some(*case_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_type_tag() {
        let event = DomainEvent::CaseStatusChanged {
            case_id: CaseId::generate(),
            status: CaseStatus::Running,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "case_status_changed");
        assert_eq!(json["status"], "RUNNING");
        assert_eq!(event.name(), "case_status_changed");
    }

    #[test]
    fn envelope_flattens_event() {
        let env = EventEnvelope {
            at: Utc::now(),
            event: DomainEvent::TaskCompleted {
                case_id: CaseId::generate(),
                task_id: "a".into(),
            },
        };
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["type"], "task_completed");
        assert!(json.get("at").is_some());
        let back: EventEnvelope = serde_json::from_value(json).unwrap();
        assert_eq!(back, env);
    }
}
