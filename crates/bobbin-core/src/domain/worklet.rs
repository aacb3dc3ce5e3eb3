//! Worklets: small compensating procedures selected by RDR rules.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::data::DataMap;
use super::errors::EngineError;
use super::exception::ExceptionContext;
use super::ids::{CaseId, SpecificationId, WorkItemId, WorkletCaseId};

/// One step of a worklet's action list (its "exlet").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum WorkletAction {
    SuspendCase,
    ContinueCase,
    RemoveCase,
    FailCase,
    SuspendItem,
    ContinueItem,
    RemoveItem,
    FailItem,
    ForceCompleteItem,
    UpdateCaseData { data: DataMap },
    /// Launch a case of another specification and wait for it.
    Compensate { specification_id: SpecificationId },
}

impl WorkletAction {
    pub fn targets_item(&self) -> bool {
        matches!(
            self,
            WorkletAction::SuspendItem
                | WorkletAction::ContinueItem
                | WorkletAction::RemoveItem
                | WorkletAction::FailItem
                | WorkletAction::ForceCompleteItem
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkletDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub actions: Vec<WorkletAction>,
}

impl WorkletDefinition {
    pub fn new(id: impl Into<String>, actions: Vec<WorkletAction>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            actions,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkletCaseStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkletCaseStatus {
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            WorkletCaseStatus::Completed | WorkletCaseStatus::Failed | WorkletCaseStatus::Cancelled
        )
    }
}

impl std::fmt::Display for WorkletCaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkletCaseStatus::Pending => "PENDING",
            WorkletCaseStatus::Running => "RUNNING",
            WorkletCaseStatus::Completed => "COMPLETED",
            WorkletCaseStatus::Failed => "FAILED",
            WorkletCaseStatus::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// A running instance of a worklet, bound to the exception that selected it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkletCase {
    pub id: WorkletCaseId,
    pub worklet_id: String,
    pub parent_case_id: CaseId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_work_item_id: Option<WorkItemId>,
    pub context: ExceptionContext,
    status: WorkletCaseStatus,
    /// Index of the next action to run.
    pub next_action: usize,
    /// Compensation case currently awaited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensation_case: Option<CaseId>,
    #[serde(default)]
    pub results: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkletCase {
    pub fn new(
        id: WorkletCaseId,
        worklet_id: impl Into<String>,
        context: ExceptionContext,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            worklet_id: worklet_id.into(),
            parent_case_id: context.case_id,
            parent_work_item_id: context.work_item_id,
            context,
            status: WorkletCaseStatus::Pending,
            next_action: 0,
            compensation_case: None,
            results: Vec::new(),
            created_at: now,
            finished_at: None,
        }
    }

    pub fn status(&self) -> WorkletCaseStatus {
        self.status
    }

    pub fn start(&mut self) -> Result<(), EngineError> {
        self.transition("start", &[WorkletCaseStatus::Pending], WorkletCaseStatus::Running)
    }

    pub fn complete(&mut self, now: DateTime<Utc>) -> Result<(), EngineError> {
        self.transition("complete", &[WorkletCaseStatus::Running], WorkletCaseStatus::Completed)?;
        self.finished_at = Some(now);
        Ok(())
    }

    pub fn fail(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> Result<(), EngineError> {
        self.transition(
            "fail",
            &[WorkletCaseStatus::Pending, WorkletCaseStatus::Running],
            WorkletCaseStatus::Failed,
        )?;
        self.results.push(format!("failed: {}", reason.into()));
        self.finished_at = Some(now);
        Ok(())
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<(), EngineError> {
        self.transition(
            "cancel",
            &[WorkletCaseStatus::Pending, WorkletCaseStatus::Running],
            WorkletCaseStatus::Cancelled,
        )?;
        self.finished_at = Some(now);
        Ok(())
    }

    pub fn is_waiting(&self) -> bool {
        self.status == WorkletCaseStatus::Running && self.compensation_case.is_some()
    }

    fn transition(
        &mut self,
        action: &'static str,
        from: &[WorkletCaseStatus],
        to: WorkletCaseStatus,
    ) -> Result<(), EngineError> {
        if !from.contains(&self.status) {
            return Err(EngineError::StateTransition {
                entity: "worklet case",
                id: self.id.to_string(),
                from: self.status.to_string(),
                action,
            });
        }
        self.status = to;
        Ok(())
    }
}

/// What the executor reports back for one exception.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkletResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worklet_case_id: Option<WorkletCaseId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worklet_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<WorkletCaseStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl WorkletResult {
    pub fn unhandled(message: impl Into<String>) -> Self {
        Self {
            success: false,
            worklet_case_id: None,
            worklet_id: None,
            status: None,
            message: Some(message.into()),
        }
    }

    pub fn from_case(case: &WorkletCase) -> Self {
        Self {
            success: case.status() != WorkletCaseStatus::Failed
                && case.status() != WorkletCaseStatus::Cancelled,
            worklet_case_id: Some(case.id),
            worklet_id: Some(case.worklet_id.clone()),
            status: Some(case.status()),
            message: case.results.last().cloned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::exception::ExceptionType;
    use serde_json::json;

    #[test]
    fn actions_use_tagged_json() {
        let actions: Vec<WorkletAction> = serde_json::from_value(json!([
            {"action": "suspend_item"},
            {"action": "update_case_data", "data": {"approved": false}},
            {"action": "compensate", "specification_id": "refund"},
            {"action": "remove_item"}
        ]))
        .unwrap();
        assert_eq!(actions[0], WorkletAction::SuspendItem);
        assert!(matches!(
            &actions[2],
            WorkletAction::Compensate { specification_id } if specification_id.as_str() == "refund"
        ));
        assert!(actions[3].targets_item());
    }

    #[test]
    fn worklet_case_lifecycle() {
        let now = Utc::now();
        let ctx = ExceptionContext::for_case(ExceptionType::CaseExternalTrigger, CaseId::generate());
        let mut wc = WorkletCase::new(WorkletCaseId::generate(), "w", ctx, now);
        assert!(wc.complete(now).is_err());
        wc.start().unwrap();
        wc.complete(now).unwrap();
        assert_eq!(wc.status(), WorkletCaseStatus::Completed);
        assert!(WorkletResult::from_case(&wc).success);
        assert!(wc.cancel(now).is_err());
    }
}
