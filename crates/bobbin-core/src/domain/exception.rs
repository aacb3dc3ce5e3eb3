//! Exception kinds and the context handed to rule evaluation.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::ids::{CaseId, WorkItemId};

/// Closed set of exceptions the worklet executor handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExceptionType {
    CasePreConstraint,
    CasePostConstraint,
    ItemPreConstraint,
    ItemPostConstraint,
    ItemAbort,
    Timeout,
    ResourceUnavailable,
    ConstraintViolation,
    CaseExternalTrigger,
    ItemExternalTrigger,
}

impl ExceptionType {
    /// Item-level exceptions look up task-specific trees first.
    pub fn is_item_level(self) -> bool {
        matches!(
            self,
            ExceptionType::ItemPreConstraint
                | ExceptionType::ItemPostConstraint
                | ExceptionType::ItemAbort
                | ExceptionType::Timeout
                | ExceptionType::ResourceUnavailable
                | ExceptionType::ItemExternalTrigger
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExceptionType::CasePreConstraint => "case_pre_constraint",
            ExceptionType::CasePostConstraint => "case_post_constraint",
            ExceptionType::ItemPreConstraint => "item_pre_constraint",
            ExceptionType::ItemPostConstraint => "item_post_constraint",
            ExceptionType::ItemAbort => "item_abort",
            ExceptionType::Timeout => "timeout",
            ExceptionType::ResourceUnavailable => "resource_unavailable",
            ExceptionType::ConstraintViolation => "constraint_violation",
            ExceptionType::CaseExternalTrigger => "case_external_trigger",
            ExceptionType::ItemExternalTrigger => "item_external_trigger",
        }
    }
}

impl fmt::Display for ExceptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything known about an exception when it is raised.
///
/// Rule conditions are evaluated against [`ExceptionContext::facts`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionContext {
    pub exception: ExceptionType,
    pub case_id: CaseId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_item_id: Option<WorkItemId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Snapshot of the case variables.
    #[serde(default)]
    pub case_data: Map<String, Value>,
    /// Input/output of the work item involved, if any.
    #[serde(default)]
    pub item_data: Map<String, Value>,
}

impl ExceptionContext {
    pub fn for_case(exception: ExceptionType, case_id: CaseId) -> Self {
        Self {
            exception,
            case_id,
            work_item_id: None,
            task_id: None,
            reason: None,
            case_data: Map::new(),
            item_data: Map::new(),
        }
    }

    pub fn for_item(
        exception: ExceptionType,
        case_id: CaseId,
        work_item_id: WorkItemId,
        task_id: impl Into<String>,
    ) -> Self {
        Self {
            work_item_id: Some(work_item_id),
            task_id: Some(task_id.into()),
            ..Self::for_case(exception, case_id)
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_case_data(mut self, data: Map<String, Value>) -> Self {
        self.case_data = data;
        self
    }

    pub fn with_item_data(mut self, data: Map<String, Value>) -> Self {
        self.item_data = data;
        self
    }

    /// Flat fact document: case variables, overlaid by item data, plus the
    /// reserved keys `exception`, `task` and `reason`.
    pub fn facts(&self) -> Value {
        let mut facts = self.case_data.clone();
        facts.extend(self.item_data.clone());
        facts.insert("exception".into(), Value::from(self.exception.as_str()));
        if let Some(task) = &self.task_id {
            facts.insert("task".into(), Value::from(task.as_str()));
        }
        if let Some(reason) = &self.reason {
            facts.insert("reason".into(), Value::from(reason.as_str()));
        }
        Value::Object(facts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn item_data_overrides_case_data_in_facts() {
        let mut case_data = Map::new();
        case_data.insert("amount".into(), json!(10));
        case_data.insert("region".into(), json!("eu"));
        let mut item_data = Map::new();
        item_data.insert("amount".into(), json!(99));

        let ctx = ExceptionContext::for_item(
            ExceptionType::ItemAbort,
            CaseId::generate(),
            WorkItemId::generate(),
            "approve",
        )
        .with_case_data(case_data)
        .with_item_data(item_data);

        let facts = ctx.facts();
        assert_eq!(facts["amount"], json!(99));
        assert_eq!(facts["region"], json!("eu"));
        assert_eq!(facts["task"], json!("approve"));
        assert_eq!(facts["exception"], json!("item_abort"));
    }

    #[test]
    fn case_level_kinds_are_not_item_level() {
        assert!(!ExceptionType::CasePreConstraint.is_item_level());
        assert!(!ExceptionType::ConstraintViolation.is_item_level());
        assert!(ExceptionType::Timeout.is_item_level());
    }
}
