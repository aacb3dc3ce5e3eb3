//! Cases: running instances of a net.
//!
//! A case owns its marking and its work items. Composite tasks run their
//! sub-net as a separate case that points back here through [`ParentLink`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::data::{CaseData, DataMap};
use super::errors::EngineError;
use super::ids::{CaseId, SpecificationId, WorkItemId, WorkletCaseId};
use super::marking::Marking;
use super::work_item::WorkItem;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CaseStatus {
    Created,
    Running,
    Suspended,
    Completed,
    Failed,
    Cancelled,
    /// Detected by the engine after a firing round, never requested.
    Deadlocked,
}

impl CaseStatus {
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            CaseStatus::Completed | CaseStatus::Failed | CaseStatus::Cancelled
        )
    }

    pub fn can_transition_to(self, to: CaseStatus) -> bool {
        use CaseStatus::*;
        matches!(
            (self, to),
            (Created, Running)
                | (Running, Suspended)
                | (Suspended, Running)
                | (Running, Completed)
                | (Running | Suspended, Failed)
                | (Created | Running | Suspended | Deadlocked, Cancelled)
                | (Running, Deadlocked)
        )
    }
}

impl fmt::Display for CaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CaseStatus::Created => "CREATED",
            CaseStatus::Running => "RUNNING",
            CaseStatus::Suspended => "SUSPENDED",
            CaseStatus::Completed => "COMPLETED",
            CaseStatus::Failed => "FAILED",
            CaseStatus::Cancelled => "CANCELLED",
            CaseStatus::Deadlocked => "DEADLOCKED",
        };
        f.write_str(s)
    }
}

/// Back-reference from a sub-case to the composite work item it runs for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentLink {
    pub case_id: CaseId,
    pub work_item_id: WorkItemId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseLogEntry {
    pub at: DateTime<Utc>,
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// What a cancel cascades to once the case itself is cancelled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CancelCascade {
    pub work_items: Vec<WorkItemId>,
    pub sub_cases: Vec<CaseId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Case {
    pub id: CaseId,
    pub specification_id: SpecificationId,
    /// Net this case runs: the root net, or a sub-net for a sub-case.
    pub net_id: String,
    status: CaseStatus,
    pub data: CaseData,
    pub marking: Marking,
    work_items: BTreeMap<WorkItemId, WorkItem>,
    active: BTreeSet<WorkItemId>,
    /// sub-case id -> net id it runs.
    #[serde(default)]
    pub sub_cases: BTreeMap<CaseId, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentLink>,
    /// Worklet case that launched this case as compensation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launched_by: Option<WorkletCaseId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    log: Vec<CaseLogEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Case {
    pub fn new(
        id: CaseId,
        specification_id: SpecificationId,
        net_id: impl Into<String>,
        input_condition: &str,
        input: DataMap,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            specification_id,
            net_id: net_id.into(),
            status: CaseStatus::Created,
            data: CaseData::from_input(input),
            marking: Marking::initial(input_condition),
            work_items: BTreeMap::new(),
            active: BTreeSet::new(),
            sub_cases: BTreeMap::new(),
            parent: None,
            launched_by: None,
            failure_reason: None,
            log: Vec::new(),
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn status(&self) -> CaseStatus {
        self.status
    }

    pub fn log_entries(&self) -> &[CaseLogEntry] {
        &self.log
    }

    pub fn log(&mut self, event: impl Into<String>, detail: Option<String>, now: DateTime<Utc>) {
        self.log.push(CaseLogEntry {
            at: now,
            event: event.into(),
            detail,
        });
        self.updated_at = now;
    }

    pub fn start(&mut self, now: DateTime<Utc>) -> Result<(), EngineError> {
        self.transition("start", CaseStatus::Running, now, None)?;
        self.started_at = Some(now);
        Ok(())
    }

    pub fn suspend(&mut self, now: DateTime<Utc>) -> Result<(), EngineError> {
        self.transition("suspend", CaseStatus::Suspended, now, None)
    }

    pub fn resume(&mut self, now: DateTime<Utc>) -> Result<(), EngineError> {
        if self.status != CaseStatus::Suspended {
            return Err(self.rejected("resume"));
        }
        self.transition("resume", CaseStatus::Running, now, None)
    }

    /// Completion freezes the variables as the case output.
    pub fn complete(&mut self, now: DateTime<Utc>) -> Result<(), EngineError> {
        self.transition("complete", CaseStatus::Completed, now, None)?;
        self.data.finalize();
        self.finished_at = Some(now);
        Ok(())
    }

    pub fn fail(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> Result<(), EngineError> {
        let reason = reason.into();
        self.transition("fail", CaseStatus::Failed, now, Some(reason.clone()))?;
        self.failure_reason = Some(reason);
        self.finished_at = Some(now);
        Ok(())
    }

    /// Cancel the case and every active work item. Sub-cases are returned
    /// for the caller to cancel under their own locks.
    pub fn cancel(
        &mut self,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<CancelCascade, EngineError> {
        let reason = reason.into();
        self.transition("cancel", CaseStatus::Cancelled, now, Some(reason.clone()))?;
        let mut cascade = CancelCascade::default();
        for id in std::mem::take(&mut self.active) {
            if let Some(item) = self.work_items.get_mut(&id) {
                if item.is_active() && item.cancel(reason.as_str(), now).is_ok() {
                    cascade.work_items.push(id);
                }
            }
        }
        cascade.sub_cases = self.sub_cases.keys().copied().collect();
        self.failure_reason = Some(reason);
        self.finished_at = Some(now);
        Ok(cascade)
    }

    pub fn mark_deadlocked(&mut self, now: DateTime<Utc>) -> Result<(), EngineError> {
        self.transition("deadlock", CaseStatus::Deadlocked, now, None)
    }

    pub fn is_running(&self) -> bool {
        self.status == CaseStatus::Running
    }

    /// Reject work-item operations unless running.
    pub fn ensure_running(&self, action: &'static str) -> Result<(), EngineError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(self.rejected(action))
        }
    }

    // ---- work items ----

    pub fn insert_item(&mut self, item: WorkItem) {
        if item.is_active() {
            self.active.insert(item.id);
        }
        self.work_items.insert(item.id, item);
    }

    pub fn item(&self, id: WorkItemId) -> Result<&WorkItem, EngineError> {
        self.work_items
            .get(&id)
            .ok_or_else(|| EngineError::not_found("work item", id))
    }

    /// Mutate an item and keep the active set in sync with its status.
    pub fn with_item<R>(
        &mut self,
        id: WorkItemId,
        f: impl FnOnce(&mut WorkItem) -> Result<R, EngineError>,
    ) -> Result<R, EngineError> {
        let item = self
            .work_items
            .get_mut(&id)
            .ok_or_else(|| EngineError::not_found("work item", id))?;
        let result = f(item)?;
        if item.is_active() {
            self.active.insert(id);
        } else {
            self.active.remove(&id);
        }
        Ok(result)
    }

    pub fn work_items(&self) -> impl Iterator<Item = &WorkItem> {
        self.work_items.values()
    }

    pub fn active_items(&self) -> impl Iterator<Item = &WorkItem> {
        self.active.iter().filter_map(|id| self.work_items.get(id))
    }

    pub fn active_ids(&self) -> &BTreeSet<WorkItemId> {
        &self.active
    }

    pub fn has_active_items(&self) -> bool {
        !self.active.is_empty()
    }

    /// Tasks with at least one active work item.
    pub fn busy_tasks(&self) -> BTreeSet<&str> {
        self.active_items().map(|w| w.task_id.as_str()).collect()
    }

    fn transition(
        &mut self,
        action: &'static str,
        to: CaseStatus,
        now: DateTime<Utc>,
        detail: Option<String>,
    ) -> Result<(), EngineError> {
        if !self.status.can_transition_to(to) {
            return Err(self.rejected(action));
        }
        let from = self.status;
        self.status = to;
        self.log(format!("{action}: {from} -> {to}"), detail, now);
        Ok(())
    }

    fn rejected(&self, action: &'static str) -> EngineError {
        EngineError::StateTransition {
            entity: "case",
            id: self.id.to_string(),
            from: self.status.to_string(),
            action,
        }
    }
}
