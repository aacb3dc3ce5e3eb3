//! Work items and their resourcing lifecycle.
//!
//! ```text
//! Enabled -> Fired -> Offered -> Allocated -> Started -> Completed
//!              \________________/^             |  ^
//!                                              v  |
//!                                           Suspended
//! Started -> Failed | ForceCompleted
//! Enabled/Fired -> Parent (multi-instance)
//! any non-terminal -> Cancelled
//! ```
//!
//! Every transition validates the current state first. A rejected call
//! returns [`EngineError::StateTransition`] and leaves the item untouched.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::data::DataMap;
use super::errors::EngineError;
use super::ids::{CaseId, WorkItemId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkItemStatus {
    Enabled,
    Fired,
    Offered,
    Allocated,
    Started,
    Suspended,
    Completed,
    Cancelled,
    Failed,
    ForceCompleted,
    /// Groups multi-instance children; see [`derive_parent_status`].
    Parent,
}

impl WorkItemStatus {
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            WorkItemStatus::Completed
                | WorkItemStatus::Cancelled
                | WorkItemStatus::Failed
                | WorkItemStatus::ForceCompleted
        )
    }

    pub fn is_active(self) -> bool {
        !self.is_finished()
    }

    pub fn is_successful(self) -> bool {
        matches!(
            self,
            WorkItemStatus::Completed | WorkItemStatus::ForceCompleted
        )
    }

    /// Whether the edge `self -> to` exists in the lifecycle graph.
    pub fn can_transition_to(self, to: WorkItemStatus) -> bool {
        use WorkItemStatus::*;
        match (self, to) {
            (from, Cancelled) => from.is_active(),
            (Enabled, Fired) => true,
            (Enabled | Fired, Parent) => true,
            (Fired | Offered, Offered) => true,
            (Fired | Offered, Allocated) => true,
            (Allocated, Started) => true,
            (Started, Suspended) | (Suspended, Started) => true,
            (Started, Completed | Failed | ForceCompleted) => true,
            (Parent, Completed | Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for WorkItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkItemStatus::Enabled => "ENABLED",
            WorkItemStatus::Fired => "FIRED",
            WorkItemStatus::Offered => "OFFERED",
            WorkItemStatus::Allocated => "ALLOCATED",
            WorkItemStatus::Started => "STARTED",
            WorkItemStatus::Suspended => "SUSPENDED",
            WorkItemStatus::Completed => "COMPLETED",
            WorkItemStatus::Cancelled => "CANCELLED",
            WorkItemStatus::Failed => "FAILED",
            WorkItemStatus::ForceCompleted => "FORCE_COMPLETED",
            WorkItemStatus::Parent => "PARENT",
        };
        f.write_str(s)
    }
}

/// One entry of a work item's append-only history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub event: String,
    pub from: WorkItemStatus,
    pub to: WorkItemStatus,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: WorkItemId,
    pub case_id: CaseId,
    pub task_id: String,
    pub net_id: String,
    status: WorkItemStatus,
    #[serde(default)]
    pub data_input: DataMap,
    #[serde(default)]
    pub data_output: DataMap,
    #[serde(default)]
    offered_to: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    resource_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<WorkItemId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<WorkItemId>,
    /// Completed children needed before a parent completes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timer_deadline: Option<DateTime<Utc>>,
    /// Case running the sub-net of a composite task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_case_id: Option<CaseId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    history: Vec<HistoryRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkItem {
    pub fn new(
        id: WorkItemId,
        case_id: CaseId,
        net_id: impl Into<String>,
        task_id: impl Into<String>,
        data_input: DataMap,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            case_id,
            task_id: task_id.into(),
            net_id: net_id.into(),
            status: WorkItemStatus::Enabled,
            data_input,
            data_output: DataMap::new(),
            offered_to: BTreeSet::new(),
            resource_id: None,
            parent_id: None,
            children: Vec::new(),
            threshold: None,
            timer_deadline: None,
            sub_case_id: None,
            failure_reason: None,
            history: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn status(&self) -> WorkItemStatus {
        self.status
    }

    pub fn offered_to(&self) -> &BTreeSet<String> {
        &self.offered_to
    }

    pub fn resource_id(&self) -> Option<&str> {
        self.resource_id.as_deref()
    }

    pub fn history(&self) -> &[HistoryRecord] {
        &self.history
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_finished()
    }

    pub fn is_successful(&self) -> bool {
        self.status.is_successful()
    }

    pub fn is_parent(&self) -> bool {
        self.status == WorkItemStatus::Parent || !self.children.is_empty()
    }

    pub fn fire(&mut self, now: DateTime<Utc>) -> Result<(), EngineError> {
        self.transition("fire", WorkItemStatus::Fired, now, None)
    }

    /// Offer to a set of participants. Re-offering replaces the set.
    pub fn offer(
        &mut self,
        participants: impl IntoIterator<Item = String>,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let participants: BTreeSet<String> = participants.into_iter().collect();
        let data = serde_json::to_value(&participants).ok();
        self.transition("offer", WorkItemStatus::Offered, now, data)?;
        self.offered_to = participants;
        Ok(())
    }

    /// Allocate to one participant. From `Offered` the participant must be
    /// among those offered; from `Fired` allocation is direct.
    pub fn allocate(&mut self, participant: &str, now: DateTime<Utc>) -> Result<(), EngineError> {
        if self.status == WorkItemStatus::Offered && !self.offered_to.contains(participant) {
            return Err(EngineError::Allocation {
                work_item: self.id.to_string(),
                participant: participant.to_string(),
                reason: "participant was not offered this item".into(),
            });
        }
        self.transition(
            "allocate",
            WorkItemStatus::Allocated,
            now,
            Some(Value::from(participant)),
        )?;
        self.resource_id = Some(participant.to_string());
        Ok(())
    }

    pub fn start(&mut self, now: DateTime<Utc>) -> Result<(), EngineError> {
        self.transition("start", WorkItemStatus::Started, now, None)
    }

    pub fn suspend(&mut self, now: DateTime<Utc>) -> Result<(), EngineError> {
        self.transition("suspend", WorkItemStatus::Suspended, now, None)
    }

    pub fn resume(&mut self, now: DateTime<Utc>) -> Result<(), EngineError> {
        if self.status != WorkItemStatus::Suspended {
            return Err(self.rejected("resume"));
        }
        self.transition("resume", WorkItemStatus::Started, now, None)
    }

    pub fn complete(&mut self, output: DataMap, now: DateTime<Utc>) -> Result<(), EngineError> {
        if self.status == WorkItemStatus::Parent {
            return Err(self.rejected("complete"));
        }
        self.finish_with("complete", WorkItemStatus::Completed, output, now)
    }

    pub fn force_complete(
        &mut self,
        output: DataMap,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        self.finish_with("force_complete", WorkItemStatus::ForceCompleted, output, now)
    }

    /// Completion of a multi-instance parent once its threshold is met.
    pub fn complete_parent(
        &mut self,
        output: DataMap,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        if self.status != WorkItemStatus::Parent {
            return Err(self.rejected("complete_parent"));
        }
        self.finish_with("complete", WorkItemStatus::Completed, output, now)
    }

    pub fn fail(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> Result<(), EngineError> {
        let reason = reason.into();
        self.transition(
            "fail",
            WorkItemStatus::Failed,
            now,
            Some(Value::from(reason.as_str())),
        )?;
        self.failure_reason = Some(reason);
        Ok(())
    }

    pub fn cancel(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> Result<(), EngineError> {
        let reason = reason.into();
        self.transition(
            "cancel",
            WorkItemStatus::Cancelled,
            now,
            Some(Value::from(reason.as_str())),
        )?;
        self.failure_reason = Some(reason);
        Ok(())
    }

    /// Turn this item into the parent of multi-instance children.
    pub fn become_parent(
        &mut self,
        children: Vec<WorkItemId>,
        threshold: usize,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let data = serde_json::json!({ "instances": children.len(), "threshold": threshold });
        self.transition("spawn_children", WorkItemStatus::Parent, now, Some(data))?;
        self.children = children;
        self.threshold = Some(threshold);
        Ok(())
    }

    fn finish_with(
        &mut self,
        event: &'static str,
        to: WorkItemStatus,
        output: DataMap,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        self.transition(event, to, now, Some(Value::Object(output.clone())))?;
        self.data_output = output;
        self.timer_deadline = None;
        Ok(())
    }

    fn transition(
        &mut self,
        event: &'static str,
        to: WorkItemStatus,
        now: DateTime<Utc>,
        data: Option<Value>,
    ) -> Result<(), EngineError> {
        if !self.status.can_transition_to(to) {
            return Err(self.rejected(event));
        }
        self.history.push(HistoryRecord {
            event: event.to_string(),
            from: self.status,
            to,
            at: now,
            data,
        });
        self.status = to;
        self.updated_at = now;
        Ok(())
    }

    fn rejected(&self, action: &'static str) -> EngineError {
        EngineError::StateTransition {
            entity: "work item",
            id: self.id.to_string(),
            from: self.status.to_string(),
            action,
        }
    }
}

/// Effective status of a multi-instance parent, derived from its children.
///
/// - threshold successful children: `Completed`
/// - every child finished without reaching the threshold: `Failed`
/// - any child started or suspended: `Started`
/// - otherwise still `Parent`
pub fn derive_parent_status(threshold: usize, children: &[WorkItemStatus]) -> WorkItemStatus {
    let successful = children.iter().filter(|s| s.is_successful()).count();
    if successful >= threshold {
        WorkItemStatus::Completed
    } else if !children.is_empty() && children.iter().all(|s| s.is_finished()) {
        WorkItemStatus::Failed
    } else if children
        .iter()
        .any(|s| matches!(s, WorkItemStatus::Started | WorkItemStatus::Suspended))
    {
        WorkItemStatus::Started
    } else {
        WorkItemStatus::Parent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use WorkItemStatus::*;

    fn item() -> WorkItem {
        WorkItem::new(
            WorkItemId::generate(),
            CaseId::generate(),
            "main",
            "approve",
            DataMap::new(),
            Utc::now(),
        )
    }

    #[test]
    fn happy_path_records_every_transition() {
        let now = Utc::now();
        let mut wi = item();
        wi.fire(now).unwrap();
        wi.offer(["alice".to_string(), "bob".to_string()], now).unwrap();
        wi.allocate("bob", now).unwrap();
        wi.start(now).unwrap();
        wi.complete(DataMap::new(), now).unwrap();

        assert_eq!(wi.status(), Completed);
        assert_eq!(wi.resource_id(), Some("bob"));
        let events: Vec<_> = wi.history().iter().map(|h| h.event.as_str()).collect();
        assert_eq!(events, ["fire", "offer", "allocate", "start", "complete"]);
        assert!(wi.is_successful());
        assert!(!wi.is_active());
    }

    #[test]
    fn allocation_requires_an_offer_when_offered() {
        let now = Utc::now();
        let mut wi = item();
        wi.fire(now).unwrap();
        wi.offer(["alice".to_string()], now).unwrap();
        let err = wi.allocate("mallory", now).unwrap_err();
        assert!(matches!(err, EngineError::Allocation { .. }));
        assert_eq!(wi.status(), Offered);
    }

    #[test]
    fn fired_items_can_be_allocated_directly() {
        let now = Utc::now();
        let mut wi = item();
        wi.fire(now).unwrap();
        wi.allocate("system", now).unwrap();
        assert_eq!(wi.status(), Allocated);
    }

    #[test]
    fn invalid_transition_leaves_state_and_history_untouched() {
        let mut wi = item();
        let err = wi.complete(DataMap::new(), Utc::now()).unwrap_err();
        assert!(matches!(err, EngineError::StateTransition { action: "complete", .. }));
        assert_eq!(wi.status(), Enabled);
        assert!(wi.history().is_empty());
    }

    #[rstest]
    #[case(Enabled, Cancelled, true)]
    #[case(Suspended, Cancelled, true)]
    #[case(Completed, Cancelled, false)]
    #[case(Fired, Started, false)]
    #[case(Allocated, Started, true)]
    #[case(Suspended, Completed, false)]
    #[case(Started, ForceCompleted, true)]
    #[case(Fired, Parent, true)]
    #[case(Offered, Parent, false)]
    fn transition_table(
        #[case] from: WorkItemStatus,
        #[case] to: WorkItemStatus,
        #[case] allowed: bool,
    ) {
        assert_eq!(from.can_transition_to(to), allowed);
    }

    #[rstest]
    #[case(Enabled, true, false, false)]
    #[case(Parent, true, false, false)]
    #[case(Completed, false, true, true)]
    #[case(ForceCompleted, false, true, true)]
    #[case(Failed, false, true, false)]
    #[case(Cancelled, false, true, false)]
    fn status_predicates(
        #[case] status: WorkItemStatus,
        #[case] active: bool,
        #[case] finished: bool,
        #[case] successful: bool,
    ) {
        assert_eq!(status.is_active(), active);
        assert_eq!(status.is_finished(), finished);
        assert_eq!(status.is_successful(), successful);
    }

    #[rstest]
    #[case(2, &[Completed, Completed, Started], Completed)]
    #[case(2, &[Completed, Failed, Cancelled], Failed)]
    #[case(2, &[Completed, Started, Fired], Started)]
    #[case(1, &[Fired, Offered], Parent)]
    fn parent_status_is_derived(
        #[case] threshold: usize,
        #[case] children: &[WorkItemStatus],
        #[case] expected: WorkItemStatus,
    ) {
        assert_eq!(derive_parent_status(threshold, children), expected);
    }

    #[test]
    fn fail_keeps_the_reason() {
        let now = Utc::now();
        let mut wi = item();
        wi.fire(now).unwrap();
        wi.allocate("system", now).unwrap();
        wi.start(now).unwrap();
        wi.fail("timeout", now).unwrap();
        assert_eq!(wi.failure_reason.as_deref(), Some("timeout"));
        assert_eq!(wi.history().last().unwrap().data, Some(Value::from("timeout")));
    }
}
