//! Errors - engine error type and its stable classification.
//!
//! Every public engine operation returns `Result<_, EngineError>`. Callers that
//! need to branch on the failure use [`EngineError::kind`], which is stable
//! across message wording changes.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::exception::ExceptionType;
use super::ids::{CheckpointId, SpecificationId};

/// Stable classification of an [`EngineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    StateTransition,
    Routing,
    Synchronization,
    WorkletNotFound,
    CheckpointCorrupted,
    NotFound,
    SpecificationNotActive,
    EngineNotRunning,
    Allocation,
    Evaluation,
    StepLimitExceeded,
    Repository,
    Parse,
}

/// One structural problem found while validating a specification.
///
/// Validation collects all issues instead of stopping at the first one.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ValidationIssue {
    #[error("root net {0} does not exist")]
    MissingRootNet(String),

    #[error("net {net} has {count} input conditions (expected exactly one)")]
    InputConditionCount { net: String, count: usize },

    #[error("net {net} has {count} output conditions (expected exactly one)")]
    OutputConditionCount { net: String, count: usize },

    #[error("net {net}: duplicate element id {id}")]
    DuplicateElement { net: String, id: String },

    #[error("net {net}: flow {flow} references unknown element {element}")]
    DanglingFlow {
        net: String,
        flow: String,
        element: String,
    },

    #[error("net {net}: flow {flow} does not connect a condition and a task")]
    NonBipartiteFlow { net: String, flow: String },

    #[error("net {net}: element {element} is not reachable from the input condition")]
    Unreachable { net: String, element: String },

    #[error("net {net}: input condition {condition} has incoming flows")]
    InputHasIncoming { net: String, condition: String },

    #[error("net {net}: output condition {condition} has outgoing flows")]
    OutputHasOutgoing { net: String, condition: String },

    #[error("net {net}: task {task} references unknown decomposition {decomposition}")]
    DanglingDecomposition {
        net: String,
        task: String,
        decomposition: String,
    },

    #[error("net {net}: task {task} declares more than one default flow")]
    MultipleDefaultFlows { net: String, task: String },

    #[error("net {net}: task {task} has a conditional split without a default or unconditional flow")]
    UnroutableSplit { net: String, task: String },

    #[error("net {net}: task {task} has no {direction} flows")]
    DisconnectedTask {
        net: String,
        task: String,
        direction: String,
    },

    #[error("net {net}: task {task} has an invalid multi-instance configuration: {reason}")]
    InvalidMultiInstance {
        net: String,
        task: String,
        reason: String,
    },

    #[error("net {net}: task {task} cancels unknown element {element}")]
    DanglingCancellation {
        net: String,
        task: String,
        element: String,
    },
}

/// Errors surfaced by the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("specification {specification} is invalid: {}", format_issues(.issues))]
    Validation {
        specification: SpecificationId,
        issues: Vec<ValidationIssue>,
    },

    #[error("{entity} {id}: cannot {action} while {from}")]
    StateTransition {
        entity: &'static str,
        id: String,
        from: String,
        action: &'static str,
    },

    #[error("task {task}: no outgoing flow could be selected ({reason})")]
    Routing { task: String, reason: String },

    #[error("OR-join {task} is part of a synchronization cycle: {cycle:?}")]
    Synchronization { task: String, cycle: Vec<String> },

    #[error("no worklet selected for {exception} exception (task={task:?})")]
    WorkletNotFound {
        exception: ExceptionType,
        task: Option<String>,
    },

    #[error("checkpoint {checkpoint} is corrupted: {reason}")]
    CheckpointCorrupted {
        checkpoint: CheckpointId,
        reason: String,
    },

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("specification {id} is {status}, not active")]
    SpecificationNotActive { id: SpecificationId, status: String },

    #[error("engine is not running")]
    EngineNotRunning,

    #[error("cannot allocate work item {work_item} to {participant}: {reason}")]
    Allocation {
        work_item: String,
        participant: String,
        reason: String,
    },

    #[error("cannot evaluate `{expression}`: {reason}")]
    Evaluation { expression: String, reason: String },

    #[error("case {case} exceeded {limit} firing steps in one round")]
    StepLimitExceeded { case: String, limit: usize },

    #[error("repository error: {0}")]
    Repository(String),

    #[error("cannot parse specification: {0}")]
    Parse(String),

    #[error("malformed rule tree: {0}")]
    RuleTree(String),
}

fn format_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation { .. } => ErrorKind::Validation,
            EngineError::StateTransition { .. } => ErrorKind::StateTransition,
            EngineError::Routing { .. } => ErrorKind::Routing,
            EngineError::Synchronization { .. } => ErrorKind::Synchronization,
            EngineError::WorkletNotFound { .. } => ErrorKind::WorkletNotFound,
            EngineError::CheckpointCorrupted { .. } => ErrorKind::CheckpointCorrupted,
            EngineError::NotFound { .. } => ErrorKind::NotFound,
            EngineError::SpecificationNotActive { .. } => ErrorKind::SpecificationNotActive,
            EngineError::EngineNotRunning => ErrorKind::EngineNotRunning,
            EngineError::Allocation { .. } => ErrorKind::Allocation,
            EngineError::Evaluation { .. } => ErrorKind::Evaluation,
            EngineError::StepLimitExceeded { .. } => ErrorKind::StepLimitExceeded,
            EngineError::Repository(_) => ErrorKind::Repository,
            EngineError::Parse(_) => ErrorKind::Parse,
            EngineError::RuleTree(_) => ErrorKind::Validation,
        }
    }

    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        EngineError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Runtime faults that are handed to the worklet executor before being
    /// returned to the caller.
    pub fn is_runtime_fault(&self) -> bool {
        matches!(
            self,
            EngineError::Routing { .. } | EngineError::Synchronization { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_message_lists_every_issue() {
        let err = EngineError::Validation {
            specification: SpecificationId::new("order"),
            issues: vec![
                ValidationIssue::MissingRootNet("main".into()),
                ValidationIssue::InputConditionCount {
                    net: "sub".into(),
                    count: 0,
                },
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("root net main"));
        assert!(msg.contains("0 input conditions"));
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn error_kind_serializes_snake_case() {
        let s = serde_json::to_string(&ErrorKind::StateTransition).unwrap();
        assert_eq!(s, "\"state_transition\"");
    }

    #[test]
    fn runtime_faults_are_routing_and_synchronization() {
        let routing = EngineError::Routing {
            task: "t".into(),
            reason: "none".into(),
        };
        assert!(routing.is_runtime_fault());
        assert!(!EngineError::EngineNotRunning.is_runtime_fault());
    }
}
