//! Domain model (nets, specifications, cases, work items, rules, checkpoints).
//!
//! Everything here is plain data plus the state machines that guard it. No
//! module in `domain` performs I/O or takes a lock.

pub mod case;
pub mod checkpoint;
pub mod data;
pub mod errors;
pub mod events;
pub mod exception;
pub mod graph;
pub mod ids;
pub mod marking;
pub mod net;
pub mod participant;
pub mod rdr;
pub mod spec;
pub mod work_item;
pub mod worklet;

mod validate;

pub use case::{CancelCascade, Case, CaseLogEntry, CaseStatus, ParentLink};
pub use checkpoint::{
    Checkpoint, CheckpointPayload, CheckpointState, CheckpointStatus, CheckpointSubject,
    CheckpointType, CHECKPOINT_FORMAT_VERSION,
};
pub use data::{into_data_map, CaseData, DataMap};
pub use errors::{EngineError, ErrorKind, ValidationIssue};
pub use events::{DomainEvent, EventEnvelope};
pub use exception::{ExceptionContext, ExceptionType};
pub use graph::FlowGraph;
pub use ids::{CaseId, CheckpointId, EngineId, Id, IdMarker, SpecificationId, WorkItemId, WorkletCaseId};
pub use marking::Marking;
pub use net::{
    Condition, ConditionKind, Flow, JoinType, MultiInstance, Net, NetBuilder, NetNode, SplitType,
    Task, TimerAction, TimerSpec, TimerTrigger,
};
pub use participant::{AllocationStrategy, Participant, ResourcingSpec};
pub use rdr::{RdrNode, RdrTree, RuleKey, RuleSet, Selection};
pub use spec::{
    Decomposition, DecompositionKind, Specification, SpecificationBuilder, SpecificationStatus,
};
pub use work_item::{derive_parent_status, HistoryRecord, WorkItem, WorkItemStatus};
pub use worklet::{WorkletAction, WorkletCase, WorkletCaseStatus, WorkletDefinition, WorkletResult};
