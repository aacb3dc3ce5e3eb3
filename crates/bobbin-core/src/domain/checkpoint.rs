//! Checkpoints: versioned snapshots of case or engine state.
//!
//! The snapshot is kept as an opaque JSON blob (`state_data`) so a checkpoint
//! can be persisted and validated without knowing its payload. Decoding is
//! all-or-nothing: [`Checkpoint::decode`] either yields a complete
//! [`CheckpointState`] or reports corruption.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::case::Case;
use super::data::DataMap;
use super::errors::EngineError;
use super::ids::{CaseId, CheckpointId, EngineId, WorkItemId};
use super::work_item::WorkItem;
use super::worklet::WorkletCase;

/// Bumped whenever the payload shape changes.
pub const CHECKPOINT_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckpointType {
    Engine,
    Case,
    WorkItem,
    Incremental,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckpointStatus {
    Created,
    Valid,
    Restored,
    Expired,
    Corrupted,
}

impl CheckpointStatus {
    pub fn is_restorable(self) -> bool {
        matches!(
            self,
            CheckpointStatus::Created | CheckpointStatus::Valid | CheckpointStatus::Restored
        )
    }
}

impl std::fmt::Display for CheckpointStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CheckpointStatus::Created => "CREATED",
            CheckpointStatus::Valid => "VALID",
            CheckpointStatus::Restored => "RESTORED",
            CheckpointStatus::Expired => "EXPIRED",
            CheckpointStatus::Corrupted => "CORRUPTED",
        };
        f.write_str(s)
    }
}

/// What a checkpoint captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CheckpointSubject {
    Engine { engine_id: EngineId },
    Case { case_id: CaseId },
    WorkItem { case_id: CaseId, work_item_id: WorkItemId },
}

/// Decoded payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "payload", rename_all = "snake_case")]
pub enum CheckpointPayload {
    /// A case and all of its sub-cases, root first.
    Cases { cases: Vec<Case> },
    WorkItem { item: WorkItem, variables: DataMap },
    Engine {
        cases: Vec<Case>,
        #[serde(default)]
        worklet_cases: Vec<WorkletCase>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub format_version: u32,
    #[serde(flatten)]
    pub payload: CheckpointPayload,
}

impl CheckpointState {
    pub fn new(payload: CheckpointPayload) -> Self {
        Self {
            format_version: CHECKPOINT_FORMAT_VERSION,
            payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: CheckpointId,
    pub checkpoint_type: CheckpointType,
    pub subject: CheckpointSubject,
    status: CheckpointStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restored_at: Option<DateTime<Utc>>,
    pub state_data: Value,
    #[serde(default)]
    pub description: String,
}

impl Checkpoint {
    pub fn capture(
        id: CheckpointId,
        checkpoint_type: CheckpointType,
        subject: CheckpointSubject,
        state: &CheckpointState,
        description: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<Self, EngineError> {
        let state_data = serde_json::to_value(state).map_err(|e| EngineError::CheckpointCorrupted {
            checkpoint: id,
            reason: format!("cannot encode state: {e}"),
        })?;
        Ok(Self {
            id,
            checkpoint_type,
            subject,
            status: CheckpointStatus::Created,
            created_at: now,
            restored_at: None,
            state_data,
            description: description.into(),
        })
    }

    pub fn status(&self) -> CheckpointStatus {
        self.status
    }

    /// Fully decode the blob. Nothing is applied anywhere.
    pub fn decode(&self) -> Result<CheckpointState, EngineError> {
        let corrupted = |reason: String| EngineError::CheckpointCorrupted {
            checkpoint: self.id,
            reason,
        };
        let version = self
            .state_data
            .get("format_version")
            .and_then(Value::as_u64)
            .ok_or_else(|| corrupted("missing format_version".into()))?;
        if version != u64::from(CHECKPOINT_FORMAT_VERSION) {
            return Err(corrupted(format!(
                "unsupported format_version {version} (expected {CHECKPOINT_FORMAT_VERSION})"
            )));
        }
        let state: CheckpointState = serde_json::from_value(self.state_data.clone())
            .map_err(|e| corrupted(e.to_string()))?;
        self.check_subject(&state).map_err(corrupted)?;
        Ok(state)
    }

    /// CREATED -> VALID, or CORRUPTED when the blob does not decode.
    pub fn validate(&mut self) -> Result<(), EngineError> {
        match self.decode() {
            Ok(_) => {
                if self.status == CheckpointStatus::Created {
                    self.status = CheckpointStatus::Valid;
                }
                Ok(())
            }
            Err(err) => {
                self.status = CheckpointStatus::Corrupted;
                Err(err)
            }
        }
    }

    pub fn ensure_restorable(&self) -> Result<(), EngineError> {
        if self.status.is_restorable() {
            Ok(())
        } else {
            Err(EngineError::StateTransition {
                entity: "checkpoint",
                id: self.id.to_string(),
                from: self.status.to_string(),
                action: "restore",
            })
        }
    }

    pub fn mark_restored(&mut self, now: DateTime<Utc>) {
        self.status = CheckpointStatus::Restored;
        self.restored_at = Some(now);
    }

    pub fn mark_corrupted(&mut self) {
        self.status = CheckpointStatus::Corrupted;
    }

    pub fn mark_expired(&mut self) {
        if self.status != CheckpointStatus::Corrupted {
            self.status = CheckpointStatus::Expired;
        }
    }

    fn check_subject(&self, state: &CheckpointState) -> Result<(), String> {
        match (&self.subject, &state.payload) {
            (CheckpointSubject::Case { case_id }, CheckpointPayload::Cases { cases }) => {
                match cases.first() {
                    Some(root) if root.id == *case_id => Ok(()),
                    Some(root) => Err(format!("payload is for case {} not {case_id}", root.id)),
                    None => Err("payload holds no case".into()),
                }
            }
            (
                CheckpointSubject::WorkItem { work_item_id, .. },
                CheckpointPayload::WorkItem { item, .. },
            ) if item.id == *work_item_id => Ok(()),
            (CheckpointSubject::Engine { .. }, CheckpointPayload::Engine { .. }) => Ok(()),
            (CheckpointSubject::Engine { .. }, CheckpointPayload::Cases { .. })
                if self.checkpoint_type == CheckpointType::Incremental =>
            {
                Ok(())
            }
            _ => Err("payload does not match checkpoint subject".into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ids::SpecificationId;

    fn case() -> Case {
        Case::new(
            CaseId::generate(),
            SpecificationId::new("s"),
            "main",
            "i",
            DataMap::new(),
            Utc::now(),
        )
    }

    fn checkpoint(case: &Case) -> Checkpoint {
        Checkpoint::capture(
            CheckpointId::generate(),
            CheckpointType::Case,
            CheckpointSubject::Case { case_id: case.id },
            &CheckpointState::new(CheckpointPayload::Cases {
                cases: vec![case.clone()],
            }),
            "test",
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn captured_checkpoint_validates_and_decodes() {
        let c = case();
        let mut cp = checkpoint(&c);
        assert_eq!(cp.status(), CheckpointStatus::Created);
        cp.validate().unwrap();
        assert_eq!(cp.status(), CheckpointStatus::Valid);
        match cp.decode().unwrap().payload {
            CheckpointPayload::Cases { cases } => assert_eq!(cases[0], c),
            other => panic!("unexpected payload {other:?}"),
        }
        assert_eq!(cp.state_data["format_version"], CHECKPOINT_FORMAT_VERSION);
    }

    #[test]
    fn tampered_blob_is_marked_corrupted() {
        let mut cp = checkpoint(&case());
        cp.state_data["cases"] = Value::from("garbage");
        let err = cp.validate().unwrap_err();
        assert!(matches!(err, EngineError::CheckpointCorrupted { .. }));
        assert_eq!(cp.status(), CheckpointStatus::Corrupted);
        assert!(cp.ensure_restorable().is_err());
    }

    #[test]
    fn future_format_version_is_rejected() {
        let mut cp = checkpoint(&case());
        cp.state_data["format_version"] = Value::from(99);
        assert!(cp.decode().unwrap_err().to_string().contains("format_version 99"));
    }

    #[test]
    fn subject_mismatch_is_corruption() {
        let mut cp = checkpoint(&case());
        cp.subject = CheckpointSubject::Case {
            case_id: CaseId::generate(),
        };
        assert!(cp.decode().is_err());
    }

    #[test]
    fn expired_checkpoints_cannot_be_restored() {
        let mut cp = checkpoint(&case());
        cp.mark_expired();
        assert_eq!(cp.status(), CheckpointStatus::Expired);
        assert!(cp.ensure_restorable().is_err());
    }
}
