//! Domain identifiers (strongly-typed IDs).
//!
//! Runtime entities (cases, work items, worklet cases, checkpoints) are
//! identified by ULIDs wrapped in a phantom-typed [`Id<T>`], so a `CaseId` can
//! never be passed where a `WorkItemId` is expected.
//!
//! Net elements (conditions, tasks, flows) are *not* ULIDs: they come from the
//! specification document and are addressed by their stable string ids.
//!
//! ## ULID properties
//! - sortable by creation time (the timestamp is the high 48 bits)
//! - generated without coordination
//! - 128-bit, same size as a UUID

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use ulid::Ulid;

/// Marker trait for each id flavour.
///
/// Supplies the display prefix ("case-", "item-", ...).
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// Generic ULID-backed id.
///
/// `T` is only used at compile time.
#[repr(transparent)]
#[derive(Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

// Manual impls: deriving would put bounds on `T`, which is an uninhabited marker.
impl<T: IdMarker> Clone for Id<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: IdMarker> Copy for Id<T> {}

impl<T: IdMarker> PartialEq for Id<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ulid == other.ulid
    }
}

impl<T: IdMarker> Eq for Id<T> {}

impl<T: IdMarker> std::hash::Hash for Id<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.ulid.hash(state);
    }
}

impl<T: IdMarker> PartialOrd for Id<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: IdMarker> Ord for Id<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.ulid.cmp(&other.ulid)
    }
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    /// Fresh id from the system clock. Prefer [`crate::ports::IdGenerator`]
    /// inside the engine so tests can pin time.
    pub fn generate() -> Self {
        Self::from_ulid(Ulid::new())
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

impl<T: IdMarker> fmt::Debug for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Accepts both the prefixed display form and a bare ULID.
impl<T: IdMarker> FromStr for Id<T> {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix(T::prefix()).unwrap_or(s);
        Ulid::from_string(raw).map(Self::from_ulid)
    }
}

// ========================================
// Marker types
// ========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Case {}

impl IdMarker for Case {
    fn prefix() -> &'static str {
        "case-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WorkItem {}

impl IdMarker for WorkItem {
    fn prefix() -> &'static str {
        "item-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WorkletCase {}

impl IdMarker for WorkletCase {
    fn prefix() -> &'static str {
        "worklet-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Checkpoint {}

impl IdMarker for Checkpoint {
    fn prefix() -> &'static str {
        "ckpt-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Engine {}

impl IdMarker for Engine {
    fn prefix() -> &'static str {
        "engine-"
    }
}

/// Identifier of a running process instance.
pub type CaseId = Id<Case>;

/// Identifier of one unit of work created by a task firing.
pub type WorkItemId = Id<WorkItem>;

/// Identifier of a worklet instance launched to handle an exception.
pub type WorkletCaseId = Id<WorkletCase>;

/// Identifier of a stored checkpoint.
pub type CheckpointId = Id<Checkpoint>;

/// Identifier of an engine instance (checkpoint subject).
pub type EngineId = Id<Engine>;

/// Identifier of a loaded specification, taken verbatim from the document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpecificationId(String);

impl SpecificationId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SpecificationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for SpecificationId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for SpecificationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}
