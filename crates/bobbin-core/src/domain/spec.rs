//! Process specifications: a root net plus the decompositions it refers to.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::errors::EngineError;
pub use super::ids::SpecificationId;
use super::net::Net;

/// Lifecycle of a loaded specification.
///
/// ```text
/// Editing/Loaded --activate--> Active <--activate-- Suspended
///                               |  \--suspend-------^   |
///                               \------retire------> Retired --archive--> Archived
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SpecificationStatus {
    Editing,
    Loaded,
    Active,
    Suspended,
    Retired,
    Archived,
}

impl std::fmt::Display for SpecificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SpecificationStatus::Editing => "EDITING",
            SpecificationStatus::Loaded => "LOADED",
            SpecificationStatus::Active => "ACTIVE",
            SpecificationStatus::Suspended => "SUSPENDED",
            SpecificationStatus::Retired => "RETIRED",
            SpecificationStatus::Archived => "ARCHIVED",
        };
        f.write_str(s)
    }
}

/// What a task decomposes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecompositionKind {
    /// A sub-net; tasks decomposing to it are composite.
    Net,
    /// Work performed outside the engine by a participant or service.
    Atomic,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decomposition {
    pub id: String,
    pub kind: DecompositionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub documentation: Option<String>,
}

impl Decomposition {
    pub fn atomic(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: DecompositionKind::Atomic,
            name: None,
            documentation: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Specification {
    id: SpecificationId,
    name: String,
    #[serde(default)]
    version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    documentation: Option<String>,
    #[serde(default)]
    metadata: BTreeMap<String, serde_json::Value>,
    status: SpecificationStatus,
    root_net_id: String,
    nets: BTreeMap<String, Net>,
    decompositions: BTreeMap<String, Decomposition>,
}

impl Specification {
    pub fn builder(id: impl Into<SpecificationId>, name: impl Into<String>) -> SpecificationBuilder {
        SpecificationBuilder::new(id, name)
    }

    pub fn id(&self) -> &SpecificationId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn uri(&self) -> Option<&str> {
        self.uri.as_deref()
    }

    pub fn documentation(&self) -> Option<&str> {
        self.documentation.as_deref()
    }

    pub fn metadata(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.metadata
    }

    pub fn status(&self) -> SpecificationStatus {
        self.status
    }

    pub fn root_net_id(&self) -> &str {
        &self.root_net_id
    }

    pub fn root_net(&self) -> Option<&Net> {
        self.nets.get(&self.root_net_id)
    }

    pub fn net(&self, id: &str) -> Option<&Net> {
        self.nets.get(id)
    }

    pub fn nets(&self) -> impl Iterator<Item = &Net> {
        self.nets.values()
    }

    pub fn decomposition(&self, id: &str) -> Option<&Decomposition> {
        self.decompositions.get(id)
    }

    /// The sub-net a task decomposes into, if it is composite.
    pub fn sub_net_of(&self, net_id: &str, task_id: &str) -> Option<&Net> {
        let task = self.nets.get(net_id)?.task(task_id)?;
        let decomposition = self.decompositions.get(task.decomposition_id.as_deref()?)?;
        match decomposition.kind {
            DecompositionKind::Net => self.nets.get(&decomposition.id),
            DecompositionKind::Atomic => None,
        }
    }

    pub fn accepts_new_cases(&self) -> bool {
        self.status == SpecificationStatus::Active
    }

    /// Full structural validation. A failing specification is never loaded.
    pub fn validate(&self) -> Result<(), EngineError> {
        let issues = super::validate::specification_issues(self);
        if issues.is_empty() {
            Ok(())
        } else {
            Err(EngineError::Validation {
                specification: self.id.clone(),
                issues,
            })
        }
    }

    pub fn mark_loaded(&mut self) -> Result<(), EngineError> {
        self.transition(
            "load",
            &[SpecificationStatus::Editing, SpecificationStatus::Loaded],
            SpecificationStatus::Loaded,
        )
    }

    pub fn activate(&mut self) -> Result<(), EngineError> {
        self.transition(
            "activate",
            &[
                SpecificationStatus::Editing,
                SpecificationStatus::Loaded,
                SpecificationStatus::Suspended,
            ],
            SpecificationStatus::Active,
        )
    }

    pub fn suspend(&mut self) -> Result<(), EngineError> {
        self.transition(
            "suspend",
            &[SpecificationStatus::Active],
            SpecificationStatus::Suspended,
        )
    }

    pub fn retire(&mut self) -> Result<(), EngineError> {
        self.transition(
            "retire",
            &[SpecificationStatus::Active, SpecificationStatus::Suspended],
            SpecificationStatus::Retired,
        )
    }

    pub fn archive(&mut self) -> Result<(), EngineError> {
        self.transition(
            "archive",
            &[SpecificationStatus::Retired],
            SpecificationStatus::Archived,
        )
    }

    fn transition(
        &mut self,
        action: &'static str,
        from: &[SpecificationStatus],
        to: SpecificationStatus,
    ) -> Result<(), EngineError> {
        if !from.contains(&self.status) {
            return Err(EngineError::StateTransition {
                entity: "specification",
                id: self.id.to_string(),
                from: self.status.to_string(),
                action,
            });
        }
        self.status = to;
        Ok(())
    }
}

/// Assembles and validates a [`Specification`].
///
/// Every net added is also registered as a `Net` decomposition.
#[derive(Debug, Clone)]
pub struct SpecificationBuilder {
    id: SpecificationId,
    name: String,
    version: String,
    uri: Option<String>,
    documentation: Option<String>,
    metadata: BTreeMap<String, serde_json::Value>,
    root_net_id: Option<String>,
    nets: BTreeMap<String, Net>,
    decompositions: BTreeMap<String, Decomposition>,
}

impl SpecificationBuilder {
    pub fn new(id: impl Into<SpecificationId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: "0.1".to_string(),
            uri: None,
            documentation: None,
            metadata: BTreeMap::new(),
            root_net_id: None,
            nets: BTreeMap::new(),
            decompositions: BTreeMap::new(),
        }
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    pub fn documentation(mut self, doc: impl Into<String>) -> Self {
        self.documentation = Some(doc.into());
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Add the root net. The first net added is the root unless `root` is called.
    pub fn net(mut self, net: Net) -> Self {
        if self.root_net_id.is_none() {
            self.root_net_id = Some(net.id().to_string());
        }
        self.decompositions.insert(
            net.id().to_string(),
            Decomposition {
                id: net.id().to_string(),
                kind: DecompositionKind::Net,
                name: None,
                documentation: None,
            },
        );
        self.nets.insert(net.id().to_string(), net);
        self
    }

    pub fn root(mut self, net_id: impl Into<String>) -> Self {
        self.root_net_id = Some(net_id.into());
        self
    }

    pub fn decomposition(mut self, decomposition: Decomposition) -> Self {
        self.decompositions
            .insert(decomposition.id.clone(), decomposition);
        self
    }

    /// Shorthand for an atomic decomposition.
    pub fn atomic(self, id: impl Into<String>) -> Self {
        self.decomposition(Decomposition::atomic(id))
    }

    /// Validate and produce a specification in `Loaded` status.
    pub fn build(self) -> Result<Specification, EngineError> {
        let spec = Specification {
            id: self.id,
            name: self.name,
            version: self.version,
            uri: self.uri,
            documentation: self.documentation,
            metadata: self.metadata,
            status: SpecificationStatus::Loaded,
            root_net_id: self.root_net_id.unwrap_or_default(),
            nets: self.nets,
            decompositions: self.decompositions,
        };
        spec.validate()?;
        Ok(spec)
    }
}
