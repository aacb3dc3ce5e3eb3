//! Participants and the resourcing requirements tasks declare.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// A human or system resource that can be offered work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub roles: BTreeSet<String>,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default)]
    pub positions: BTreeSet<String>,
    #[serde(default = "default_available")]
    pub available: bool,
}

fn default_available() -> bool {
    true
}

impl Participant {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            roles: BTreeSet::new(),
            capabilities: BTreeSet::new(),
            positions: BTreeSet::new(),
            available: true,
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.insert(role.into());
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    pub fn with_position(mut self, position: impl Into<String>) -> Self {
        self.positions.insert(position.into());
        self
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }
}

/// How a fired work item is distributed once candidates are known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStrategy {
    /// Offer to every candidate; one of them allocates explicitly.
    #[default]
    Offer,
    /// Offer, then allocate to the first candidate returned.
    FirstAvailable,
    /// Offer, then allocate to a uniformly chosen candidate.
    Random,
}

/// Resourcing requirements of a task.
///
/// A participant matches when it holds *any* listed role, *every* listed
/// capability, and *any* listed position. Empty lists do not constrain.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourcingSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub positions: Vec<String>,
    #[serde(default)]
    pub available_only: bool,
    #[serde(default)]
    pub strategy: AllocationStrategy,
}

impl ResourcingSpec {
    pub fn role(role: impl Into<String>) -> Self {
        Self {
            roles: vec![role.into()],
            ..Self::default()
        }
    }

    pub fn with_strategy(mut self, strategy: AllocationStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn available_only(mut self) -> Self {
        self.available_only = true;
        self
    }

    pub fn matches(&self, participant: &Participant) -> bool {
        if self.available_only && !participant.available {
            return false;
        }
        let any_of = |wanted: &[String], held: &BTreeSet<String>| {
            wanted.is_empty() || wanted.iter().any(|w| held.contains(w))
        };
        any_of(&self.roles, &participant.roles)
            && self
                .capabilities
                .iter()
                .all(|c| participant.capabilities.contains(c))
            && any_of(&self.positions, &participant.positions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::role_match(ResourcingSpec::role("clerk"), true)]
    #[case::role_miss(ResourcingSpec::role("manager"), false)]
    #[case::unconstrained(ResourcingSpec::default(), true)]
    #[case::capability_required(
        ResourcingSpec { capabilities: vec!["sign".into(), "audit".into()], ..Default::default() },
        false
    )]
    fn matching_rules(#[case] spec: ResourcingSpec, #[case] expected: bool) {
        let alice = Participant::new("alice")
            .with_role("clerk")
            .with_capability("sign");
        assert_eq!(spec.matches(&alice), expected);
    }

    #[test]
    fn available_only_excludes_unavailable_participants() {
        let bob = Participant::new("bob").with_role("clerk").unavailable();
        assert!(ResourcingSpec::role("clerk").matches(&bob));
        assert!(!ResourcingSpec::role("clerk").available_only().matches(&bob));
    }
}
