//! Net model: conditions (places), tasks (transitions) and flows (arcs).
//!
//! A [`Net`] is an arena. Nodes are stored by their stable string id and the
//! adjacency (preset / postset) is kept as lists of flow indices, never as
//! references between nodes. Cycles in the process graph and composite-task
//! recursion therefore need no special handling.
//!
//! Nets are immutable once built. Per-case state (token counts) lives in
//! [`crate::domain::Marking`].

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::errors::{EngineError, ValidationIssue};
use super::participant::ResourcingSpec;
use super::ids::SpecificationId;

/// Kind of a condition. Each net has exactly one input and one output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConditionKind {
    Input,
    Output,
    Ordinary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    pub id: String,
    pub kind: ConditionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Created by the builder for a task→task flow.
    #[serde(default)]
    pub implicit: bool,
}

impl Condition {
    pub fn new(id: impl Into<String>, kind: ConditionKind) -> Self {
        Self {
            id: id.into(),
            kind,
            name: None,
            implicit: false,
        }
    }
}

/// Rule governing when a task becomes enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinType {
    And,
    #[default]
    Xor,
    Or,
}

/// Rule governing which outgoing flows receive a token on completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SplitType {
    #[default]
    And,
    Xor,
    Or,
}

/// Multi-instance configuration of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiInstance {
    pub min: usize,
    pub max: usize,
    /// Number of completed instances after which the task completes.
    pub threshold: usize,
    /// Case variable holding an array; one instance per element.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub split_variable: Option<String>,
    /// Case variable receiving the array of instance outputs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_variable: Option<String>,
}

impl MultiInstance {
    pub fn new(min: usize, max: usize, threshold: usize) -> Self {
        Self {
            min,
            max,
            threshold,
            split_variable: None,
            output_variable: None,
        }
    }

    pub fn split_on(mut self, variable: impl Into<String>) -> Self {
        self.split_variable = Some(variable.into());
        self
    }

    pub fn collect_into(mut self, variable: impl Into<String>) -> Self {
        self.output_variable = Some(variable.into());
        self
    }

    pub(crate) fn problems(&self) -> Option<String> {
        if self.min == 0 {
            Some("min must be at least 1".into())
        } else if self.min > self.max {
            Some(format!("min {} exceeds max {}", self.min, self.max))
        } else if self.threshold == 0 || self.threshold > self.max {
            Some(format!(
                "threshold {} must be within 1..={}",
                self.threshold, self.max
            ))
        } else {
            None
        }
    }
}

/// When a work-item timer starts counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerTrigger {
    OnEnabled,
    OnStarted,
}

/// What happens when a work-item timer expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerAction {
    Cancel,
    Fail,
    /// Raise a timeout exception for the worklet executor.
    Escalate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerSpec {
    pub trigger: TimerTrigger,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    pub action: TimerAction,
}

pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (duration.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// A transition of the net.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub join: JoinType,
    #[serde(default)]
    pub split: SplitType,
    /// `None` makes this an empty routing task: it completes as soon as it fires.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decomposition_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multi_instance: Option<MultiInstance>,
    /// Conditions and tasks cleared when this task completes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cancellation_set: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timer: Option<TimerSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resourcing: Option<ResourcingSpec>,
}

impl Task {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            join: JoinType::default(),
            split: SplitType::default(),
            decomposition_id: None,
            multi_instance: None,
            cancellation_set: Vec::new(),
            timer: None,
            resourcing: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn join(mut self, join: JoinType) -> Self {
        self.join = join;
        self
    }

    pub fn split(mut self, split: SplitType) -> Self {
        self.split = split;
        self
    }

    pub fn decomposes_to(mut self, decomposition: impl Into<String>) -> Self {
        self.decomposition_id = Some(decomposition.into());
        self
    }

    pub fn multi_instance(mut self, mi: MultiInstance) -> Self {
        self.multi_instance = Some(mi);
        self
    }

    pub fn cancels(mut self, element: impl Into<String>) -> Self {
        self.cancellation_set.push(element.into());
        self
    }

    pub fn timer(mut self, timer: TimerSpec) -> Self {
        self.timer = Some(timer);
        self
    }

    pub fn resourcing(mut self, resourcing: ResourcingSpec) -> Self {
        self.resourcing = Some(resourcing);
        self
    }

    pub fn is_empty_task(&self) -> bool {
        self.decomposition_id.is_none()
    }
}

/// A directed arc. Always connects a condition and a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flow {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicate: Option<String>,
    #[serde(default)]
    pub is_default: bool,
    /// Declared evaluation order among the source's outgoing flows.
    #[serde(default)]
    pub ordering: usize,
}

/// Either kind of node, as returned by [`Net::node`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NetNode<'a> {
    Condition(&'a Condition),
    Task(&'a Task),
}

/// A process net. Built with [`NetBuilder`]; validated on build.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "NetDocument", into = "NetDocument")]
pub struct Net {
    id: String,
    conditions: BTreeMap<String, Condition>,
    tasks: BTreeMap<String, Task>,
    flows: Vec<Flow>,
    input: String,
    output: String,
    /// node id -> indices of incoming flows, in declared order.
    incoming: HashMap<String, Vec<usize>>,
    /// node id -> indices of outgoing flows, in declared order.
    outgoing: HashMap<String, Vec<usize>>,
}

impl Net {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn input_condition(&self) -> &str {
        &self.input
    }

    pub fn output_condition(&self) -> &str {
        &self.output
    }

    pub fn condition(&self, id: &str) -> Option<&Condition> {
        self.conditions.get(id)
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn node(&self, id: &str) -> Option<NetNode<'_>> {
        self.conditions
            .get(id)
            .map(NetNode::Condition)
            .or_else(|| self.tasks.get(id).map(NetNode::Task))
    }

    /// Tasks in id order (deterministic iteration).
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn conditions(&self) -> impl Iterator<Item = &Condition> {
        self.conditions.values()
    }

    pub fn flows(&self) -> &[Flow] {
        &self.flows
    }

    pub fn incoming_flows(&self, node: &str) -> impl Iterator<Item = &Flow> {
        self.flow_list(&self.incoming, node)
    }

    pub fn outgoing_flows(&self, node: &str) -> impl Iterator<Item = &Flow> {
        self.flow_list(&self.outgoing, node)
    }

    /// Source ids of the incoming flows.
    pub fn preset(&self, node: &str) -> Vec<&str> {
        self.incoming_flows(node).map(|f| f.source.as_str()).collect()
    }

    /// Target ids of the outgoing flows.
    pub fn postset(&self, node: &str) -> Vec<&str> {
        self.outgoing_flows(node).map(|f| f.target.as_str()).collect()
    }

    fn flow_list<'a>(
        &'a self,
        index: &'a HashMap<String, Vec<usize>>,
        node: &str,
    ) -> impl Iterator<Item = &'a Flow> {
        index
            .get(node)
            .into_iter()
            .flat_map(|ids| ids.iter().map(|&i| &self.flows[i]))
    }

    /// Decomposition ids referenced by tasks of this net.
    pub fn referenced_decompositions(&self) -> impl Iterator<Item = (&str, &str)> {
        self.tasks.values().filter_map(|t| {
            t.decomposition_id
                .as_deref()
                .map(|d| (t.id.as_str(), d))
        })
    }

    /// Structural checks that only need this net.
    pub(crate) fn structural_issues(&self) -> Vec<ValidationIssue> {
        super::validate::net_issues(self)
    }

    fn index(mut self) -> Self {
        self.flows.sort_by_key(|f| f.ordering);
        let mut incoming: HashMap<String, Vec<usize>> = HashMap::new();
        let mut outgoing: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, flow) in self.flows.iter().enumerate() {
            outgoing.entry(flow.source.clone()).or_default().push(i);
            incoming.entry(flow.target.clone()).or_default().push(i);
        }
        self.incoming = incoming;
        self.outgoing = outgoing;
        self
    }
}

/// Serialized shape of a net (adjacency is rebuilt on load).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct NetDocument {
    id: String,
    conditions: Vec<Condition>,
    tasks: Vec<Task>,
    flows: Vec<Flow>,
}

impl From<Net> for NetDocument {
    fn from(net: Net) -> Self {
        NetDocument {
            id: net.id,
            conditions: net.conditions.into_values().collect(),
            tasks: net.tasks.into_values().collect(),
            flows: net.flows,
        }
    }
}

impl TryFrom<NetDocument> for Net {
    type Error = EngineError;

    fn try_from(doc: NetDocument) -> Result<Self, Self::Error> {
        let mut builder = NetBuilder::new(doc.id);
        for c in doc.conditions {
            builder = builder.condition_with(c);
        }
        for t in doc.tasks {
            builder = builder.task(t);
        }
        builder.flows.extend(doc.flows);
        builder.build()
    }
}

/// Fluent construction of a [`Net`].
///
/// ```ignore
/// let net = NetBuilder::new("main")
///     .input_condition("start")
///     .output_condition("end")
///     .task(Task::new("approve").decomposes_to("manual"))
///     .flow("start", "approve")
///     .flow("approve", "end")
///     .build()?;
/// ```
///
/// A flow declared between two tasks gets an implicit condition
/// `c_<source>_<target>` inserted between them.
#[derive(Debug, Clone)]
pub struct NetBuilder {
    id: String,
    conditions: Vec<Condition>,
    tasks: Vec<Task>,
    flows: Vec<Flow>,
}

impl NetBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            conditions: Vec::new(),
            tasks: Vec::new(),
            flows: Vec::new(),
        }
    }

    pub fn input_condition(self, id: impl Into<String>) -> Self {
        self.condition_with(Condition::new(id, ConditionKind::Input))
    }

    pub fn output_condition(self, id: impl Into<String>) -> Self {
        self.condition_with(Condition::new(id, ConditionKind::Output))
    }

    pub fn condition(self, id: impl Into<String>) -> Self {
        self.condition_with(Condition::new(id, ConditionKind::Ordinary))
    }

    pub fn condition_with(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn task(mut self, task: Task) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn flow(self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.push_flow(source.into(), target.into(), None, false)
    }

    pub fn flow_when(
        self,
        source: impl Into<String>,
        target: impl Into<String>,
        predicate: impl Into<String>,
    ) -> Self {
        self.push_flow(source.into(), target.into(), Some(predicate.into()), false)
    }

    pub fn default_flow(self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.push_flow(source.into(), target.into(), None, true)
    }

    /// Add a fully specified flow (explicit id, predicate, default flag and ordering).
    pub fn flow_with(mut self, flow: Flow) -> Self {
        self.flows.push(flow);
        self
    }

    fn push_flow(
        mut self,
        source: String,
        target: String,
        predicate: Option<String>,
        is_default: bool,
    ) -> Self {
        let ordering = self.flows.len();
        self.flows.push(Flow {
            id: format!("{source}->{target}"),
            source,
            target,
            predicate,
            is_default,
            ordering,
        });
        self
    }

    /// Build and check the net's own structure.
    ///
    /// Cross-net checks (decomposition references) happen when the net is
    /// placed in a [`crate::domain::Specification`].
    pub fn build(self) -> Result<Net, EngineError> {
        let net_id = self.id.clone();
        let mut issues = Vec::new();

        let mut conditions = BTreeMap::new();
        let mut tasks = BTreeMap::new();
        for c in self.conditions {
            if conditions.contains_key(&c.id) {
                issues.push(ValidationIssue::DuplicateElement {
                    net: net_id.clone(),
                    id: c.id.clone(),
                });
            }
            conditions.insert(c.id.clone(), c);
        }
        for t in self.tasks {
            if conditions.contains_key(&t.id) || tasks.contains_key(&t.id) {
                issues.push(ValidationIssue::DuplicateElement {
                    net: net_id.clone(),
                    id: t.id.clone(),
                });
            }
            tasks.insert(t.id.clone(), t);
        }

        let mut flows = Vec::with_capacity(self.flows.len());
        for flow in self.flows {
            let task_to_task = tasks.contains_key(&flow.source) && tasks.contains_key(&flow.target);
            if !task_to_task {
                flows.push(flow);
                continue;
            }
            let implicit_id = format!("c_{}_{}", flow.source, flow.target);
            conditions
                .entry(implicit_id.clone())
                .or_insert_with(|| Condition {
                    implicit: true,
                    ..Condition::new(implicit_id.clone(), ConditionKind::Ordinary)
                });
            flows.push(Flow {
                id: format!("{}->{}", flow.source, implicit_id),
                target: implicit_id.clone(),
                ..flow.clone()
            });
            flows.push(Flow {
                id: format!("{}->{}", implicit_id, flow.target),
                source: implicit_id,
                predicate: None,
                is_default: false,
                ..flow
            });
        }

        let pick = |kind: ConditionKind| -> Vec<String> {
            conditions
                .values()
                .filter(|c| c.kind == kind)
                .map(|c| c.id.clone())
                .collect()
        };
        let inputs = pick(ConditionKind::Input);
        let outputs = pick(ConditionKind::Output);
        if inputs.len() != 1 {
            issues.push(ValidationIssue::InputConditionCount {
                net: net_id.clone(),
                count: inputs.len(),
            });
        }
        if outputs.len() != 1 {
            issues.push(ValidationIssue::OutputConditionCount {
                net: net_id.clone(),
                count: outputs.len(),
            });
        }
        if !issues.is_empty() {
            return Err(invalid(&net_id, issues));
        }

        let net = Net {
            id: net_id.clone(),
            conditions,
            tasks,
            flows,
            input: inputs[0].clone(),
            output: outputs[0].clone(),
            incoming: HashMap::new(),
            outgoing: HashMap::new(),
        }
        .index();

        let issues = net.structural_issues();
        if issues.is_empty() {
            Ok(net)
        } else {
            Err(invalid(&net_id, issues))
        }
    }
}

fn invalid(net_id: &str, issues: Vec<ValidationIssue>) -> EngineError {
    EngineError::Validation {
        specification: SpecificationId::new(format!("net:{net_id}")),
        issues,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sequence() -> Net {
        NetBuilder::new("main")
            .input_condition("start")
            .output_condition("end")
            .task(Task::new("a").decomposes_to("work"))
            .task(Task::new("b").decomposes_to("work"))
            .flow("start", "a")
            .flow("a", "b")
            .flow("b", "end")
            .build()
            .unwrap()
    }

    #[test]
    fn task_to_task_flow_gets_implicit_condition() {
        let net = sequence();
        let implicit = net.condition("c_a_b").expect("implicit condition");
        assert!(implicit.implicit);
        assert_eq!(net.postset("a"), vec!["c_a_b"]);
        assert_eq!(net.preset("b"), vec!["c_a_b"]);
    }

    #[test]
    fn preset_and_postset_follow_declared_order() {
        let net = NetBuilder::new("main")
            .input_condition("i")
            .output_condition("o")
            .condition("c1")
            .condition("c2")
            .task(Task::new("split").split(SplitType::Xor))
            .task(Task::new("x"))
            .task(Task::new("y"))
            .flow("i", "split")
            .flow_when("split", "c2", "amount > 10")
            .default_flow("split", "c1")
            .flow("c1", "x")
            .flow("c2", "y")
            .flow("x", "o")
            .flow("y", "o")
            .build()
            .unwrap();
        assert_eq!(net.postset("split"), vec!["c2", "c1"]);
        let defaults: Vec<_> = net
            .outgoing_flows("split")
            .filter(|f| f.is_default)
            .map(|f| f.target.as_str())
            .collect();
        assert_eq!(defaults, vec!["c1"]);
    }

    #[test]
    fn missing_output_condition_is_rejected() {
        let err = NetBuilder::new("broken")
            .input_condition("i")
            .task(Task::new("a"))
            .flow("i", "a")
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation { ref issues, .. }
                if issues.contains(&ValidationIssue::OutputConditionCount { net: "broken".into(), count: 0 })
        ));
    }

    #[test]
    fn net_roundtrips_through_json() {
        let net = sequence();
        let json = serde_json::to_string(&net).unwrap();
        let back: Net = serde_json::from_str(&json).unwrap();
        assert_eq!(back.postset("a"), vec!["c_a_b"]);
        assert_eq!(back.input_condition(), "start");
        assert_eq!(back.tasks().count(), 2);
    }

    #[test]
    fn multi_instance_bounds_are_checked() {
        assert!(MultiInstance::new(1, 3, 2).problems().is_none());
        assert!(MultiInstance::new(0, 3, 2).problems().is_some());
        assert!(MultiInstance::new(4, 3, 2).problems().is_some());
        assert!(MultiInstance::new(1, 3, 5).problems().is_some());
    }
}
