//! Ripple-Down-Rules trees that select worklets for exceptions.
//!
//! Nodes live in an arena (`Vec<RdrNode>`) and refer to each other by index.
//! Node 0 is the root: it always holds and concludes nothing, so a tree with
//! no rules selects nothing.
//!
//! A tree read from outside is checked before use: the root exists, every
//! child index points into the arena and every node hangs off exactly one
//! branch.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::errors::EngineError;
use super::exception::ExceptionType;

pub const ROOT: usize = 0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RdrNode {
    pub condition: String,
    /// Worklet id selected when this is the last node that held.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conclusion: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub true_child: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub false_child: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<usize>,
    /// Facts of the case that justified adding this rule.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cornerstone: Option<Value>,
}

/// Outcome of walking a tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub conclusion: Option<String>,
    /// Last node whose condition held.
    pub last_true: usize,
    /// Node where the walk stopped, and what its condition evaluated to.
    pub last_evaluated: usize,
    pub last_result: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RdrTreeRepr")]
pub struct RdrTree {
    nodes: Vec<RdrNode>,
}

#[derive(Deserialize)]
struct RdrTreeRepr {
    nodes: Vec<RdrNode>,
}

impl TryFrom<RdrTreeRepr> for RdrTree {
    type Error = EngineError;

    fn try_from(repr: RdrTreeRepr) -> Result<Self, Self::Error> {
        let tree = RdrTree { nodes: repr.nodes };
        tree.check()?;
        Ok(tree)
    }
}

impl Default for RdrTree {
    fn default() -> Self {
        Self::new()
    }
}

impl RdrTree {
    pub fn new() -> Self {
        Self {
            nodes: vec![RdrNode {
                condition: "true".into(),
                conclusion: None,
                true_child: None,
                false_child: None,
                parent: None,
                cornerstone: None,
            }],
        }
    }

    pub fn node(&self, index: usize) -> Option<&RdrNode> {
        self.nodes.get(index)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    /// Check the arena shape: a root, in-range children, no node on two
    /// branches (which also rules out cycles) and no detached node.
    pub fn check(&self) -> Result<(), EngineError> {
        if self.nodes.is_empty() {
            return Err(EngineError::RuleTree("tree has no root node".into()));
        }
        let mut attached = vec![false; self.nodes.len()];
        attached[ROOT] = true;
        let mut stack = vec![ROOT];
        while let Some(index) = stack.pop() {
            let node = &self.nodes[index];
            for child in [node.true_child, node.false_child].into_iter().flatten() {
                match attached.get_mut(child) {
                    None => {
                        return Err(EngineError::RuleTree(format!(
                            "node {index} points at missing node {child}"
                        )));
                    }
                    Some(true) => {
                        return Err(EngineError::RuleTree(format!(
                            "node {child} is reached more than once"
                        )));
                    }
                    Some(seen) => {
                        *seen = true;
                        stack.push(child);
                    }
                }
            }
        }
        match attached.iter().position(|a| !a) {
            Some(index) => Err(EngineError::RuleTree(format!(
                "node {index} is not attached to the root"
            ))),
            None => Ok(()),
        }
    }

    fn at(&self, index: usize) -> Result<&RdrNode, EngineError> {
        self.nodes
            .get(index)
            .ok_or_else(|| EngineError::RuleTree(format!("missing node {index}")))
    }

    /// Attach a rule under `parent` on the given branch.
    pub fn add_rule(
        &mut self,
        parent: usize,
        on_true: bool,
        condition: impl Into<String>,
        conclusion: impl Into<String>,
        cornerstone: Option<Value>,
    ) -> Result<usize, EngineError> {
        let index = self.nodes.len();
        let slot = self.slot_mut(parent, on_true)?;
        if slot.is_some() {
            return Err(EngineError::StateTransition {
                entity: "rdr node",
                id: parent.to_string(),
                from: (if on_true { "true branch taken" } else { "false branch taken" }).into(),
                action: "add_rule",
            });
        }
        *slot = Some(index);
        self.nodes.push(RdrNode {
            condition: condition.into(),
            conclusion: Some(conclusion.into()),
            true_child: None,
            false_child: None,
            parent: Some(parent),
            cornerstone,
        });
        Ok(index)
    }

    /// Walk the tree: a holding node is remembered and its true child tried,
    /// a failing node hands over to its false child. The conclusion is that
    /// of the last node that held.
    pub fn select(
        &self,
        mut holds: impl FnMut(&str) -> Result<bool, EngineError>,
    ) -> Result<Selection, EngineError> {
        let mut last_true = ROOT;
        let mut last_evaluated = ROOT;
        let mut last_result = true;
        let mut current = self.at(ROOT)?.true_child;
        let mut steps = 0usize;

        while let Some(index) = current {
            steps += 1;
            if steps > self.nodes.len() {
                return Err(EngineError::RuleTree("walk revisits a node".into()));
            }
            let node = self.at(index)?;
            let result = holds(&node.condition)?;
            last_evaluated = index;
            last_result = result;
            if result {
                last_true = index;
                current = node.true_child;
            } else {
                current = node.false_child;
            }
        }

        Ok(Selection {
            conclusion: self.at(last_true)?.conclusion.clone(),
            last_true,
            last_evaluated,
            last_result,
        })
    }

    /// Add a correcting rule where `selection` stopped. Cases that reached
    /// the old conclusion and fail the new condition keep it.
    pub fn refine(
        &mut self,
        selection: &Selection,
        condition: impl Into<String>,
        conclusion: impl Into<String>,
        cornerstone: Value,
    ) -> Result<usize, EngineError> {
        self.add_rule(
            selection.last_evaluated,
            selection.last_result,
            condition,
            conclusion,
            Some(cornerstone),
        )
    }

    fn slot_mut(&mut self, parent: usize, on_true: bool) -> Result<&mut Option<usize>, EngineError> {
        let node = self
            .nodes
            .get_mut(parent)
            .ok_or_else(|| EngineError::not_found("rdr node", parent))?;
        Ok(if on_true {
            &mut node.true_child
        } else {
            &mut node.false_child
        })
    }
}

/// Tree address: task-specific (`Some(task)`) or case-level (`None`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RuleKey {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    pub exception: ExceptionType,
}

impl RuleKey {
    pub fn case_level(exception: ExceptionType) -> Self {
        Self {
            task: None,
            exception,
        }
    }

    pub fn for_task(task: impl Into<String>, exception: ExceptionType) -> Self {
        Self {
            task: Some(task.into()),
            exception,
        }
    }
}

/// Serialized form of one tree in a rule set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSetEntry {
    #[serde(flatten)]
    pub key: RuleKey,
    pub tree: RdrTree,
}

/// All trees of a specification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<RuleSetEntry>", into = "Vec<RuleSetEntry>")]
pub struct RuleSet {
    trees: BTreeMap<RuleKey, RdrTree>,
}

impl From<Vec<RuleSetEntry>> for RuleSet {
    fn from(entries: Vec<RuleSetEntry>) -> Self {
        Self {
            trees: entries.into_iter().map(|e| (e.key, e.tree)).collect(),
        }
    }
}

impl From<RuleSet> for Vec<RuleSetEntry> {
    fn from(set: RuleSet) -> Self {
        set.trees
            .into_iter()
            .map(|(key, tree)| RuleSetEntry { key, tree })
            .collect()
    }
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: RuleKey, tree: RdrTree) {
        self.trees.insert(key, tree);
    }

    pub fn tree(&self, key: &RuleKey) -> Option<&RdrTree> {
        self.trees.get(key)
    }

    /// Tree for `key`, created empty on first use.
    pub fn tree_mut(&mut self, key: RuleKey) -> &mut RdrTree {
        self.trees.entry(key).or_default()
    }

    pub fn keys(&self) -> impl Iterator<Item = &RuleKey> {
        self.trees.keys()
    }

    /// Select a worklet. Item-level exceptions with a task try the task's
    /// tree first and fall back to the case-level tree when it concludes
    /// nothing.
    pub fn select(
        &self,
        task: Option<&str>,
        exception: ExceptionType,
        mut holds: impl FnMut(&str) -> Result<bool, EngineError>,
    ) -> Result<Option<(RuleKey, Selection)>, EngineError> {
        let mut candidates = Vec::with_capacity(2);
        if let (Some(task), true) = (task, exception.is_item_level()) {
            candidates.push(RuleKey::for_task(task, exception));
        }
        candidates.push(RuleKey::case_level(exception));

        let mut fallback = None;
        for key in candidates {
            let Some(tree) = self.trees.get(&key) else {
                continue;
            };
            let selection = tree.select(&mut holds)?;
            if selection.conclusion.is_some() {
                return Ok(Some((key, selection)));
            }
            fallback.get_or_insert((key, selection));
        }
        Ok(fallback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    /// Conditions are plain names; `facts` lists the ones that hold.
    fn holds<'a>(facts: &'a [&'a str]) -> impl FnMut(&str) -> Result<bool, EngineError> + 'a {
        move |c| Ok(facts.iter().any(|f| *f == c))
    }

    fn tree() -> RdrTree {
        //  root
        //   └─T─ late -> "escalate"
        //        ├─T─ vip -> "apologise"
        //        └─F─ rush -> "expedite"
        let mut t = RdrTree::new();
        let late = t.add_rule(ROOT, true, "late", "escalate", None).unwrap();
        t.add_rule(late, true, "vip", "apologise", None).unwrap();
        t.add_rule(late, false, "rush", "expedite", None).unwrap();
        t
    }

    #[test]
    fn most_specific_true_node_wins() {
        let t = tree();
        assert_eq!(
            t.select(holds(&["late", "vip"])).unwrap().conclusion.as_deref(),
            Some("apologise")
        );
        assert_eq!(
            t.select(holds(&["late"])).unwrap().conclusion.as_deref(),
            Some("escalate")
        );
        assert_eq!(
            t.select(holds(&["rush"])).unwrap().conclusion.as_deref(),
            Some("expedite")
        );
        assert_eq!(t.select(holds(&[])).unwrap().conclusion, None);
    }

    #[test]
    fn empty_tree_selects_nothing() {
        let sel = RdrTree::new().select(holds(&["anything"])).unwrap();
        assert_eq!(sel.conclusion, None);
        assert_eq!(sel.last_true, ROOT);
    }

    #[test]
    fn refinement_only_changes_the_new_cornerstone_case() {
        let mut t = tree();
        let sel = t.select(holds(&["late"])).unwrap();
        assert_eq!(sel.conclusion.as_deref(), Some("escalate"));

        // Stopped after `vip` evaluated false: the refinement hangs off its false branch.
        let node = t
            .refine(&sel, "weekend", "defer", json!({"late": true, "weekend": true}))
            .unwrap();
        assert_eq!(t.node(node).unwrap().parent, Some(sel.last_evaluated));

        assert_eq!(
            t.select(holds(&["late", "weekend"])).unwrap().conclusion.as_deref(),
            Some("defer")
        );
        assert_eq!(
            t.select(holds(&["late"])).unwrap().conclusion.as_deref(),
            Some("escalate")
        );
        assert_eq!(
            t.select(holds(&["late", "vip"])).unwrap().conclusion.as_deref(),
            Some("apologise")
        );
    }

    #[test]
    fn occupied_branch_is_rejected() {
        let mut t = tree();
        assert!(t.add_rule(ROOT, true, "x", "y", None).is_err());
    }

    #[test]
    fn item_level_falls_back_to_case_level() {
        let mut rules = RuleSet::new();
        let mut case_tree = RdrTree::new();
        case_tree
            .add_rule(ROOT, true, "true", "case_handler", None)
            .unwrap();
        rules.insert(RuleKey::case_level(ExceptionType::ItemAbort), case_tree);
        rules.insert(
            RuleKey::for_task("pack", ExceptionType::ItemAbort),
            RdrTree::new(),
        );

        let (key, sel) = rules
            .select(Some("pack"), ExceptionType::ItemAbort, holds(&["true"]))
            .unwrap()
            .unwrap();
        assert_eq!(key, RuleKey::case_level(ExceptionType::ItemAbort));
        assert_eq!(sel.conclusion.as_deref(), Some("case_handler"));
    }

    #[test]
    fn evaluation_errors_propagate() {
        let t = tree();
        let err = t
            .select(|c| {
                Err(EngineError::Evaluation {
                    expression: c.to_string(),
                    reason: "boom".into(),
                })
            })
            .unwrap_err();
        assert!(matches!(err, EngineError::Evaluation { .. }));
    }

    #[rstest]
    #[case::missing_child(json!({"nodes": [{"condition": "true", "true_child": 7}]}))]
    #[case::no_root(json!({"nodes": []}))]
    #[case::cycle(json!({"nodes": [
        {"condition": "true", "true_child": 1},
        {"condition": "late", "conclusion": "escalate", "true_child": 1}
    ]}))]
    #[case::shared_node(json!({"nodes": [
        {"condition": "true", "true_child": 1},
        {"condition": "late", "conclusion": "escalate", "false_child": 2, "true_child": 2},
        {"condition": "vip", "conclusion": "apologise"}
    ]}))]
    #[case::detached(json!({"nodes": [
        {"condition": "true"},
        {"condition": "late", "conclusion": "escalate"}
    ]}))]
    fn malformed_trees_are_refused_when_read(#[case] raw: serde_json::Value) {
        let err = serde_json::from_value::<RdrTree>(raw).unwrap_err();
        assert!(err.to_string().contains("malformed rule tree"), "{err}");
    }

    #[test]
    fn well_formed_tree_is_read_and_walked() {
        let raw = serde_json::to_value(tree()).unwrap();
        let back: RdrTree = serde_json::from_value(raw).unwrap();
        assert_eq!(back, tree());
        assert_eq!(
            back.select(holds(&["late", "vip"])).unwrap().conclusion.as_deref(),
            Some("apologise")
        );
    }

    #[test]
    fn rule_set_roundtrips_as_entry_list() {
        let mut rules = RuleSet::new();
        rules.insert(RuleKey::for_task("a", ExceptionType::Timeout), tree());
        let json = serde_json::to_value(&rules).unwrap();
        assert_eq!(json[0]["task"], "a");
        assert_eq!(json[0]["exception"], "timeout");
        let back: RuleSet = serde_json::from_value(json).unwrap();
        assert_eq!(back, rules);
    }
}
