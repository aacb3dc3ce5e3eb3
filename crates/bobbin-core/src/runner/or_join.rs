//! OR-join enabling analysis.
//!
//! An OR-join with at least one marked preset condition may fire only when no
//! empty preset condition can still receive a token. For each empty preset
//! condition a backward search walks the net (never through the OR-join
//! itself) looking for:
//!
//! - a busy task (it has an active work item and will produce later), or
//! - a marked condition with a consumer that is not an OR-join.
//!
//! Either one blocks the join. A marked condition consumed only by other
//! OR-joins makes the join *depend* on them. Dependencies are resolved
//! across all candidate OR-joins: a join waiting on joins that themselves
//! wait only on each other is a vicious circle.
//!
//! Only consumers that lie upstream of the empty preset condition count. A
//! consumer off that path cannot deliver to the join, so it neither blocks
//! nor adds a dependency.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

use crate::domain::graph::FlowGraph;
use crate::domain::marking::Marking;
use crate::domain::net::{JoinType, Net, NetNode};

/// What to do when OR-joins wait on each other in a circle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrJoinCyclePolicy {
    /// Treat every member of the circle as enabled.
    Fire,
    /// Report a synchronization error.
    #[default]
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrJoinVerdict {
    /// No marked preset condition.
    NotEnabled,
    Ready,
    Waiting,
    /// Member of a vicious circle; the members are listed in id order.
    Cycle(Vec<String>),
}

/// Result of the backward search for one OR-join.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Scan {
    Blocked,
    Free,
    Dependent(BTreeSet<String>),
}

/// Verdict for `task`, taking the other OR-joins of the net into account.
pub fn analyse(net: &Net, marking: &Marking, busy: &BTreeSet<&str>, task: &str) -> OrJoinVerdict {
    if !has_marked_preset(net, marking, task) {
        return OrJoinVerdict::NotEnabled;
    }

    // Scan every candidate OR-join reachable through dependencies.
    let graph = FlowGraph::from_net(net);
    let mut scans: BTreeMap<String, Scan> = BTreeMap::new();
    let mut pending = vec![task.to_string()];
    while let Some(join) = pending.pop() {
        if scans.contains_key(&join) {
            continue;
        }
        let scan = scan(net, &graph, marking, busy, &join);
        if let Scan::Dependent(deps) = &scan {
            pending.extend(deps.iter().cloned());
        }
        scans.insert(join, scan);
    }

    match &scans[task] {
        Scan::Blocked => OrJoinVerdict::Waiting,
        Scan::Free => OrJoinVerdict::Ready,
        Scan::Dependent(_) => resolve_dependent(task, &scans),
    }
}

/// A dependent join waits unless everything it (transitively) depends on is
/// itself dependent and the chain leads back to it.
fn resolve_dependent(task: &str, scans: &BTreeMap<String, Scan>) -> OrJoinVerdict {
    let mut closure: BTreeSet<&str> = BTreeSet::new();
    let mut stack: Vec<&str> = match &scans[task] {
        Scan::Dependent(deps) => deps.iter().map(String::as_str).collect(),
        _ => Vec::new(),
    };
    while let Some(join) = stack.pop() {
        if !closure.insert(join) {
            continue;
        }
        match scans.get(join) {
            Some(Scan::Dependent(deps)) => stack.extend(deps.iter().map(String::as_str)),
            // Some other join can move (or is blocked on live work): wait for it.
            Some(Scan::Free) | Some(Scan::Blocked) | None => return OrJoinVerdict::Waiting,
        }
    }
    if closure.contains(task) {
        OrJoinVerdict::Cycle(closure.into_iter().map(str::to_string).collect())
    } else {
        OrJoinVerdict::Waiting
    }
}

fn has_marked_preset(net: &Net, marking: &Marking, task: &str) -> bool {
    net.preset(task).iter().any(|c| marking.is_marked(c))
}

fn scan(
    net: &Net,
    graph: &FlowGraph<'_>,
    marking: &Marking,
    busy: &BTreeSet<&str>,
    join: &str,
) -> Scan {
    let mut deps = BTreeSet::new();
    for condition in net.preset(join) {
        if marking.is_marked(condition) {
            continue;
        }
        if search_backwards(net, graph, marking, busy, join, condition, &mut deps) == Scan::Blocked {
            return Scan::Blocked;
        }
    }
    if deps.is_empty() {
        Scan::Free
    } else {
        Scan::Dependent(deps)
    }
}

fn search_backwards(
    net: &Net,
    graph: &FlowGraph<'_>,
    marking: &Marking,
    busy: &BTreeSet<&str>,
    join: &str,
    start: &str,
    deps: &mut BTreeSet<String>,
) -> Scan {
    let upstream: HashSet<&str> = graph.upstream_avoiding(start, join).into_iter().collect();
    for node in &upstream {
        match net.node(node) {
            Some(NetNode::Task(task)) if busy.contains(task.id.as_str()) => return Scan::Blocked,
            Some(NetNode::Condition(condition)) if marking.is_marked(&condition.id) => {
                let consumers: Vec<&str> = net
                    .postset(&condition.id)
                    .into_iter()
                    .filter(|t| upstream.contains(t))
                    .collect();
                let or_joins_only = consumers
                    .iter()
                    .all(|t| net.task(t).is_some_and(|t| t.join == JoinType::Or));
                if !or_joins_only {
                    return Scan::Blocked;
                }
                deps.extend(consumers.into_iter().map(str::to_string));
            }
            _ => {}
        }
    }
    Scan::Free
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::net::{NetBuilder, SplitType, Task};

    /// i -> split (OR) -> {c1 -> a, c2 -> b} -> join (OR) -> o
    fn diamond() -> Net {
        NetBuilder::new("n")
            .input_condition("i")
            .output_condition("o")
            .condition("c1")
            .condition("c2")
            .condition("d1")
            .condition("d2")
            .task(Task::new("split").split(SplitType::Or))
            .task(Task::new("a").decomposes_to("w"))
            .task(Task::new("b").decomposes_to("w"))
            .task(Task::new("join").join(JoinType::Or))
            .flow("i", "split")
            .flow_when("split", "c1", "x")
            .default_flow("split", "c2")
            .flow("c1", "a")
            .flow("c2", "b")
            .flow("a", "d1")
            .flow("b", "d2")
            .flow("d1", "join")
            .flow("d2", "join")
            .flow("join", "o")
            .build()
            .unwrap()
    }

    fn marking(conditions: &[&str]) -> Marking {
        let mut m = Marking::new();
        for c in conditions {
            m.add(c, 1);
        }
        m
    }

    #[test]
    fn waits_while_a_sibling_branch_is_busy() {
        let net = diamond();
        let busy = BTreeSet::from(["b"]);
        assert_eq!(
            analyse(&net, &marking(&["d1"]), &busy, "join"),
            OrJoinVerdict::Waiting
        );
    }

    #[test]
    fn waits_for_a_token_still_upstream() {
        let net = diamond();
        assert_eq!(
            analyse(&net, &marking(&["d1", "c2"]), &BTreeSet::new(), "join"),
            OrJoinVerdict::Waiting
        );
    }

    #[test]
    fn fires_once_the_other_branch_is_dead() {
        let net = diamond();
        assert_eq!(
            analyse(&net, &marking(&["d1"]), &BTreeSet::new(), "join"),
            OrJoinVerdict::Ready
        );
    }

    #[test]
    fn not_enabled_without_tokens() {
        let net = diamond();
        assert_eq!(
            analyse(&net, &marking(&["c1"]), &BTreeSet::new(), "join"),
            OrJoinVerdict::NotEnabled
        );
    }

    /// Two OR-joins each waiting on a token that only the other can consume.
    ///
    /// ```text
    /// i -> s (AND) -> p1 -> j1 (OR) -> q1 -> j2
    ///               \ p2 -> j2 (OR) -> q2 -> j1
    /// j1, j2 also flow to o via e (XOR join)
    /// ```
    fn vicious_circle() -> Net {
        NetBuilder::new("n")
            .input_condition("i")
            .output_condition("o")
            .condition("p1")
            .condition("p2")
            .condition("q1")
            .condition("q2")
            .condition("r")
            .task(Task::new("s"))
            .task(Task::new("j1").join(JoinType::Or))
            .task(Task::new("j2").join(JoinType::Or))
            .task(Task::new("e"))
            .flow("i", "s")
            .flow("s", "p1")
            .flow("s", "p2")
            .flow("p1", "j1")
            .flow("q2", "j1")
            .flow("p2", "j2")
            .flow("q1", "j2")
            .flow("j1", "q1")
            .flow("j1", "r")
            .flow("j2", "q2")
            .flow("j2", "r")
            .flow("r", "e")
            .flow("e", "o")
            .build()
            .unwrap()
    }

    #[test]
    fn mutual_or_joins_form_a_cycle() {
        let net = vicious_circle();
        let m = marking(&["p1", "p2"]);
        let expected = OrJoinVerdict::Cycle(vec!["j1".into(), "j2".into()]);
        assert_eq!(analyse(&net, &m, &BTreeSet::new(), "j1"), expected);
        assert_eq!(analyse(&net, &m, &BTreeSet::new(), "j2"), expected);
    }

    /// The circle above, plus an AND-join `x` that also consumes p2 but only
    /// leads to the output condition.
    fn vicious_circle_with_side_exit() -> Net {
        NetBuilder::new("n")
            .input_condition("i")
            .output_condition("o")
            .condition("p1")
            .condition("p2")
            .condition("q1")
            .condition("q2")
            .condition("g")
            .condition("r")
            .task(Task::new("s"))
            .task(Task::new("j1").join(JoinType::Or))
            .task(Task::new("j2").join(JoinType::Or))
            .task(Task::new("x").join(JoinType::And))
            .task(Task::new("e"))
            .flow("i", "s")
            .flow("s", "p1")
            .flow("s", "p2")
            .flow("s", "g")
            .flow("p1", "j1")
            .flow("q2", "j1")
            .flow("p2", "j2")
            .flow("p2", "x")
            .flow("g", "x")
            .flow("q1", "j2")
            .flow("j1", "q1")
            .flow("j1", "r")
            .flow("j2", "q2")
            .flow("j2", "r")
            .flow("x", "o")
            .flow("r", "e")
            .flow("e", "o")
            .build()
            .unwrap()
    }

    #[test]
    fn consumer_off_the_join_path_does_not_hide_a_cycle() {
        let net = vicious_circle_with_side_exit();
        let m = marking(&["p1", "p2"]);
        let expected = OrJoinVerdict::Cycle(vec!["j1".into(), "j2".into()]);
        assert_eq!(analyse(&net, &m, &BTreeSet::new(), "j1"), expected);
        assert_eq!(analyse(&net, &m, &BTreeSet::new(), "j2"), expected);
    }
}
