//! Structural validation of nets and specifications.
//!
//! All checks collect issues rather than failing fast, so a rejected
//! specification reports everything that is wrong with it at once.

use super::errors::ValidationIssue;
use super::graph::FlowGraph;
use super::net::{ConditionKind, Net, SplitType};
use super::spec::Specification;

/// Checks that only involve one net.
pub(crate) fn net_issues(net: &Net) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    let net_id = net.id().to_string();

    for flow in net.flows() {
        let source = net.node(&flow.source);
        let target = net.node(&flow.target);
        for (endpoint, node) in [(&flow.source, source), (&flow.target, target)] {
            if node.is_none() {
                issues.push(ValidationIssue::DanglingFlow {
                    net: net_id.clone(),
                    flow: flow.id.clone(),
                    element: endpoint.clone(),
                });
            }
        }
        let bipartite = match (net.condition(&flow.source), net.condition(&flow.target)) {
            (Some(_), None) => net.task(&flow.target).is_some(),
            (None, Some(_)) => net.task(&flow.source).is_some(),
            _ => false,
        };
        if source.is_some() && target.is_some() && !bipartite {
            issues.push(ValidationIssue::NonBipartiteFlow {
                net: net_id.clone(),
                flow: flow.id.clone(),
            });
        }
    }

    if net.incoming_flows(net.input_condition()).next().is_some() {
        issues.push(ValidationIssue::InputHasIncoming {
            net: net_id.clone(),
            condition: net.input_condition().to_string(),
        });
    }
    if net.outgoing_flows(net.output_condition()).next().is_some() {
        issues.push(ValidationIssue::OutputHasOutgoing {
            net: net_id.clone(),
            condition: net.output_condition().to_string(),
        });
    }

    for task in net.tasks() {
        for (direction, count) in [
            ("incoming", net.incoming_flows(&task.id).count()),
            ("outgoing", net.outgoing_flows(&task.id).count()),
        ] {
            if count == 0 {
                issues.push(ValidationIssue::DisconnectedTask {
                    net: net_id.clone(),
                    task: task.id.clone(),
                    direction: direction.to_string(),
                });
            }
        }

        let outgoing: Vec<_> = net.outgoing_flows(&task.id).collect();
        let defaults = outgoing.iter().filter(|f| f.is_default).count();
        if defaults > 1 {
            issues.push(ValidationIssue::MultipleDefaultFlows {
                net: net_id.clone(),
                task: task.id.clone(),
            });
        }
        // An XOR/OR split must always be able to route somewhere.
        if task.split != SplitType::And && !outgoing.is_empty() {
            let has_fallback = outgoing
                .iter()
                .any(|f| f.is_default || f.predicate.is_none());
            if !has_fallback {
                issues.push(ValidationIssue::UnroutableSplit {
                    net: net_id.clone(),
                    task: task.id.clone(),
                });
            }
        }

        if let Some(mi) = &task.multi_instance {
            let reason = mi.problems().or_else(|| {
                task.decomposition_id
                    .is_none()
                    .then(|| "multi-instance tasks need a decomposition".to_string())
            });
            if let Some(reason) = reason {
                issues.push(ValidationIssue::InvalidMultiInstance {
                    net: net_id.clone(),
                    task: task.id.clone(),
                    reason,
                });
            }
        }

        for element in &task.cancellation_set {
            if net.node(element).is_none() {
                issues.push(ValidationIssue::DanglingCancellation {
                    net: net_id.clone(),
                    task: task.id.clone(),
                    element: element.clone(),
                });
            }
        }
    }

    let reachable = FlowGraph::from_net(net).reachable_from(net.input_condition());
    let unreachable = net
        .conditions()
        .filter(|c| c.kind != ConditionKind::Input)
        .map(|c| c.id.as_str())
        .chain(net.tasks().map(|t| t.id.as_str()))
        .filter(|id| !reachable.contains(id));
    for element in unreachable {
        issues.push(ValidationIssue::Unreachable {
            net: net_id.clone(),
            element: element.to_string(),
        });
    }

    issues
}

/// Checks across the whole specification (root net, decomposition references).
pub(crate) fn specification_issues(spec: &Specification) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    if spec.net(spec.root_net_id()).is_none() {
        issues.push(ValidationIssue::MissingRootNet(
            spec.root_net_id().to_string(),
        ));
    }
    for net in spec.nets() {
        issues.extend(net_issues(net));
        for (task, decomposition) in net.referenced_decompositions() {
            if spec.decomposition(decomposition).is_none() {
                issues.push(ValidationIssue::DanglingDecomposition {
                    net: net.id().to_string(),
                    task: task.to_string(),
                    decomposition: decomposition.to_string(),
                });
            }
        }
    }
    issues
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::net::{NetBuilder, Task};
    use crate::domain::EngineError;
    use rstest::rstest;

    fn issues_of(result: Result<Net, EngineError>) -> Vec<ValidationIssue> {
        match result {
            Err(EngineError::Validation { issues, .. }) => issues,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn orphan_task_is_unreachable() {
        let issues = issues_of(
            NetBuilder::new("n")
                .input_condition("i")
                .output_condition("o")
                .condition("island")
                .task(Task::new("a"))
                .task(Task::new("orphan"))
                .flow("i", "a")
                .flow("a", "o")
                .flow("island", "orphan")
                .flow("orphan", "o")
                .build(),
        );
        assert!(issues.contains(&ValidationIssue::Unreachable {
            net: "n".into(),
            element: "orphan".into()
        }));
        assert!(issues.contains(&ValidationIssue::Unreachable {
            net: "n".into(),
            element: "island".into()
        }));
    }

    #[test]
    fn condition_to_condition_flow_is_not_bipartite() {
        let issues = issues_of(
            NetBuilder::new("n")
                .input_condition("i")
                .output_condition("o")
                .flow("i", "o")
                .build(),
        );
        assert!(issues
            .iter()
            .any(|i| matches!(i, ValidationIssue::NonBipartiteFlow { .. })));
    }

    #[test]
    fn xor_split_without_fallback_is_rejected() {
        let issues = issues_of(
            NetBuilder::new("n")
                .input_condition("i")
                .output_condition("o")
                .condition("c1")
                .condition("c2")
                .task(Task::new("choose").split(SplitType::Xor))
                .task(Task::new("left"))
                .task(Task::new("right"))
                .flow("i", "choose")
                .flow_when("choose", "c1", "x > 1")
                .flow_when("choose", "c2", "x <= 1")
                .flow("c1", "left")
                .flow("c2", "right")
                .flow("left", "o")
                .flow("right", "o")
                .build(),
        );
        assert_eq!(
            issues,
            vec![ValidationIssue::UnroutableSplit {
                net: "n".into(),
                task: "choose".into()
            }]
        );
    }

    #[rstest]
    #[case(SplitType::Xor)]
    #[case(SplitType::Or)]
    fn single_predicated_flow_needs_a_fallback(#[case] split: SplitType) {
        let issues = issues_of(
            NetBuilder::new("n")
                .input_condition("i")
                .output_condition("o")
                .task(Task::new("route").split(split))
                .flow("i", "route")
                .flow_when("route", "o", "amount > 100")
                .build(),
        );
        assert_eq!(
            issues,
            vec![ValidationIssue::UnroutableSplit {
                net: "n".into(),
                task: "route".into()
            }]
        );
    }

    #[test]
    fn single_unconditional_flow_is_routable() {
        let net = NetBuilder::new("n")
            .input_condition("i")
            .output_condition("o")
            .task(Task::new("route").split(SplitType::Xor))
            .flow("i", "route")
            .flow("route", "o")
            .build();
        assert!(net.is_ok());
    }

    #[test]
    fn dangling_cancellation_target_is_reported() {
        let issues = issues_of(
            NetBuilder::new("n")
                .input_condition("i")
                .output_condition("o")
                .task(Task::new("a").cancels("ghost"))
                .flow("i", "a")
                .flow("a", "o")
                .build(),
        );
        assert!(issues
            .iter()
            .any(|i| matches!(i, ValidationIssue::DanglingCancellation { element, .. } if element == "ghost")));
    }
}
