//! JsonSpecificationParser - JSON 形式の仕様ドキュメント
//!
//! # ドキュメント形式
//! ```json
//! {
//!   "id": "order", "name": "Order handling", "version": "1.0",
//!   "decompositions": [
//!     { "id": "main", "isRootNet": true, "processControlElements": {
//!         "inputCondition":  { "id": "start", "flowsInto": [{ "nextElementRef": "approve" }] },
//!         "outputCondition": { "id": "end" },
//!         "conditions": [],
//!         "tasks": [{ "id": "approve", "decomposesTo": "manual",
//!                     "flowsInto": [{ "nextElementRef": "end" }] }]
//!     }},
//!     { "id": "manual", "name": "Manual approval" }
//!   ]
//! }
//! ```
//!
//! `processControlElements` を持つ decomposition はネット、それ以外は atomic。
//! 全ネットの構造エラーはまとめて1つの EngineError::Validation で返す。

use std::time::Duration;

use serde::Deserialize;

use crate::domain::errors::{EngineError, ValidationIssue};
use crate::domain::net::{
    Condition, ConditionKind, Flow, JoinType, MultiInstance, Net, NetBuilder, SplitType, Task,
    TimerAction, TimerSpec, TimerTrigger,
};
use crate::domain::participant::ResourcingSpec;
use crate::domain::spec::{Decomposition, DecompositionKind, Specification};
use crate::ports::SpecificationParser;

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSpecificationParser;

impl SpecificationParser for JsonSpecificationParser {
    fn parse(&self, source: &str) -> Result<Specification, EngineError> {
        let doc: SpecDoc =
            serde_json::from_str(source).map_err(|e| EngineError::Parse(e.to_string()))?;
        doc.into_specification()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpecDoc {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    uri: Option<String>,
    #[serde(default)]
    documentation: Option<String>,
    #[serde(default)]
    metadata: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    root_net: Option<String>,
    decompositions: Vec<DecompositionDoc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DecompositionDoc {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    documentation: Option<String>,
    #[serde(default)]
    is_root_net: bool,
    #[serde(default)]
    process_control_elements: Option<ControlElementsDoc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ControlElementsDoc {
    input_condition: ConditionDoc,
    output_condition: ConditionDoc,
    #[serde(default)]
    conditions: Vec<ConditionDoc>,
    #[serde(default)]
    tasks: Vec<TaskDoc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConditionDoc {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    flows_into: Vec<FlowDoc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FlowDoc {
    next_element_ref: String,
    #[serde(default)]
    predicate: Option<String>,
    #[serde(default)]
    is_default_flow: bool,
    #[serde(default)]
    ordering: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskDoc {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    join: JoinType,
    #[serde(default)]
    split: SplitType,
    #[serde(default)]
    decomposes_to: Option<String>,
    #[serde(default)]
    flows_into: Vec<FlowDoc>,
    #[serde(default)]
    multiple_instance: Option<MultiInstanceDoc>,
    #[serde(default)]
    removes_tokens: Vec<String>,
    #[serde(default)]
    timer: Option<TimerDoc>,
    #[serde(default)]
    resourcing: Option<ResourcingSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MultiInstanceDoc {
    minimum: usize,
    maximum: usize,
    threshold: usize,
    #[serde(default)]
    split_variable: Option<String>,
    #[serde(default)]
    output_variable: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TimerDoc {
    trigger: TimerTrigger,
    duration_ms: u64,
    action: TimerAction,
}

impl SpecDoc {
    fn into_specification(self) -> Result<Specification, EngineError> {
        let root = self.root_net.clone().or_else(|| {
            self.decompositions
                .iter()
                .find(|d| d.is_root_net)
                .or_else(|| {
                    self.decompositions
                        .iter()
                        .find(|d| d.process_control_elements.is_some())
                })
                .map(|d| d.id.clone())
        });

        let mut builder = Specification::builder(self.id.as_str(), self.name.unwrap_or_default());
        if let Some(version) = self.version {
            builder = builder.version(version);
        }
        if let Some(uri) = self.uri {
            builder = builder.uri(uri);
        }
        if let Some(doc) = self.documentation {
            builder = builder.documentation(doc);
        }
        for (key, value) in self.metadata {
            builder = builder.metadata(key, value);
        }

        let mut issues: Vec<ValidationIssue> = Vec::new();
        for decomposition in self.decompositions {
            match decomposition.process_control_elements {
                Some(elements) => match build_net(&decomposition.id, elements) {
                    Ok(net) => builder = builder.net(net),
                    Err(EngineError::Validation { issues: found, .. }) => issues.extend(found),
                    Err(other) => return Err(other),
                },
                None => {
                    builder = builder.decomposition(Decomposition {
                        id: decomposition.id,
                        kind: DecompositionKind::Atomic,
                        name: decomposition.name,
                        documentation: decomposition.documentation,
                    })
                }
            }
        }
        if let Some(root) = root {
            builder = builder.root(root);
        }

        if !issues.is_empty() {
            return Err(EngineError::Validation {
                specification: self.id.into(),
                issues,
            });
        }
        builder.build()
    }
}

fn build_net(id: &str, elements: ControlElementsDoc) -> Result<Net, EngineError> {
    let mut builder = NetBuilder::new(id);
    let mut flows: Vec<(String, FlowDoc)> = Vec::new();

    let mut add_condition = |builder: NetBuilder, doc: ConditionDoc, kind: ConditionKind| {
        flows.extend(doc.flows_into.into_iter().map(|f| (doc.id.clone(), f)));
        builder.condition_with(Condition {
            name: doc.name,
            ..Condition::new(doc.id, kind)
        })
    };
    builder = add_condition(builder, elements.input_condition, ConditionKind::Input);
    builder = add_condition(builder, elements.output_condition, ConditionKind::Output);
    for condition in elements.conditions {
        builder = add_condition(builder, condition, ConditionKind::Ordinary);
    }

    for doc in elements.tasks {
        flows.extend(doc.flows_into.into_iter().map(|f| (doc.id.clone(), f)));
        let mut task = Task::new(doc.id).join(doc.join).split(doc.split);
        task.name = doc.name;
        task.decomposition_id = doc.decomposes_to;
        task.cancellation_set = doc.removes_tokens;
        task.multi_instance = doc.multiple_instance.map(|mi| MultiInstance {
            min: mi.minimum,
            max: mi.maximum,
            threshold: mi.threshold,
            split_variable: mi.split_variable,
            output_variable: mi.output_variable,
        });
        task.timer = doc.timer.map(|t| TimerSpec {
            trigger: t.trigger,
            duration: Duration::from_millis(t.duration_ms),
            action: t.action,
        });
        task.resourcing = doc.resourcing;
        builder = builder.task(task);
    }

    for (index, (source, flow)) in flows.into_iter().enumerate() {
        builder = builder.flow_with(Flow {
            id: format!("{source}->{}", flow.next_element_ref),
            source,
            target: flow.next_element_ref,
            predicate: flow.predicate,
            is_default: flow.is_default_flow,
            ordering: flow.ordering.unwrap_or(index),
        });
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn order_doc() -> serde_json::Value {
        json!({
            "id": "order",
            "name": "Order handling",
            "version": "2.1",
            "metadata": {"owner": "ops"},
            "decompositions": [
                {"id": "main", "isRootNet": true, "processControlElements": {
                    "inputCondition": {"id": "start", "flowsInto": [{"nextElementRef": "check"}]},
                    "outputCondition": {"id": "end"},
                    "tasks": [
                        {"id": "check", "split": "xor", "decomposesTo": "manual",
                         "flowsInto": [
                            {"nextElementRef": "ship", "predicate": "ok == true"},
                            {"nextElementRef": "reject", "isDefaultFlow": true}
                         ]},
                        {"id": "ship", "decomposesTo": "manual", "flowsInto": [{"nextElementRef": "end"}],
                         "timer": {"trigger": "on_enabled", "durationMs": 60000, "action": "escalate"},
                         "resourcing": {"roles": ["clerk"], "strategy": "first_available"}},
                        {"id": "reject", "flowsInto": [{"nextElementRef": "end"}]}
                    ]
                }},
                {"id": "manual", "name": "Manual step"}
            ]
        })
    }

    #[test]
    fn parses_nets_atomic_decompositions_and_task_details() {
        let spec = JsonSpecificationParser
            .parse(&order_doc().to_string())
            .unwrap();
        assert_eq!(spec.version(), "2.1");
        assert_eq!(spec.root_net_id(), "main");
        assert_eq!(
            spec.decomposition("manual").map(|d| d.kind),
            Some(DecompositionKind::Atomic)
        );
        let net = spec.root_net().unwrap();
        assert_eq!(net.postset("check"), vec!["c_check_ship", "c_check_reject"]);
        let ship = net.task("ship").unwrap();
        assert_eq!(ship.timer.as_ref().unwrap().duration, Duration::from_secs(60));
        assert_eq!(ship.resourcing.as_ref().unwrap().roles, vec!["clerk"]);
        assert!(net.task("reject").unwrap().is_empty_task());
    }

    #[test]
    fn invalid_net_fails_the_whole_load() {
        let mut doc = order_doc();
        doc["decompositions"][0]["processControlElements"]["tasks"][2]["flowsInto"] = json!([]);
        doc["decompositions"][0]["processControlElements"]["tasks"][0]["decomposesTo"] =
            json!("ghost");
        let err = JsonSpecificationParser.parse(&doc.to_string()).unwrap_err();
        match err {
            EngineError::Validation { issues, .. } => {
                assert!(issues
                    .iter()
                    .any(|i| matches!(i, ValidationIssue::DisconnectedTask { task, .. } if task == "reject")));
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        let err = JsonSpecificationParser.parse("{ not json").unwrap_err();
        assert!(matches!(err, EngineError::Parse(_)));
    }
}
