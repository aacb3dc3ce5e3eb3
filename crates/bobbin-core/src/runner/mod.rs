//! Net runner: the token game of one case.
//!
//! [`NetRunner`] holds no state of its own. Every call takes the case it
//! mutates, so the caller decides which lock protects it and whether the
//! result is committed. Side effects that need other cases or ports (sub-case
//! launch, resourcing, events) are returned as [`RunnerEffect`]s and carried
//! out by the engine after the case lock is released.

pub mod or_join;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::domain::case::Case;
use crate::domain::data::DataMap;
use crate::domain::errors::EngineError;
use crate::domain::ids::{CaseId, WorkItemId};
use crate::domain::net::{Flow, JoinType, MultiInstance, Net, SplitType, Task, TimerSpec, TimerTrigger};
use crate::domain::spec::Specification;
use crate::domain::work_item::{derive_parent_status, WorkItem, WorkItemStatus};
use crate::ports::{IdGenerator, PredicateEvaluator};

pub use self::or_join::{OrJoinCyclePolicy, OrJoinVerdict};

/// Participant recorded on items the engine runs itself (composite tasks).
pub const SYSTEM_PARTICIPANT: &str = "system";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerLimits {
    pub or_join_cycle_policy: OrJoinCyclePolicy,
    /// Firings allowed in one round before the round is aborted.
    pub max_round_steps: usize,
}

impl Default for RunnerLimits {
    fn default() -> Self {
        Self {
            or_join_cycle_policy: OrJoinCyclePolicy::default(),
            max_round_steps: 10_000,
        }
    }
}

/// Work left for the engine after the runner touched a case.
#[derive(Debug, Clone, PartialEq)]
pub enum RunnerEffect {
    TaskFired {
        task_id: String,
        work_item_id: Option<WorkItemId>,
    },
    /// An atomic item was fired and waits for resourcing.
    ItemFired {
        work_item_id: WorkItemId,
        task_id: String,
    },
    /// A composite item needs its sub-net started as a case with this id.
    SubCaseRequested {
        work_item_id: WorkItemId,
        sub_case_id: CaseId,
        net_id: String,
        data: DataMap,
    },
    ItemCancelled {
        work_item_id: WorkItemId,
        task_id: String,
    },
    ItemFailed {
        work_item_id: WorkItemId,
        task_id: String,
    },
    SubCaseCancelled {
        case_id: CaseId,
    },
    TaskCompleted {
        task_id: String,
    },
}

/// Where a running case stands once no task is enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quiescence {
    /// Work items are still active.
    Busy,
    Completed,
    /// Tokens are left but no task can consume them.
    Deadlocked,
    /// No token and no active item: the case waits for outside intervention.
    Stalled,
}

/// Deadline of a timer started at `now`. `None` if it would overflow.
pub fn timer_deadline(timer: &TimerSpec, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(timer.duration)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
}

pub struct NetRunner<'a> {
    spec: &'a Specification,
    evaluator: &'a dyn PredicateEvaluator,
    ids: &'a dyn IdGenerator,
    limits: RunnerLimits,
    now: DateTime<Utc>,
}

impl<'a> NetRunner<'a> {
    pub fn new(
        spec: &'a Specification,
        evaluator: &'a dyn PredicateEvaluator,
        ids: &'a dyn IdGenerator,
        limits: RunnerLimits,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            spec,
            evaluator,
            ids,
            limits,
            now,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// Definition of `task_id` in the case's net.
    pub fn task_of(&self, case: &Case, task_id: &str) -> Result<&'a Task, EngineError> {
        let net = self.net(case)?;
        self.task(net, task_id)
    }

    fn net(&self, case: &Case) -> Result<&'a Net, EngineError> {
        self.spec
            .net(&case.net_id)
            .ok_or_else(|| EngineError::not_found("net", &case.net_id))
    }

    fn task(&self, net: &'a Net, task_id: &str) -> Result<&'a Task, EngineError> {
        net.task(task_id)
            .ok_or_else(|| EngineError::not_found("task", task_id))
    }

    // ---- enabling ----

    /// Tasks enabled under the current marking, in id order.
    pub fn enabled_tasks(&self, case: &Case) -> Result<Vec<String>, EngineError> {
        let net = self.net(case)?;
        let busy = case.busy_tasks();
        let mut enabled = Vec::new();
        for task in net.tasks() {
            let preset = net.preset(&task.id);
            let on = match task.join {
                JoinType::And => {
                    !preset.is_empty() && preset.iter().all(|c| case.marking.is_marked(c))
                }
                JoinType::Xor => preset.iter().any(|c| case.marking.is_marked(c)),
                JoinType::Or => match or_join::analyse(net, &case.marking, &busy, &task.id) {
                    OrJoinVerdict::Ready => true,
                    OrJoinVerdict::NotEnabled | OrJoinVerdict::Waiting => false,
                    OrJoinVerdict::Cycle(cycle) => match self.limits.or_join_cycle_policy {
                        OrJoinCyclePolicy::Fire => {
                            tracing::debug!(task = %task.id, ?cycle, "firing OR-join in a cycle");
                            true
                        }
                        OrJoinCyclePolicy::Fail => {
                            return Err(EngineError::Synchronization {
                                task: task.id.clone(),
                                cycle,
                            });
                        }
                    },
                },
            };
            if on {
                enabled.push(task.id.clone());
            }
        }
        Ok(enabled)
    }

    /// Fire enabled tasks until none is left or the case stops running.
    pub fn run(&self, case: &mut Case, effects: &mut Vec<RunnerEffect>) -> Result<(), EngineError> {
        let mut steps = 0usize;
        while case.is_running() {
            let Some(task_id) = self.enabled_tasks(case)?.into_iter().next() else {
                break;
            };
            steps += 1;
            if steps > self.limits.max_round_steps {
                return Err(EngineError::StepLimitExceeded {
                    case: case.id.to_string(),
                    limit: self.limits.max_round_steps,
                });
            }
            self.fire(case, &task_id, effects)?;
        }
        Ok(())
    }

    /// Where the case stands after [`NetRunner::run`].
    pub fn quiescence(&self, case: &Case) -> Result<Quiescence, EngineError> {
        if case.has_active_items() {
            return Ok(Quiescence::Busy);
        }
        let net = self.net(case)?;
        if case.marking.is_marked(net.output_condition()) {
            Ok(Quiescence::Completed)
        } else if case.marking.is_empty() {
            Ok(Quiescence::Stalled)
        } else {
            Ok(Quiescence::Deadlocked)
        }
    }

    // ---- firing ----

    pub fn fire(
        &self,
        case: &mut Case,
        task_id: &str,
        effects: &mut Vec<RunnerEffect>,
    ) -> Result<(), EngineError> {
        let net = self.net(case)?;
        let task = self.task(net, task_id)?;
        consume(net, case, task);
        case.log("fire", Some(task.id.clone()), self.now);

        if task.is_empty_task() {
            effects.push(RunnerEffect::TaskFired {
                task_id: task.id.clone(),
                work_item_id: None,
            });
            return self.complete_task(net, case, task, DataMap::new(), effects);
        }

        let input = case.data.variables.clone();
        match &task.multi_instance {
            Some(mi) => self.fire_multi_instance(net, case, task, mi, input, effects),
            None => {
                let id = self.ids.work_item_id();
                effects.push(RunnerEffect::TaskFired {
                    task_id: task.id.clone(),
                    work_item_id: Some(id),
                });
                self.spawn_item(net, case, task, id, input, None, effects)
            }
        }
    }

    fn fire_multi_instance(
        &self,
        net: &Net,
        case: &mut Case,
        task: &Task,
        mi: &MultiInstance,
        input: DataMap,
        effects: &mut Vec<RunnerEffect>,
    ) -> Result<(), EngineError> {
        let inputs = instance_inputs(task, mi, &input)?;
        let parent_id = self.ids.work_item_id();
        effects.push(RunnerEffect::TaskFired {
            task_id: task.id.clone(),
            work_item_id: Some(parent_id),
        });

        let mut children = Vec::with_capacity(inputs.len());
        for child_input in inputs {
            let child_id = self.ids.work_item_id();
            self.spawn_item(net, case, task, child_id, child_input, Some(parent_id), effects)?;
            children.push(child_id);
        }

        let threshold = mi.threshold.min(children.len());
        let mut parent = WorkItem::new(parent_id, case.id, net.id(), &task.id, input, self.now);
        parent.become_parent(children, threshold, self.now)?;
        case.insert_item(parent);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_item(
        &self,
        net: &Net,
        case: &mut Case,
        task: &Task,
        id: WorkItemId,
        input: DataMap,
        parent: Option<WorkItemId>,
        effects: &mut Vec<RunnerEffect>,
    ) -> Result<(), EngineError> {
        let mut item = WorkItem::new(id, case.id, net.id(), &task.id, input.clone(), self.now);
        item.parent_id = parent;
        item.fire(self.now)?;
        if let Some(timer) = &task.timer
            && timer.trigger == TimerTrigger::OnEnabled
        {
            item.timer_deadline = timer_deadline(timer, self.now);
        }

        match self.spec.sub_net_of(net.id(), &task.id) {
            Some(sub_net) => {
                item.allocate(SYSTEM_PARTICIPANT, self.now)?;
                item.start(self.now)?;
                if let Some(timer) = &task.timer
                    && timer.trigger == TimerTrigger::OnStarted
                {
                    item.timer_deadline = timer_deadline(timer, self.now);
                }
                let sub_case_id = self.ids.case_id();
                item.sub_case_id = Some(sub_case_id);
                case.sub_cases.insert(sub_case_id, sub_net.id().to_string());
                effects.push(RunnerEffect::SubCaseRequested {
                    work_item_id: id,
                    sub_case_id,
                    net_id: sub_net.id().to_string(),
                    data: input,
                });
            }
            None => effects.push(RunnerEffect::ItemFired {
                work_item_id: id,
                task_id: task.id.clone(),
            }),
        }
        case.insert_item(item);
        Ok(())
    }

    // ---- completion ----

    /// Complete an item with `output`, then let the net move on.
    pub fn complete_item(
        &self,
        case: &mut Case,
        id: WorkItemId,
        output: DataMap,
        effects: &mut Vec<RunnerEffect>,
    ) -> Result<(), EngineError> {
        let now = self.now;
        case.with_item(id, |item| item.complete(output, now))?;
        self.item_finished(case, id, effects)
    }

    pub fn force_complete_item(
        &self,
        case: &mut Case,
        id: WorkItemId,
        output: DataMap,
        effects: &mut Vec<RunnerEffect>,
    ) -> Result<(), EngineError> {
        let now = self.now;
        case.with_item(id, |item| item.force_complete(output, now))?;
        self.item_finished(case, id, effects)
    }

    /// React to an item that reached a final status.
    ///
    /// A successful top-level item completes its task. A multi-instance child
    /// may complete or fail its parent. Afterwards the net runs to quiescence.
    pub fn item_finished(
        &self,
        case: &mut Case,
        id: WorkItemId,
        effects: &mut Vec<RunnerEffect>,
    ) -> Result<(), EngineError> {
        let item = case.item(id)?;
        match item.parent_id {
            Some(parent) => self.settle_parent(case, parent, effects)?,
            None if item.is_successful() => {
                let output = item.data_output.clone();
                let task_id = item.task_id.clone();
                let net = self.net(case)?;
                let task = self.task(net, &task_id)?;
                self.complete_task(net, case, task, output, effects)?;
            }
            None => {}
        }
        self.run(case, effects)
    }

    fn settle_parent(
        &self,
        case: &mut Case,
        parent_id: WorkItemId,
        effects: &mut Vec<RunnerEffect>,
    ) -> Result<(), EngineError> {
        let (task_id, verdict, outputs, pending) = {
            let parent = case.item(parent_id)?;
            if parent.status() != WorkItemStatus::Parent {
                return Ok(());
            }
            let children = parent
                .children
                .iter()
                .map(|id| case.item(*id))
                .collect::<Result<Vec<_>, _>>()?;
            let statuses: Vec<WorkItemStatus> = children.iter().map(|c| c.status()).collect();
            let threshold = parent.threshold.unwrap_or(children.len());
            let outputs: Vec<DataMap> = children
                .iter()
                .filter(|c| c.is_successful())
                .map(|c| c.data_output.clone())
                .collect();
            let pending: Vec<WorkItemId> = children
                .iter()
                .filter(|c| c.is_active())
                .map(|c| c.id)
                .collect();
            (
                parent.task_id.clone(),
                derive_parent_status(threshold, &statuses),
                outputs,
                pending,
            )
        };

        let now = self.now;
        match verdict {
            WorkItemStatus::Completed => {
                for child in pending {
                    self.cancel_item(case, child, "multi-instance threshold reached", effects)?;
                }
                let net = self.net(case)?;
                let task = self.task(net, &task_id)?;
                let output = aggregate(task, outputs);
                case.with_item(parent_id, |p| p.complete_parent(output.clone(), now))?;
                self.complete_task(net, case, task, output, effects)
            }
            WorkItemStatus::Failed => {
                case.with_item(parent_id, |p| p.fail("too few instances completed", now))?;
                effects.push(RunnerEffect::ItemFailed {
                    work_item_id: parent_id,
                    task_id,
                });
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Merge the task output, produce tokens, then apply the cancellation set.
    fn complete_task(
        &self,
        net: &Net,
        case: &mut Case,
        task: &Task,
        output: DataMap,
        effects: &mut Vec<RunnerEffect>,
    ) -> Result<(), EngineError> {
        case.data.merge(&output);
        for target in self.select_targets(net, case, task)? {
            case.marking.add(target, 1);
        }
        self.apply_cancellation_set(net, case, task, effects)?;
        case.log("complete", Some(task.id.clone()), self.now);
        effects.push(RunnerEffect::TaskCompleted {
            task_id: task.id.clone(),
        });
        Ok(())
    }

    fn select_targets<'n>(
        &self,
        net: &'n Net,
        case: &Case,
        task: &Task,
    ) -> Result<Vec<&'n str>, EngineError> {
        let flows: Vec<&Flow> = net.outgoing_flows(&task.id).collect();
        if task.split == SplitType::And {
            return Ok(flows.iter().map(|f| f.target.as_str()).collect());
        }

        let facts = case.data.as_value();
        let mut chosen = Vec::new();
        for flow in flows.iter().filter(|f| !f.is_default) {
            let holds = match &flow.predicate {
                Some(predicate) => self.evaluator.evaluate(predicate, &facts)?,
                None => true,
            };
            if holds {
                chosen.push(flow.target.as_str());
                if task.split == SplitType::Xor {
                    break;
                }
            }
        }
        if chosen.is_empty() {
            match flows.iter().find(|f| f.is_default) {
                Some(default) => chosen.push(default.target.as_str()),
                None => {
                    return Err(EngineError::Routing {
                        task: task.id.clone(),
                        reason: "no predicate held and there is no default flow".into(),
                    });
                }
            }
        }
        Ok(chosen)
    }

    fn apply_cancellation_set(
        &self,
        net: &Net,
        case: &mut Case,
        task: &Task,
        effects: &mut Vec<RunnerEffect>,
    ) -> Result<(), EngineError> {
        let reason = format!("cancelled by {}", task.id);
        for element in &task.cancellation_set {
            if net.condition(element).is_some() {
                case.marking.clear(element);
                continue;
            }
            let targets: Vec<WorkItemId> = case
                .active_items()
                .filter(|w| w.task_id == *element && w.parent_id.is_none())
                .map(|w| w.id)
                .collect();
            for id in targets {
                self.cancel_item(case, id, &reason, effects)?;
            }
        }
        Ok(())
    }

    /// Cancel an item and its children. Sub-cases are reported, not touched.
    pub fn cancel_item(
        &self,
        case: &mut Case,
        id: WorkItemId,
        reason: &str,
        effects: &mut Vec<RunnerEffect>,
    ) -> Result<(), EngineError> {
        let (task_id, sub_case, children) = {
            let item = case.item(id)?;
            if !item.is_active() {
                return Ok(());
            }
            (item.task_id.clone(), item.sub_case_id, item.children.clone())
        };
        for child in children {
            self.cancel_item(case, child, reason, effects)?;
        }
        let now = self.now;
        case.with_item(id, |item| item.cancel(reason, now))?;
        effects.push(RunnerEffect::ItemCancelled {
            work_item_id: id,
            task_id,
        });
        if let Some(sub_case) = sub_case
            && case.sub_cases.remove(&sub_case).is_some()
        {
            effects.push(RunnerEffect::SubCaseCancelled { case_id: sub_case });
        }
        Ok(())
    }
}

fn consume(net: &Net, case: &mut Case, task: &Task) {
    let preset = net.preset(&task.id);
    match task.join {
        JoinType::And | JoinType::Or => {
            for condition in preset {
                case.marking.consume(condition);
            }
        }
        JoinType::Xor => {
            if let Some(condition) = preset.into_iter().find(|c| case.marking.is_marked(c)) {
                case.marking.consume(condition);
            }
        }
    }
}

/// One input document per instance.
fn instance_inputs(
    task: &Task,
    mi: &MultiInstance,
    input: &DataMap,
) -> Result<Vec<DataMap>, EngineError> {
    let Some(variable) = &mi.split_variable else {
        return Ok(vec![input.clone(); mi.min]);
    };
    let elements = match input.get(variable) {
        Some(Value::Array(elements)) => elements,
        _ => {
            return Err(EngineError::Routing {
                task: task.id.clone(),
                reason: format!("multi-instance variable `{variable}` is not an array"),
            });
        }
    };
    if elements.len() < mi.min {
        return Err(EngineError::Routing {
            task: task.id.clone(),
            reason: format!(
                "{} instances requested, at least {} required",
                elements.len(),
                mi.min
            ),
        });
    }
    Ok(elements
        .iter()
        .take(mi.max)
        .map(|element| {
            let mut data = input.clone();
            data.insert(variable.clone(), element.clone());
            data
        })
        .collect())
}

/// Instance outputs as an array under the output variable, or merged in order.
fn aggregate(task: &Task, outputs: Vec<DataMap>) -> DataMap {
    let mut merged = DataMap::new();
    match task
        .multi_instance
        .as_ref()
        .and_then(|mi| mi.output_variable.as_ref())
    {
        Some(variable) => {
            let values = outputs.into_iter().map(Value::Object).collect();
            merged.insert(variable.clone(), Value::Array(values));
        }
        None => {
            for output in outputs {
                merged.extend(output);
            }
        }
    }
    merged
}
