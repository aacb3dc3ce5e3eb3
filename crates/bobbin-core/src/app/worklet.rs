//! WorkletExecutor - RDR による例外処理
//!
//! 例外が起きると (タスク, 例外種別) の RDR ツリーでワークレットを選び、
//! WorkletCase を作ってアクションを順に実行する。
//!
//! # 設計原則
//! - エンジンは直接触らない。アクションは WorkletHost 経由で実行する
//! - host を呼ぶ間は executor 自身のロックも持たない（host から再入されるため）
//! - `Compensate` は別仕様のケースを起動して待つ。完了はエンジンが
//!   [`WorkletExecutor::compensation_finished`] で知らせる

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use crate::domain::errors::EngineError;
use crate::domain::events::{DomainEvent, EventEnvelope};
use crate::domain::exception::ExceptionContext;
use crate::domain::ids::{CaseId, WorkletCaseId};
use crate::domain::rdr::{RdrTree, RuleKey, RuleSet, Selection};
use crate::domain::worklet::{WorkletAction, WorkletCase, WorkletDefinition, WorkletResult};
use crate::ports::{Clock, EventSink, IdGenerator, PredicateEvaluator, Repository, WorkletHost};

#[derive(Default)]
struct ExecutorState {
    cases: BTreeMap<WorkletCaseId, WorkletCase>,
    /// Compensation cases that finished before their launch call returned.
    finished_early: HashMap<CaseId, bool>,
}

/// Outcome of one action.
enum Step {
    Done(String),
    Launched(CaseId),
}

/// WorkletExecutor はルール・ワークレット定義・実行中の WorkletCase を持つ
pub struct WorkletExecutor {
    rules: RwLock<RuleSet>,
    definitions: RwLock<BTreeMap<String, WorkletDefinition>>,
    state: Mutex<ExecutorState>,
    evaluator: Arc<dyn PredicateEvaluator>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
    repository: Arc<dyn Repository<WorkletCase>>,
}

impl WorkletExecutor {
    pub fn new(
        evaluator: Arc<dyn PredicateEvaluator>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
        repository: Arc<dyn Repository<WorkletCase>>,
    ) -> Self {
        Self {
            rules: RwLock::new(RuleSet::new()),
            definitions: RwLock::new(BTreeMap::new()),
            state: Mutex::new(ExecutorState::default()),
            evaluator,
            ids,
            clock,
            events,
            repository,
        }
    }

    // ---- rules & definitions ----

    pub async fn register_worklet(&self, definition: WorkletDefinition) {
        tracing::debug!(worklet = %definition.id, actions = definition.actions.len(), "worklet registered");
        self.definitions
            .write()
            .await
            .insert(definition.id.clone(), definition);
    }

    pub async fn worklet(&self, id: &str) -> Option<WorkletDefinition> {
        self.definitions.read().await.get(id).cloned()
    }

    /// Replace the whole tree for `key`.
    pub async fn set_tree(&self, key: RuleKey, tree: RdrTree) {
        self.rules.write().await.insert(key, tree);
    }

    /// Attach a rule under `parent` of the tree for `key` (created on first use).
    pub async fn add_rule(
        &self,
        key: RuleKey,
        parent: usize,
        on_true: bool,
        condition: impl Into<String>,
        conclusion: impl Into<String>,
    ) -> Result<usize, EngineError> {
        self.rules
            .write()
            .await
            .tree_mut(key)
            .add_rule(parent, on_true, condition, conclusion, None)
    }

    pub async fn rules(&self) -> RuleSet {
        self.rules.read().await.clone()
    }

    /// The tree that decides `context` and where its walk stopped.
    pub async fn select(
        &self,
        context: &ExceptionContext,
    ) -> Result<Option<(RuleKey, Selection)>, EngineError> {
        let facts = context.facts();
        self.rules.read().await.select(
            context.task_id.as_deref(),
            context.exception,
            |condition| self.evaluator.evaluate(condition, &facts),
        )
    }

    /// Add a rule at the point where `context`'s evaluation ended, with the
    /// context as its cornerstone. Earlier cases that do not satisfy the new
    /// condition keep their conclusion.
    pub async fn refine(
        &self,
        context: &ExceptionContext,
        condition: impl Into<String>,
        conclusion: impl Into<String>,
    ) -> Result<usize, EngineError> {
        let facts = context.facts();
        let holds = |c: &str| self.evaluator.evaluate(c, &facts);
        let mut rules = self.rules.write().await;
        let (key, selection) = match rules.select(context.task_id.as_deref(), context.exception, holds)? {
            Some(found) => found,
            None => {
                let key = match (&context.task_id, context.exception.is_item_level()) {
                    (Some(task), true) => RuleKey::for_task(task.clone(), context.exception),
                    _ => RuleKey::case_level(context.exception),
                };
                let selection = rules.tree_mut(key.clone()).select(holds)?;
                (key, selection)
            }
        };
        let index = rules
            .tree_mut(key.clone())
            .refine(&selection, condition, conclusion, facts)?;
        tracing::info!(
            exception = %key.exception,
            task = ?key.task,
            node = index,
            "rule tree refined"
        );
        Ok(index)
    }

    // ---- execution ----

    /// Select a worklet for `context` and run it.
    ///
    /// No concluding rule gives an unsuccessful result. A conclusion naming an
    /// unknown worklet is `WorkletNotFound`.
    pub async fn handle(
        &self,
        host: &dyn WorkletHost,
        context: ExceptionContext,
    ) -> Result<WorkletResult, EngineError> {
        let worklet_id = match self.select(&context).await? {
            Some((_, Selection {
                conclusion: Some(worklet_id),
                ..
            })) => worklet_id,
            _ => {
                return Ok(WorkletResult::unhandled(format!(
                    "no rule concluded for {} exception",
                    context.exception
                )));
            }
        };
        if self.worklet(&worklet_id).await.is_none() {
            return Err(EngineError::WorkletNotFound {
                exception: context.exception,
                task: context.task_id.clone(),
            });
        }

        let now = self.clock.now();
        let mut case = WorkletCase::new(self.ids.worklet_case_id(), worklet_id.clone(), context, now);
        case.start()?;
        let id = case.id;
        let parent = case.parent_case_id;
        tracing::info!(
            worklet = %worklet_id,
            worklet_case = %id,
            case = %parent,
            exception = %case.context.exception,
            "worklet started"
        );
        self.store(case).await?;
        self.emit(DomainEvent::WorkletStarted {
            worklet_case_id: id,
            worklet_id,
            case_id: parent,
        })
        .await;
        self.drive(host, id).await
    }

    /// Report that a compensation case launched by `worklet_case` ended.
    pub async fn compensation_finished(
        &self,
        host: &dyn WorkletHost,
        worklet_case: WorkletCaseId,
        compensation_case: CaseId,
        success: bool,
    ) -> Result<WorkletResult, EngineError> {
        {
            let mut state = self.state.lock().await;
            let case = state
                .cases
                .get_mut(&worklet_case)
                .ok_or_else(|| EngineError::not_found("worklet case", worklet_case))?;
            if case.compensation_case != Some(compensation_case) {
                // Still inside launch_compensation; drive() picks this up.
                state.finished_early.insert(compensation_case, success);
                return Ok(WorkletResult::from_case(&state.cases[&worklet_case]));
            }
            case.compensation_case = None;
        }
        if success {
            self.drive(host, worklet_case).await
        } else {
            self.finish_failed(worklet_case, "compensation case did not complete".into())
                .await
        }
    }

    /// Run actions from `next_action` until the list ends, an action fails,
    /// or a compensation case has to be awaited.
    async fn drive(
        &self,
        host: &dyn WorkletHost,
        id: WorkletCaseId,
    ) -> Result<WorkletResult, EngineError> {
        loop {
            let snapshot = self.worklet_case(id).await?;
            let definition = self.worklet(&snapshot.worklet_id).await.ok_or_else(|| {
                EngineError::WorkletNotFound {
                    exception: snapshot.context.exception,
                    task: snapshot.context.task_id.clone(),
                }
            })?;
            let Some(action) = definition.actions.get(snapshot.next_action).cloned() else {
                return self.finish_completed(id).await;
            };

            let step = match self.perform(host, &snapshot, action).await {
                Ok(step) => step,
                Err(err) => return self.finish_failed(id, err.to_string()).await,
            };

            let mut state = self.state.lock().await;
            let early = match &step {
                Step::Launched(case_id) => Some(state.finished_early.remove(case_id)),
                Step::Done(_) => None,
            };
            let case = state
                .cases
                .get_mut(&id)
                .ok_or_else(|| EngineError::not_found("worklet case", id))?;
            case.next_action += 1;
            match step {
                Step::Done(message) => case.results.push(message),
                Step::Launched(case_id) => {
                    case.results.push(format!("compensation case {case_id} launched"));
                    match early.flatten() {
                        Some(true) => {}
                        Some(false) => {
                            drop(state);
                            return self
                                .finish_failed(id, "compensation case did not complete".into())
                                .await;
                        }
                        None => {
                            case.compensation_case = Some(case_id);
                            let waiting = case.clone();
                            drop(state);
                            tracing::debug!(worklet_case = %id, compensation = %case_id, "waiting for compensation");
                            self.repository.save(waiting.clone()).await?;
                            return Ok(WorkletResult::from_case(&waiting));
                        }
                    }
                }
            }
            let updated = case.clone();
            drop(state);
            self.repository.save(updated).await?;
        }
    }

    async fn perform(
        &self,
        host: &dyn WorkletHost,
        case: &WorkletCase,
        action: WorkletAction,
    ) -> Result<Step, EngineError> {
        let target = case.parent_case_id;
        let reason = format!("worklet {} ({} exception)", case.worklet_id, case.context.exception);
        let item = || {
            case.parent_work_item_id.ok_or_else(|| {
                EngineError::not_found("work item", format!("of worklet case {}", case.id))
            })
        };
        let label = format!("{action:?}");
        match action {
            WorkletAction::SuspendCase => host.suspend_case(target).await?,
            WorkletAction::ContinueCase => host.resume_case(target).await?,
            WorkletAction::RemoveCase => host.cancel_case(target, &reason).await?,
            WorkletAction::FailCase => host.fail_case(target, &reason).await?,
            WorkletAction::SuspendItem => host.suspend_item(target, item()?).await?,
            WorkletAction::ContinueItem => host.resume_item(target, item()?).await?,
            WorkletAction::RemoveItem => host.cancel_item(target, item()?, &reason).await?,
            WorkletAction::FailItem => host.fail_item(target, item()?, &reason).await?,
            WorkletAction::ForceCompleteItem => host.force_complete_item(target, item()?).await?,
            WorkletAction::UpdateCaseData { data } => host.update_case_data(target, data).await?,
            WorkletAction::Compensate { specification_id } => {
                let launched = host
                    .launch_compensation(&specification_id, case.context.case_data.clone(), case.id)
                    .await?;
                return Ok(Step::Launched(launched));
            }
        }
        Ok(Step::Done(label))
    }

    async fn finish_completed(&self, id: WorkletCaseId) -> Result<WorkletResult, EngineError> {
        let now = self.clock.now();
        let case = {
            let mut state = self.state.lock().await;
            let case = state
                .cases
                .get_mut(&id)
                .ok_or_else(|| EngineError::not_found("worklet case", id))?;
            case.complete(now)?;
            case.clone()
        };
        tracing::info!(worklet_case = %id, worklet = %case.worklet_id, "worklet completed");
        self.finish(case).await
    }

    async fn finish_failed(
        &self,
        id: WorkletCaseId,
        reason: String,
    ) -> Result<WorkletResult, EngineError> {
        let now = self.clock.now();
        let case = {
            let mut state = self.state.lock().await;
            let case = state
                .cases
                .get_mut(&id)
                .ok_or_else(|| EngineError::not_found("worklet case", id))?;
            case.fail(reason.as_str(), now)?;
            case.clone()
        };
        tracing::warn!(worklet_case = %id, worklet = %case.worklet_id, %reason, "worklet failed");
        self.finish(case).await
    }

    async fn finish(&self, case: WorkletCase) -> Result<WorkletResult, EngineError> {
        let result = WorkletResult::from_case(&case);
        let worklet_case_id = case.id;
        self.repository.save(case).await?;
        self.emit(DomainEvent::WorkletFinished {
            worklet_case_id,
            success: result.success,
        })
        .await;
        Ok(result)
    }

    // ---- worklet cases ----

    pub async fn worklet_case(&self, id: WorkletCaseId) -> Result<WorkletCase, EngineError> {
        self.state
            .lock()
            .await
            .cases
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("worklet case", id))
    }

    pub async fn worklet_cases(&self) -> Vec<WorkletCase> {
        self.state.lock().await.cases.values().cloned().collect()
    }

    /// Replace every worklet case (engine checkpoint restore).
    pub async fn restore(&self, cases: Vec<WorkletCase>) -> Result<(), EngineError> {
        {
            let mut state = self.state.lock().await;
            state.finished_early.clear();
            state.cases = cases.iter().map(|c| (c.id, c.clone())).collect();
        }
        for case in cases {
            self.repository.save(case).await?;
        }
        Ok(())
    }

    async fn store(&self, case: WorkletCase) -> Result<(), EngineError> {
        self.state.lock().await.cases.insert(case.id, case.clone());
        self.repository.save(case).await
    }

    async fn emit(&self, event: DomainEvent) {
        let envelope = EventEnvelope {
            at: self.clock.now(),
            event,
        };
        if let Err(err) = self.events.emit(envelope).await {
            tracing::warn!(error = %err, "event sink rejected worklet event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::data::DataMap;
    use crate::domain::exception::ExceptionType;
    use crate::domain::ids::{SpecificationId, WorkItemId};
    use crate::impls::{InMemoryRepository, MemoryEventSink, SimpleEvaluator};
    use crate::ports::{FixedClock, UlidGenerator};
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;

    /// Records every call; fails on `fail_case`.
    #[derive(Default)]
    struct RecordingHost {
        calls: Mutex<Vec<String>>,
        compensation: Mutex<Option<CaseId>>,
    }

    impl RecordingHost {
        async fn record(&self, call: impl Into<String>) {
            self.calls.lock().await.push(call.into());
        }

        async fn calls(&self) -> Vec<String> {
            self.calls.lock().await.clone()
        }
    }

    #[async_trait]
    impl WorkletHost for RecordingHost {
        async fn suspend_case(&self, _case: CaseId) -> Result<(), EngineError> {
            self.record("suspend_case").await;
            Ok(())
        }
        async fn resume_case(&self, _case: CaseId) -> Result<(), EngineError> {
            self.record("resume_case").await;
            Ok(())
        }
        async fn cancel_case(&self, _case: CaseId, _reason: &str) -> Result<(), EngineError> {
            self.record("cancel_case").await;
            Ok(())
        }
        async fn fail_case(&self, case: CaseId, _reason: &str) -> Result<(), EngineError> {
            Err(EngineError::not_found("case", case))
        }
        async fn suspend_item(&self, _case: CaseId, _item: WorkItemId) -> Result<(), EngineError> {
            self.record("suspend_item").await;
            Ok(())
        }
        async fn resume_item(&self, _case: CaseId, _item: WorkItemId) -> Result<(), EngineError> {
            self.record("resume_item").await;
            Ok(())
        }
        async fn cancel_item(
            &self,
            _case: CaseId,
            _item: WorkItemId,
            _reason: &str,
        ) -> Result<(), EngineError> {
            self.record("cancel_item").await;
            Ok(())
        }
        async fn fail_item(
            &self,
            _case: CaseId,
            _item: WorkItemId,
            _reason: &str,
        ) -> Result<(), EngineError> {
            self.record("fail_item").await;
            Ok(())
        }
        async fn force_complete_item(
            &self,
            _case: CaseId,
            _item: WorkItemId,
        ) -> Result<(), EngineError> {
            self.record("force_complete_item").await;
            Ok(())
        }
        async fn update_case_data(&self, _case: CaseId, data: DataMap) -> Result<(), EngineError> {
            self.record(format!("update_case_data {}", serde_json::Value::Object(data)))
                .await;
            Ok(())
        }
        async fn launch_compensation(
            &self,
            specification: &SpecificationId,
            _data: DataMap,
            _launched_by: WorkletCaseId,
        ) -> Result<CaseId, EngineError> {
            self.record(format!("launch {specification}")).await;
            let id = CaseId::generate();
            *self.compensation.lock().await = Some(id);
            Ok(id)
        }
    }

    fn executor() -> (WorkletExecutor, MemoryEventSink) {
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let events = MemoryEventSink::new();
        let executor = WorkletExecutor::new(
            Arc::new(SimpleEvaluator),
            Arc::new(UlidGenerator::new(clock.clone())),
            clock,
            Arc::new(events.clone()),
            Arc::new(InMemoryRepository::<WorkletCase>::new()),
        );
        (executor, events)
    }

    fn late_item() -> ExceptionContext {
        let mut data = DataMap::new();
        data.insert("days_late".into(), json!(5));
        ExceptionContext::for_item(
            ExceptionType::Timeout,
            CaseId::generate(),
            WorkItemId::generate(),
            "ship",
        )
        .with_case_data(data)
    }

    #[tokio::test]
    async fn runs_actions_in_order_and_completes() {
        let (executor, events) = executor();
        executor
            .register_worklet(WorkletDefinition::new(
                "chase",
                vec![
                    WorkletAction::SuspendItem,
                    WorkletAction::UpdateCaseData {
                        data: serde_json::from_value(json!({"chased": true})).unwrap(),
                    },
                    WorkletAction::ContinueItem,
                ],
            ))
            .await;
        executor
            .add_rule(RuleKey::for_task("ship", ExceptionType::Timeout), 0, true, "days_late > 3", "chase")
            .await
            .unwrap();

        let host = RecordingHost::default();
        let result = executor.handle(&host, late_item()).await.unwrap();

        assert!(result.success);
        assert_eq!(result.worklet_id.as_deref(), Some("chase"));
        assert_eq!(
            host.calls().await,
            ["suspend_item", "update_case_data {\"chased\":true}", "resume_item"]
        );
        assert_eq!(events.names().await, ["worklet_started", "worklet_finished"]);
    }

    #[tokio::test]
    async fn no_matching_rule_is_unhandled() {
        let (executor, _) = executor();
        executor
            .add_rule(RuleKey::case_level(ExceptionType::Timeout), 0, true, "days_late > 30", "x")
            .await
            .unwrap();
        let result = executor
            .handle(&RecordingHost::default(), late_item())
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.worklet_case_id.is_none());
    }

    #[tokio::test]
    async fn conclusion_without_definition_is_worklet_not_found() {
        let (executor, _) = executor();
        executor
            .add_rule(RuleKey::case_level(ExceptionType::Timeout), 0, true, "true", "ghost")
            .await
            .unwrap();
        let err = executor
            .handle(&RecordingHost::default(), late_item())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::WorkletNotFound { .. }));
    }

    #[tokio::test]
    async fn failing_action_fails_the_worklet_case() {
        let (executor, _) = executor();
        executor
            .register_worklet(WorkletDefinition::new(
                "abort",
                vec![WorkletAction::FailCase, WorkletAction::SuspendCase],
            ))
            .await;
        executor
            .add_rule(RuleKey::case_level(ExceptionType::Timeout), 0, true, "true", "abort")
            .await
            .unwrap();
        let host = RecordingHost::default();
        let result = executor.handle(&host, late_item()).await.unwrap();
        assert!(!result.success);
        assert!(host.calls().await.is_empty(), "later actions are skipped");
    }

    #[tokio::test]
    async fn compensation_waits_for_the_launched_case() {
        let (executor, _) = executor();
        executor
            .register_worklet(WorkletDefinition::new(
                "refund",
                vec![
                    WorkletAction::Compensate {
                        specification_id: "refund".into(),
                    },
                    WorkletAction::ContinueCase,
                ],
            ))
            .await;
        executor
            .add_rule(RuleKey::case_level(ExceptionType::Timeout), 0, true, "true", "refund")
            .await
            .unwrap();
        let host = RecordingHost::default();

        let waiting = executor.handle(&host, late_item()).await.unwrap();
        let worklet_case = waiting.worklet_case_id.unwrap();
        assert_eq!(
            executor.worklet_case(worklet_case).await.unwrap().status(),
            crate::domain::worklet::WorkletCaseStatus::Running
        );
        assert_eq!(host.calls().await, ["launch refund"]);

        let compensation = host.compensation.lock().await.unwrap();
        let done = executor
            .compensation_finished(&host, worklet_case, compensation, true)
            .await
            .unwrap();
        assert!(done.success);
        assert_eq!(host.calls().await, ["launch refund", "resume_case"]);
    }

    #[tokio::test]
    async fn refinement_keeps_the_cornerstone_conclusion() {
        let (executor, _) = executor();
        let key = RuleKey::for_task("ship", ExceptionType::Timeout);
        executor
            .add_rule(key.clone(), 0, true, "days_late > 3", "chase")
            .await
            .unwrap();

        // A very late shipment should escalate instead.
        let mut very_late = late_item();
        very_late.case_data.insert("days_late".into(), json!(20));
        executor
            .refine(&very_late, "days_late > 10", "escalate")
            .await
            .unwrap();

        let pick = |ctx: ExceptionContext| {
            let executor = &executor;
            async move {
                executor
                    .select(&ctx)
                    .await
                    .unwrap()
                    .and_then(|(_, s)| s.conclusion)
            }
        };
        assert_eq!(pick(very_late).await.as_deref(), Some("escalate"));
        assert_eq!(pick(late_item()).await.as_deref(), Some("chase"));
    }
}
