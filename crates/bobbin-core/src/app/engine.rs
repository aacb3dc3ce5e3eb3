//! Engine - ワークフローエンジン本体
//!
//! 仕様とケースのレジストリを持ち、公開操作をすべて提供する。
//!
//! # 実装
//! - ケースごとに [`CaseSlot`]（`Arc<Mutex<Case>>`）を持つ。エンジン全体のロックはない
//! - 操作はケースの複製に対して行い、成功したときだけ書き戻す
//! - 他ケースやポートに触る後続処理（FollowUp）はケースのロックを解放してから実行する
//! - 例外は WorkletExecutor に渡し、ワークレットのアクションは WorkletHost 経由で戻ってくる
//!
//! # 設計原則
//! - ResourceDirectory の呼び出しやワークレットのコールバック中はケースのロックを持たない
//! - 子ケースの完了は親への FollowUp として、子のロック解放後に処理する

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use tokio::sync::{Mutex, RwLock};

use crate::app::checkpoint::CheckpointManager;
use crate::app::config::EngineConfig;
use crate::app::status::{CaseCounts, CaseStatusView, EngineStatus};
use crate::app::worklet::WorkletExecutor;
use crate::domain::case::{Case, CaseStatus, ParentLink};
use crate::domain::checkpoint::{
    Checkpoint, CheckpointPayload, CheckpointState, CheckpointSubject, CheckpointType,
};
use crate::domain::data::DataMap;
use crate::domain::errors::EngineError;
use crate::domain::events::{DomainEvent, EventEnvelope};
use crate::domain::exception::{ExceptionContext, ExceptionType};
use crate::domain::ids::{CaseId, CheckpointId, EngineId, SpecificationId, WorkItemId, WorkletCaseId};
use crate::domain::net::{TimerAction, TimerTrigger};
use crate::domain::participant::{AllocationStrategy, ResourcingSpec};
use crate::domain::rdr::{RdrTree, RuleKey, RuleSet};
use crate::domain::spec::{Specification, SpecificationStatus};
use crate::domain::work_item::{WorkItem, WorkItemStatus};
use crate::domain::worklet::{WorkletCase, WorkletDefinition, WorkletResult};
use crate::ports::{
    CaseQueries, Clock, EventSink, IdGenerator, PredicateEvaluator, Repository, ResourceDirectory,
    SpecificationParser, WorkItemQueries, WorkletHost,
};
use crate::runner::{timer_deadline, NetRunner, Quiescence, RunnerEffect};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One case behind its own lock.
pub type CaseSlot = Arc<Mutex<Case>>;

/// Which case states an operation accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Guard {
    /// Public work-item operations.
    Running,
    /// Worklet actions and timers.
    Unfinished,
    /// The operation checks for itself.
    Any,
}

impl Guard {
    fn check(self, case: &Case, action: &'static str) -> Result<(), EngineError> {
        match self {
            Guard::Running => case.ensure_running(action),
            Guard::Unfinished if case.status().is_finished() => Err(EngineError::StateTransition {
                entity: "case",
                id: case.id.to_string(),
                from: case.status().to_string(),
                action,
            }),
            _ => Ok(()),
        }
    }
}

/// Work that must run after the case lock is released.
enum FollowUp {
    Event(DomainEvent),
    Resource {
        case_id: CaseId,
        work_item_id: WorkItemId,
        query: ResourcingSpec,
    },
    StartSubCase {
        parent: ParentLink,
        sub_case_id: CaseId,
        specification_id: SpecificationId,
        net_id: String,
        data: DataMap,
    },
    CancelSubCase {
        case_id: CaseId,
    },
    CaseFinished {
        case_id: CaseId,
        status: CaseStatus,
        parent: Option<ParentLink>,
        launched_by: Option<WorkletCaseId>,
        output: DataMap,
    },
    /// `quiet` exceptions are dropped unless a rule concludes.
    Exception {
        context: ExceptionContext,
        quiet: bool,
    },
    Checkpoint {
        case_id: CaseId,
        state: CheckpointState,
    },
}

/// What a committed operation writes to the repositories.
struct WriteThrough {
    case: Case,
    items: Vec<WorkItem>,
    new_items: Vec<WorkItemId>,
}

/// Everything [`Engine::new`] needs. Assembled by the builder.
pub(crate) struct EngineParts {
    pub config: EngineConfig,
    pub clock: Arc<dyn Clock>,
    pub ids: Arc<dyn IdGenerator>,
    pub evaluator: Arc<dyn PredicateEvaluator>,
    pub directory: Arc<dyn ResourceDirectory>,
    pub parser: Arc<dyn SpecificationParser>,
    pub events: Arc<dyn EventSink>,
    pub case_repository: Arc<dyn CaseQueries>,
    pub item_repository: Arc<dyn WorkItemQueries>,
    pub specification_repository: Arc<dyn Repository<Specification>>,
    pub checkpoint_repository: Arc<dyn Repository<Checkpoint>>,
    pub worklet_repository: Arc<dyn Repository<WorkletCase>>,
}

/// Engine はワークフローエンジンのインスタンス
///
/// [`EngineBuilder`](crate::app::EngineBuilder) で組み立て、`start()` してから使う。
pub struct Engine {
    id: EngineId,
    config: EngineConfig,
    running: AtomicBool,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    evaluator: Arc<dyn PredicateEvaluator>,
    directory: Arc<dyn ResourceDirectory>,
    parser: Arc<dyn SpecificationParser>,
    events: Arc<dyn EventSink>,
    case_repository: Arc<dyn CaseQueries>,
    item_repository: Arc<dyn WorkItemQueries>,
    specification_repository: Arc<dyn Repository<Specification>>,
    specifications: RwLock<BTreeMap<SpecificationId, Arc<Specification>>>,
    cases: RwLock<HashMap<CaseId, CaseSlot>>,
    item_index: RwLock<HashMap<WorkItemId, CaseId>>,
    worklets: WorkletExecutor,
    checkpoints: CheckpointManager,
}

impl Engine {
    pub(crate) fn new(parts: EngineParts) -> Self {
        let worklets = WorkletExecutor::new(
            parts.evaluator.clone(),
            parts.ids.clone(),
            parts.clock.clone(),
            parts.events.clone(),
            parts.worklet_repository,
        );
        let checkpoints = CheckpointManager::new(
            parts.checkpoint_repository,
            parts.events.clone(),
            parts.clock.clone(),
            parts.ids.clone(),
            parts.config.max_checkpoints,
        );
        Self {
            id: parts.ids.engine_id(),
            config: parts.config,
            running: AtomicBool::new(false),
            clock: parts.clock,
            ids: parts.ids,
            evaluator: parts.evaluator,
            directory: parts.directory,
            parser: parts.parser,
            events: parts.events,
            case_repository: parts.case_repository,
            item_repository: parts.item_repository,
            specification_repository: parts.specification_repository,
            specifications: RwLock::new(BTreeMap::new()),
            cases: RwLock::new(HashMap::new()),
            item_index: RwLock::new(HashMap::new()),
            worklets,
            checkpoints,
        }
    }

    pub fn id(&self) -> EngineId {
        self.id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ---- lifecycle ----

    pub fn start(&self) {
        if !self.running.swap(true, Ordering::AcqRel) {
            tracing::info!(engine = %self.id, "engine started");
        }
    }

    /// Stop accepting operations. State is kept; `start` resumes.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            tracing::info!(engine = %self.id, "engine stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn ensure_running(&self) -> Result<(), EngineError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(EngineError::EngineNotRunning)
        }
    }

    // ---- specifications ----

    /// Parse and load a specification document. Structural errors fail the
    /// whole load.
    pub async fn load_specification(&self, source: &str) -> Result<SpecificationId, EngineError> {
        let specification = self.parser.parse(source)?;
        self.load(specification).await
    }

    pub async fn load(&self, mut specification: Specification) -> Result<SpecificationId, EngineError> {
        self.ensure_running()?;
        specification.validate()?;
        let id = specification.id().clone();
        {
            let mut specs = self.specifications.write().await;
            if let Some(existing) = specs.get(&id) {
                return Err(EngineError::StateTransition {
                    entity: "specification",
                    id: id.to_string(),
                    from: existing.status().to_string(),
                    action: "load",
                });
            }
            specification.mark_loaded()?;
            specs.insert(id.clone(), Arc::new(specification.clone()));
        }
        self.specification_repository.save(specification).await?;
        tracing::info!(specification = %id, "specification loaded");
        self.emit(DomainEvent::SpecificationStatusChanged {
            specification_id: id.clone(),
            status: SpecificationStatus::Loaded,
        })
        .await;
        Ok(id)
    }

    pub async fn activate_specification(&self, id: &SpecificationId) -> Result<(), EngineError> {
        self.change_specification(id, Specification::activate).await
    }

    pub async fn suspend_specification(&self, id: &SpecificationId) -> Result<(), EngineError> {
        self.change_specification(id, Specification::suspend).await
    }

    pub async fn retire_specification(&self, id: &SpecificationId) -> Result<(), EngineError> {
        self.change_specification(id, Specification::retire).await
    }

    pub async fn archive_specification(&self, id: &SpecificationId) -> Result<(), EngineError> {
        self.change_specification(id, Specification::archive).await
    }

    /// Remove a specification that no unfinished case uses.
    pub async fn unload_specification(&self, id: &SpecificationId) -> Result<(), EngineError> {
        self.ensure_running()?;
        let in_use = self
            .case_repository
            .by_specification(id)
            .await?
            .iter()
            .any(|c| !c.status().is_finished());
        let mut specs = self.specifications.write().await;
        let current = specs
            .get(id)
            .ok_or_else(|| EngineError::not_found("specification", id))?;
        if in_use {
            return Err(EngineError::StateTransition {
                entity: "specification",
                id: id.to_string(),
                from: format!("{} with unfinished cases", current.status()),
                action: "unload",
            });
        }
        specs.remove(id);
        drop(specs);
        self.specification_repository.delete(id).await?;
        tracing::info!(specification = %id, "specification unloaded");
        self.emit(DomainEvent::SpecificationUnloaded {
            specification_id: id.clone(),
        })
        .await;
        Ok(())
    }

    pub async fn specification(&self, id: &SpecificationId) -> Result<Arc<Specification>, EngineError> {
        self.specifications
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("specification", id))
    }

    pub async fn specifications(&self) -> Vec<(SpecificationId, SpecificationStatus)> {
        self.specifications
            .read()
            .await
            .iter()
            .map(|(id, s)| (id.clone(), s.status()))
            .collect()
    }

    /// Copy-on-write status change; running cases keep the `Arc` they hold.
    async fn change_specification(
        &self,
        id: &SpecificationId,
        change: impl FnOnce(&mut Specification) -> Result<(), EngineError> + Send,
    ) -> Result<(), EngineError> {
        self.ensure_running()?;
        let updated = {
            let mut specs = self.specifications.write().await;
            let current = specs
                .get(id)
                .ok_or_else(|| EngineError::not_found("specification", id))?;
            let mut next = Specification::clone(current);
            change(&mut next)?;
            let next = Arc::new(next);
            specs.insert(id.clone(), next.clone());
            next
        };
        self.specification_repository
            .save(Specification::clone(&updated))
            .await?;
        tracing::info!(specification = %id, status = %updated.status(), "specification status changed");
        self.emit(DomainEvent::SpecificationStatusChanged {
            specification_id: id.clone(),
            status: updated.status(),
        })
        .await;
        Ok(())
    }

    // ---- cases ----

    /// Create a case of an ACTIVE specification. The case is not started.
    pub async fn create_case(
        &self,
        specification_id: &SpecificationId,
        input: DataMap,
    ) -> Result<CaseId, EngineError> {
        self.new_case(specification_id, input, None).await
    }

    pub async fn start_case(&self, case_id: CaseId) -> Result<(), EngineError> {
        self.mutate(case_id, Guard::Any, "start", |runner, case, effects| {
            case.start(runner.now())?;
            runner.run(case, effects)
        })
        .await
    }

    /// Create and start.
    pub async fn launch_case(
        &self,
        specification_id: &SpecificationId,
        input: DataMap,
    ) -> Result<CaseId, EngineError> {
        let case_id = self.create_case(specification_id, input).await?;
        self.start_case(case_id).await?;
        Ok(case_id)
    }

    pub async fn suspend_case(&self, case_id: CaseId) -> Result<(), EngineError> {
        self.mutate(case_id, Guard::Any, "suspend", |runner, case, _| {
            case.suspend(runner.now())
        })
        .await
    }

    /// Resume and run a firing round.
    pub async fn resume_case(&self, case_id: CaseId) -> Result<(), EngineError> {
        self.mutate(case_id, Guard::Any, "resume", |runner, case, effects| {
            case.resume(runner.now())?;
            runner.run(case, effects)
        })
        .await
    }

    /// Cancel the case, its active work items and its sub-cases.
    pub async fn cancel_case(&self, case_id: CaseId, reason: &str) -> Result<(), EngineError> {
        let reason = reason.to_string();
        self.mutate(case_id, Guard::Any, "cancel", move |runner, case, effects| {
            let cascade = case.cancel(reason, runner.now())?;
            effects.extend(
                cascade
                    .sub_cases
                    .into_iter()
                    .map(|case_id| RunnerEffect::SubCaseCancelled { case_id }),
            );
            Ok(())
        })
        .await
    }

    /// Fail the case. Active work items are cancelled.
    pub async fn fail_case(&self, case_id: CaseId, reason: &str) -> Result<(), EngineError> {
        let reason = reason.to_string();
        self.mutate(case_id, Guard::Any, "fail", move |runner, case, effects| {
            let top_level: Vec<WorkItemId> = case
                .active_items()
                .filter(|w| w.parent_id.is_none())
                .map(|w| w.id)
                .collect();
            for id in top_level {
                runner.cancel_item(case, id, "case failed", effects)?;
            }
            case.fail(reason, runner.now())
        })
        .await
    }

    /// Merge `data` into the case variables.
    pub async fn update_case_data(&self, case_id: CaseId, data: DataMap) -> Result<(), EngineError> {
        self.mutate(case_id, Guard::Unfinished, "update data", move |runner, case, _| {
            case.data.merge(&data);
            case.log("update data", None, runner.now());
            Ok(())
        })
        .await
    }

    async fn new_case(
        &self,
        specification_id: &SpecificationId,
        input: DataMap,
        launched_by: Option<WorkletCaseId>,
    ) -> Result<CaseId, EngineError> {
        self.ensure_running()?;
        let spec = self.specification(specification_id).await?;
        if !spec.accepts_new_cases() {
            return Err(EngineError::SpecificationNotActive {
                id: specification_id.clone(),
                status: spec.status().to_string(),
            });
        }
        let net = spec
            .root_net()
            .ok_or_else(|| EngineError::not_found("net", spec.root_net_id()))?;
        let mut case = Case::new(
            self.ids.case_id(),
            specification_id.clone(),
            net.id(),
            net.input_condition(),
            input,
            self.clock.now(),
        );
        case.launched_by = launched_by;
        let case_id = case.id;
        self.register(case).await;
        tracing::info!(case = %case_id, specification = %specification_id, "case created");
        Ok(case_id)
    }

    async fn register(&self, case: Case) {
        let case_id = case.id;
        let status = case.status();
        self.cases
            .write()
            .await
            .insert(case_id, Arc::new(Mutex::new(case.clone())));
        self.write_through(WriteThrough {
            new_items: case.work_items().map(|w| w.id).collect(),
            items: case.work_items().cloned().collect(),
            case,
        })
        .await;
        self.emit(DomainEvent::CaseStatusChanged { case_id, status }).await;
    }

    async fn start_sub_case(
        &self,
        parent: ParentLink,
        sub_case_id: CaseId,
        specification_id: SpecificationId,
        net_id: String,
        data: DataMap,
    ) -> Result<(), EngineError> {
        let spec = self.specification(&specification_id).await?;
        let net = spec
            .net(&net_id)
            .ok_or_else(|| EngineError::not_found("net", &net_id))?;
        let mut case = Case::new(
            sub_case_id,
            specification_id,
            net.id(),
            net.input_condition(),
            data,
            self.clock.now(),
        );
        case.parent = Some(parent);
        self.register(case).await;
        tracing::debug!(case = %sub_case_id, parent = %parent.case_id, net = %net_id, "sub-case started");
        self.start_case(sub_case_id).await
    }

    /// Cancel a sub-case whose composite item went away. Finished cases are left alone.
    async fn cancel_sub_case(&self, case_id: CaseId) -> Result<(), EngineError> {
        self.mutate(case_id, Guard::Any, "cancel", |runner, case, effects| {
            if case.status().is_finished() {
                return Ok(());
            }
            let cascade = case.cancel("composite work item withdrawn", runner.now())?;
            effects.extend(
                cascade
                    .sub_cases
                    .into_iter()
                    .map(|case_id| RunnerEffect::SubCaseCancelled { case_id }),
            );
            Ok(())
        })
        .await
    }

    /// Feed a finished sub-case back into its composite work item.
    async fn sub_case_finished(
        &self,
        link: ParentLink,
        child: CaseId,
        status: CaseStatus,
        output: DataMap,
    ) -> Result<(), EngineError> {
        self.mutate(link.case_id, Guard::Any, "complete sub-case", move |runner, case, effects| {
            if case.status().is_finished() {
                return Ok(());
            }
            let item = case.item(link.work_item_id)?;
            if !item.is_active() || item.sub_case_id != Some(child) {
                return Ok(());
            }
            case.sub_cases.remove(&child);
            if status == CaseStatus::Completed {
                runner.complete_item(case, link.work_item_id, output, effects)
            } else {
                let now = runner.now();
                case.with_item(link.work_item_id, |w| {
                    w.fail(format!("sub-case {child} ended {status}"), now)
                })?;
                runner.item_finished(case, link.work_item_id, effects)
            }
        })
        .await
    }

    // ---- work items ----

    pub async fn offer_work_item(
        &self,
        item: WorkItemId,
        participants: Vec<String>,
    ) -> Result<(), EngineError> {
        self.item_op(item, None, Guard::Running, "offer", move |runner, case, _| {
            let now = runner.now();
            case.with_item(item, |w| w.offer(participants, now))
        })
        .await
    }

    /// Allocate to a participant known to the resource directory.
    pub async fn allocate_work_item(&self, item: WorkItemId, participant: &str) -> Result<(), EngineError> {
        let known = self.directory.participant(participant).ok_or_else(|| {
            EngineError::Allocation {
                work_item: item.to_string(),
                participant: participant.to_string(),
                reason: "unknown participant".into(),
            }
        })?;
        if !known.available {
            return Err(EngineError::Allocation {
                work_item: item.to_string(),
                participant: participant.to_string(),
                reason: "participant is unavailable".into(),
            });
        }
        let participant = participant.to_string();
        self.item_op(item, None, Guard::Running, "allocate", move |runner, case, _| {
            let now = runner.now();
            case.with_item(item, |w| w.allocate(&participant, now))
        })
        .await
    }

    pub async fn start_work_item(&self, item: WorkItemId) -> Result<(), EngineError> {
        self.item_op(item, None, Guard::Running, "start", move |runner, case, _| {
            start_item(runner, case, item)
        })
        .await
    }

    pub async fn complete_work_item(&self, item: WorkItemId, output: DataMap) -> Result<(), EngineError> {
        self.item_op(item, None, Guard::Running, "complete", move |runner, case, effects| {
            let current = case.item(item)?;
            if let Some(sub_case) = current.sub_case_id {
                return Err(EngineError::StateTransition {
                    entity: "work item",
                    id: item.to_string(),
                    from: format!("{} running sub-case {sub_case}", current.status()),
                    action: "complete",
                });
            }
            runner.complete_item(case, item, output, effects)
        })
        .await
    }

    pub async fn suspend_work_item(&self, item: WorkItemId) -> Result<(), EngineError> {
        self.item_op(item, None, Guard::Running, "suspend", move |runner, case, _| {
            suspend_item(runner, case, item)
        })
        .await
    }

    pub async fn resume_work_item(&self, item: WorkItemId) -> Result<(), EngineError> {
        self.item_op(item, None, Guard::Running, "resume", move |runner, case, _| {
            resume_item(runner, case, item)
        })
        .await
    }

    pub async fn cancel_work_item(&self, item: WorkItemId, reason: &str) -> Result<(), EngineError> {
        let reason = reason.to_string();
        self.item_op(item, None, Guard::Running, "cancel", move |runner, case, effects| {
            runner.cancel_item(case, item, &reason, effects)
        })
        .await
    }

    pub async fn fail_work_item(&self, item: WorkItemId, reason: &str) -> Result<(), EngineError> {
        let reason = reason.to_string();
        self.item_op(item, None, Guard::Running, "fail", move |runner, case, effects| {
            fail_item(runner, case, item, reason, effects)
        })
        .await
    }

    pub async fn force_complete_work_item(
        &self,
        item: WorkItemId,
        output: DataMap,
    ) -> Result<(), EngineError> {
        self.item_op(item, None, Guard::Running, "force complete", move |runner, case, effects| {
            force_complete_item(runner, case, item, output, effects)
        })
        .await
    }

    async fn item_op<R, F>(
        &self,
        item: WorkItemId,
        expected_case: Option<CaseId>,
        guard: Guard,
        action: &'static str,
        f: F,
    ) -> Result<R, EngineError>
    where
        R: Send,
        F: FnOnce(&NetRunner<'_>, &mut Case, &mut Vec<RunnerEffect>) -> Result<R, EngineError> + Send,
    {
        let case_id = self.case_of(item).await?;
        if let Some(expected) = expected_case
            && expected != case_id
        {
            return Err(EngineError::not_found(
                "work item",
                format!("{item} in case {expected}"),
            ));
        }
        self.mutate(case_id, guard, action, f).await
    }

    // ---- queries ----

    pub async fn case(&self, case_id: CaseId) -> Result<Case, EngineError> {
        let slot = self.slot(case_id).await?;
        let case = slot.lock().await.clone();
        Ok(case)
    }

    pub async fn case_status(&self, case_id: CaseId) -> Result<CaseStatusView, EngineError> {
        let case = self.case(case_id).await?;
        let enabled = if case.is_running() {
            self.enabled_in(&case).await?
        } else {
            Vec::new()
        };
        Ok(CaseStatusView::new(&case, enabled))
    }

    /// Tasks enabled under the case's current marking.
    pub async fn enabled_tasks(&self, case_id: CaseId) -> Result<Vec<String>, EngineError> {
        let case = self.case(case_id).await?;
        self.enabled_in(&case).await
    }

    async fn enabled_in(&self, case: &Case) -> Result<Vec<String>, EngineError> {
        let spec = self.specification(&case.specification_id).await?;
        let runner = NetRunner::new(
            &spec,
            self.evaluator.as_ref(),
            self.ids.as_ref(),
            self.config.runner_limits(),
            self.clock.now(),
        );
        runner.enabled_tasks(case)
    }

    pub async fn cases_of(&self, specification_id: &SpecificationId) -> Result<Vec<Case>, EngineError> {
        self.case_repository.by_specification(specification_id).await
    }

    pub async fn cases_with_status(&self, status: CaseStatus) -> Result<Vec<Case>, EngineError> {
        self.case_repository.by_status(status).await
    }

    pub async fn work_item(&self, item: WorkItemId) -> Result<WorkItem, EngineError> {
        let case_id = self.case_of(item).await?;
        let slot = self.slot(case_id).await?;
        let case = slot.lock().await;
        case.item(item).cloned()
    }

    pub async fn work_items_for_case(&self, case_id: CaseId) -> Result<Vec<WorkItem>, EngineError> {
        let slot = self.slot(case_id).await?;
        let case = slot.lock().await;
        Ok(case.work_items().cloned().collect())
    }

    /// Active items offered or allocated to `participant`.
    pub async fn work_items_for_participant(&self, participant: &str) -> Result<Vec<WorkItem>, EngineError> {
        let mut items = self.item_repository.by_participant(participant).await?;
        items.retain(WorkItem::is_active);
        items.sort_by_key(|w| w.id);
        Ok(items)
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        let mut counts = CaseCounts::default();
        let mut active_work_items = 0;
        let slots: Vec<CaseSlot> = self.cases.read().await.values().cloned().collect();
        for slot in slots {
            let case = slot.lock().await;
            counts.record(case.status());
            active_work_items += case.active_ids().len();
        }
        Ok(EngineStatus {
            engine_id: self.id,
            running: self.is_running(),
            specifications: self.specifications.read().await.keys().cloned().collect(),
            cases: counts,
            active_work_items,
            worklet_cases: self.worklets.worklet_cases().await.len(),
            checkpoints: self.checkpoints.list().await?.len(),
        })
    }

    async fn slot(&self, case_id: CaseId) -> Result<CaseSlot, EngineError> {
        self.cases
            .read()
            .await
            .get(&case_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("case", case_id))
    }

    async fn case_of(&self, item: WorkItemId) -> Result<CaseId, EngineError> {
        self.item_index
            .read()
            .await
            .get(&item)
            .copied()
            .ok_or_else(|| EngineError::not_found("work item", item))
    }

    // ---- timers ----

    /// Expire every work-item timer whose deadline is at or before now.
    /// Returns how many timers fired.
    pub async fn poll_timers(&self) -> Result<usize, EngineError> {
        self.ensure_running()?;
        let now = self.clock.now();
        let slots: Vec<CaseSlot> = self.cases.read().await.values().cloned().collect();
        let mut due = Vec::new();
        for slot in slots {
            let case = slot.lock().await;
            if case.status().is_finished() {
                continue;
            }
            due.extend(
                case.active_items()
                    .filter(|w| w.timer_deadline.is_some_and(|d| d <= now))
                    .map(|w| (case.id, w.id)),
            );
        }

        let mut fired = 0;
        for (case_id, item) in due {
            let outcome = self
                .mutate(case_id, Guard::Unfinished, "expire timer", move |runner, case, effects| {
                    expire_timer(runner, case, item, effects)
                })
                .await;
            match outcome {
                Ok(None) => {}
                Ok(Some(action)) => {
                    fired += 1;
                    tracing::info!(case = %case_id, work_item = %item, ?action, "timer expired");
                    if action == TimerAction::Escalate {
                        let context = self
                            .item_context(ExceptionType::Timeout, case_id, item)
                            .await?
                            .with_reason("timer expired");
                        self.handle_exception(context, false).await?;
                    }
                }
                Err(err) => {
                    tracing::warn!(case = %case_id, work_item = %item, error = %err, "timer could not be applied");
                }
            }
        }
        Ok(fired)
    }

    // ---- exceptions & rules ----

    /// Hand an exception to the worklet executor. No concluding rule is
    /// `WorkletNotFound`.
    pub async fn raise_exception(&self, context: ExceptionContext) -> Result<WorkletResult, EngineError> {
        self.ensure_running()?;
        self.slot(context.case_id).await?;
        let exception = context.exception;
        let task = context.task_id.clone();
        match self.handle_exception(context, false).await? {
            Some(result) if result.worklet_case_id.is_some() => Ok(result),
            _ => Err(EngineError::WorkletNotFound { exception, task }),
        }
    }

    /// Raise a case-level exception with the case's current data.
    pub async fn raise_case_exception(
        &self,
        case_id: CaseId,
        exception: ExceptionType,
        reason: &str,
    ) -> Result<WorkletResult, EngineError> {
        let case = self.case(case_id).await?;
        let context = ExceptionContext::for_case(exception, case_id)
            .with_case_data(case.data.variables.clone())
            .with_reason(reason);
        self.raise_exception(context).await
    }

    /// Raise an item-level exception with the item's and the case's data.
    pub async fn raise_item_exception(
        &self,
        item: WorkItemId,
        exception: ExceptionType,
        reason: &str,
    ) -> Result<WorkletResult, EngineError> {
        let case_id = self.case_of(item).await?;
        let context = self
            .item_context(exception, case_id, item)
            .await?
            .with_reason(reason);
        self.raise_exception(context).await
    }

    pub async fn register_worklet(&self, definition: WorkletDefinition) {
        self.worklets.register_worklet(definition).await;
    }

    pub async fn add_rule(
        &self,
        key: RuleKey,
        parent: usize,
        on_true: bool,
        condition: &str,
        conclusion: &str,
    ) -> Result<usize, EngineError> {
        self.worklets
            .add_rule(key, parent, on_true, condition, conclusion)
            .await
    }

    pub async fn set_rule_tree(&self, key: RuleKey, tree: RdrTree) {
        self.worklets.set_tree(key, tree).await;
    }

    pub async fn rules(&self) -> RuleSet {
        self.worklets.rules().await
    }

    /// Refine the rule tree at the point where `context` was decided. The
    /// case named by the context is locked for the duration.
    pub async fn refine_rule(
        &self,
        context: &ExceptionContext,
        condition: &str,
        conclusion: &str,
    ) -> Result<usize, EngineError> {
        let slot = self.slot(context.case_id).await?;
        let _case = slot.lock().await;
        self.worklets.refine(context, condition, conclusion).await
    }

    pub async fn worklet_case(&self, id: WorkletCaseId) -> Result<WorkletCase, EngineError> {
        self.worklets.worklet_case(id).await
    }

    pub async fn worklet_cases(&self) -> Vec<WorkletCase> {
        self.worklets.worklet_cases().await
    }

    async fn item_context(
        &self,
        exception: ExceptionType,
        case_id: CaseId,
        item: WorkItemId,
    ) -> Result<ExceptionContext, EngineError> {
        let slot = self.slot(case_id).await?;
        let case = slot.lock().await;
        let work_item = case.item(item)?;
        Ok(item_context(exception, &case, work_item))
    }

    async fn handle_exception(
        &self,
        context: ExceptionContext,
        quiet: bool,
    ) -> Result<Option<WorkletResult>, EngineError> {
        if quiet {
            let concluded = self
                .worklets
                .select(&context)
                .await?
                .is_some_and(|(_, s)| s.conclusion.is_some());
            if !concluded {
                return Ok(None);
            }
        }
        tracing::info!(
            case = %context.case_id,
            exception = %context.exception,
            task = ?context.task_id,
            "exception raised"
        );
        self.emit(DomainEvent::ExceptionRaised {
            case_id: context.case_id,
            exception: context.exception,
            task_id: context.task_id.clone(),
        })
        .await;
        let result = self.worklets.handle(self, context).await?;
        if !result.success {
            tracing::warn!(message = ?result.message, "exception was not handled");
        }
        Ok(Some(result))
    }

    // ---- checkpoints ----

    /// Snapshot a case and all of its sub-cases, root first.
    pub async fn create_case_checkpoint(
        &self,
        case_id: CaseId,
        description: &str,
    ) -> Result<Checkpoint, EngineError> {
        let mut cases = Vec::new();
        let mut pending = vec![case_id];
        while let Some(id) = pending.pop() {
            let slot = match self.slot(id).await {
                Ok(slot) => slot,
                Err(_) if id != case_id => continue,
                Err(err) => return Err(err),
            };
            let case = slot.lock().await.clone();
            pending.extend(case.sub_cases.keys().copied());
            cases.push(case);
        }
        let state = CheckpointState::new(CheckpointPayload::Cases { cases });
        self.checkpoints
            .create(
                CheckpointType::Case,
                CheckpointSubject::Case { case_id },
                &state,
                description,
            )
            .await
    }

    pub async fn create_work_item_checkpoint(
        &self,
        item: WorkItemId,
        description: &str,
    ) -> Result<Checkpoint, EngineError> {
        let case_id = self.case_of(item).await?;
        let (work_item, variables) = {
            let slot = self.slot(case_id).await?;
            let case = slot.lock().await;
            (case.item(item)?.clone(), case.data.variables.clone())
        };
        let state = CheckpointState::new(CheckpointPayload::WorkItem {
            item: work_item,
            variables,
        });
        self.checkpoints
            .create(
                CheckpointType::WorkItem,
                CheckpointSubject::WorkItem {
                    case_id,
                    work_item_id: item,
                },
                &state,
                description,
            )
            .await
    }

    /// Snapshot every case and worklet case.
    pub async fn create_engine_checkpoint(&self, description: &str) -> Result<Checkpoint, EngineError> {
        let cases = self.snapshot_cases(|_| true).await;
        let state = CheckpointState::new(CheckpointPayload::Engine {
            cases,
            worklet_cases: self.worklets.worklet_cases().await,
        });
        self.checkpoints
            .create(
                CheckpointType::Engine,
                CheckpointSubject::Engine { engine_id: self.id },
                &state,
                description,
            )
            .await
    }

    /// Snapshot the cases touched since `since`.
    pub async fn create_incremental_checkpoint(
        &self,
        since: DateTime<Utc>,
        description: &str,
    ) -> Result<Checkpoint, EngineError> {
        let cases = self.snapshot_cases(|c| c.updated_at >= since).await;
        let state = CheckpointState::new(CheckpointPayload::Cases { cases });
        self.checkpoints
            .create(
                CheckpointType::Incremental,
                CheckpointSubject::Engine { engine_id: self.id },
                &state,
                description,
            )
            .await
    }

    pub async fn validate_checkpoint(&self, id: CheckpointId) -> Result<Checkpoint, EngineError> {
        self.checkpoints.validate(id).await
    }

    pub async fn checkpoint(&self, id: CheckpointId) -> Result<Checkpoint, EngineError> {
        self.checkpoints.get(id).await
    }

    pub async fn checkpoints(&self) -> Result<Vec<Checkpoint>, EngineError> {
        self.checkpoints.list().await
    }

    pub async fn expire_checkpoints_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, EngineError> {
        self.checkpoints.expire_older_than(cutoff).await
    }

    /// Restore a checkpoint. The blob is decoded completely before anything
    /// is replaced; a blob that does not decode marks the checkpoint
    /// CORRUPTED and leaves the engine untouched. A work-item checkpoint is
    /// refused once the live item has finished.
    pub async fn restore_checkpoint(&self, id: CheckpointId) -> Result<Checkpoint, EngineError> {
        self.ensure_running()?;
        let (checkpoint, state) = self.checkpoints.open(id).await?;
        match state.payload {
            CheckpointPayload::Cases { cases } => {
                for case in cases {
                    self.install(case).await;
                }
            }
            CheckpointPayload::WorkItem { item, variables } => {
                self.mutate(item.case_id, Guard::Any, "restore", move |_, case, _| {
                    let id = item.id;
                    // A finished item already moved tokens; only the whole case can be rewound.
                    let live = case.item(id)?;
                    if !live.is_active() {
                        return Err(EngineError::StateTransition {
                            entity: "work item",
                            id: id.to_string(),
                            from: live.status().to_string(),
                            action: "restore",
                        });
                    }
                    case.data.variables = variables;
                    case.insert_item(item);
                    // Re-sync the active set with the restored status.
                    case.with_item(id, |_| Ok(()))
                })
                .await?;
            }
            CheckpointPayload::Engine {
                cases,
                worklet_cases,
            } => {
                self.cases.write().await.clear();
                self.item_index.write().await.clear();
                for case in cases {
                    self.install(case).await;
                }
                self.worklets.restore(worklet_cases).await?;
            }
        }
        self.checkpoints.mark_restored(checkpoint).await
    }

    /// Roll a case back to its newest restorable case checkpoint.
    pub async fn restore_case_checkpoint(&self, case_id: CaseId) -> Result<Checkpoint, EngineError> {
        let checkpoint = self
            .checkpoints
            .latest_for_case(case_id)
            .await?
            .ok_or_else(|| EngineError::not_found("checkpoint for case", case_id))?;
        self.restore_checkpoint(checkpoint.id).await
    }

    /// Put a case back into the registry, replacing the live one.
    async fn install(&self, case: Case) {
        let existing = self.cases.read().await.get(&case.id).cloned();
        match existing {
            Some(slot) => *slot.lock().await = case.clone(),
            None => {
                self.cases
                    .write()
                    .await
                    .insert(case.id, Arc::new(Mutex::new(case.clone())));
            }
        }
        tracing::debug!(case = %case.id, status = %case.status(), "case restored");
        self.write_through(WriteThrough {
            new_items: case.work_items().map(|w| w.id).collect(),
            items: case.work_items().cloned().collect(),
            case,
        })
        .await;
    }

    async fn snapshot_cases(&self, keep: impl Fn(&Case) -> bool) -> Vec<Case> {
        let slots: Vec<CaseSlot> = self.cases.read().await.values().cloned().collect();
        let mut cases = Vec::with_capacity(slots.len());
        for slot in slots {
            let case = slot.lock().await;
            if keep(&case) {
                cases.push(case.clone());
            }
        }
        cases.sort_by_key(|c| c.id);
        cases
    }

    // ---- the mutation pipeline ----

    /// Run `f` against a clone of the case, settle it, and commit on success.
    ///
    /// Follow-ups run after the lock is released. A runtime fault is handed to
    /// the worklet executor as a constraint violation before it is returned.
    async fn mutate<R, F>(
        &self,
        case_id: CaseId,
        guard: Guard,
        action: &'static str,
        f: F,
    ) -> Result<R, EngineError>
    where
        R: Send,
        F: FnOnce(&NetRunner<'_>, &mut Case, &mut Vec<RunnerEffect>) -> Result<R, EngineError> + Send,
    {
        self.ensure_running()?;
        let slot = self.slot(case_id).await?;
        let mut follow_ups = VecDeque::new();
        let (outcome, write) = {
            let mut committed = slot.lock().await;
            guard.check(&committed, action)?;
            let spec = self.specification(&committed.specification_id).await?;
            let runner = NetRunner::new(
                &spec,
                self.evaluator.as_ref(),
                self.ids.as_ref(),
                self.config.runner_limits(),
                self.clock.now(),
            );
            let mut case = committed.clone();
            let mut effects = Vec::new();
            let outcome = f(&runner, &mut case, &mut effects);
            let mid = case.status();
            match outcome.and_then(|r| self.settle(&runner, &mut case).map(|()| r)) {
                Ok(r) => {
                    let write = self.collect(&spec, &committed, &case, mid, effects, &mut follow_ups);
                    *committed = case;
                    if self.config.auto_checkpoint {
                        follow_ups.push_back(FollowUp::Checkpoint {
                            case_id,
                            state: CheckpointState::new(CheckpointPayload::Cases {
                                cases: vec![(*committed).clone()],
                            }),
                        });
                    }
                    (Ok(r), Some(write))
                }
                Err(err) => {
                    if err.is_runtime_fault() {
                        tracing::warn!(case = %case_id, error = %err, "runtime fault");
                        follow_ups.push_back(FollowUp::Exception {
                            context: fault_context(&committed, &err),
                            quiet: false,
                        });
                    } else {
                        tracing::debug!(case = %case_id, action, error = %err, "operation rejected");
                    }
                    (Err(err), None)
                }
            }
        };
        if let Some(write) = write {
            self.write_through(write).await;
        }
        self.drain(follow_ups).await;
        outcome
    }

    /// Complete or deadlock a running case that has nothing left to do.
    fn settle(&self, runner: &NetRunner<'_>, case: &mut Case) -> Result<(), EngineError> {
        if !case.is_running() {
            return Ok(());
        }
        match runner.quiescence(case)? {
            Quiescence::Busy => Ok(()),
            Quiescence::Completed => case.complete(runner.now()),
            Quiescence::Deadlocked if self.config.deadlock_detection => {
                tracing::warn!(case = %case.id, "case deadlocked");
                case.mark_deadlocked(runner.now())
            }
            Quiescence::Deadlocked | Quiescence::Stalled => Ok(()),
        }
    }

    /// Turn the difference between `before` and `after` into follow-ups.
    fn collect(
        &self,
        spec: &Specification,
        before: &Case,
        after: &Case,
        mid: CaseStatus,
        effects: Vec<RunnerEffect>,
        queue: &mut VecDeque<FollowUp>,
    ) -> WriteThrough {
        let case_id = after.id;
        let constraints = self.config.check_constraints;

        if mid != before.status() {
            queue.push_back(FollowUp::Event(DomainEvent::CaseStatusChanged {
                case_id,
                status: mid,
            }));
            if before.status() == CaseStatus::Created && constraints {
                queue.push_back(FollowUp::Exception {
                    context: ExceptionContext::for_case(ExceptionType::CasePreConstraint, case_id)
                        .with_case_data(after.data.variables.clone()),
                    quiet: true,
                });
            }
        }

        for effect in effects {
            match effect {
                RunnerEffect::TaskFired {
                    task_id,
                    work_item_id,
                } => queue.push_back(FollowUp::Event(DomainEvent::TaskFired {
                    case_id,
                    task_id,
                    work_item_id,
                })),
                RunnerEffect::TaskCompleted { task_id } => {
                    queue.push_back(FollowUp::Event(DomainEvent::TaskCompleted { case_id, task_id }))
                }
                RunnerEffect::ItemFired {
                    work_item_id,
                    task_id,
                } => {
                    if constraints && let Ok(item) = after.item(work_item_id) {
                        queue.push_back(FollowUp::Exception {
                            context: item_context(ExceptionType::ItemPreConstraint, after, item),
                            quiet: true,
                        });
                    }
                    let query = spec
                        .net(&after.net_id)
                        .and_then(|net| net.task(&task_id))
                        .and_then(|task| task.resourcing.clone());
                    if let Some(query) = query {
                        queue.push_back(FollowUp::Resource {
                            case_id,
                            work_item_id,
                            query,
                        });
                    }
                }
                RunnerEffect::SubCaseRequested {
                    work_item_id,
                    sub_case_id,
                    net_id,
                    data,
                } => queue.push_back(FollowUp::StartSubCase {
                    parent: ParentLink {
                        case_id,
                        work_item_id,
                    },
                    sub_case_id,
                    specification_id: after.specification_id.clone(),
                    net_id,
                    data,
                }),
                RunnerEffect::SubCaseCancelled { case_id } => {
                    queue.push_back(FollowUp::CancelSubCase { case_id })
                }
                // Reported through the item status diff below.
                RunnerEffect::ItemCancelled { .. } | RunnerEffect::ItemFailed { .. } => {}
            }
        }

        let mut items = Vec::new();
        let mut new_items = Vec::new();
        for item in after.work_items() {
            let previous = before.item(item.id).ok().map(WorkItem::status);
            if previous == Some(item.status()) {
                continue;
            }
            if previous.is_none() {
                new_items.push(item.id);
            }
            queue.push_back(FollowUp::Event(DomainEvent::WorkItemStatusChanged {
                case_id,
                work_item_id: item.id,
                task_id: item.task_id.clone(),
                status: item.status(),
            }));
            match item.status() {
                WorkItemStatus::Completed if constraints && item.children.is_empty() => {
                    queue.push_back(FollowUp::Exception {
                        context: item_context(ExceptionType::ItemPostConstraint, after, item),
                        quiet: true,
                    });
                }
                WorkItemStatus::Failed => queue.push_back(FollowUp::Exception {
                    context: item_context(ExceptionType::ItemAbort, after, item),
                    quiet: true,
                }),
                _ => {}
            }
            items.push(item.clone());
        }

        let status = after.status();
        if status != mid {
            queue.push_back(FollowUp::Event(DomainEvent::CaseStatusChanged { case_id, status }));
        }
        if status != before.status() && (status.is_finished() || status == CaseStatus::Deadlocked) {
            tracing::info!(case = %case_id, %status, "case finished");
            if status == CaseStatus::Completed && constraints {
                queue.push_back(FollowUp::Exception {
                    context: ExceptionContext::for_case(ExceptionType::CasePostConstraint, case_id)
                        .with_case_data(after.data.output.clone()),
                    quiet: true,
                });
            }
            queue.push_back(FollowUp::CaseFinished {
                case_id,
                status,
                parent: after.parent,
                launched_by: after.launched_by,
                output: after.data.output.clone(),
            });
        }

        WriteThrough {
            case: after.clone(),
            items,
            new_items,
        }
    }

    async fn write_through(&self, write: WriteThrough) {
        if !write.new_items.is_empty() {
            let mut index = self.item_index.write().await;
            for id in write.new_items {
                index.insert(id, write.case.id);
            }
        }
        let case_id = write.case.id;
        if let Err(err) = self.case_repository.save(write.case).await {
            tracing::warn!(case = %case_id, error = %err, "case not persisted");
        }
        for item in write.items {
            let item_id = item.id;
            if let Err(err) = self.item_repository.save(item).await {
                tracing::warn!(work_item = %item_id, error = %err, "work item not persisted");
            }
        }
    }

    fn drain(&self, mut queue: VecDeque<FollowUp>) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            while let Some(next) = queue.pop_front() {
                if let Err(err) = self.follow_up(next).await {
                    tracing::warn!(error = %err, "follow-up failed");
                }
            }
        })
    }

    async fn follow_up(&self, next: FollowUp) -> Result<(), EngineError> {
        match next {
            FollowUp::Event(event) => self.emit(event).await,
            FollowUp::Resource {
                case_id,
                work_item_id,
                query,
            } => self.distribute(case_id, work_item_id, &query).await?,
            FollowUp::StartSubCase {
                parent,
                sub_case_id,
                specification_id,
                net_id,
                data,
            } => {
                self.start_sub_case(parent, sub_case_id, specification_id, net_id, data)
                    .await?
            }
            FollowUp::CancelSubCase { case_id } => self.cancel_sub_case(case_id).await?,
            FollowUp::CaseFinished {
                case_id,
                status,
                parent,
                launched_by,
                output,
            } => {
                if let Some(link) = parent {
                    self.sub_case_finished(link, case_id, status, output).await?;
                }
                if let Some(worklet_case) = launched_by {
                    self.worklets
                        .compensation_finished(self, worklet_case, case_id, status == CaseStatus::Completed)
                        .await?;
                }
            }
            FollowUp::Exception { context, quiet } => {
                self.handle_exception(context, quiet).await?;
            }
            FollowUp::Checkpoint { case_id, state } => {
                self.checkpoints
                    .create(
                        CheckpointType::Case,
                        CheckpointSubject::Case { case_id },
                        &state,
                        "automatic",
                    )
                    .await?;
            }
        }
        Ok(())
    }

    /// Ask the directory for candidates (no lock held), then offer and
    /// possibly allocate.
    async fn distribute(
        &self,
        case_id: CaseId,
        item: WorkItemId,
        query: &ResourcingSpec,
    ) -> Result<(), EngineError> {
        let candidates = self.directory.find_participants(query)?;
        if candidates.is_empty() {
            tracing::warn!(case = %case_id, work_item = %item, "no participant for work item");
            let context = self
                .item_context(ExceptionType::ResourceUnavailable, case_id, item)
                .await?
                .with_reason("no participant matches the resourcing query");
            self.handle_exception(context, false).await?;
            return Ok(());
        }
        let chosen = match query.strategy {
            AllocationStrategy::Offer => None,
            AllocationStrategy::FirstAvailable => candidates.first().map(|p| p.id.clone()),
            AllocationStrategy::Random => candidates
                .choose(&mut rand::thread_rng())
                .map(|p| p.id.clone()),
        };
        let offered: Vec<String> = candidates.into_iter().map(|p| p.id).collect();
        self.mutate(case_id, Guard::Unfinished, "offer", move |runner, case, _| {
            if case.item(item)?.status() != WorkItemStatus::Fired {
                return Ok(());
            }
            let now = runner.now();
            case.with_item(item, |w| {
                w.offer(offered, now)?;
                if let Some(participant) = &chosen {
                    w.allocate(participant, now)?;
                }
                Ok(())
            })
        })
        .await
    }

    async fn emit(&self, event: DomainEvent) {
        let envelope = EventEnvelope {
            at: self.clock.now(),
            event,
        };
        if let Err(err) = self.events.emit(envelope).await {
            tracing::warn!(error = %err, "event sink rejected event");
        }
    }
}

// ---- operation bodies shared by the public API and the worklet host ----

fn start_item(runner: &NetRunner<'_>, case: &mut Case, item: WorkItemId) -> Result<(), EngineError> {
    let now = runner.now();
    case.with_item(item, |w| w.start(now))?;
    let task_id = case.item(item)?.task_id.clone();
    if let Some(timer) = &runner.task_of(case, &task_id)?.timer
        && timer.trigger == TimerTrigger::OnStarted
    {
        let deadline = timer_deadline(timer, now);
        case.with_item(item, |w| {
            w.timer_deadline = deadline;
            Ok(())
        })?;
    }
    Ok(())
}

fn suspend_item(runner: &NetRunner<'_>, case: &mut Case, item: WorkItemId) -> Result<(), EngineError> {
    let now = runner.now();
    case.with_item(item, |w| w.suspend(now))
}

fn resume_item(runner: &NetRunner<'_>, case: &mut Case, item: WorkItemId) -> Result<(), EngineError> {
    let now = runner.now();
    case.with_item(item, |w| w.resume(now))
}

fn fail_item(
    runner: &NetRunner<'_>,
    case: &mut Case,
    item: WorkItemId,
    reason: String,
    effects: &mut Vec<RunnerEffect>,
) -> Result<(), EngineError> {
    let now = runner.now();
    case.with_item(item, |w| w.fail(reason, now))?;
    runner.item_finished(case, item, effects)
}

/// Force-completing a composite item withdraws its sub-case.
fn force_complete_item(
    runner: &NetRunner<'_>,
    case: &mut Case,
    item: WorkItemId,
    output: DataMap,
    effects: &mut Vec<RunnerEffect>,
) -> Result<(), EngineError> {
    let sub_case = case.item(item)?.sub_case_id;
    if let Some(sub_case) = sub_case
        && case.sub_cases.remove(&sub_case).is_some()
    {
        effects.push(RunnerEffect::SubCaseCancelled { case_id: sub_case });
    }
    runner.force_complete_item(case, item, output, effects)
}

/// Apply an expired timer. `None` when the timer is no longer due.
fn expire_timer(
    runner: &NetRunner<'_>,
    case: &mut Case,
    item: WorkItemId,
    effects: &mut Vec<RunnerEffect>,
) -> Result<Option<TimerAction>, EngineError> {
    let now = runner.now();
    let (status, task_id, due) = {
        let w = case.item(item)?;
        (
            w.status(),
            w.task_id.clone(),
            w.is_active() && w.timer_deadline.is_some_and(|d| d <= now),
        )
    };
    if !due {
        return Ok(None);
    }
    let Some(timer) = runner.task_of(case, &task_id)?.timer.as_ref() else {
        return Ok(None);
    };
    match timer.action {
        TimerAction::Fail if status == WorkItemStatus::Started => {
            fail_item(runner, case, item, "timer expired".into(), effects)?;
        }
        // Items that never started cannot fail; they are withdrawn.
        TimerAction::Fail | TimerAction::Cancel => {
            runner.cancel_item(case, item, "timer expired", effects)?;
        }
        TimerAction::Escalate => {
            case.with_item(item, |w| {
                w.timer_deadline = None;
                Ok(())
            })?;
        }
    }
    Ok(Some(timer.action))
}

fn item_context(exception: ExceptionType, case: &Case, item: &WorkItem) -> ExceptionContext {
    let mut data = item.data_input.clone();
    data.extend(item.data_output.clone());
    ExceptionContext::for_item(exception, case.id, item.id, item.task_id.as_str())
        .with_case_data(case.data.variables.clone())
        .with_item_data(data)
}

fn fault_context(case: &Case, err: &EngineError) -> ExceptionContext {
    let mut context = ExceptionContext::for_case(ExceptionType::ConstraintViolation, case.id)
        .with_case_data(case.data.variables.clone())
        .with_reason(err.to_string());
    if let EngineError::Routing { task, .. } | EngineError::Synchronization { task, .. } = err {
        context.task_id = Some(task.clone());
    }
    context
}

#[async_trait]
impl WorkletHost for Engine {
    async fn suspend_case(&self, case_id: CaseId) -> Result<(), EngineError> {
        Engine::suspend_case(self, case_id).await
    }

    async fn resume_case(&self, case_id: CaseId) -> Result<(), EngineError> {
        Engine::resume_case(self, case_id).await
    }

    async fn cancel_case(&self, case_id: CaseId, reason: &str) -> Result<(), EngineError> {
        Engine::cancel_case(self, case_id, reason).await
    }

    async fn fail_case(&self, case_id: CaseId, reason: &str) -> Result<(), EngineError> {
        Engine::fail_case(self, case_id, reason).await
    }

    async fn suspend_item(&self, case_id: CaseId, item: WorkItemId) -> Result<(), EngineError> {
        self.item_op(item, Some(case_id), Guard::Unfinished, "suspend", move |runner, case, _| {
            suspend_item(runner, case, item)
        })
        .await
    }

    async fn resume_item(&self, case_id: CaseId, item: WorkItemId) -> Result<(), EngineError> {
        self.item_op(item, Some(case_id), Guard::Unfinished, "resume", move |runner, case, _| {
            resume_item(runner, case, item)
        })
        .await
    }

    async fn cancel_item(
        &self,
        case_id: CaseId,
        item: WorkItemId,
        reason: &str,
    ) -> Result<(), EngineError> {
        let reason = reason.to_string();
        self.item_op(item, Some(case_id), Guard::Unfinished, "cancel", move |runner, case, effects| {
            runner.cancel_item(case, item, &reason, effects)
        })
        .await
    }

    async fn fail_item(
        &self,
        case_id: CaseId,
        item: WorkItemId,
        reason: &str,
    ) -> Result<(), EngineError> {
        let reason = reason.to_string();
        self.item_op(item, Some(case_id), Guard::Unfinished, "fail", move |runner, case, effects| {
            fail_item(runner, case, item, reason, effects)
        })
        .await
    }

    async fn force_complete_item(
        &self,
        case_id: CaseId,
        item: WorkItemId,
    ) -> Result<(), EngineError> {
        self.item_op(
            item,
            Some(case_id),
            Guard::Unfinished,
            "force complete",
            move |runner, case, effects| force_complete_item(runner, case, item, DataMap::new(), effects),
        )
        .await
    }

    async fn update_case_data(&self, case_id: CaseId, data: DataMap) -> Result<(), EngineError> {
        Engine::update_case_data(self, case_id, data).await
    }

    async fn launch_compensation(
        &self,
        specification: &SpecificationId,
        data: DataMap,
        launched_by: WorkletCaseId,
    ) -> Result<CaseId, EngineError> {
        let case_id = self.new_case(specification, data, Some(launched_by)).await?;
        tracing::info!(case = %case_id, worklet_case = %launched_by, "compensation case launched");
        self.start_case(case_id).await?;
        Ok(case_id)
    }
}
