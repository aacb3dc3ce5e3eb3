//! EngineBuilder - エンジンの構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）
//! - 差し替えなかったポートは開発用の実装で埋める

use std::sync::Arc;

use crate::app::config::EngineConfig;
use crate::app::engine::{Engine, EngineParts};
use crate::domain::checkpoint::Checkpoint;
use crate::domain::spec::Specification;
use crate::domain::worklet::WorkletCase;
use crate::impls::{
    InMemoryRepository, JsonSpecificationParser, SimpleEvaluator, StaticResourceDirectory,
    TracingEventSink,
};
use crate::ports::{
    CaseQueries, Clock, EventSink, IdGenerator, PredicateEvaluator, Repository, ResourceDirectory,
    SpecificationParser, SystemClock, UlidGenerator, WorkItemQueries,
};

/// EngineBuilder は Engine を構築
///
/// # 使用例
/// ```ignore
/// let engine = EngineBuilder::new()
///     .config(EngineConfig::load("bobbin.json")?)
///     .directory(StaticResourceDirectory::new(participants))
///     .build()?;
/// engine.start();
/// ```
///
/// # Fail-fast 設計
/// - build() 時に設定値を検証する
/// - 不正な設定は BuildError を返し、エンジンは作られない
pub struct EngineBuilder {
    config: EngineConfig,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    evaluator: Option<Arc<dyn PredicateEvaluator>>,
    directory: Option<Arc<dyn ResourceDirectory>>,
    parser: Option<Arc<dyn SpecificationParser>>,
    events: Option<Arc<dyn EventSink>>,
    case_repository: Option<Arc<dyn CaseQueries>>,
    item_repository: Option<Arc<dyn WorkItemQueries>>,
    specification_repository: Option<Arc<dyn Repository<Specification>>>,
    checkpoint_repository: Option<Arc<dyn Repository<Checkpoint>>>,
    worklet_repository: Option<Arc<dyn Repository<WorkletCase>>>,
}

/// BuildError はエンジン構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Invalid engine configuration: {0}")]
    InvalidConfig(String),
}

impl EngineBuilder {
    /// 新しい EngineBuilder を作成
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            clock: None,
            ids: None,
            evaluator: None,
            directory: None,
            parser: None,
            events: None,
            case_repository: None,
            item_repository: None,
            specification_repository: None,
            checkpoint_repository: None,
            worklet_repository: None,
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// 時刻源を設定
    ///
    /// IdGenerator を設定しない場合、ULID の時刻部分もこの時計から取る。
    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    pub fn ids(mut self, ids: impl IdGenerator + 'static) -> Self {
        self.ids = Some(Arc::new(ids));
        self
    }

    pub fn evaluator(mut self, evaluator: impl PredicateEvaluator + 'static) -> Self {
        self.evaluator = Some(Arc::new(evaluator));
        self
    }

    pub fn directory(mut self, directory: impl ResourceDirectory + 'static) -> Self {
        self.directory = Some(Arc::new(directory));
        self
    }

    pub fn parser(mut self, parser: impl SpecificationParser + 'static) -> Self {
        self.parser = Some(Arc::new(parser));
        self
    }

    pub fn events(mut self, events: impl EventSink + 'static) -> Self {
        self.events = Some(Arc::new(events));
        self
    }

    pub fn case_repository(mut self, repository: impl CaseQueries + 'static) -> Self {
        self.case_repository = Some(Arc::new(repository));
        self
    }

    pub fn work_item_repository(mut self, repository: impl WorkItemQueries + 'static) -> Self {
        self.item_repository = Some(Arc::new(repository));
        self
    }

    pub fn specification_repository(
        mut self,
        repository: impl Repository<Specification> + 'static,
    ) -> Self {
        self.specification_repository = Some(Arc::new(repository));
        self
    }

    pub fn checkpoint_repository(mut self, repository: impl Repository<Checkpoint> + 'static) -> Self {
        self.checkpoint_repository = Some(Arc::new(repository));
        self
    }

    pub fn worklet_repository(mut self, repository: impl Repository<WorkletCase> + 'static) -> Self {
        self.worklet_repository = Some(Arc::new(repository));
        self
    }

    /// EngineBuilder を構築して Engine を生成
    ///
    /// # 検証
    /// - `max_round_steps` が 0 なら BuildError::InvalidConfig
    ///
    /// 生成直後のエンジンは停止状態。`start()` で操作を受け付ける。
    pub fn build(self) -> Result<Engine, BuildError> {
        if self.config.max_round_steps == 0 {
            return Err(BuildError::InvalidConfig(
                "max_round_steps must be at least 1".into(),
            ));
        }
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>);
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(clock.clone())));
        let parts = EngineParts {
            config: self.config,
            clock,
            ids,
            evaluator: self.evaluator.unwrap_or_else(|| Arc::new(SimpleEvaluator)),
            directory: self
                .directory
                .unwrap_or_else(|| Arc::new(StaticResourceDirectory::default())),
            parser: self.parser.unwrap_or_else(|| Arc::new(JsonSpecificationParser)),
            events: self.events.unwrap_or_else(|| Arc::new(TracingEventSink)),
            case_repository: self
                .case_repository
                .unwrap_or_else(|| Arc::new(InMemoryRepository::<crate::domain::case::Case>::new())),
            item_repository: self.item_repository.unwrap_or_else(|| {
                Arc::new(InMemoryRepository::<crate::domain::work_item::WorkItem>::new())
            }),
            specification_repository: self
                .specification_repository
                .unwrap_or_else(|| Arc::new(InMemoryRepository::<Specification>::new())),
            checkpoint_repository: self
                .checkpoint_repository
                .unwrap_or_else(|| Arc::new(InMemoryRepository::<Checkpoint>::new())),
            worklet_repository: self
                .worklet_repository
                .unwrap_or_else(|| Arc::new(InMemoryRepository::<WorkletCase>::new())),
        };
        let engine = Engine::new(parts);
        tracing::debug!(engine = %engine.id(), "engine built");
        Ok(engine)
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::errors::EngineError;

    #[test]
    fn build_with_defaults_is_stopped() {
        let engine = EngineBuilder::new().build().unwrap();
        assert!(!engine.is_running());
        engine.start();
        assert!(engine.is_running());
    }

    #[test]
    fn zero_round_steps_is_rejected() {
        let config = EngineConfig {
            max_round_steps: 0,
            ..EngineConfig::default()
        };
        let result = EngineBuilder::new().config(config).build();
        assert!(matches!(result, Err(BuildError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn stopped_engine_rejects_operations() {
        let engine = EngineBuilder::new().build().unwrap();
        let err = engine
            .create_case(&"missing".into(), Default::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::EngineNotRunning));
    }
}
