//! Impls - ports の実装（開発用・テスト用）
//!
//! # 含まれる実装
//! - **InMemoryRepository**: Repository / CaseQueries / WorkItemQueries
//! - **StaticResourceDirectory**: 固定の参加者リスト
//! - **SimpleEvaluator**: 最小限の比較式
//! - **NoopEventSink / TracingEventSink / MemoryEventSink**
//! - **JsonSpecificationParser**: JSON 形式の仕様ドキュメント
//!
//! # 本番用実装
//! 永続化バックエンドや式言語は別クレートで ports を実装する想定。

pub mod event_sinks;
pub mod inmem_repository;
pub mod json_parser;
pub mod simple_evaluator;
pub mod static_directory;

pub use self::event_sinks::{MemoryEventSink, NoopEventSink, TracingEventSink};
pub use self::inmem_repository::InMemoryRepository;
pub use self::json_parser::JsonSpecificationParser;
pub use self::simple_evaluator::SimpleEvaluator;
pub use self::static_directory::StaticResourceDirectory;
