//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」を定義する。
//! 各 trait はエンジンの外側（永続化、参加者ディレクトリ、式評価、
//! イベント配信、時刻、ID 生成）へのインターフェースで、実装の詳細を隠す。
//!
//! # 設計原則
//! - ネットの実行（マーキング操作）はポートに依存しない
//! - ポート呼び出しはケースのロックを解放してから行う（Clock / IdGenerator を除く）

pub mod clock;
pub mod evaluator;
pub mod event_sink;
pub mod id_generator;
pub mod parser;
pub mod repository;
pub mod resource_directory;
pub mod worklet_host;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::evaluator::PredicateEvaluator;
pub use self::event_sink::EventSink;
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::parser::SpecificationParser;
pub use self::repository::{CaseQueries, Entity, Repository, WorkItemQueries};
pub use self::resource_directory::ResourceDirectory;
pub use self::worklet_host::WorkletHost;
