//! bobbin-core
//!
//! Core building blocks for the Bobbin workflow engine.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, spec, net, marking, case, work_item, rdr, worklet, checkpoint, errors, events）
//! - **runner**: ネットの実行（発火、join/split、OR-join 判定、キャンセル領域）
//! - **ports**: 抽象化レイヤー（Repository, ResourceDirectory, PredicateEvaluator, EventSink, WorkletHost など）
//! - **app**: アプリケーションロジック（builder, engine, worklet, checkpoint, config, status）
//! - **impls**: 実装（InMemoryRepository など開発用）

pub mod app;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod runner;

pub use crate::app::{BuildError, Engine, EngineBuilder, EngineConfig};
pub use crate::domain::errors::EngineError;
