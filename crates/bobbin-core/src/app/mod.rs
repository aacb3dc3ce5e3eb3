//! App - アプリケーション層
//!
//! このモジュールは、ports と runner を組み合わせてエンジンを実装します。
//!
//! # 主要コンポーネント
//! - **EngineBuilder**: エンジンの構築とワイヤリング
//! - **Engine**: 仕様・ケース・ワークアイテムの公開操作
//! - **WorkletExecutor**: RDR によるワークレット選択と実行
//! - **CheckpointManager**: チェックポイントの保存・保持・復元前検証
//! - **EngineConfig / status**: 設定と読み取り専用ビュー

pub mod builder;
pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod status;
pub mod worklet;

// 主要な型を再エクスポート
pub use self::builder::{BuildError, EngineBuilder};
pub use self::checkpoint::CheckpointManager;
pub use self::config::EngineConfig;
pub use self::engine::{CaseSlot, Engine};
pub use self::status::{CaseCounts, CaseStatusView, EngineStatus, WorkItemSummary};
pub use self::worklet::WorkletExecutor;
