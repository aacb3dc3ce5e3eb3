//! SpecificationParser port - 仕様ドキュメントの読み込み
//!
//! # 実装
//! - JsonSpecificationParser（JSON 形式）

use crate::domain::errors::EngineError;
use crate::domain::spec::Specification;

/// SpecificationParser はドキュメントを検証済み Specification に変換
///
/// 構造エラーは全件まとめて EngineError::Validation で返す（部分ロードはしない）。
pub trait SpecificationParser: Send + Sync {
    fn parse(&self, source: &str) -> Result<Specification, EngineError>;
}
