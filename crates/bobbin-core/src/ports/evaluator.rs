//! PredicateEvaluator port - フロー述語・ルール条件の評価
//!
//! 式言語は規定しない。エンジンは文字列をそのまま渡し、真偽だけを受け取る。

use serde_json::Value;

use crate::domain::errors::EngineError;

/// PredicateEvaluator は式を facts（JSON オブジェクト）に対して評価
///
/// # 呼び出し箇所
/// - XOR/OR split のフロー述語（facts = ケース変数 + 完了データ）
/// - RDR ノードの条件（facts = ExceptionContext::facts）
pub trait PredicateEvaluator: Send + Sync {
    fn evaluate(&self, expression: &str, facts: &Value) -> Result<bool, EngineError>;
}
