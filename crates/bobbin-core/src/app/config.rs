//! EngineConfig - エンジンの設定
//!
//! 全フィールドにデフォルトがあるので、JSON では変えたいキーだけ書けばよい。
//!
//! ```json
//! { "max_checkpoints": 20, "or_join_cycle_policy": "fire" }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::domain::errors::EngineError;
use crate::runner::{OrJoinCyclePolicy, RunnerLimits};

/// EngineConfig はエンジン全体の挙動を決める
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// 保持するチェックポイントの上限（超えたら古いものから削除）
    pub max_checkpoints: usize,
    /// 操作ごとの発火ラウンドが落ち着いた時点でケースのチェックポイントを取る
    pub auto_checkpoint: bool,
    /// 事前・事後制約の RDR ツリーを評価する
    pub check_constraints: bool,
    pub or_join_cycle_policy: OrJoinCyclePolicy,
    /// 1 ラウンドあたりの発火回数の上限
    pub max_round_steps: usize,
    /// 有効なタスクも稼働中のアイテムもなく、トークンが残ったまま出力条件が空のケースを DEADLOCKED にする
    pub deadlock_detection: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_checkpoints: 10,
            auto_checkpoint: false,
            check_constraints: true,
            or_join_cycle_policy: OrJoinCyclePolicy::Fail,
            max_round_steps: 10_000,
            deadlock_detection: true,
        }
    }
}

impl EngineConfig {
    pub fn from_json(source: &str) -> Result<Self, EngineError> {
        serde_json::from_str(source).map_err(|e| EngineError::Parse(format!("engine config: {e}")))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Parse(format!("{}: {e}", path.display())))?;
        Self::from_json(&source)
    }

    pub fn runner_limits(&self) -> RunnerLimits {
        RunnerLimits {
            or_join_cycle_policy: self.or_join_cycle_policy,
            max_round_steps: self.max_round_steps,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config =
            EngineConfig::from_json(r#"{"max_checkpoints": 3, "or_join_cycle_policy": "fire"}"#)
                .unwrap();
        assert_eq!(config.max_checkpoints, 3);
        assert_eq!(config.or_join_cycle_policy, OrJoinCyclePolicy::Fire);
        assert!(config.check_constraints);
        assert_eq!(config.max_round_steps, 10_000);
    }

    #[test]
    fn unknown_policy_is_a_parse_error() {
        let err = EngineConfig::from_json(r#"{"or_join_cycle_policy": "maybe"}"#).unwrap_err();
        assert!(matches!(err, EngineError::Parse(_)));
    }

    #[test]
    fn missing_file_is_reported_with_its_path() {
        let err = EngineConfig::load("/nonexistent/bobbin.json").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/bobbin.json"));
    }
}
