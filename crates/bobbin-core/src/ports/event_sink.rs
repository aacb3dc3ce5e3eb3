//! EventSink port - イベント記録の抽象化
//!
//! # 実装
//! - NoopEventSink: 何もしない
//! - TracingEventSink: tracing にイベントとして流す
//! - MemoryEventSink: テスト用にメモリへ溜める

use async_trait::async_trait;

use crate::domain::errors::EngineError;
use crate::domain::events::EventEnvelope;

/// EventSink はドメインイベントを記録
///
/// エンジンはケースのロックを解放した後に emit する。
/// 失敗してもエンジンの状態遷移は巻き戻さない（warn ログのみ）。
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: EventEnvelope) -> Result<(), EngineError>;
}
