//! EventSink の実装
//!
//! - NoopEventSink: 何もしない（デフォルト）
//! - TracingEventSink: `tracing::info!` で構造化ログに出す
//! - MemoryEventSink: テスト用、emit されたイベントを保持

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::errors::EngineError;
use crate::domain::events::{DomainEvent, EventEnvelope};
use crate::ports::EventSink;

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventSink;

#[async_trait]
impl EventSink for NoopEventSink {
    async fn emit(&self, _event: EventEnvelope) -> Result<(), EngineError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn emit(&self, event: EventEnvelope) -> Result<(), EngineError> {
        let name = event.event.name();
        let case_id = event.event.case_id().map(|id| id.to_string());
        let payload = serde_json::to_string(&event.event)
            .map_err(|e| EngineError::Repository(format!("cannot encode event: {e}")))?;
        tracing::info!(
            target: "bobbin::events",
            event = name,
            case_id = case_id.as_deref(),
            at = %event.at,
            payload = %payload,
        );
        Ok(())
    }
}

/// MemoryEventSink は受け取ったイベントを順に溜める
///
/// clone したものは同じバッファを共有する。
#[derive(Debug, Clone, Default)]
pub struct MemoryEventSink {
    events: Arc<Mutex<Vec<EventEnvelope>>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<DomainEvent> {
        self.events
            .lock()
            .await
            .iter()
            .map(|e| e.event.clone())
            .collect()
    }

    pub async fn names(&self) -> Vec<&'static str> {
        self.events
            .lock()
            .await
            .iter()
            .map(|e| e.event.name())
            .collect()
    }

    pub async fn clear(&self) {
        self.events.lock().await.clear();
    }
}

#[async_trait]
impl EventSink for MemoryEventSink {
    async fn emit(&self, event: EventEnvelope) -> Result<(), EngineError> {
        self.events.lock().await.push(event);
        Ok(())
    }
}
