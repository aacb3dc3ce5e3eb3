//! CheckpointManager - チェックポイントの保存と保持
//!
//! 状態の収集と復元先への適用はエンジンが行う。ここでは
//! 作成・検証・保持数の管理・期限切れ・復元前のデコードだけを扱う。
//!
//! # 実装
//! - 保存先は `Repository<Checkpoint>`
//! - 作成のたびに `max_checkpoints` を超えた分を古い順に削除する（0 なら無制限）
//! - デコードに失敗したチェックポイントは CORRUPTED として保存し直す

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::checkpoint::{
    Checkpoint, CheckpointState, CheckpointStatus, CheckpointSubject, CheckpointType,
};
use crate::domain::errors::EngineError;
use crate::domain::events::{DomainEvent, EventEnvelope};
use crate::domain::ids::{CaseId, CheckpointId};
use crate::ports::{Clock, EventSink, IdGenerator, Repository};

pub struct CheckpointManager {
    repository: Arc<dyn Repository<Checkpoint>>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    max_checkpoints: usize,
    /// Serializes create + evict so retention never overshoots.
    retention: Mutex<()>,
}

impl CheckpointManager {
    pub fn new(
        repository: Arc<dyn Repository<Checkpoint>>,
        events: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        max_checkpoints: usize,
    ) -> Self {
        Self {
            repository,
            events,
            clock,
            ids,
            max_checkpoints,
            retention: Mutex::new(()),
        }
    }

    pub async fn create(
        &self,
        checkpoint_type: CheckpointType,
        subject: CheckpointSubject,
        state: &CheckpointState,
        description: impl Into<String>,
    ) -> Result<Checkpoint, EngineError> {
        let _guard = self.retention.lock().await;
        let checkpoint = Checkpoint::capture(
            self.ids.checkpoint_id(),
            checkpoint_type,
            subject,
            state,
            description,
            self.clock.now(),
        )?;
        self.repository.save(checkpoint.clone()).await?;
        tracing::debug!(
            checkpoint = %checkpoint.id,
            kind = ?checkpoint_type,
            "checkpoint created"
        );
        self.announce(&checkpoint).await;
        self.evict().await?;
        Ok(checkpoint)
    }

    async fn evict(&self) -> Result<(), EngineError> {
        if self.max_checkpoints == 0 {
            return Ok(());
        }
        let mut all = self.repository.get_all().await?;
        if all.len() <= self.max_checkpoints {
            return Ok(());
        }
        all.sort_by_key(|c| (c.created_at, c.id));
        let excess = all.len() - self.max_checkpoints;
        for old in all.into_iter().take(excess) {
            self.repository.delete(&old.id).await?;
            tracing::debug!(checkpoint = %old.id, "checkpoint evicted");
        }
        Ok(())
    }

    pub async fn get(&self, id: CheckpointId) -> Result<Checkpoint, EngineError> {
        self.repository
            .get(&id)
            .await?
            .ok_or_else(|| EngineError::not_found("checkpoint", id))
    }

    /// All checkpoints, oldest first.
    pub async fn list(&self) -> Result<Vec<Checkpoint>, EngineError> {
        let mut all = self.repository.get_all().await?;
        all.sort_by_key(|c| (c.created_at, c.id));
        Ok(all)
    }

    /// Newest restorable checkpoint whose subject is `case_id`.
    pub async fn latest_for_case(&self, case_id: CaseId) -> Result<Option<Checkpoint>, EngineError> {
        Ok(self.list().await?.into_iter().rev().find(|c| {
            c.status().is_restorable()
                && matches!(c.subject, CheckpointSubject::Case { case_id: id } if id == case_id)
        }))
    }

    /// CREATED -> VALID. A blob that does not decode is stored as CORRUPTED
    /// and the decode error is returned.
    pub async fn validate(&self, id: CheckpointId) -> Result<Checkpoint, EngineError> {
        let mut checkpoint = self.get(id).await?;
        let before = checkpoint.status();
        let outcome = checkpoint.validate();
        if checkpoint.status() != before {
            self.repository.save(checkpoint.clone()).await?;
            self.announce(&checkpoint).await;
        }
        outcome.map(|()| checkpoint)
    }

    /// Load and fully decode a checkpoint ahead of a restore.
    pub async fn open(&self, id: CheckpointId) -> Result<(Checkpoint, CheckpointState), EngineError> {
        let mut checkpoint = self.get(id).await?;
        checkpoint.ensure_restorable()?;
        match checkpoint.decode() {
            Ok(state) => Ok((checkpoint, state)),
            Err(err) => {
                tracing::warn!(checkpoint = %id, error = %err, "checkpoint does not decode");
                checkpoint.mark_corrupted();
                self.repository.save(checkpoint.clone()).await?;
                self.announce(&checkpoint).await;
                Err(err)
            }
        }
    }

    pub async fn mark_restored(&self, mut checkpoint: Checkpoint) -> Result<Checkpoint, EngineError> {
        checkpoint.mark_restored(self.clock.now());
        self.repository.save(checkpoint.clone()).await?;
        tracing::info!(checkpoint = %checkpoint.id, "checkpoint restored");
        self.announce(&checkpoint).await;
        Ok(checkpoint)
    }

    /// Tag every checkpoint created before `cutoff` as EXPIRED.
    pub async fn expire_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, EngineError> {
        let mut expired = 0;
        for mut checkpoint in self.repository.get_all().await? {
            if checkpoint.created_at >= cutoff
                || matches!(
                    checkpoint.status(),
                    CheckpointStatus::Expired | CheckpointStatus::Corrupted
                )
            {
                continue;
            }
            checkpoint.mark_expired();
            self.repository.save(checkpoint.clone()).await?;
            self.announce(&checkpoint).await;
            expired += 1;
        }
        if expired > 0 {
            tracing::info!(expired, %cutoff, "checkpoints expired");
        }
        Ok(expired)
    }

    async fn announce(&self, checkpoint: &Checkpoint) {
        let envelope = EventEnvelope {
            at: self.clock.now(),
            event: DomainEvent::CheckpointChanged {
                checkpoint_id: checkpoint.id,
                checkpoint_type: checkpoint.checkpoint_type,
                status: checkpoint.status(),
            },
        };
        if let Err(err) = self.events.emit(envelope).await {
            tracing::warn!(error = %err, "event sink rejected checkpoint event");
        }
    }
}
