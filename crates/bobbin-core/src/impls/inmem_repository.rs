//! InMemoryRepository - 開発・テスト用の Repository
//!
//! # 実装詳細
//! - `tokio::sync::RwLock<BTreeMap<Key, E>>` でキー順に保持
//! - get / get_all はクローンを返す（呼び出し側がロックを持ち続けない）

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::domain::case::{Case, CaseStatus};
use crate::domain::errors::EngineError;
use crate::domain::ids::{CaseId, SpecificationId};
use crate::domain::work_item::{WorkItem, WorkItemStatus};
use crate::ports::{CaseQueries, Entity, Repository, WorkItemQueries};

/// InMemoryRepository はメモリ上の Repository
///
/// clone したものは同じストアを共有する。
pub struct InMemoryRepository<E: Entity> {
    entries: Arc<RwLock<BTreeMap<E::Key, E>>>,
}

impl<E: Entity> InMemoryRepository<E> {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    async fn filter(&self, pred: impl Fn(&E) -> bool + Send) -> Vec<E> {
        self.entries
            .read()
            .await
            .values()
            .filter(|e| pred(e))
            .cloned()
            .collect()
    }
}

impl<E: Entity> Clone for InMemoryRepository<E> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
        }
    }
}

impl<E: Entity> Default for InMemoryRepository<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<E: Entity> Repository<E> for InMemoryRepository<E> {
    async fn save(&self, entity: E) -> Result<(), EngineError> {
        self.entries.write().await.insert(entity.key(), entity);
        Ok(())
    }

    async fn get(&self, key: &E::Key) -> Result<Option<E>, EngineError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn delete(&self, key: &E::Key) -> Result<bool, EngineError> {
        Ok(self.entries.write().await.remove(key).is_some())
    }

    async fn get_all(&self) -> Result<Vec<E>, EngineError> {
        Ok(self.entries.read().await.values().cloned().collect())
    }

    async fn exists(&self, key: &E::Key) -> Result<bool, EngineError> {
        Ok(self.entries.read().await.contains_key(key))
    }
}

#[async_trait]
impl CaseQueries for InMemoryRepository<Case> {
    async fn by_specification(&self, id: &SpecificationId) -> Result<Vec<Case>, EngineError> {
        Ok(self.filter(|c| &c.specification_id == id).await)
    }

    async fn by_status(&self, status: CaseStatus) -> Result<Vec<Case>, EngineError> {
        Ok(self.filter(|c| c.status() == status).await)
    }

    async fn created_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Case>, EngineError> {
        Ok(self
            .filter(|c| c.created_at >= from && c.created_at < to)
            .await)
    }
}

#[async_trait]
impl WorkItemQueries for InMemoryRepository<WorkItem> {
    async fn by_case(&self, case_id: CaseId) -> Result<Vec<WorkItem>, EngineError> {
        Ok(self.filter(|w| w.case_id == case_id).await)
    }

    async fn by_status(&self, status: WorkItemStatus) -> Result<Vec<WorkItem>, EngineError> {
        Ok(self.filter(|w| w.status() == status).await)
    }

    async fn by_participant(&self, participant: &str) -> Result<Vec<WorkItem>, EngineError> {
        Ok(self
            .filter(|w| {
                w.resource_id() == Some(participant) || w.offered_to().contains(participant)
            })
            .await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::data::DataMap;
    use crate::domain::ids::WorkItemId;

    fn case(spec: &str, at: DateTime<Utc>) -> Case {
        Case::new(
            CaseId::generate(),
            SpecificationId::new(spec),
            "main",
            "i",
            DataMap::new(),
            at,
        )
    }

    #[tokio::test]
    async fn save_get_delete_roundtrip() {
        let repo = InMemoryRepository::<Case>::new();
        let c = case("s", Utc::now());
        let id = c.id;

        repo.save(c.clone()).await.unwrap();
        assert!(repo.exists(&id).await.unwrap());
        assert_eq!(repo.get(&id).await.unwrap(), Some(c));
        assert!(repo.delete(&id).await.unwrap());
        assert!(!repo.delete(&id).await.unwrap());
        assert!(repo.is_empty().await);
    }

    #[tokio::test]
    async fn case_queries_filter_by_spec_status_and_time() {
        let repo = InMemoryRepository::<Case>::new();
        let t0 = Utc::now();
        let mut running = case("orders", t0);
        running.start(t0).unwrap();
        repo.save(running.clone()).await.unwrap();
        repo.save(case("orders", t0 + chrono::Duration::hours(2)))
            .await
            .unwrap();
        repo.save(case("refunds", t0)).await.unwrap();

        assert_eq!(
            repo.by_specification(&SpecificationId::new("orders"))
                .await
                .unwrap()
                .len(),
            2
        );
        assert_eq!(
            repo.by_status(CaseStatus::Running).await.unwrap(),
            vec![running]
        );
        assert_eq!(
            repo.created_between(t0, t0 + chrono::Duration::hours(1))
                .await
                .unwrap()
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn work_items_by_participant_include_offers() {
        let repo = InMemoryRepository::<WorkItem>::new();
        let now = Utc::now();
        let case_id = CaseId::generate();
        let mut offered = WorkItem::new(WorkItemId::generate(), case_id, "main", "a", DataMap::new(), now);
        offered.fire(now).unwrap();
        offered.offer(["ann".to_string()], now).unwrap();
        let mut allocated = WorkItem::new(WorkItemId::generate(), case_id, "main", "b", DataMap::new(), now);
        allocated.fire(now).unwrap();
        allocated.allocate("ann", now).unwrap();
        let other = WorkItem::new(WorkItemId::generate(), CaseId::generate(), "main", "c", DataMap::new(), now);

        for w in [offered, allocated, other] {
            repo.save(w).await.unwrap();
        }

        assert_eq!(repo.by_participant("ann").await.unwrap().len(), 2);
        assert_eq!(repo.by_case(case_id).await.unwrap().len(), 2);
        assert_eq!(
            repo.by_status(WorkItemStatus::Enabled).await.unwrap().len(),
            1
        );
    }
}
