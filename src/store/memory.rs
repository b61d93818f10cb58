use super::{PendingMutationStore, StoreResult};
use crate::core::{ParentRef, PersistenceError};
use crate::mutation::PendingMutation;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::RwLock;

/// Records by id plus a unique parent index.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "Vec<PendingMutation>", into = "Vec<PendingMutation>")]
pub(crate) struct MutationIndex {
    by_id: BTreeMap<String, PendingMutation>,
    by_parent: BTreeMap<ParentRef, String>,
}

impl MutationIndex {
    pub(crate) fn insert(&mut self, mutation: PendingMutation) -> StoreResult<()> {
        if self.by_parent.contains_key(&mutation.parent) {
            return Err(PersistenceError::DuplicatePendingMutation(
                mutation.parent.to_string(),
            ));
        }
        self.by_parent
            .insert(mutation.parent.clone(), mutation.id.clone());
        self.by_id.insert(mutation.id.clone(), mutation);
        Ok(())
    }

    pub(crate) fn replace_for_parent(
        &mut self,
        mutation: PendingMutation,
    ) -> StoreResult<Option<PendingMutation>> {
        let superseded = self.delete_for_parent(&mutation.parent);
        self.insert(mutation)?;
        Ok(superseded)
    }

    pub(crate) fn get(&self, id: &str) -> Option<PendingMutation> {
        self.by_id.get(id).cloned()
    }

    pub(crate) fn find_by_parent(&self, parent: &ParentRef) -> Option<PendingMutation> {
        self.by_parent
            .get(parent)
            .and_then(|id| self.by_id.get(id))
            .cloned()
    }

    pub(crate) fn update(&mut self, mutation: PendingMutation) -> StoreResult<()> {
        let existing = self
            .by_id
            .get_mut(&mutation.id)
            .ok_or_else(|| PersistenceError::PendingMutationNotFound(mutation.id.clone()))?;
        if existing.parent != mutation.parent {
            return Err(PersistenceError::ConstraintViolation(format!(
                "Pending mutation '{}' cannot move from {} to {}",
                mutation.id, existing.parent, mutation.parent
            )));
        }
        *existing = mutation;
        Ok(())
    }

    pub(crate) fn delete(&mut self, id: &str) -> Option<PendingMutation> {
        let removed = self.by_id.remove(id)?;
        self.by_parent.remove(&removed.parent);
        Some(removed)
    }

    pub(crate) fn delete_for_parent(&mut self, parent: &ParentRef) -> Option<PendingMutation> {
        let id = self.by_parent.remove(parent)?;
        self.by_id.remove(&id)
    }

    pub(crate) fn due(&self, now: DateTime<Utc>) -> Vec<PendingMutation> {
        let mut due: Vec<_> = self
            .by_id
            .values()
            .filter(|mutation| mutation.is_due(now))
            .cloned()
            .collect();
        due.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        due
    }

    pub(crate) fn list(&self) -> Vec<PendingMutation> {
        let mut all: Vec<_> = self.by_id.values().cloned().collect();
        all.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        all
    }

    pub(crate) fn len(&self) -> usize {
        self.by_id.len()
    }
}

impl From<Vec<PendingMutation>> for MutationIndex {
    fn from(records: Vec<PendingMutation>) -> Self {
        let mut index = Self::default();
        for record in records {
            // Last record wins if a hand-edited file repeats a parent.
            index.delete_for_parent(&record.parent);
            index.by_parent.insert(record.parent.clone(), record.id.clone());
            index.by_id.insert(record.id.clone(), record);
        }
        index
    }
}

impl From<MutationIndex> for Vec<PendingMutation> {
    fn from(index: MutationIndex) -> Self {
        index.list()
    }
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct InMemoryPendingStore {
    index: RwLock<MutationIndex>,
}

impl InMemoryPendingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PendingMutationStore for InMemoryPendingStore {
    async fn insert(&self, mutation: PendingMutation) -> StoreResult<()> {
        self.index.write().await.insert(mutation)
    }

    async fn replace_for_parent(
        &self,
        mutation: PendingMutation,
    ) -> StoreResult<Option<PendingMutation>> {
        self.index.write().await.replace_for_parent(mutation)
    }

    async fn get(&self, id: &str) -> StoreResult<Option<PendingMutation>> {
        Ok(self.index.read().await.get(id))
    }

    async fn find_by_parent(&self, parent: &ParentRef) -> StoreResult<Option<PendingMutation>> {
        Ok(self.index.read().await.find_by_parent(parent))
    }

    async fn update(&self, mutation: PendingMutation) -> StoreResult<()> {
        self.index.write().await.update(mutation)
    }

    async fn delete(&self, id: &str) -> StoreResult<bool> {
        Ok(self.index.write().await.delete(id).is_some())
    }

    async fn delete_for_parent(&self, parent: &ParentRef) -> StoreResult<Option<PendingMutation>> {
        Ok(self.index.write().await.delete_for_parent(parent))
    }

    async fn due(&self, now: DateTime<Utc>) -> StoreResult<Vec<PendingMutation>> {
        Ok(self.index.read().await.due(now))
    }

    async fn list(&self) -> StoreResult<Vec<PendingMutation>> {
        Ok(self.index.read().await.list())
    }

    async fn count(&self) -> StoreResult<usize> {
        Ok(self.index.read().await.len())
    }
}
