//! Persistence of pending mutations, keyed by parent reference.

pub mod file;
pub mod memory;

use crate::core::{ParentRef, PersistenceError};
use crate::mutation::PendingMutation;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use file::FilePendingStore;
pub use memory::InMemoryPendingStore;

pub(crate) type StoreResult<T> = std::result::Result<T, PersistenceError>;

/// Storage for [`PendingMutation`] records.
///
/// Implementations hold at most one record per parent.
#[async_trait]
pub trait PendingMutationStore: Send + Sync {
    /// Fails with `DuplicatePendingMutation` when the parent already has a record.
    async fn insert(&self, mutation: PendingMutation) -> StoreResult<()>;

    /// Deletes the parent's current record, if any, then inserts `mutation`.
    /// Returns the superseded record.
    async fn replace_for_parent(
        &self,
        mutation: PendingMutation,
    ) -> StoreResult<Option<PendingMutation>>;

    async fn get(&self, id: &str) -> StoreResult<Option<PendingMutation>>;

    async fn find_by_parent(&self, parent: &ParentRef) -> StoreResult<Option<PendingMutation>>;

    async fn exists_for_parent(&self, parent: &ParentRef) -> StoreResult<bool> {
        Ok(self.find_by_parent(parent).await?.is_some())
    }

    /// Overwrites an existing record with the same id.
    async fn update(&self, mutation: PendingMutation) -> StoreResult<()>;

    /// Returns whether a record was removed.
    async fn delete(&self, id: &str) -> StoreResult<bool>;

    async fn delete_for_parent(&self, parent: &ParentRef) -> StoreResult<Option<PendingMutation>>;

    /// Records whose apply or revert guard holds at `now`.
    async fn due(&self, now: DateTime<Utc>) -> StoreResult<Vec<PendingMutation>>;

    async fn list(&self) -> StoreResult<Vec<PendingMutation>>;

    async fn count(&self) -> StoreResult<usize>;

    /// Excludes other processes sharing this store for the length of a
    /// reconciler pass. `Ok(None)` when one of them already holds it.
    async fn try_lock_pass(&self) -> StoreResult<Option<PassLock>> {
        Ok(Some(PassLock::free()))
    }
}

/// Held for the length of a reconciler pass. Dropping it releases the store.
#[must_use]
pub struct PassLock {
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl PassLock {
    /// A lock with nothing to release, for stores local to one process.
    pub fn free() -> Self {
        Self { release: None }
    }

    pub fn on_release(release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }
}

impl Drop for PassLock {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}
