use super::memory::MutationIndex;
use super::{PassLock, PendingMutationStore, StoreResult};
use crate::core::ParentRef;
use crate::mutation::PendingMutation;
use crate::snapshot::{
    SnapshotLock, lock_exclusive, read_json, try_lock_exclusive, write_json_atomic,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;
use tracing::{Level, event};

/// Store persisted as a single JSON file that several processes may share.
///
/// Every operation reads the file afresh. Writes hold an advisory lock on
/// the sibling `.lock` file across read, change and rewrite, so a record
/// written by another process is never lost. A failed write changes nothing.
#[derive(Debug)]
pub struct FilePendingStore {
    path: PathBuf,
    write_gate: Mutex<()>,
    pass_lock: Arc<StdMutex<Option<SnapshotLock>>>,
}

impl FilePendingStore {
    /// Opens the store at `path`, checking that any records already saved there load.
    pub async fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let store = Self {
            path: path.into(),
            write_gate: Mutex::new(()),
            pass_lock: Arc::new(StdMutex::new(None)),
        };
        let index = store.load().await?;
        event!(
            Level::DEBUG,
            path = %store.path.display(),
            records = index.len(),
            "pending mutation store opened"
        );
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> StoreResult<MutationIndex> {
        Ok(read_json::<MutationIndex>(&self.path).await?.unwrap_or_default())
    }

    fn holds_pass_lock(&self) -> bool {
        match self.pass_lock.lock() {
            Ok(slot) => slot.is_some(),
            Err(poisoned) => poisoned.into_inner().is_some(),
        }
    }

    async fn write<T>(
        &self,
        op: impl FnOnce(&mut MutationIndex) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let _gate = self.write_gate.lock().await;
        // A pass held by this store already excludes other processes.
        let _file_lock = if self.holds_pass_lock() {
            None
        } else {
            Some(lock_exclusive(&self.path).await?)
        };

        let mut index = self.load().await?;
        let result = op(&mut index)?;
        write_json_atomic(&self.path, &index).await?;
        Ok(result)
    }
}

#[async_trait]
impl PendingMutationStore for FilePendingStore {
    async fn insert(&self, mutation: PendingMutation) -> StoreResult<()> {
        self.write(|index| index.insert(mutation)).await
    }

    async fn replace_for_parent(
        &self,
        mutation: PendingMutation,
    ) -> StoreResult<Option<PendingMutation>> {
        self.write(|index| index.replace_for_parent(mutation)).await
    }

    async fn get(&self, id: &str) -> StoreResult<Option<PendingMutation>> {
        Ok(self.load().await?.get(id))
    }

    async fn find_by_parent(&self, parent: &ParentRef) -> StoreResult<Option<PendingMutation>> {
        Ok(self.load().await?.find_by_parent(parent))
    }

    async fn update(&self, mutation: PendingMutation) -> StoreResult<()> {
        self.write(|index| index.update(mutation)).await
    }

    async fn delete(&self, id: &str) -> StoreResult<bool> {
        if self.load().await?.get(id).is_none() {
            return Ok(false);
        }
        self.write(|index| Ok(index.delete(id).is_some())).await
    }

    async fn delete_for_parent(&self, parent: &ParentRef) -> StoreResult<Option<PendingMutation>> {
        if self.load().await?.find_by_parent(parent).is_none() {
            return Ok(None);
        }
        self.write(|index| Ok(index.delete_for_parent(parent))).await
    }

    async fn due(&self, now: DateTime<Utc>) -> StoreResult<Vec<PendingMutation>> {
        Ok(self.load().await?.due(now))
    }

    async fn list(&self) -> StoreResult<Vec<PendingMutation>> {
        Ok(self.load().await?.list())
    }

    async fn count(&self) -> StoreResult<usize> {
        Ok(self.load().await?.len())
    }

    async fn try_lock_pass(&self) -> StoreResult<Option<PassLock>> {
        let _gate = self.write_gate.lock().await;
        let Some(lock) = try_lock_exclusive(&self.path).await? else {
            return Ok(None);
        };

        let slot = self.pass_lock.clone();
        match slot.lock() {
            Ok(mut held) => *held = Some(lock),
            Err(poisoned) => *poisoned.into_inner() = Some(lock),
        }
        Ok(Some(PassLock::on_release(move || match slot.lock() {
            Ok(mut held) => *held = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        })))
    }
}
