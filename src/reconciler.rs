//! One scan-and-execute pass over due pending mutations.

use crate::clock::Clock;
use crate::core::Result;
use crate::entity::EntityResolver;
use crate::mutation::{TransitionOutcome, apply, revert};
use crate::store::PendingMutationStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{Instrument, Level, event, info_span};

/// Result of [`Reconciler::run_pass`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassStatus {
    /// The scan finished; every due record was handled or reported.
    Completed,
    /// Another pass held the run-lock, nothing was touched.
    AlreadyRunning,
}

#[derive(Debug, Default)]
struct PassTally {
    applied: usize,
    armed_for_revert: usize,
    reverted: usize,
    orphaned: usize,
    abandoned: usize,
    failed: usize,
}

impl PassTally {
    fn record(&mut self, outcome: &TransitionOutcome) {
        match outcome {
            TransitionOutcome::Applied => self.applied += 1,
            TransitionOutcome::ArmedForRevert => self.armed_for_revert += 1,
            TransitionOutcome::Reverted => self.reverted += 1,
            TransitionOutcome::Orphaned => self.orphaned += 1,
            TransitionOutcome::Abandoned(_) => self.abandoned += 1,
        }
    }
}

/// Drives due records through apply and revert.
///
/// Passes are serialized by a run-lock, which reconcilers built by the same
/// [`PendingUpdates`](crate::PendingUpdates) share, and by the store's pass
/// lock, which covers other processes.
pub struct Reconciler {
    store: Arc<dyn PendingMutationStore>,
    resolver: Arc<dyn EntityResolver>,
    clock: Arc<dyn Clock>,
    run_lock: Arc<Mutex<()>>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn PendingMutationStore>,
        resolver: Arc<dyn EntityResolver>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            resolver,
            clock,
            run_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Shares `run_lock` with other reconcilers over the same store.
    pub fn with_run_lock(mut self, run_lock: Arc<Mutex<()>>) -> Self {
        self.run_lock = run_lock;
        self
    }

    /// Runs one pass. Fails only when the due records cannot be listed;
    /// per-record failures are reported as events and leave the rest of the
    /// batch running.
    pub async fn run_pass(&self) -> Result<PassStatus> {
        let Ok(_guard) = self.run_lock.try_lock() else {
            event!(Level::DEBUG, "reconciler pass already running, skipping");
            return Ok(PassStatus::AlreadyRunning);
        };
        let Some(_pass) = self.store.try_lock_pass().await? else {
            event!(Level::DEBUG, "store is locked by another pass, skipping");
            return Ok(PassStatus::AlreadyRunning);
        };

        let now = self.clock.now();
        let span = info_span!("pending.reconcile", now = %now);
        self.run_locked(now).instrument(span).await
    }

    async fn run_locked(&self, now: DateTime<Utc>) -> Result<PassStatus> {
        let due = self.store.due(now).await.inspect_err(|err| {
            event!(Level::ERROR, error = %err, "failed to scan due pending mutations");
        })?;

        let mut tally = PassTally::default();
        for mutation in &due {
            // Revert wins when both guards hold.
            let result = if mutation.should_revert(now) {
                revert(mutation, self.resolver.as_ref(), self.store.as_ref()).await
            } else {
                apply(mutation, self.resolver.as_ref(), self.store.as_ref(), now).await
            };

            match result {
                Ok(outcome) => tally.record(&outcome),
                Err(err) => {
                    tally.failed += 1;
                    event!(
                        Level::WARN,
                        mutation_id = %mutation.id,
                        parent = %mutation.parent,
                        error = %err,
                        "pending mutation transition failed, record kept for the next pass"
                    );
                }
            }
        }

        event!(
            Level::INFO,
            due = due.len(),
            applied = tally.applied,
            armed_for_revert = tally.armed_for_revert,
            reverted = tally.reverted,
            orphaned = tally.orphaned,
            abandoned = tally.abandoned,
            failed = tally.failed,
            "reconciler pass completed"
        );
        Ok(PassStatus::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::core::{AttributeMap, ParentRef, PersistenceError, attributes};
    use crate::entity::{PendingEntity, SaveOptions};
    use crate::mutation::PendingMutation;
    use crate::store::InMemoryPendingStore;
    use crate::window::Window;
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap()
    }

    struct FailingResolver;

    #[async_trait]
    impl EntityResolver for FailingResolver {
        async fn resolve(
            &self,
            parent: &ParentRef,
        ) -> std::result::Result<Option<Box<dyn PendingEntity>>, PersistenceError> {
            Err(PersistenceError::UnknownEntityType(parent.entity_type.clone()))
        }
    }

    struct Ghost;

    #[async_trait]
    impl PendingEntity for Ghost {
        fn parent_ref(&self) -> ParentRef {
            ParentRef::new("Ghost", "1")
        }

        fn allowed_pending_attributes(&self) -> Vec<String> {
            Vec::new()
        }

        async fn attribute_values(
            &self,
            _keys: &[String],
        ) -> std::result::Result<AttributeMap, PersistenceError> {
            Ok(AttributeMap::new())
        }

        async fn set_attributes_and_save(
            &mut self,
            _values: &AttributeMap,
            _options: SaveOptions,
        ) -> std::result::Result<(), PersistenceError> {
            Ok(())
        }
    }

    struct NoEntities;

    #[async_trait]
    impl EntityResolver for NoEntities {
        async fn resolve(
            &self,
            _parent: &ParentRef,
        ) -> std::result::Result<Option<Box<dyn PendingEntity>>, PersistenceError> {
            Ok(None)
        }
    }

    struct AlwaysGhost;

    #[async_trait]
    impl EntityResolver for AlwaysGhost {
        async fn resolve(
            &self,
            _parent: &ParentRef,
        ) -> std::result::Result<Option<Box<dyn PendingEntity>>, PersistenceError> {
            Ok(Some(Box::new(Ghost)))
        }
    }

    fn record(id: &str, start: Option<i64>, revert: Option<i64>) -> PendingMutation {
        PendingMutation::new(
            ParentRef::new("Ghost", id),
            attributes([("name", "Stefan")]),
            Window {
                start_at: start.map(|m| t0() + Duration::minutes(m)),
                revert_at: revert.map(|m| t0() + Duration::minutes(m)),
            },
            t0(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_resolver_errors_keep_records() {
        let clock = ManualClock::new(t0() + Duration::hours(1));
        let store = Arc::new(InMemoryPendingStore::new());
        store.insert(record("1", Some(10), None)).await.unwrap();

        let reconciler =
            Reconciler::new(store.clone(), Arc::new(FailingResolver), Arc::new(clock));
        assert_eq!(reconciler.run_pass().await.unwrap(), PassStatus::Completed);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_orphans_are_removed_and_undue_records_kept() {
        let clock = ManualClock::new(t0() + Duration::minutes(10));
        let store = Arc::new(InMemoryPendingStore::new());
        store.insert(record("1", Some(10), None)).await.unwrap();
        store.insert(record("2", Some(20), None)).await.unwrap();

        let reconciler = Reconciler::new(store.clone(), Arc::new(NoEntities), Arc::new(clock));
        reconciler.run_pass().await.unwrap();

        let left = store.list().await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].parent.entity_id, "2");
    }

    #[tokio::test]
    async fn test_revert_takes_priority() {
        let clock = ManualClock::new(t0() + Duration::hours(5));
        let store = Arc::new(InMemoryPendingStore::new());
        store.insert(record("1", Some(10), Some(190))).await.unwrap();

        let reconciler = Reconciler::new(store.clone(), Arc::new(AlwaysGhost), Arc::new(clock));
        reconciler.run_pass().await.unwrap();

        // An apply would have re-armed the record instead of deleting it.
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_pass_is_skipped() {
        let clock = ManualClock::new(t0());
        let store = Arc::new(InMemoryPendingStore::new());
        let reconciler = Reconciler::new(store, Arc::new(NoEntities), Arc::new(clock));

        let _held = reconciler.run_lock.lock().await;
        assert_eq!(
            reconciler.run_pass().await.unwrap(),
            PassStatus::AlreadyRunning
        );
    }
}
