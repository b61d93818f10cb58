use crate::clock::Clock;
use crate::config::PendingConfig;
use crate::core::{ParentRef, Result};
use crate::entity::{EntityResolver, PendingEntity};
use crate::mutation::PendingMutation;
use crate::postponer::Postponer;
use crate::reconciler::Reconciler;
use crate::store::PendingMutationStore;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{Level, event};

/// Entry point wiring a store, a clock and configuration together.
///
/// Clones share the reconciler run-lock.
#[derive(Clone)]
pub struct PendingUpdates {
    store: Arc<dyn PendingMutationStore>,
    clock: Arc<dyn Clock>,
    config: PendingConfig,
    run_lock: Arc<Mutex<()>>,
}

impl PendingUpdates {
    pub fn new(
        store: Arc<dyn PendingMutationStore>,
        clock: Arc<dyn Clock>,
        config: PendingConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            clock,
            config,
            run_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn store(&self) -> &Arc<dyn PendingMutationStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn config(&self) -> &PendingConfig {
        &self.config
    }

    /// Starts a scheduling request for `entity`.
    pub fn postpone<'a>(&self, entity: &'a mut dyn PendingEntity) -> Postponer<'a> {
        Postponer::new(
            entity,
            self.store.clone(),
            self.clock.clone(),
            self.config.clone(),
        )
    }

    pub async fn has_pending_mutation(&self, parent: &ParentRef) -> Result<bool> {
        Ok(self.store.exists_for_parent(parent).await?)
    }

    pub async fn pending_mutation(&self, parent: &ParentRef) -> Result<Option<PendingMutation>> {
        Ok(self.store.find_by_parent(parent).await?)
    }

    /// Drops whatever is scheduled for `parent`. Call after deleting the entity.
    pub async fn forget(&self, parent: &ParentRef) -> Result<Option<PendingMutation>> {
        let removed = self.store.delete_for_parent(parent).await?;
        if let Some(mutation) = &removed {
            event!(
                Level::INFO,
                parent = %parent,
                mutation_id = %mutation.id,
                "pending mutation cancelled"
            );
        }
        Ok(removed)
    }

    pub fn reconciler(&self, resolver: Arc<dyn EntityResolver>) -> Reconciler {
        Reconciler::new(self.store.clone(), resolver, self.clock.clone())
            .with_run_lock(self.run_lock.clone())
    }
}
