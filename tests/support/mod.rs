#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use pending_updates::clock::ManualClock;
use pending_updates::core::Column;
use pending_updates::entity::EntityRow;
use pending_updates::{
    DataType, EntityRegistry, EntityTable, InMemoryPendingStore, ParentRef, PassStatus,
    PendingConfig, PendingMutation, PendingMutationStore, PendingUpdates, PersistenceError,
    TableEntity, Value, attributes,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

pub const FROZEN_AT: &str = "2023-01-01 00:00:00";

pub fn at(timestamp: &str) -> DateTime<Utc> {
    NaiveDateTime::parse_from_str(timestamp, "%Y-%m-%d %H:%M:%S")
        .unwrap()
        .and_utc()
}

pub fn format(timestamp: Option<DateTime<Utc>>) -> Option<String> {
    timestamp.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
}

pub fn test_table(clock: &ManualClock) -> EntityTable {
    EntityTable::new(
        "TestModel",
        vec![
            Column::new("name", DataType::Text).not_null(),
            Column::new("secret", DataType::Text),
        ],
        Arc::new(clock.clone()),
    )
    .fillable(["name"])
}

pub struct Fixture {
    pub clock: ManualClock,
    pub table: EntityTable,
    pub registry: Arc<EntityRegistry>,
    pub store: Arc<InMemoryPendingStore>,
    pub service: PendingUpdates,
    pub id: String,
}

pub async fn fixture() -> Fixture {
    fixture_with(PendingConfig::default()).await
}

pub async fn fixture_with(config: PendingConfig) -> Fixture {
    let clock = ManualClock::new(at(FROZEN_AT));
    let table = test_table(&clock);
    let id = table
        .insert(attributes([("name", "John Doe"), ("secret", "hash")]))
        .await
        .unwrap();

    let mut registry = EntityRegistry::new();
    registry.register(table.clone());

    let store = Arc::new(InMemoryPendingStore::new());
    let service = PendingUpdates::new(store.clone(), Arc::new(clock.clone()), config).unwrap();

    Fixture {
        clock,
        table,
        registry: Arc::new(registry),
        store,
        service,
        id,
    }
}

impl Fixture {
    pub fn parent(&self) -> ParentRef {
        ParentRef::new("TestModel", self.id.clone())
    }

    pub async fn entity(&self) -> TableEntity {
        self.table.entity(&self.id).await.unwrap()
    }

    pub async fn create(&self, name: &str) -> String {
        self.table
            .insert(attributes([("name", name)]))
            .await
            .unwrap()
    }

    pub async fn row(&self, id: &str) -> EntityRow {
        self.table.get(id).await.unwrap()
    }

    pub async fn name_of(&self, id: &str) -> Value {
        self.row(id).await.get("name").cloned().unwrap()
    }

    pub async fn name(&self) -> Value {
        self.name_of(&self.id).await
    }

    pub async fn pending(&self) -> Vec<PendingMutation> {
        self.store.list().await.unwrap()
    }

    pub async fn first_pending(&self) -> PendingMutation {
        self.pending().await.into_iter().next().unwrap()
    }

    /// Stores a record directly, bypassing the window checks.
    pub async fn seed(
        &self,
        id: &str,
        values: &[(&str, Value)],
        start_at: Option<&str>,
        revert_at: Option<&str>,
    ) -> PendingMutation {
        let now = self.clock_now();
        let mutation = PendingMutation {
            id: pending_updates::core::new_mutation_id(),
            parent: ParentRef::new("TestModel", id),
            values: attributes(values.iter().cloned()),
            start_at: start_at.map(at),
            revert_at: revert_at.map(at),
            created_at: now,
            updated_at: now,
        };
        self.store.replace_for_parent(mutation.clone()).await.unwrap();
        mutation
    }

    pub async fn check(&self) {
        let reconciler = self.service.reconciler(self.registry.clone());
        assert_eq!(reconciler.run_pass().await.unwrap(), PassStatus::Completed);
    }

    fn clock_now(&self) -> DateTime<Utc> {
        use pending_updates::Clock;
        self.clock.now()
    }
}

/// In-memory store whose `update` and `replace_for_parent` fail a set number of times.
#[derive(Default)]
pub struct FlakyStore {
    inner: InMemoryPendingStore,
    failing_updates: AtomicUsize,
    failing_replaces: AtomicUsize,
}

impl FlakyStore {
    pub fn failing_updates(count: usize) -> Self {
        let store = Self::default();
        store.failing_updates.store(count, Ordering::SeqCst);
        store
    }

    pub fn failing_replaces(count: usize) -> Self {
        let store = Self::default();
        store.failing_replaces.store(count, Ordering::SeqCst);
        store
    }

    fn trip(counter: &AtomicUsize) -> Result<(), PersistenceError> {
        let tripped = counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if tripped {
            return Err(PersistenceError::Io("disk full".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl PendingMutationStore for FlakyStore {
    async fn insert(&self, mutation: PendingMutation) -> Result<(), PersistenceError> {
        self.inner.insert(mutation).await
    }

    async fn replace_for_parent(
        &self,
        mutation: PendingMutation,
    ) -> Result<Option<PendingMutation>, PersistenceError> {
        Self::trip(&self.failing_replaces)?;
        self.inner.replace_for_parent(mutation).await
    }

    async fn get(&self, id: &str) -> Result<Option<PendingMutation>, PersistenceError> {
        self.inner.get(id).await
    }

    async fn find_by_parent(
        &self,
        parent: &ParentRef,
    ) -> Result<Option<PendingMutation>, PersistenceError> {
        self.inner.find_by_parent(parent).await
    }

    async fn update(&self, mutation: PendingMutation) -> Result<(), PersistenceError> {
        Self::trip(&self.failing_updates)?;
        self.inner.update(mutation).await
    }

    async fn delete(&self, id: &str) -> Result<bool, PersistenceError> {
        self.inner.delete(id).await
    }

    async fn delete_for_parent(
        &self,
        parent: &ParentRef,
    ) -> Result<Option<PendingMutation>, PersistenceError> {
        self.inner.delete_for_parent(parent).await
    }

    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<PendingMutation>, PersistenceError> {
        self.inner.due(now).await
    }

    async fn list(&self) -> Result<Vec<PendingMutation>, PersistenceError> {
        self.inner.list().await
    }

    async fn count(&self) -> Result<usize, PersistenceError> {
        self.inner.count().await
    }
}

impl Fixture {
    /// A service over `store` sharing the fixture's clock.
    pub fn service_over(&self, store: Arc<dyn PendingMutationStore>) -> PendingUpdates {
        PendingUpdates::new(store, Arc::new(self.clock.clone()), PendingConfig::default()).unwrap()
    }
}
