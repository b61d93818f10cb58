use super::table::{EntityTable, TableEntity, TableSnapshot};
use super::{EntityResolver, PendingEntity, SaveOptions, StoreResult};
use crate::clock::Clock;
use crate::core::{AttributeMap, ParentRef, PersistenceError};
use crate::snapshot::{SnapshotLock, lock_exclusive, read_json, write_json_atomic};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{Level, event};

#[derive(Debug, Serialize, Deserialize)]
struct RegistrySnapshot {
    tables: Vec<TableSnapshot>,
}

/// Entity tables keyed by entity type.
#[derive(Clone, Default)]
pub struct EntityRegistry {
    tables: BTreeMap<String, EntityTable>,
    snapshot_path: Option<PathBuf>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes entities handed out by [`EntityResolver::resolve`] rewrite the
    /// snapshot at `path` after every successful save.
    pub fn persist_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.snapshot_path = Some(path.into());
        self
    }

    pub fn snapshot_path(&self) -> Option<&Path> {
        self.snapshot_path.as_deref()
    }

    /// Adds `table`, replacing any table registered under the same type.
    pub fn register(&mut self, table: EntityTable) -> &mut Self {
        self.tables.insert(table.entity_type().to_string(), table);
        self
    }

    pub fn table(&self, entity_type: &str) -> StoreResult<&EntityTable> {
        self.tables
            .get(entity_type)
            .ok_or_else(|| PersistenceError::UnknownEntityType(entity_type.to_string()))
    }

    pub fn entity_types(&self) -> Vec<String> {
        self.tables.keys().cloned().collect()
    }

    /// Overwrites the snapshot at `path` with the tables held in memory.
    pub async fn save(&self, path: &Path) -> StoreResult<()> {
        self.write_snapshot(path, Vec::new()).await
    }

    /// Locks the snapshot at `path` against other writers and reloads every
    /// registered table from it. Registered tables missing from the file keep
    /// their rows.
    pub async fn lock_snapshot(&self, path: &Path) -> StoreResult<RegistryLock<'_>> {
        let lock = lock_exclusive(path).await?;
        let mut unregistered = Vec::new();
        if let Some(snapshot) = read_json::<RegistrySnapshot>(path).await? {
            for table in snapshot.tables {
                match self.tables.get(&table.schema.entity_type) {
                    Some(registered) => registered.replace_rows(table.rows).await,
                    None => unregistered.push(table),
                }
            }
        }
        Ok(RegistryLock {
            registry: self,
            path: path.to_path_buf(),
            unregistered,
            _lock: lock,
        })
    }

    /// Adds `table` to the snapshot at `path`, replacing a stored table of the
    /// same type and keeping the others.
    pub async fn define_in(path: &Path, table: EntityTable) -> StoreResult<()> {
        let _lock = lock_exclusive(path).await?;
        let mut tables = read_json::<RegistrySnapshot>(path)
            .await?
            .map(|snapshot| snapshot.tables)
            .unwrap_or_default();
        tables.retain(|stored| stored.schema.entity_type != table.entity_type());
        tables.push(table.snapshot().await);
        tables.sort_by(|a, b| a.schema.entity_type.cmp(&b.schema.entity_type));
        write_json_atomic(path, &RegistrySnapshot { tables }).await?;
        event!(
            Level::DEBUG,
            path = %path.display(),
            entity_type = table.entity_type(),
            "entity type defined"
        );
        Ok(())
    }

    async fn write_snapshot(&self, path: &Path, carried: Vec<TableSnapshot>) -> StoreResult<()> {
        let mut tables = Vec::with_capacity(self.tables.len() + carried.len());
        for table in self.tables.values() {
            tables.push(table.snapshot().await);
        }
        tables.extend(carried);
        tables.sort_by(|a, b| a.schema.entity_type.cmp(&b.schema.entity_type));
        write_json_atomic(path, &RegistrySnapshot { tables }).await?;
        event!(Level::DEBUG, path = %path.display(), "entity snapshot written");
        Ok(())
    }

    /// Loads every table stored at `path`. A missing file yields an empty registry.
    pub async fn load(path: &Path, clock: Arc<dyn Clock>) -> StoreResult<Self> {
        let mut registry = Self::new();
        if let Some(snapshot) = read_json::<RegistrySnapshot>(path).await? {
            for table in snapshot.tables {
                registry.register(EntityTable::from_snapshot(table, clock.clone()));
            }
        }
        Ok(registry)
    }
}

/// Exclusive hold on a registry snapshot, released on drop.
///
/// Tables found in the file but not registered are written back unchanged.
pub struct RegistryLock<'a> {
    registry: &'a EntityRegistry,
    path: PathBuf,
    unregistered: Vec<TableSnapshot>,
    _lock: SnapshotLock,
}

impl RegistryLock<'_> {
    pub async fn save(&self) -> StoreResult<()> {
        self.registry
            .write_snapshot(&self.path, self.unregistered.clone())
            .await
    }
}

#[async_trait]
impl EntityResolver for EntityRegistry {
    async fn resolve(&self, parent: &ParentRef) -> StoreResult<Option<Box<dyn PendingEntity>>> {
        let table = self.table(&parent.entity_type)?;
        let Some(entity) = table.entity(&parent.entity_id).await else {
            return Ok(None);
        };

        let boxed: Box<dyn PendingEntity> = match &self.snapshot_path {
            Some(path) => Box::new(SavedEntity {
                entity,
                registry: self.clone(),
                path: path.clone(),
            }),
            None => Box::new(entity),
        };
        Ok(Some(boxed))
    }
}

/// Table entity whose saves are followed by a registry snapshot.
struct SavedEntity {
    entity: TableEntity,
    registry: EntityRegistry,
    path: PathBuf,
}

#[async_trait]
impl PendingEntity for SavedEntity {
    fn parent_ref(&self) -> ParentRef {
        self.entity.parent_ref()
    }

    fn allowed_pending_attributes(&self) -> Vec<String> {
        self.entity.allowed_pending_attributes()
    }

    async fn attribute_values(&self, keys: &[String]) -> StoreResult<AttributeMap> {
        self.entity.attribute_values(keys).await
    }

    async fn set_attributes_and_save(
        &mut self,
        values: &AttributeMap,
        options: SaveOptions,
    ) -> StoreResult<()> {
        let snapshot = self.registry.lock_snapshot(&self.path).await?;
        let previous = self.entity.fresh().await;
        self.entity.set_attributes_and_save(values, options).await?;

        if let Err(err) = snapshot.save().await {
            if let Some(row) = previous {
                let keys: Vec<String> = values.keys().cloned().collect();
                let restore: AttributeMap = keys
                    .iter()
                    .filter_map(|key| row.get(key).map(|value| (key.clone(), value.clone())))
                    .collect();
                self.entity.restore(&restore, row.updated_at).await;
            }
            event!(Level::ERROR, error = %err, "entity snapshot failed, change rolled back");
            return Err(err);
        }
        Ok(())
    }
}
