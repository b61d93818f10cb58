use super::{PendingEntity, SaveOptions, StoreResult};
use crate::clock::Clock;
use crate::core::{AttributeMap, Column, ParentRef, PersistenceError, Value};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRow {
    pub id: String,
    pub attributes: AttributeMap,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EntityRow {
    pub fn get(&self, attribute: &str) -> Option<&Value> {
        self.attributes.get(attribute)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub entity_type: String,
    pub columns: Vec<Column>,
    /// Attributes callers may schedule changes for.
    pub fillable: Vec<String>,
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|column| column.name == name)
    }
}

/// Serialized form of a table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSnapshot {
    pub schema: TableSchema,
    pub rows: Vec<EntityRow>,
}

/// In-memory table of entities of a single type.
///
/// Clones share storage, so handles given out by [`EntityTable::entity`]
/// write through to the same rows.
#[derive(Clone)]
pub struct EntityTable {
    schema: Arc<TableSchema>,
    rows: Arc<RwLock<BTreeMap<String, EntityRow>>>,
    next_id: Arc<AtomicU64>,
    clock: Arc<dyn Clock>,
}

impl EntityTable {
    pub fn new(entity_type: impl Into<String>, columns: Vec<Column>, clock: Arc<dyn Clock>) -> Self {
        Self {
            schema: Arc::new(TableSchema {
                entity_type: entity_type.into(),
                columns,
                fillable: Vec::new(),
            }),
            rows: Arc::new(RwLock::new(BTreeMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            clock,
        }
    }

    /// Sets the attributes pending updates may touch.
    pub fn fillable<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut schema = (*self.schema).clone();
        schema.fillable = attributes.into_iter().map(Into::into).collect();
        self.schema = Arc::new(schema);
        self
    }

    pub fn entity_type(&self) -> &str {
        &self.schema.entity_type
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub fn parent_ref(&self, id: &str) -> ParentRef {
        ParentRef::new(self.schema.entity_type.clone(), id)
    }

    pub async fn insert(&self, attributes: AttributeMap) -> StoreResult<String> {
        let mut full = AttributeMap::new();
        for column in &self.schema.columns {
            let value = attributes.get(&column.name).cloned().unwrap_or(Value::Null);
            column.validate(&value)?;
            full.insert(column.name.clone(), value);
        }
        self.reject_unknown(&attributes)?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        let now = self.clock.now();
        let row = EntityRow {
            id: id.clone(),
            attributes: full,
            created_at: now,
            updated_at: now,
        };
        self.rows.write().await.insert(id.clone(), row);
        Ok(id)
    }

    pub async fn get(&self, id: &str) -> Option<EntityRow> {
        self.rows.read().await.get(id).cloned()
    }

    pub async fn exists(&self, id: &str) -> bool {
        self.rows.read().await.contains_key(id)
    }

    pub async fn count(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn rows(&self) -> Vec<EntityRow> {
        self.rows.read().await.values().cloned().collect()
    }

    /// Overwrites `values` on the row. The row is left untouched on error.
    pub async fn update(
        &self,
        id: &str,
        values: &AttributeMap,
        options: SaveOptions,
    ) -> StoreResult<()> {
        self.reject_unknown(values)?;
        for (name, value) in values {
            if let Some(column) = self.schema.column(name) {
                column.validate(value)?;
            }
        }

        let mut rows = self.rows.write().await;
        let row = rows
            .get_mut(id)
            .ok_or_else(|| PersistenceError::EntityNotFound(self.parent_ref(id).to_string()))?;

        for (name, value) in values {
            row.attributes.insert(name.clone(), value.clone());
        }
        if options.touch_timestamps {
            row.updated_at = self.clock.now();
        }
        Ok(())
    }

    /// Removes the row. Callers own the cascade to pending mutations.
    pub async fn delete(&self, id: &str) -> bool {
        self.rows.write().await.remove(id).is_some()
    }

    pub async fn entity(&self, id: &str) -> Option<TableEntity> {
        if !self.exists(id).await {
            return None;
        }
        Some(TableEntity {
            table: self.clone(),
            id: id.to_string(),
        })
    }

    pub async fn snapshot(&self) -> TableSnapshot {
        TableSnapshot {
            schema: (*self.schema).clone(),
            rows: self.rows().await,
        }
    }

    pub fn from_snapshot(snapshot: TableSnapshot, clock: Arc<dyn Clock>) -> Self {
        let next_id = next_free_id(&snapshot.rows);
        let rows = snapshot
            .rows
            .into_iter()
            .map(|row| (row.id.clone(), row))
            .collect();

        Self {
            schema: Arc::new(snapshot.schema),
            rows: Arc::new(RwLock::new(rows)),
            next_id: Arc::new(AtomicU64::new(next_id)),
            clock,
        }
    }

    /// Swaps every row for `rows` read back from a snapshot. Ids are never reused.
    pub(crate) async fn replace_rows(&self, rows: Vec<EntityRow>) {
        self.next_id.fetch_max(next_free_id(&rows), Ordering::SeqCst);
        *self.rows.write().await = rows
            .into_iter()
            .map(|row| (row.id.clone(), row))
            .collect();
    }

    fn reject_unknown(&self, values: &AttributeMap) -> StoreResult<()> {
        match values.keys().find(|name| self.schema.column(name).is_none()) {
            Some(name) => Err(PersistenceError::UnknownAttribute {
                entity_type: self.schema.entity_type.clone(),
                attribute: name.clone(),
            }),
            None => Ok(()),
        }
    }
}

fn next_free_id(rows: &[EntityRow]) -> u64 {
    rows.iter()
        .filter_map(|row| row.id.parse::<u64>().ok())
        .max()
        .map_or(1, |max| max + 1)
}

/// Handle to one row of an [`EntityTable`].
#[derive(Clone)]
pub struct TableEntity {
    table: EntityTable,
    id: String,
}

impl TableEntity {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Fresh copy of the row, `None` once deleted.
    pub async fn fresh(&self) -> Option<EntityRow> {
        self.table.get(&self.id).await
    }

    /// Puts back values read earlier from this row, bypassing validation.
    pub(crate) async fn restore(&self, values: &AttributeMap, updated_at: DateTime<Utc>) {
        let mut rows = self.table.rows.write().await;
        if let Some(row) = rows.get_mut(&self.id) {
            for (name, value) in values {
                row.attributes.insert(name.clone(), value.clone());
            }
            row.updated_at = updated_at;
        }
    }
}

#[async_trait]
impl PendingEntity for TableEntity {
    fn parent_ref(&self) -> ParentRef {
        self.table.parent_ref(&self.id)
    }

    fn allowed_pending_attributes(&self) -> Vec<String> {
        self.table.schema.fillable.clone()
    }

    async fn attribute_values(&self, keys: &[String]) -> StoreResult<AttributeMap> {
        let row = self
            .fresh()
            .await
            .ok_or_else(|| PersistenceError::EntityNotFound(self.parent_ref().to_string()))?;
        Ok(keys
            .iter()
            .filter_map(|key| row.get(key).map(|value| (key.clone(), value.clone())))
            .collect())
    }

    async fn set_attributes_and_save(
        &mut self,
        values: &AttributeMap,
        options: SaveOptions,
    ) -> StoreResult<()> {
        self.table.update(&self.id, values, options).await
    }
}
