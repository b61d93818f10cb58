use crate::core::{DataType, PersistenceError, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Attribute name to value mapping, ordered by attribute name.
pub type AttributeMap = BTreeMap<String, Value>;

/// Polymorphic reference to the entity that owns a pending mutation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParentRef {
    pub entity_type: String,
    pub entity_id: String,
}

impl ParentRef {
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }
}

impl fmt::Display for ParentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.entity_id)
    }
}

pub fn new_mutation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Builds an [`AttributeMap`] from `(name, value)` pairs.
pub fn attributes<K, V, I>(pairs: I) -> AttributeMap
where
    K: Into<String>,
    V: Into<Value>,
    I: IntoIterator<Item = (K, V)>,
{
    pairs
        .into_iter()
        .map(|(key, value)| (key.into(), value.into()))
        .collect()
}

/// The keys whose value would change, with both sides of the change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttributeDelta {
    pub original: AttributeMap,
    pub changed: AttributeMap,
}

impl AttributeDelta {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changed.len()
    }
}

/// Compares `target` against `current`. Keys absent from `current` count as NULL.
pub fn attribute_delta(current: &AttributeMap, target: &AttributeMap) -> AttributeDelta {
    let mut delta = AttributeDelta::default();
    for (key, new_value) in target {
        let old_value = current.get(key).cloned().unwrap_or(Value::Null);
        if old_value != *new_value {
            delta.original.insert(key.clone(), old_value);
            delta.changed.insert(key.clone(), new_value.clone());
        }
    }
    delta
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: true,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn validate(&self, value: &Value) -> std::result::Result<(), PersistenceError> {
        if value.is_null() {
            if !self.nullable {
                return Err(PersistenceError::ConstraintViolation(format!(
                    "Column '{}' cannot be NULL",
                    self.name
                )));
            }
            return Ok(());
        }

        if !self.data_type.is_compatible(value) {
            return Err(PersistenceError::TypeMismatch(format!(
                "Column '{}' expects type {}, got {}",
                self.name,
                self.data_type,
                value.type_name()
            )));
        }

        Ok(())
    }
}
