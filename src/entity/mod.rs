//! The capability contract an entity must offer to have pending updates,
//! plus an in-memory implementation used by the binary and the tests.

pub mod registry;
pub mod table;

use crate::core::{AttributeMap, ParentRef, PersistenceError};
use async_trait::async_trait;

pub use registry::{EntityRegistry, RegistryLock};
pub use table::{EntityRow, EntityTable, TableEntity};

type StoreResult<T> = std::result::Result<T, PersistenceError>;

/// Options for [`PendingEntity::set_attributes_and_save`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveOptions {
    /// Bump the entity's own last-modified timestamp.
    pub touch_timestamps: bool,
}

impl SaveOptions {
    /// A regular, user-initiated save.
    pub fn touching() -> Self {
        Self {
            touch_timestamps: true,
        }
    }

    /// A system-driven restoration that leaves modification bookkeeping alone.
    pub fn quiet() -> Self {
        Self {
            touch_timestamps: false,
        }
    }
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self::touching()
    }
}

/// An entity whose attributes can be changed later.
#[async_trait]
pub trait PendingEntity: Send + Sync {
    /// Stable type + id of this entity.
    fn parent_ref(&self) -> ParentRef;

    /// Attributes a pending update may touch.
    fn allowed_pending_attributes(&self) -> Vec<String>;

    /// Current values for `keys`. Keys the entity does not know are omitted.
    async fn attribute_values(&self, keys: &[String]) -> StoreResult<AttributeMap>;

    /// Overwrites every listed attribute and persists the entity. Nothing is
    /// committed when this fails.
    async fn set_attributes_and_save(
        &mut self,
        values: &AttributeMap,
        options: SaveOptions,
    ) -> StoreResult<()>;
}

/// Looks up the owning entity of a pending mutation.
#[async_trait]
pub trait EntityResolver: Send + Sync {
    /// `Ok(None)` when the entity no longer exists.
    async fn resolve(&self, parent: &ParentRef) -> StoreResult<Option<Box<dyn PendingEntity>>>;
}
