// ============================================================================
// Pending Updates Library
// ============================================================================

//! Delayed and self-reverting attribute updates.
//!
//! An update can be applied later (`delay_for*`, `start_from`), applied now
//! and undone later (`keep_for*`, `revert_at`), or both. Scheduled changes
//! are stored as [`PendingMutation`] records and driven by a [`Reconciler`]
//! pass that an external scheduler triggers.
//!
//! ```ignore
//! use pending_updates::{attributes, PendingUpdates};
//!
//! let outcome = service
//!     .postpone(&mut entity)
//!     .delay_for_minutes(10)?
//!     .keep_for_hours(3)?
//!     .update(attributes([("name", "Stefan")]))
//!     .await?;
//!
//! // later, from a timer or cron job
//! service.reconciler(resolver).run_pass().await?;
//! ```

pub mod clock;
pub mod config;
pub mod core;
pub mod entity;
pub mod mutation;
pub mod postponer;
pub mod reconciler;
pub mod service;
mod snapshot;
pub mod store;
pub mod window;
pub mod worker;

// Re-export main types for convenience
pub use clock::{Clock, SystemClock};
pub use config::PendingConfig;
pub use core::{
    AttributeMap, DataType, InvalidParameters, ParentRef, PendingError, PersistenceError, Result,
    Value, attributes,
};
pub use entity::{
    EntityRegistry, EntityResolver, EntityTable, PendingEntity, SaveOptions, TableEntity,
};
pub use mutation::{MutationState, PendingMutation, TransitionOutcome};
pub use postponer::{Postponer, UpdateOutcome};
pub use reconciler::{PassStatus, Reconciler};
pub use service::PendingUpdates;
pub use store::{FilePendingStore, InMemoryPendingStore, PendingMutationStore};
pub use window::{Window, WindowBuilder};
pub use worker::{ReconcileWorker, spawn_reconcile_worker};
