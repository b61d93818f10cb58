//! Apply and revert transitions of a due [`PendingMutation`].
//!
//! Entity writes go through [`SaveOptions::quiet`]. A failed entity write
//! abandons the record: it is deleted and the error is reported as an
//! `ERROR` event, never retried.

use super::PendingMutation;
use crate::core::{AttributeMap, PersistenceError, Result, Value};
use crate::entity::{EntityResolver, SaveOptions};
use crate::store::PendingMutationStore;
use chrono::{DateTime, Utc};
use tracing::{Instrument, Level, event, info_span};

/// What a transition did to the record and its entity.
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    /// Values written, record deleted.
    Applied,
    /// Values written, record now holds the previous values until `revert_at`.
    ArmedForRevert,
    /// Previous values restored, record deleted.
    Reverted,
    /// The entity no longer exists, record deleted.
    Orphaned,
    /// The entity rejected the write, record deleted.
    Abandoned(PersistenceError),
}

/// Writes the record's values onto its entity.
///
/// Guards are not checked here; callers decide when a record is due.
pub async fn apply(
    mutation: &PendingMutation,
    resolver: &dyn EntityResolver,
    store: &dyn PendingMutationStore,
    now: DateTime<Utc>,
) -> Result<TransitionOutcome> {
    let span = info_span!(
        "pending.apply",
        mutation_id = %mutation.id,
        parent = %mutation.parent
    );

    run_apply(mutation, resolver, store, now)
        .instrument(span)
        .await
}

async fn run_apply(
    mutation: &PendingMutation,
    resolver: &dyn EntityResolver,
    store: &dyn PendingMutationStore,
    now: DateTime<Utc>,
) -> Result<TransitionOutcome> {
    let Some(mut entity) = resolver.resolve(&mutation.parent).await? else {
        store.delete(&mutation.id).await?;
        event!(Level::INFO, "parent entity is gone, pending mutation removed");
        return Ok(TransitionOutcome::Orphaned);
    };

    let keys: Vec<String> = mutation.values.keys().cloned().collect();
    let current = entity.attribute_values(&keys).await?;

    if let Err(err) = entity
        .set_attributes_and_save(&mutation.values, SaveOptions::quiet())
        .await
    {
        event!(Level::ERROR, error = %err, "pending mutation could not be applied, abandoning it");
        store.delete(&mutation.id).await?;
        return Ok(TransitionOutcome::Abandoned(err));
    }

    let Some(revert_at) = mutation.revert_at else {
        store.delete(&mutation.id).await?;
        event!(Level::INFO, "pending mutation applied");
        return Ok(TransitionOutcome::Applied);
    };

    let original: AttributeMap = keys
        .into_iter()
        .map(|key| {
            let value = current.get(&key).cloned().unwrap_or(Value::Null);
            (key, value)
        })
        .collect();
    if let Err(err) = store
        .update(mutation.armed_for_revert(original.clone(), now))
        .await
    {
        // The record still holds the new values; the next pass applies again.
        if let Err(restore_err) = entity
            .set_attributes_and_save(&original, SaveOptions::quiet())
            .await
        {
            event!(
                Level::ERROR,
                error = %restore_err,
                "applied values could not be rolled back after a store failure"
            );
        }
        return Err(err.into());
    }
    event!(
        Level::INFO,
        revert_at = %revert_at,
        "pending mutation applied, armed for revert"
    );
    Ok(TransitionOutcome::ArmedForRevert)
}

/// Restores the values held by the record. Always terminal.
pub async fn revert(
    mutation: &PendingMutation,
    resolver: &dyn EntityResolver,
    store: &dyn PendingMutationStore,
) -> Result<TransitionOutcome> {
    let span = info_span!(
        "pending.revert",
        mutation_id = %mutation.id,
        parent = %mutation.parent
    );

    run_revert(mutation, resolver, store).instrument(span).await
}

async fn run_revert(
    mutation: &PendingMutation,
    resolver: &dyn EntityResolver,
    store: &dyn PendingMutationStore,
) -> Result<TransitionOutcome> {
    let Some(mut entity) = resolver.resolve(&mutation.parent).await? else {
        store.delete(&mutation.id).await?;
        event!(Level::INFO, "parent entity is gone, pending mutation removed");
        return Ok(TransitionOutcome::Orphaned);
    };

    let outcome = match entity
        .set_attributes_and_save(&mutation.values, SaveOptions::quiet())
        .await
    {
        Ok(()) => {
            event!(Level::INFO, "pending mutation reverted");
            TransitionOutcome::Reverted
        }
        Err(err) => {
            event!(Level::ERROR, error = %err, "pending mutation could not be reverted, abandoning it");
            TransitionOutcome::Abandoned(err)
        }
    };
    store.delete(&mutation.id).await?;
    Ok(outcome)
}
