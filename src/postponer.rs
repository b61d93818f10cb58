//! Fluent scheduling of a pending update for one entity.

use crate::clock::Clock;
use crate::config::PendingConfig;
use crate::core::{AttributeMap, PendingError, Result, attribute_delta};
use crate::entity::{PendingEntity, SaveOptions};
use crate::mutation::PendingMutation;
use crate::store::PendingMutationStore;
use crate::window::{self, WindowBuilder};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{Instrument, Level, event, info_span};

/// Result of [`Postponer::update`].
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    Scheduled(PendingMutation),
    /// None of the target values differ from the entity; nothing was written.
    NoChange,
}

impl UpdateOutcome {
    pub fn is_scheduled(&self) -> bool {
        matches!(self, Self::Scheduled(_))
    }

    pub fn mutation(&self) -> Option<&PendingMutation> {
        match self {
            Self::Scheduled(mutation) => Some(mutation),
            Self::NoChange => None,
        }
    }
}

/// Builder for a single scheduling request, consumed by [`Postponer::update`].
///
/// ```ignore
/// service
///     .postpone(&mut entity)
///     .delay_for_minutes(10)?
///     .keep_for_hours(3)?
///     .update(attributes([("name", "Stefan")]))
///     .await?;
/// ```
pub struct Postponer<'a> {
    entity: &'a mut dyn PendingEntity,
    store: Arc<dyn PendingMutationStore>,
    clock: Arc<dyn Clock>,
    config: PendingConfig,
    window: WindowBuilder,
}

impl<'a> Postponer<'a> {
    pub fn new(
        entity: &'a mut dyn PendingEntity,
        store: Arc<dyn PendingMutationStore>,
        clock: Arc<dyn Clock>,
        config: PendingConfig,
    ) -> Self {
        let window =
            WindowBuilder::new(clock.clone()).with_max_postpone_days(config.max_postpone_days);
        Self {
            entity,
            store,
            clock,
            config,
            window,
        }
    }

    pub fn delay_for(mut self, duration: Duration) -> Result<Self> {
        self.window.delay_for(duration)?;
        Ok(self)
    }

    pub fn delay_for_minutes(self, minutes: i64) -> Result<Self> {
        self.delay_for(window::minutes(minutes)?)
    }

    pub fn delay_for_hours(self, hours: i64) -> Result<Self> {
        self.delay_for(window::hours(hours)?)
    }

    pub fn delay_for_days(self, days: i64) -> Result<Self> {
        self.delay_for(window::days(days)?)
    }

    pub fn keep_for(mut self, duration: Duration) -> Result<Self> {
        self.window.keep_for(duration)?;
        Ok(self)
    }

    pub fn keep_for_minutes(self, minutes: i64) -> Result<Self> {
        self.keep_for(window::minutes(minutes)?)
    }

    pub fn keep_for_hours(self, hours: i64) -> Result<Self> {
        self.keep_for(window::hours(hours)?)
    }

    pub fn keep_for_days(self, days: i64) -> Result<Self> {
        self.keep_for(window::days(days)?)
    }

    pub fn start_from(mut self, timestamp: DateTime<Utc>) -> Result<Self> {
        self.window.start_from(timestamp)?;
        Ok(self)
    }

    /// Like [`Postponer::start_from`], parsing `timestamp` first.
    pub fn start_from_str(mut self, timestamp: &str) -> Result<Self> {
        self.window.start_from_str(timestamp)?;
        Ok(self)
    }

    pub fn revert_at(mut self, timestamp: DateTime<Utc>) -> Result<Self> {
        self.window.revert_at(timestamp)?;
        Ok(self)
    }

    pub fn revert_at_str(mut self, timestamp: &str) -> Result<Self> {
        self.window.revert_at_str(timestamp)?;
        Ok(self)
    }

    /// Schedules `attributes` using the configured save options for the
    /// immediate path.
    pub async fn update(self, attributes: AttributeMap) -> Result<UpdateOutcome> {
        let options = SaveOptions {
            touch_timestamps: self.config.touch_on_immediate_update,
        };
        self.update_with(attributes, options).await
    }

    /// Validates, then either stores the target values for a later apply or
    /// writes them now and stores the previous values for a later revert.
    pub async fn update_with(
        self,
        attributes: AttributeMap,
        options: SaveOptions,
    ) -> Result<UpdateOutcome> {
        let parent = self.entity.parent_ref();
        let span = info_span!("pending.schedule", parent = %parent);
        self.schedule(attributes, options).instrument(span).await
    }

    async fn schedule(
        mut self,
        attributes: AttributeMap,
        options: SaveOptions,
    ) -> Result<UpdateOutcome> {
        let allowed = self.entity.allowed_pending_attributes();
        let disallowed: Vec<String> = attributes
            .keys()
            .filter(|key| !allowed.contains(*key))
            .cloned()
            .collect();
        if !disallowed.is_empty() {
            return Err(PendingError::InvalidAttribute(disallowed));
        }

        let window = self.window.resolve()?;

        let keys: Vec<String> = attributes.keys().cloned().collect();
        let current = self.entity.attribute_values(&keys).await?;
        let delta = attribute_delta(&current, &attributes);
        if delta.is_empty() {
            event!(Level::DEBUG, "target values match the entity, nothing scheduled");
            return Ok(UpdateOutcome::NoChange);
        }

        let now = self.clock.now();
        let parent = self.entity.parent_ref();
        let (mutation, written) = if window.is_deferred() {
            (PendingMutation::new(parent, delta.changed, window, now)?, None)
        } else {
            let mutation = PendingMutation::new(parent, delta.original.clone(), window, now)?;
            self.entity
                .set_attributes_and_save(&attributes, options)
                .await?;
            (mutation, Some(delta.original))
        };

        let superseded = match self.store.replace_for_parent(mutation.clone()).await {
            Ok(superseded) => superseded,
            Err(err) => {
                // Nothing would revert the immediate write, so undo it.
                if let Some(original) = written
                    && let Err(restore_err) = self
                        .entity
                        .set_attributes_and_save(&original, SaveOptions::quiet())
                        .await
                {
                    event!(
                        Level::ERROR,
                        error = %restore_err,
                        "immediate update could not be rolled back after a store failure"
                    );
                }
                return Err(err.into());
            }
        };
        if let Some(previous) = superseded {
            event!(Level::INFO, superseded_id = %previous.id, "previous pending mutation replaced");
        }
        event!(
            Level::INFO,
            mutation_id = %mutation.id,
            start_at = ?mutation.start_at,
            revert_at = ?mutation.revert_at,
            "pending mutation scheduled"
        );
        Ok(UpdateOutcome::Scheduled(mutation))
    }
}
