//! The persisted pending-mutation record and its transitions.

pub mod transition;

use crate::core::{AttributeMap, InvalidParameters, ParentRef, new_mutation_id};
use crate::window::Window;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use transition::{TransitionOutcome, apply, revert};

/// One scheduled change of an entity's attributes.
///
/// `values` always describes the next transition: the target values while
/// armed for apply, the original values while armed for revert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMutation {
    pub id: String,
    pub parent: ParentRef,
    pub values: AttributeMap,
    pub start_at: Option<DateTime<Utc>>,
    pub revert_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Where a record sits in its lifecycle at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationState {
    ArmedForApply,
    ArmedForRevert,
    Due,
}

impl PendingMutation {
    /// Creates a record, enforcing the creation invariants.
    pub fn new(
        parent: ParentRef,
        values: AttributeMap,
        window: Window,
        now: DateTime<Utc>,
    ) -> Result<Self, InvalidParameters> {
        if values.is_empty() {
            return Err(InvalidParameters::EmptyPayload);
        }
        match (window.start_at, window.revert_at) {
            (None, None) => return Err(InvalidParameters::NothingScheduled),
            (Some(start), Some(revert)) if start >= revert => {
                return Err(InvalidParameters::StartNotBeforeRevert);
            }
            _ => {}
        }

        Ok(Self {
            id: new_mutation_id(),
            parent,
            values,
            start_at: window.start_at,
            revert_at: window.revert_at,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn window(&self) -> Window {
        Window {
            start_at: self.start_at,
            revert_at: self.revert_at,
        }
    }

    pub fn should_apply(&self, now: DateTime<Utc>) -> bool {
        self.start_at.is_some_and(|start| now >= start)
    }

    pub fn should_revert(&self, now: DateTime<Utc>) -> bool {
        self.revert_at.is_some_and(|revert| now >= revert)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.should_apply(now) || self.should_revert(now)
    }

    pub fn state(&self, now: DateTime<Utc>) -> MutationState {
        if self.is_due(now) {
            MutationState::Due
        } else if self.start_at.is_some() {
            MutationState::ArmedForApply
        } else {
            MutationState::ArmedForRevert
        }
    }

    /// The record after a successful apply that still has a revert ahead.
    pub(crate) fn armed_for_revert(&self, original: AttributeMap, now: DateTime<Utc>) -> Self {
        Self {
            values: original,
            start_at: None,
            updated_at: now,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::attributes;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap()
    }

    fn window(start: Option<i64>, revert: Option<i64>) -> Window {
        Window {
            start_at: start.map(|m| t0() + Duration::minutes(m)),
            revert_at: revert.map(|m| t0() + Duration::minutes(m)),
        }
    }

    fn parent() -> ParentRef {
        ParentRef::new("TestModel", "1")
    }

    #[test]
    fn test_new_rejects_invalid_records() {
        let values = attributes([("name", "Stefan")]);
        assert_eq!(
            PendingMutation::new(parent(), AttributeMap::new(), window(Some(10), None), t0()),
            Err(InvalidParameters::EmptyPayload)
        );
        assert_eq!(
            PendingMutation::new(parent(), values.clone(), window(None, None), t0()),
            Err(InvalidParameters::NothingScheduled)
        );
        assert_eq!(
            PendingMutation::new(parent(), values, window(Some(10), Some(10)), t0()),
            Err(InvalidParameters::StartNotBeforeRevert)
        );
    }

    #[test]
    fn test_guards_are_inclusive() {
        let record = PendingMutation::new(
            parent(),
            attributes([("name", "Stefan")]),
            window(Some(10), Some(190)),
            t0(),
        )
        .unwrap();

        assert_eq!(record.state(t0()), MutationState::ArmedForApply);
        assert!(!record.should_apply(t0() + Duration::minutes(10) - Duration::seconds(1)));
        assert!(record.should_apply(t0() + Duration::minutes(10)));
        assert!(!record.should_revert(t0() + Duration::minutes(10)));
        assert!(record.should_revert(t0() + Duration::minutes(190)));
        assert_eq!(
            record.state(t0() + Duration::minutes(10)),
            MutationState::Due
        );
    }

    #[test]
    fn test_armed_for_revert_swaps_snapshot() {
        let record = PendingMutation::new(
            parent(),
            attributes([("name", "Stefan")]),
            window(Some(10), Some(190)),
            t0(),
        )
        .unwrap();
        let later = t0() + Duration::minutes(10);

        let armed = record.armed_for_revert(attributes([("name", "John Doe")]), later);
        assert_eq!(armed.id, record.id);
        assert_eq!(armed.start_at, None);
        assert_eq!(armed.revert_at, record.revert_at);
        assert_eq!(armed.values, attributes([("name", "John Doe")]));
        assert_eq!(armed.updated_at, later);
        assert_eq!(armed.state(later), MutationState::ArmedForRevert);
    }
}
