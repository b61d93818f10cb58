use thiserror::Error;

/// Reasons a time window or a pending mutation is rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvalidParameters {
    #[error("Cannot set postpone property twice")]
    TwicePropertySet,

    #[error("Durations must be positive")]
    NonPositiveDuration,

    #[error("Duration is too large to be scheduled")]
    DurationOutOfRange,

    #[error("Timestamp '{0}' is in the past, only future timestamps can be scheduled")]
    PastTimestamp(String),

    #[error("Timestamp '{0}' could not be parsed")]
    UnparsableTimestamp(String),

    #[error("Invalid start at configuration: cannot use start at and delay for at the same time")]
    StartConflict,

    #[error("Invalid revert at configuration: cannot use revert at and keep for at the same time")]
    RevertConflict,

    #[error("Invalid timestamp configuration: start at must be before revert at")]
    StartNotBeforeRevert,

    #[error("Invalid timestamp configuration: at least one window parameter must be set")]
    NothingScheduled,

    #[error("Scheduled timestamp is more than {0} days away")]
    AboveMaximumPostponeDays(i64),

    #[error("Pending mutation must change at least one attribute")]
    EmptyPayload,
}

/// Opaque error of the persistence layer (entity store or pending-mutation store).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PersistenceError {
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Attribute '{attribute}' does not exist on '{entity_type}'")]
    UnknownAttribute { entity_type: String, attribute: String },

    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    #[error("Entity type '{0}' is not registered")]
    UnknownEntityType(String),

    #[error("Pending mutation already exists for {0}")]
    DuplicatePendingMutation(String),

    #[error("Pending mutation not found: {0}")]
    PendingMutationNotFound(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Lock error: {0}")]
    LockError(String),
}

#[derive(Error, Debug)]
pub enum PendingError {
    #[error("Invalid pending parameters: {0}")]
    InvalidParameters(#[from] InvalidParameters),

    #[error("Trying to postpone update of not allowed attribute(s): {}", .0.join(", "))]
    InvalidAttribute(Vec<String>),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Background worker failed: {0}")]
    Worker(String),
}

impl PendingError {
    /// The underlying persistence error, when this failure came from a store.
    pub fn persistence(&self) -> Option<&PersistenceError> {
        match self {
            Self::Persistence(err) => Some(err),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, PendingError>;

impl From<std::io::Error> for PersistenceError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for PersistenceError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_attribute_lists_keys() {
        let err = PendingError::InvalidAttribute(vec!["secret".into(), "token".into()]);
        assert_eq!(
            err.to_string(),
            "Trying to postpone update of not allowed attribute(s): secret, token"
        );
    }

    #[test]
    fn test_persistence_error_is_transparent() {
        let inner = PersistenceError::ConstraintViolation("Column 'name' cannot be NULL".into());
        let err = PendingError::from(inner.clone());
        assert_eq!(err.to_string(), inner.to_string());
        assert_eq!(err.persistence(), Some(&inner));
    }

    #[test]
    fn test_invalid_parameters_wraps_reason() {
        let err = PendingError::from(InvalidParameters::StartConflict);
        assert!(matches!(
            err,
            PendingError::InvalidParameters(InvalidParameters::StartConflict)
        ));
        assert!(err.to_string().contains("start at and delay for"));
    }
}
