use crate::core::{PendingError, Result};

pub const ENV_MAX_POSTPONE_DAYS: &str = "PENDING_UPDATES_MAX_POSTPONE_DAYS";
pub const ENV_TOUCH_ON_IMMEDIATE_UPDATE: &str = "PENDING_UPDATES_TOUCH_ON_IMMEDIATE_UPDATE";

/// Scheduling configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingConfig {
    /// Upper bound, in whole days from now, for any resolved timestamp.
    /// `None` leaves windows unbounded.
    pub max_postpone_days: Option<i64>,

    /// Whether a caller-initiated immediate update bumps the entity's
    /// last-modified timestamp
    pub touch_on_immediate_update: bool,
}

impl PendingConfig {
    pub fn new() -> Self {
        Self {
            max_postpone_days: None,
            touch_on_immediate_update: true,
        }
    }

    /// Set the maximum postpone window in days
    pub fn max_postpone_days(mut self, days: i64) -> Self {
        self.max_postpone_days = Some(days);
        self
    }

    /// Remove the maximum postpone window
    pub fn unbounded(mut self) -> Self {
        self.max_postpone_days = None;
        self
    }

    pub fn touch_on_immediate_update(mut self, touch: bool) -> Self {
        self.touch_on_immediate_update = touch;
        self
    }

    /// Read overrides from `PENDING_UPDATES_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::new();

        if let Some(raw) = lookup(ENV_MAX_POSTPONE_DAYS) {
            let days = raw.trim().parse::<i64>().map_err(|_| {
                PendingError::InvalidConfig(format!(
                    "{} must be an integer, got '{}'",
                    ENV_MAX_POSTPONE_DAYS, raw
                ))
            })?;
            config = config.max_postpone_days(days);
        }

        if let Some(raw) = lookup(ENV_TOUCH_ON_IMMEDIATE_UPDATE) {
            let touch = match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                _ => {
                    return Err(PendingError::InvalidConfig(format!(
                        "{} must be a boolean, got '{}'",
                        ENV_TOUCH_ON_IMMEDIATE_UPDATE, raw
                    )));
                }
            };
            config = config.touch_on_immediate_update(touch);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if let Some(days) = self.max_postpone_days
            && days <= 0
        {
            return Err(PendingError::InvalidConfig(
                "max_postpone_days must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for PendingConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = PendingConfig::default();
        assert_eq!(config.max_postpone_days, None);
        assert!(config.touch_on_immediate_update);
    }

    #[test]
    fn test_builder_pattern() {
        let config = PendingConfig::new()
            .max_postpone_days(30)
            .touch_on_immediate_update(false);
        assert_eq!(config.max_postpone_days, Some(30));
        assert!(!config.touch_on_immediate_update);
        assert_eq!(config.unbounded().max_postpone_days, None);
    }

    #[test]
    fn test_from_lookup() {
        let config = PendingConfig::from_lookup(lookup(&[
            (ENV_MAX_POSTPONE_DAYS, "14"),
            (ENV_TOUCH_ON_IMMEDIATE_UPDATE, "no"),
        ]))
        .unwrap();
        assert_eq!(config.max_postpone_days, Some(14));
        assert!(!config.touch_on_immediate_update);
    }

    #[test]
    fn test_from_lookup_rejects_garbage() {
        assert!(PendingConfig::from_lookup(lookup(&[(ENV_MAX_POSTPONE_DAYS, "soon")])).is_err());
        assert!(PendingConfig::from_lookup(lookup(&[(ENV_MAX_POSTPONE_DAYS, "0")])).is_err());
        assert!(
            PendingConfig::from_lookup(lookup(&[(ENV_TOUCH_ON_IMMEDIATE_UPDATE, "maybe")]))
                .is_err()
        );
    }
}
