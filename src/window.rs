//! Collection and resolution of a scheduling window.
//!
//! Setters only record what the caller asked for and reject obviously bad
//! input. Conflicts between relative and absolute settings are checked again
//! in [`WindowBuilder::resolve`], which runs before anything is persisted.

use crate::clock::Clock;
use crate::core::InvalidParameters;
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use std::sync::Arc;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y/%m/%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d"];

type WindowResult<T> = std::result::Result<T, InvalidParameters>;

/// A resolved window. At least one side is always set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start_at: Option<DateTime<Utc>>,
    pub revert_at: Option<DateTime<Utc>>,
}

impl Window {
    /// Whether applying the payload waits for `start_at`.
    pub fn is_deferred(&self) -> bool {
        self.start_at.is_some()
    }
}

pub struct WindowBuilder {
    clock: Arc<dyn Clock>,
    max_postpone_days: Option<i64>,
    delay_for: Option<Duration>,
    keep_for: Option<Duration>,
    start_at: Option<DateTime<Utc>>,
    revert_at: Option<DateTime<Utc>>,
}

impl WindowBuilder {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            max_postpone_days: None,
            delay_for: None,
            keep_for: None,
            start_at: None,
            revert_at: None,
        }
    }

    pub fn with_max_postpone_days(mut self, days: Option<i64>) -> Self {
        self.max_postpone_days = days;
        self
    }

    /// Apply the change `duration` from now.
    pub fn delay_for(&mut self, duration: Duration) -> WindowResult<&mut Self> {
        if self.delay_for.is_some() {
            return Err(InvalidParameters::TwicePropertySet);
        }
        if self.start_at.is_some() {
            return Err(InvalidParameters::StartConflict);
        }
        self.delay_for = Some(positive(duration)?);
        Ok(self)
    }

    /// Revert the change `duration` after it was applied.
    pub fn keep_for(&mut self, duration: Duration) -> WindowResult<&mut Self> {
        if self.keep_for.is_some() {
            return Err(InvalidParameters::TwicePropertySet);
        }
        if self.revert_at.is_some() {
            return Err(InvalidParameters::RevertConflict);
        }
        self.keep_for = Some(positive(duration)?);
        Ok(self)
    }

    pub fn start_from(&mut self, timestamp: DateTime<Utc>) -> WindowResult<&mut Self> {
        if self.start_at.is_some() {
            return Err(InvalidParameters::TwicePropertySet);
        }
        if self.delay_for.is_some() {
            return Err(InvalidParameters::StartConflict);
        }
        self.start_at = Some(self.not_in_past(timestamp)?);
        Ok(self)
    }

    pub fn revert_at(&mut self, timestamp: DateTime<Utc>) -> WindowResult<&mut Self> {
        if self.revert_at.is_some() {
            return Err(InvalidParameters::TwicePropertySet);
        }
        if self.keep_for.is_some() {
            return Err(InvalidParameters::RevertConflict);
        }
        self.revert_at = Some(self.not_in_past(timestamp)?);
        Ok(self)
    }

    pub fn start_from_str(&mut self, timestamp: &str) -> WindowResult<&mut Self> {
        let parsed = parse_timestamp(timestamp)?;
        self.start_from(parsed)
    }

    pub fn revert_at_str(&mut self, timestamp: &str) -> WindowResult<&mut Self> {
        let parsed = parse_timestamp(timestamp)?;
        self.revert_at(parsed)
    }

    /// Turns the collected settings into absolute timestamps relative to now.
    pub fn resolve(&self) -> WindowResult<Window> {
        if self.start_at.is_some() && self.delay_for.is_some() {
            return Err(InvalidParameters::StartConflict);
        }
        if self.revert_at.is_some() && self.keep_for.is_some() {
            return Err(InvalidParameters::RevertConflict);
        }

        let now = self.clock.now();

        let start_at = match (self.start_at, self.delay_for) {
            (Some(at), _) => Some(at),
            (None, Some(delay)) => Some(offset(now, delay)?),
            (None, None) => None,
        };

        let revert_at = match (self.revert_at, self.keep_for) {
            (Some(at), _) => Some(at),
            (None, Some(keep)) => Some(offset(start_at.unwrap_or(now), keep)?),
            (None, None) => None,
        };

        if let (Some(start), Some(revert)) = (start_at, revert_at)
            && start >= revert
        {
            return Err(InvalidParameters::StartNotBeforeRevert);
        }

        let Some(furthest) = revert_at.or(start_at) else {
            return Err(InvalidParameters::NothingScheduled);
        };

        if let Some(max_days) = self.max_postpone_days
            && (furthest - now).num_days() > max_days
        {
            return Err(InvalidParameters::AboveMaximumPostponeDays(max_days));
        }

        Ok(Window {
            start_at,
            revert_at,
        })
    }

    fn not_in_past(&self, timestamp: DateTime<Utc>) -> WindowResult<DateTime<Utc>> {
        if timestamp < self.clock.now() {
            return Err(InvalidParameters::PastTimestamp(format_timestamp(&timestamp)));
        }
        Ok(timestamp)
    }
}

fn positive(duration: Duration) -> WindowResult<Duration> {
    if duration <= Duration::zero() {
        return Err(InvalidParameters::NonPositiveDuration);
    }
    Ok(duration)
}

fn offset(from: DateTime<Utc>, by: Duration) -> WindowResult<DateTime<Utc>> {
    from.checked_add_signed(by)
        .ok_or(InvalidParameters::DurationOutOfRange)
}

pub fn minutes(count: i64) -> WindowResult<Duration> {
    Duration::try_minutes(count).ok_or(InvalidParameters::DurationOutOfRange)
}

pub fn hours(count: i64) -> WindowResult<Duration> {
    Duration::try_hours(count).ok_or(InvalidParameters::DurationOutOfRange)
}

pub fn days(count: i64) -> WindowResult<Duration> {
    Duration::try_days(count).ok_or(InvalidParameters::DurationOutOfRange)
}

/// Parses a timestamp in one of the accepted formats. Naive input is UTC.
pub fn parse_timestamp(input: &str) -> WindowResult<DateTime<Utc>> {
    let trimmed = input.trim();

    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(parsed.with_timezone(&Utc));
    }

    for format in DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(naive.and_utc());
        }
    }

    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, format)
            && let Some(midnight) = date.and_hms_opt(0, 0, 0)
        {
            return Ok(midnight.and_utc());
        }
    }

    Err(InvalidParameters::UnparsableTimestamp(input.to_string()))
}

pub fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.format(TIMESTAMP_FORMAT).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap()
    }

    fn builder() -> WindowBuilder {
        WindowBuilder::new(Arc::new(ManualClock::new(t0())))
    }

    #[test]
    fn test_delay_and_keep_are_chained() {
        let mut window = builder();
        window
            .delay_for(minutes(10).unwrap())
            .unwrap()
            .keep_for(hours(3).unwrap())
            .unwrap();

        let resolved = window.resolve().unwrap();
        assert_eq!(resolved.start_at, Some(t0() + Duration::minutes(10)));
        assert_eq!(
            resolved.revert_at,
            Some(t0() + Duration::minutes(10) + Duration::hours(3))
        );
        assert!(resolved.is_deferred());
    }

    #[test]
    fn test_keep_only_counts_from_now() {
        let mut window = builder();
        window.keep_for(days(3).unwrap()).unwrap();

        let resolved = window.resolve().unwrap();
        assert_eq!(resolved.start_at, None);
        assert_eq!(resolved.revert_at, Some(t0() + Duration::days(3)));
    }

    #[test]
    fn test_keep_counts_from_absolute_start() {
        let mut window = builder();
        window
            .start_from_str("2023-01-01 00:10:00")
            .unwrap()
            .keep_for(days(3).unwrap())
            .unwrap();

        let resolved = window.resolve().unwrap();
        assert_eq!(
            resolved.revert_at,
            Some(Utc.with_ymd_and_hms(2023, 1, 4, 0, 10, 0).unwrap())
        );
    }

    #[test]
    fn test_absolute_timestamps_in_any_order() {
        let mut window = builder();
        window
            .revert_at_str("2023-01-01 03:10:00")
            .unwrap()
            .start_from_str("2023-01-01 00:10:00")
            .unwrap();

        let resolved = window.resolve().unwrap();
        assert_eq!(
            resolved.start_at,
            Some(Utc.with_ymd_and_hms(2023, 1, 1, 0, 10, 0).unwrap())
        );
        assert_eq!(
            resolved.revert_at,
            Some(Utc.with_ymd_and_hms(2023, 1, 1, 3, 10, 0).unwrap())
        );
    }

    #[test]
    fn test_nothing_scheduled() {
        assert_eq!(
            builder().resolve(),
            Err(InvalidParameters::NothingScheduled)
        );
    }

    #[test]
    fn test_start_must_precede_revert() {
        let mut window = builder();
        window
            .start_from_str("2023-01-01 03:00:01")
            .unwrap()
            .revert_at_str("2023-01-01 03:00:00")
            .unwrap();
        assert_eq!(window.resolve(), Err(InvalidParameters::StartNotBeforeRevert));

        let mut equal = builder();
        equal
            .start_from_str("2023-01-01 03:00:00")
            .unwrap()
            .revert_at_str("2023-01-01 03:00:00")
            .unwrap();
        assert_eq!(equal.resolve(), Err(InvalidParameters::StartNotBeforeRevert));
    }

    #[test]
    fn test_relative_and_absolute_conflicts() {
        let mut window = builder();
        window.start_from_str("2023-12-31 23:59:59").unwrap();
        assert_eq!(
            window.delay_for(minutes(10).unwrap()).err(),
            Some(InvalidParameters::StartConflict)
        );

        let mut window = builder();
        window.keep_for(minutes(10).unwrap()).unwrap();
        assert_eq!(
            window.revert_at_str("2023-12-31 23:59:59").err(),
            Some(InvalidParameters::RevertConflict)
        );
    }

    #[test]
    fn test_setters_only_once() {
        let mut window = builder();
        window.keep_for(minutes(10).unwrap()).unwrap();
        assert_eq!(
            window.keep_for(days(1).unwrap()).err(),
            Some(InvalidParameters::TwicePropertySet)
        );

        let mut window = builder();
        window.delay_for(minutes(10).unwrap()).unwrap();
        assert_eq!(
            window.delay_for(days(1).unwrap()).err(),
            Some(InvalidParameters::TwicePropertySet)
        );

        let mut window = builder();
        window.start_from_str("2023-12-31 23:59:59").unwrap();
        assert_eq!(
            window.start_from_str("2023-11-30 23:59:59").err(),
            Some(InvalidParameters::TwicePropertySet)
        );

        let mut window = builder();
        window.revert_at_str("2023-12-31 23:59:59").unwrap();
        assert_eq!(
            window.revert_at_str("2023-11-30 23:59:59").err(),
            Some(InvalidParameters::TwicePropertySet)
        );
    }

    #[test]
    fn test_non_positive_durations() {
        let mut window = builder();
        assert_eq!(
            window.delay_for(minutes(-1).unwrap()).err(),
            Some(InvalidParameters::NonPositiveDuration)
        );
        assert_eq!(
            window.keep_for(Duration::zero()).err(),
            Some(InvalidParameters::NonPositiveDuration)
        );
        assert_eq!(days(i64::MAX).err(), Some(InvalidParameters::DurationOutOfRange));
    }

    #[test]
    fn test_past_timestamp_rejected_but_now_accepted() {
        let mut window = builder();
        assert!(matches!(
            window.start_from_str("2022-12-31 23:59:59"),
            Err(InvalidParameters::PastTimestamp(_))
        ));

        window.start_from(t0()).unwrap();
        assert_eq!(window.resolve().unwrap().start_at, Some(t0()));
    }

    #[test]
    fn test_max_postpone_days() {
        let mut window = builder().with_max_postpone_days(Some(7));
        window.keep_for(days(7).unwrap()).unwrap();
        assert!(window.resolve().is_ok());

        let mut window = builder().with_max_postpone_days(Some(7));
        window
            .delay_for(days(5).unwrap())
            .unwrap()
            .keep_for(days(3).unwrap())
            .unwrap();
        assert_eq!(
            window.resolve(),
            Err(InvalidParameters::AboveMaximumPostponeDays(7))
        );
    }

    #[test]
    fn test_parse_timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2023, 12, 31, 0, 0, 0).unwrap();
        assert_eq!(parse_timestamp("2023-12-31 00:00:00").unwrap(), expected);
        assert_eq!(parse_timestamp("2023/12/31 00:00:00").unwrap(), expected);
        assert_eq!(parse_timestamp("2023-12-31T00:00:00").unwrap(), expected);
        assert_eq!(parse_timestamp("2023-12-31T02:00:00+02:00").unwrap(), expected);
        assert_eq!(parse_timestamp("2023-12-31").unwrap(), expected);
        assert!(matches!(
            parse_timestamp("2022-15-20 00:00:00"),
            Err(InvalidParameters::UnparsableTimestamp(_))
        ));
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(&t0()), "2023-01-01 00:00:00");
    }
}
