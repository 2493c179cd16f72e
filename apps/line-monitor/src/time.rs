use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DurationError {
    #[error("invalid duration unit '{0}'")]
    InvalidUnit(String),
    #[error("duration amount must be >= 0 (got {0})")]
    Negative(i64),
    #[error("duration amount {0} {1} overflows")]
    Overflow(i64, &'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurationUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl DurationUnit {
    pub fn parse(value: &str) -> Result<Self, DurationError> {
        match value.trim().to_lowercase().as_str() {
            "s" | "sec" | "second" | "seconds" => Ok(Self::Seconds),
            "m" | "min" | "minute" | "minutes" => Ok(Self::Minutes),
            "h" | "hr" | "hour" | "hours" => Ok(Self::Hours),
            "d" | "day" | "days" => Ok(Self::Days),
            other => Err(DurationError::InvalidUnit(other.to_string())),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Seconds => "seconds",
            Self::Minutes => "minutes",
            Self::Hours => "hours",
            Self::Days => "days",
        }
    }

    fn seconds_per_unit(self) -> i64 {
        match self {
            Self::Seconds => 1,
            Self::Minutes => 60,
            Self::Hours => 3_600,
            Self::Days => 86_400,
        }
    }
}

pub fn to_duration(amount: i64, unit: DurationUnit) -> Result<Duration, DurationError> {
    if amount < 0 {
        return Err(DurationError::Negative(amount));
    }
    let seconds = amount
        .checked_mul(unit.seconds_per_unit())
        .ok_or(DurationError::Overflow(amount, unit.as_str()))?;
    Duration::try_seconds(seconds).ok_or(DurationError::Overflow(amount, unit.as_str()))
}

/// Parses `unit` and converts in one step; the usual shape for rule columns.
pub fn parse_duration(amount: i64, unit: &str) -> Result<Duration, DurationError> {
    to_duration(amount, DurationUnit::parse(unit)?)
}

pub fn to_millis(amount: i64, unit: DurationUnit) -> Result<u64, DurationError> {
    let duration = to_duration(amount, unit)?;
    u64::try_from(duration.num_milliseconds()).map_err(|_| DurationError::Negative(amount))
}

pub fn to_std(duration: Duration) -> std::time::Duration {
    duration.to_std().unwrap_or(std::time::Duration::ZERO)
}

pub fn has_elapsed(since: DateTime<Utc>, required: Duration, now: DateTime<Utc>) -> bool {
    now - since >= required
}

pub fn expires_at(
    from: DateTime<Utc>,
    amount: i64,
    unit: DurationUnit,
) -> Result<DateTime<Utc>, DurationError> {
    let duration = to_duration(amount, unit)?;
    from.checked_add_signed(duration)
        .ok_or(DurationError::Overflow(amount, unit.as_str()))
}

pub fn cooldown_expired(
    last_triggered_at: Option<DateTime<Utc>>,
    cooldown_minutes: i64,
    now: DateTime<Utc>,
) -> bool {
    let Some(last) = last_triggered_at else {
        return true;
    };
    Duration::try_minutes(cooldown_minutes.max(0))
        .map(|cooldown| now - last >= cooldown)
        .unwrap_or(false)
}

pub fn minutes_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    (end - start).num_milliseconds() as f64 / 60_000.0
}

pub fn whole_minutes_between(start: DateTime<Utc>, end: DateTime<Utc>) -> i64 {
    (end - start).num_seconds().div_euclid(60)
}
