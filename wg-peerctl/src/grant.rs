// Access grants

//! Relative access durations such as `1d` or `unlimited`
//!
//! A month is 30 days.

use chrono::{DateTime, TimeDelta, Utc};
use std::str::FromStr;
use thiserror::Error;

/// How long a peer keeps access
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grant {
    /// Access ends this long after the grant starts
    For(TimeDelta),
    /// Access never ends
    Unlimited,
}

/// Grant text that cannot be parsed or applied
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GrantError {
    /// Text is not `<n>h`, `<n>d`, `<n>w`, `<n>m` or `unlimited`
    #[error("invalid grant '{0}', expected <n>h, <n>d, <n>w, <n>m or unlimited")]
    Invalid(String),

    /// Grant ends beyond the representable calendar
    #[error("grant of {days} days from {from} is out of range")]
    OutOfRange {
        /// Grant length in whole days
        days: i64,
        /// Start of the grant
        from: DateTime<Utc>,
    },
}

impl Grant {
    /// Expiration instant for a grant starting at `now`; `None` never expires
    pub fn expires_at(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, GrantError> {
        match self {
            Grant::For(delta) => now
                .checked_add_signed(*delta)
                .map(Some)
                .ok_or(GrantError::OutOfRange {
                    days: delta.num_days(),
                    from: now,
                }),
            Grant::Unlimited => Ok(None),
        }
    }
}

impl FromStr for Grant {
    type Err = GrantError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim().to_ascii_lowercase();
        if text == "unlimited" {
            return Ok(Grant::Unlimited);
        }

        let invalid = || GrantError::Invalid(s.to_string());
        let (split, _) = text.char_indices().last().ok_or_else(invalid)?;
        let (count, unit) = text.split_at(split);
        let count: i64 = count.parse().map_err(|_| invalid())?;
        if count <= 0 {
            return Err(invalid());
        }

        let delta = match unit {
            "h" => TimeDelta::try_hours(count),
            "d" => TimeDelta::try_days(count),
            "w" => TimeDelta::try_weeks(count),
            "m" => count.checked_mul(30).and_then(TimeDelta::try_days),
            _ => None,
        }
        .ok_or_else(invalid)?;

        Ok(Grant::For(delta))
    }
}
