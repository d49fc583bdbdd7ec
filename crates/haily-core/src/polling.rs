//! Time-decaying re-poll policy.
//!
//! Freshly published days change often and are polled aggressively; older
//! days settle and are polled less until, from day 16 on, they are only
//! touched through an explicit backfill or reimport.

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Timelike, Utc};
use serde::Serialize;

/// First age (in days) at which a report date is protected.
pub const PROTECTED_AGE_DAYS: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    Interval(Duration),
    /// Once per clock hour, due from the top of the hour after the last poll.
    TopOfHour,
    Never,
}

impl Cadence {
    /// Earliest instant the next poll may run, given the previous one.
    pub fn next_due(&self, last_polled: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Cadence::Interval(every) => Some(last_polled + *every),
            Cadence::TopOfHour => {
                let hour_start = last_polled
                    .date_naive()
                    .and_hms_opt(last_polled.hour(), 0, 0)?;
                Some(Utc.from_utc_datetime(&hour_start) + Duration::hours(1))
            }
            Cadence::Never => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollingTier {
    /// age 0
    Live,
    /// age 1-4
    Recent,
    /// age 5-7
    Settling,
    /// age 8-15
    Daily,
    /// age 16+, backfill only
    Protected,
}

impl PollingTier {
    pub fn for_age(age_days: u32) -> Self {
        match age_days {
            0 => PollingTier::Live,
            1..=4 => PollingTier::Recent,
            5..=7 => PollingTier::Settling,
            8..=15 => PollingTier::Daily,
            _ => PollingTier::Protected,
        }
    }

    pub fn cadence(self) -> Cadence {
        match self {
            PollingTier::Live => Cadence::Interval(Duration::minutes(5)),
            PollingTier::Recent => Cadence::TopOfHour,
            PollingTier::Settling => Cadence::Interval(Duration::hours(3)),
            PollingTier::Daily => Cadence::Interval(Duration::days(1)),
            PollingTier::Protected => Cadence::Never,
        }
    }

    pub fn is_protected(self) -> bool {
        matches!(self, PollingTier::Protected)
    }
}

pub fn tier_for(age_days: u32) -> PollingTier {
    PollingTier::for_age(age_days)
}

/// Whole days between `date` and the UTC date of `now`; `None` for future dates.
pub fn age_days(date: NaiveDate, now: DateTime<Utc>) -> Option<u32> {
    let days = (now.date_naive() - date).num_days();
    u32::try_from(days).ok()
}

/// Whether a scheduled poll of `date` should run at `now`.
///
/// Dates that were never polled are always due unless protected.
pub fn is_poll_due(date: NaiveDate, last_polled: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    let Some(age) = age_days(date, now) else {
        return false;
    };
    let tier = tier_for(age);
    if tier.is_protected() {
        return false;
    }
    match last_polled {
        None => true,
        Some(last) => tier
            .cadence()
            .next_due(last)
            .is_some_and(|due| now >= due),
    }
}
