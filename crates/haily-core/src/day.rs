//! Meteorological reporting-day resolution.
//!
//! A source published under token `D` covers 12:00 UTC on `D` through
//! 11:59:59 UTC on `D + 1`. Every row carried by that source belongs to
//! reporting day `D`, whatever its own clock time says.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// UTC hour at which a reporting window opens.
pub const WINDOW_OPEN_HOUR: u32 = 12;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("source token must be six digits (YYMMDD), got {0:?}")]
    Format(String),
    #[error("source token {0:?} is not a calendar date")]
    InvalidDate(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimeError {
    #[error("report time must be four digits (HHMM), got {0:?}")]
    Format(String),
    #[error("report time {0:?} is outside 0000-2359")]
    OutOfRange(String),
}

/// Date token embedded in a source feed's name (`YYMMDD`).
///
/// Kept distinct from [`NaiveDate`] so a token is never mistaken for a
/// wall-clock calendar day elsewhere in the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceToken(NaiveDate);

impl SourceToken {
    pub fn for_report_date(date: NaiveDate) -> Self {
        Self(date)
    }

    pub fn parse(token: &str) -> Result<Self, TokenError> {
        let token = token.trim();
        if token.len() != 6 || !token.bytes().all(|b| b.is_ascii_digit()) {
            return Err(TokenError::Format(token.to_string()));
        }
        NaiveDate::parse_from_str(token, "%y%m%d")
            .map(Self)
            .map_err(|_| TokenError::InvalidDate(token.to_string()))
    }

    /// The reporting day every row of this source resolves to.
    pub fn report_date(&self) -> NaiveDate {
        self.0
    }

    pub fn window_open(&self) -> DateTime<Utc> {
        let open = self
            .0
            .and_hms_opt(WINDOW_OPEN_HOUR, 0, 0)
            .expect("12:00:00 is a valid time");
        Utc.from_utc_datetime(&open)
    }

    /// Last instant (inclusive) covered by this source.
    pub fn window_close(&self) -> DateTime<Utc> {
        self.window_open() + Duration::days(1) - Duration::seconds(1)
    }

    pub fn window_contains(&self, instant: DateTime<Utc>) -> bool {
        instant >= self.window_open() && instant <= self.window_close()
    }
}

impl fmt::Display for SourceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%y%m%d"))
    }
}

impl FromStr for SourceToken {
    type Err = TokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for SourceToken {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SourceToken {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(de::Error::custom)
    }
}

/// Clock time of an event as published (`HHMM`, UTC).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReportTime {
    hour: u8,
    minute: u8,
}

impl ReportTime {
    pub fn parse(raw: &str) -> Result<Self, TimeError> {
        let raw = raw.trim();
        if raw.len() != 4 || !raw.bytes().all(|b| b.is_ascii_digit()) {
            return Err(TimeError::Format(raw.to_string()));
        }
        let hour: u8 = raw[..2].parse().map_err(|_| TimeError::Format(raw.to_string()))?;
        let minute: u8 = raw[2..].parse().map_err(|_| TimeError::Format(raw.to_string()))?;
        if hour > 23 || minute > 59 {
            return Err(TimeError::OutOfRange(raw.to_string()));
        }
        Ok(Self { hour, minute })
    }

    pub fn hour(&self) -> u8 {
        self.hour
    }

    pub fn minute(&self) -> u8 {
        self.minute
    }

    pub fn as_naive_time(&self) -> NaiveTime {
        NaiveTime::from_hms_opt(self.hour.into(), self.minute.into(), 0)
            .expect("hour and minute validated on construction")
    }

    /// True for times published after midnight that belong to the previous
    /// calendar day's window.
    pub fn wraps_past_midnight(&self) -> bool {
        u32::from(self.hour) < WINDOW_OPEN_HOUR
    }
}

impl fmt::Display for ReportTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}{:02}", self.hour, self.minute)
    }
}

impl Serialize for ReportTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ReportTime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(de::Error::custom)
    }
}

/// Resolves the reporting day for a row carried by `token`.
///
/// The row's time is only sanity-checked; it never moves the row to an
/// adjacent day.
pub fn resolve_report_date(token: SourceToken, time_utc: &str) -> Result<NaiveDate, TimeError> {
    ReportTime::parse(time_utc)?;
    Ok(token.report_date())
}

/// UTC instant at which an event in `token`'s window occurred.
pub fn event_instant(token: SourceToken, time: ReportTime) -> DateTime<Utc> {
    let day = if time.wraps_past_midnight() {
        token.report_date() + Duration::days(1)
    } else {
        token.report_date()
    };
    Utc.from_utc_datetime(&day.and_time(time.as_naive_time()))
}
