//! Core domain model for the HailyDB storm report store.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub mod day;
pub mod polling;

pub use day::{event_instant, resolve_report_date, ReportTime, SourceToken, TimeError, TokenError};
pub use polling::{age_days, is_poll_due, tier_for, Cadence, PollingTier, PROTECTED_AGE_DAYS};

pub const CRATE_NAME: &str = "haily-core";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportKind {
    Tornado,
    Wind,
    Hail,
}

impl ReportKind {
    pub const ALL: [ReportKind; 3] = [ReportKind::Tornado, ReportKind::Wind, ReportKind::Hail];

    pub fn as_str(self) -> &'static str {
        match self {
            ReportKind::Tornado => "tornado",
            ReportKind::Wind => "wind",
            ReportKind::Hail => "hail",
        }
    }
}

impl fmt::Display for ReportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tornado" => Ok(ReportKind::Tornado),
            "wind" => Ok(ReportKind::Wind),
            "hail" => Ok(ReportKind::Hail),
            other => Err(format!("unknown report kind {other:?}")),
        }
    }
}

/// A published measurement that may be a number, the literal `UNK`, or missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Measured<T> {
    Known(T),
    Unknown,
    Absent,
}

impl<T: Copy> Measured<T> {
    pub fn known(&self) -> Option<T> {
        match self {
            Measured::Known(v) => Some(*v),
            Measured::Unknown | Measured::Absent => None,
        }
    }
}

/// Type-specific magnitude; the variant is the report's kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Magnitude {
    Tornado { f_scale: Option<String> },
    Wind { speed_mph: Measured<u32> },
    Hail { size_hundredths: Measured<u32> },
}

impl Magnitude {
    pub fn kind(&self) -> ReportKind {
        match self {
            Magnitude::Tornado { .. } => ReportKind::Tornado,
            Magnitude::Wind { .. } => ReportKind::Wind,
            Magnitude::Hail { .. } => ReportKind::Hail,
        }
    }

    pub fn hail_size_inches(&self) -> Option<f64> {
        match self {
            Magnitude::Hail { size_hundredths } => {
                size_hundredths.known().map(|h| f64::from(h) / 100.0)
            }
            _ => None,
        }
    }
}

/// Parsed handoff contract from the source adapter into the sync pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StormReportDraft {
    pub source_token: SourceToken,
    pub report_date: NaiveDate,
    pub time_utc: ReportTime,
    pub magnitude: Magnitude,
    pub location: String,
    pub county: String,
    pub state: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub narrative: String,
    /// Normalized source row the fingerprint was computed over.
    pub source_row: String,
    pub content_fingerprint: String,
}

impl StormReportDraft {
    pub fn kind(&self) -> ReportKind {
        self.magnitude.kind()
    }
}

/// Persisted storm report. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StormReport {
    pub report_date: NaiveDate,
    pub time_utc: ReportTime,
    pub magnitude: Magnitude,
    pub location: String,
    pub county: String,
    pub state: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub narrative: String,
    pub source_row: String,
    pub content_fingerprint: String,
    pub source_token: SourceToken,
    pub ingested_at: DateTime<Utc>,
}

impl StormReport {
    pub fn from_draft(draft: StormReportDraft, ingested_at: DateTime<Utc>) -> Self {
        Self {
            report_date: draft.report_date,
            time_utc: draft.time_utc,
            magnitude: draft.magnitude,
            location: draft.location,
            county: draft.county,
            state: draft.state,
            latitude: draft.latitude,
            longitude: draft.longitude,
            narrative: draft.narrative,
            source_row: draft.source_row,
            content_fingerprint: draft.content_fingerprint,
            source_token: draft.source_token,
            ingested_at,
        }
    }

    pub fn kind(&self) -> ReportKind {
        self.magnitude.kind()
    }

    pub fn event_at(&self) -> DateTime<Utc> {
        event_instant(self.source_token, self.time_utc)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchStatus {
    Match,
    Mismatch,
    Pending,
    Processing,
    Unavailable,
}

impl MatchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MatchStatus::Match => "MATCH",
            MatchStatus::Mismatch => "MISMATCH",
            MatchStatus::Pending => "PENDING",
            MatchStatus::Processing => "PROCESSING",
            MatchStatus::Unavailable => "UNAVAILABLE",
        }
    }
}

impl fmt::Display for MatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MATCH" => Ok(MatchStatus::Match),
            "MISMATCH" => Ok(MatchStatus::Mismatch),
            "PENDING" => Ok(MatchStatus::Pending),
            "PROCESSING" => Ok(MatchStatus::Processing),
            "UNAVAILABLE" => Ok(MatchStatus::Unavailable),
            other => Err(format!("unknown match status {other:?}")),
        }
    }
}

/// Per-date reconciliation record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub date: NaiveDate,
    pub hailydb_count: u64,
    pub spc_live_count: Option<u64>,
    pub match_status: MatchStatus,
    pub last_checked_at: DateTime<Utc>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl VerificationResult {
    /// Live minus stored, when the live count is known.
    pub fn difference(&self) -> Option<i64> {
        self.spc_live_count
            .map(|live| live as i64 - self.hailydb_count as i64)
    }
}
