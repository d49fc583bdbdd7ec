//! Persistence contract for reports, verification records and audit logs.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use haily_core::{ReportKind, StormReport, VerificationResult};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

mod memory;
mod postgres;

pub use memory::MemoryReportStore;
pub use postgres::PgReportStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("stored row is corrupt: {0}")]
    Corrupt(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ReplaceOutcome {
    pub deleted: u64,
    pub inserted: u64,
}

/// One ingest attempt for a report date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionLogEntry {
    pub id: Uuid,
    pub report_date: NaiveDate,
    pub url_attempted: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub success: bool,
    pub tornado_reports: u64,
    pub wind_reports: u64,
    pub hail_reports: u64,
    pub inserted: u64,
    pub skipped: u64,
    pub parse_errors: u64,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Ingest,
    Poll,
    Verify,
    Reimport,
}

impl OperationKind {
    pub const ALL: [OperationKind; 4] = [
        OperationKind::Ingest,
        OperationKind::Poll,
        OperationKind::Verify,
        OperationKind::Reimport,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Ingest => "ingest",
            OperationKind::Poll => "poll",
            OperationKind::Verify => "verify",
            OperationKind::Reimport => "reimport",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OperationKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown operation kind {s:?}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Scheduled,
    Manual,
}

impl Trigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Trigger::Scheduled => "scheduled",
            Trigger::Manual => "manual",
        }
    }
}

impl FromStr for Trigger {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(Trigger::Scheduled),
            "manual" => Ok(Trigger::Manual),
            other => Err(format!("unknown trigger {other:?}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub id: Uuid,
    pub kind: OperationKind,
    pub trigger: Trigger,
    pub report_date: Option<NaiveDate>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub success: bool,
    pub records_processed: u64,
    pub records_new: u64,
    pub error_message: Option<String>,
}

#[async_trait]
pub trait ReportStore: Send + Sync {
    async fn count_reports(&self, date: NaiveDate) -> Result<u64, StoreError>;

    async fn reports_for_date(&self, date: NaiveDate) -> Result<Vec<StormReport>, StoreError>;

    async fn fingerprints_for_date(&self, date: NaiveDate) -> Result<HashSet<String>, StoreError>;

    /// Inserts reports whose fingerprint is not yet stored for `date`, all or
    /// nothing. Existing rows are never touched. Returns the number inserted.
    async fn insert_new(&self, date: NaiveDate, reports: &[StormReport]) -> Result<u64, StoreError>;

    /// Replaces every stored row for `date` with `reports` in one transaction.
    /// On error the prior rows are left exactly as they were.
    async fn replace_reports(
        &self,
        date: NaiveDate,
        reports: &[StormReport],
    ) -> Result<ReplaceOutcome, StoreError>;

    async fn report_counts_by_kind(&self) -> Result<BTreeMap<ReportKind, u64>, StoreError>;

    async fn load_verification(&self, date: NaiveDate) -> Result<Option<VerificationResult>, StoreError>;

    async fn upsert_verification(&self, result: &VerificationResult) -> Result<(), StoreError>;

    async fn verifications_between(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<VerificationResult>, StoreError>;

    async fn record_ingestion(&self, entry: &IngestionLogEntry) -> Result<(), StoreError>;

    async fn last_successful_ingestion(
        &self,
        date: NaiveDate,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;

    async fn record_operation(&self, record: &OperationRecord) -> Result<(), StoreError>;

    async fn operations_since(&self, since: DateTime<Utc>) -> Result<Vec<OperationRecord>, StoreError>;

    async fn last_success_by_kind(&self) -> Result<BTreeMap<OperationKind, DateTime<Utc>>, StoreError>;

    async fn prune_operations(&self, before: DateTime<Utc>) -> Result<u64, StoreError>;
}
