//! Ingestion, verification and reimport orchestration for the storm report store.

use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use haily_adapters::{FetchedDocument, FixtureReportSource, ReportSource, SourceError, SpcHttpSource};
use haily_core::{age_days, tier_for, MatchStatus};
use haily_storage::{HttpFetcher, SnapshotArchive};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

pub mod config;
pub mod ingest;
pub mod locks;
pub mod ops;
pub mod reimport;
pub mod schedule;
pub mod store;
pub mod verify;

pub use config::SyncConfig;
pub use ingest::{IngestSummary, IngestionPipeline, PollFailure, PollOutcome, PollSweep};
pub use locks::{DateLocks, ReimportTicket};
pub use ops::{prune_operation_log, status_report, OperationStats, StatusReport};
pub use reimport::{ReimportCoordinator, ReimportReport};
pub use schedule::maybe_build_scheduler;
pub use store::{
    IngestionLogEntry, MemoryReportStore, OperationKind, OperationRecord, PgReportStore,
    ReplaceOutcome, ReportStore, StoreError, Trigger,
};
pub use verify::{
    classify, DateRange, IntegrityVerifier, LiveCount, VerificationRun, VerificationSummary,
    DEFAULT_WINDOW_DAYS,
};

pub const CRATE_NAME: &str = "haily-sync";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("fetching source for {date} failed: {source}")]
    SourceFetch {
        date: NaiveDate,
        #[source]
        source: SourceError,
    },
    #[error("no source document published for {date} at {url}")]
    NotPublished { date: NaiveDate, url: String },
    #[error("{date} is out of range: {reason}")]
    DateOutOfRange { date: NaiveDate, reason: String },
    #[error("a reimport for {0} is already in progress")]
    ReimportInProgress(NaiveDate),
    #[error("source document for {date} has {live_rows} report rows but none parsed ({errors} errors)")]
    Unparseable {
        date: NaiveDate,
        live_rows: u64,
        errors: usize,
    },
    #[error("replacing reports for {date} was rolled back: {source}")]
    Transaction {
        date: NaiveDate,
        #[source]
        source: StoreError,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("background task failed: {0}")]
    Task(String),
}

/// Shared handles every orchestrator works through.
#[derive(Clone)]
pub struct SyncContext {
    pub store: Arc<dyn ReportStore>,
    pub source: Arc<dyn ReportSource>,
    pub locks: Arc<DateLocks>,
    pub archive: Option<SnapshotArchive>,
    pub earliest_date: NaiveDate,
}

impl SyncContext {
    pub fn new(store: Arc<dyn ReportStore>, source: Arc<dyn ReportSource>) -> Self {
        Self {
            store,
            source,
            locks: Arc::new(DateLocks::new()),
            archive: None,
            earliest_date: NaiveDate::from_ymd_opt(2004, 1, 1).unwrap_or(NaiveDate::MIN),
        }
    }

    pub fn with_archive(mut self, archive: SnapshotArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn with_earliest_date(mut self, earliest: NaiveDate) -> Self {
        self.earliest_date = earliest;
        self
    }

    /// Dates that explicit ingest and reimport accept: not in the future and
    /// not before the earliest supported date.
    pub fn check_supported(&self, date: NaiveDate, now: DateTime<Utc>) -> Result<(), SyncError> {
        if date > now.date_naive() {
            return Err(SyncError::DateOutOfRange {
                date,
                reason: "date is in the future".to_string(),
            });
        }
        if date < self.earliest_date {
            return Err(SyncError::DateOutOfRange {
                date,
                reason: format!("before earliest supported date {}", self.earliest_date),
            });
        }
        Ok(())
    }

    /// Best effort; a failed archive write never fails the caller.
    pub(crate) async fn archive_document(&self, document: &FetchedDocument) {
        let Some(archive) = &self.archive else {
            return;
        };
        match archive
            .store(document.fetched_at, document.token, document.body.as_bytes())
            .await
        {
            Ok(snapshot) => debug!(
                path = %snapshot.relative_path.display(),
                deduplicated = snapshot.deduplicated,
                "archived source snapshot"
            ),
            Err(err) => warn!(token = %document.token, error = %err, "failed to archive source snapshot"),
        }
    }
}

/// A date whose mismatch was left for an operator because it is protected.
#[derive(Debug, Clone, Serialize)]
pub struct DeferredMismatch {
    pub date: NaiveDate,
    pub age_days: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileReport {
    pub verification: VerificationRun,
    pub reimported: Vec<ReimportReport>,
    pub deferred: Vec<DeferredMismatch>,
    pub failures: Vec<PollFailure>,
}

/// The assembled ingestion core.
#[derive(Clone)]
pub struct HailyService {
    pub ctx: SyncContext,
    pub ingest: IngestionPipeline,
    pub verifier: IntegrityVerifier,
    pub reimport: ReimportCoordinator,
}

impl HailyService {
    pub fn new(ctx: SyncContext, verify_concurrency: usize) -> Self {
        Self {
            ingest: IngestionPipeline::new(ctx.clone()),
            verifier: IntegrityVerifier::new(ctx.clone(), verify_concurrency),
            reimport: ReimportCoordinator::new(ctx.clone()),
            ctx,
        }
    }

    /// Wires a store, source and archive from configuration. A configured
    /// database is migrated before use.
    pub async fn from_config(config: &SyncConfig) -> anyhow::Result<Self> {
        let store: Arc<dyn ReportStore> = match &config.database_url {
            Some(url) => {
                let pg = PgReportStore::connect(url)
                    .await
                    .context("connecting to DATABASE_URL")?;
                pg.migrate().await.context("running migrations")?;
                Arc::new(pg)
            }
            None => {
                info!("DATABASE_URL not set; using in-memory store");
                Arc::new(MemoryReportStore::new())
            }
        };
        let source: Arc<dyn ReportSource> = match &config.fixtures_dir {
            Some(dir) => {
                info!(dir = %dir.display(), "reading source documents from fixtures");
                Arc::new(FixtureReportSource::new(dir))
            }
            None => {
                let http = HttpFetcher::new(config.http_client_config())?;
                Arc::new(SpcHttpSource::new(Arc::new(http), config.spc_base_url.clone()))
            }
        };
        let mut ctx = SyncContext::new(store, source).with_earliest_date(config.earliest_date);
        if let Some(dir) = &config.archive_dir {
            ctx = ctx.with_archive(SnapshotArchive::new(dir));
        }
        Ok(Self::new(ctx, config.verify_concurrency))
    }

    pub async fn status(&self) -> Result<StatusReport, StoreError> {
        status_report(
            self.ctx.store.as_ref(),
            Utc::now(),
            self.ctx.locks.reimports_in_flight(),
        )
        .await
    }

    /// Verifies `range`, then reimports every MISMATCH date still inside the
    /// polling horizon. Age is taken at the start of the run; protected
    /// mismatches are reported back for an operator.
    pub async fn reconcile(&self, range: DateRange, trigger: Trigger) -> Result<ReconcileReport, SyncError> {
        let verification = self.verifier.verify_range(range, trigger).await?;
        let audit_start = verification.checked_at;

        let mut reimported = Vec::new();
        let mut deferred = Vec::new();
        let mut failures = Vec::new();
        for result in &verification.results {
            if result.match_status != MatchStatus::Mismatch {
                continue;
            }
            let Some(age) = age_days(result.date, audit_start) else {
                continue;
            };
            if tier_for(age).is_protected() {
                deferred.push(DeferredMismatch {
                    date: result.date,
                    age_days: age,
                });
                continue;
            }
            match self.reimport.reimport(result.date).await {
                Ok(report) => reimported.push(report),
                Err(err) => {
                    warn!(date = %result.date, error = %err, "reconcile reimport failed");
                    failures.push(PollFailure {
                        date: result.date,
                        error: err.to_string(),
                    });
                }
            }
        }
        info!(
            reimported = reimported.len(),
            deferred = deferred.len(),
            failed = failures.len(),
            "reconcile complete"
        );
        Ok(ReconcileReport {
            verification,
            reimported,
            deferred,
            failures,
        })
    }
}
