//! Authoritative replacement of one date's reports from a fresh source fetch.

use chrono::{DateTime, NaiveDate, Utc};
use haily_adapters::{count_reports_in_csv, parse_spc_csv, ParseError, SourceDocument};
use haily_core::{MatchStatus, ReportKind, SourceToken, VerificationResult};
use serde::Serialize;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::ingest::stage_reports;
use crate::ops::OperationScope;
use crate::store::{IngestionLogEntry, OperationKind, Trigger};
use crate::{SyncContext, SyncError};

#[derive(Debug, Clone, Serialize)]
pub struct ReimportReport {
    pub op_id: Uuid,
    pub date: NaiveDate,
    pub reports_replaced: u64,
    pub reports_ingested: u64,
    pub spc_live_count: u64,
    pub match_status: MatchStatus,
    pub parse_errors: Vec<ParseError>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ReimportReport {
    pub fn message(&self) -> String {
        format!(
            "Reimported {}: replaced {} reports with {} from source ({} live, {})",
            self.date,
            self.reports_replaced,
            self.reports_ingested,
            self.spc_live_count,
            self.match_status
        )
    }
}

#[derive(Clone)]
pub struct ReimportCoordinator {
    ctx: SyncContext,
}

impl ReimportCoordinator {
    pub fn new(ctx: SyncContext) -> Self {
        Self { ctx }
    }

    /// Fetches `date` afresh and replaces its stored reports atomically.
    /// Only one reimport per date runs at a time; a second request fails
    /// fast with [`SyncError::ReimportInProgress`]. Protected dates are accepted.
    pub async fn reimport(&self, date: NaiveDate) -> Result<ReimportReport, SyncError> {
        self.ctx.check_supported(date, Utc::now())?;
        let Some(ticket) = self.ctx.locks.begin_reimport(date) else {
            warn!(%date, "reimport rejected: already in progress");
            return Err(SyncError::ReimportInProgress(date));
        };

        let scope = OperationScope::start(OperationKind::Reimport, Trigger::Manual, Some(date));
        let span = info_span!("reimport", op_id = %scope.id, %date);
        let started_at = scope.started_at();
        let op_id = scope.id;
        let result = async move {
            let _guard = self.ctx.locks.write(date).await;
            self.mark_processing(date).await?;

            let mut committed = false;
            let result = self.replace_locked(op_id, date, started_at, &mut committed).await;
            match &result {
                Ok(report) => {
                    info!(
                        replaced = report.reports_replaced,
                        ingested = report.reports_ingested,
                        status = %report.match_status,
                        "reimport complete"
                    );
                }
                Err(err) if committed => {
                    error!(error = %err, "reimport replaced stored reports but its result was not recorded");
                    self.mark_failed(date, err).await;
                }
                Err(err) => {
                    error!(error = %err, "reimport failed; stored reports left unchanged");
                    self.mark_failed(date, err).await;
                }
            }
            result
        }
        .instrument(span)
        .await;

        let (processed, new, error) = match &result {
            Ok(report) => (report.reports_ingested, report.reports_ingested, None),
            Err(err) => (0, 0, Some(err.to_string())),
        };
        scope.finish(self.ctx.store.as_ref(), processed, new, error).await;
        drop(ticket);
        result
    }

    async fn mark_processing(&self, date: NaiveDate) -> Result<(), SyncError> {
        let previous = self.ctx.store.load_verification(date).await?;
        let row = VerificationResult {
            date,
            hailydb_count: self.ctx.store.count_reports(date).await?,
            spc_live_count: previous.and_then(|p| p.spc_live_count),
            match_status: MatchStatus::Processing,
            last_checked_at: Utc::now(),
            last_error: None,
        };
        self.ctx.store.upsert_verification(&row).await?;
        Ok(())
    }

    async fn mark_failed(&self, date: NaiveDate, err: &SyncError) {
        let store = self.ctx.store.as_ref();
        let previous = store.load_verification(date).await.ok().flatten();
        let stored = match store.count_reports(date).await {
            Ok(n) => n,
            Err(count_err) => {
                warn!(%date, error = %count_err, "could not count reports after failed reimport");
                previous.as_ref().map_or(0, |p| p.hailydb_count)
            }
        };
        let row = VerificationResult {
            date,
            hailydb_count: stored,
            spc_live_count: previous.and_then(|p| p.spc_live_count),
            match_status: MatchStatus::Mismatch,
            last_checked_at: Utc::now(),
            last_error: Some(err.to_string()),
        };
        if let Err(store_err) = store.upsert_verification(&row).await {
            warn!(%date, error = %store_err, "failed to record reimport failure");
        }
    }

    async fn replace_locked(
        &self,
        op_id: Uuid,
        date: NaiveDate,
        started_at: DateTime<Utc>,
        committed: &mut bool,
    ) -> Result<ReimportReport, SyncError> {
        let token = SourceToken::for_report_date(date);
        let document = match self.ctx.source.fetch_day(op_id, token).await {
            Ok(SourceDocument::Published(doc)) => doc,
            Ok(SourceDocument::NotPublished { url }) => {
                return Err(SyncError::NotPublished { date, url });
            }
            Err(source) => return Err(SyncError::SourceFetch { date, source }),
        };
        self.ctx.archive_document(&document).await;

        let live = count_reports_in_csv(&document.body);
        let parsed = parse_spc_csv(token, &document.body);
        if parsed.drafts.is_empty() && live > 0 {
            return Err(SyncError::Unparseable {
                date,
                live_rows: live,
                errors: parsed.errors.len(),
            });
        }
        for parse_error in &parsed.errors {
            warn!(line = parse_error.line, error = %parse_error.kind, "skipped unparseable row");
        }

        let staged = stage_reports(parsed.drafts, Utc::now());
        let outcome = self
            .ctx
            .store
            .replace_reports(date, &staged)
            .await
            .map_err(|source| SyncError::Transaction { date, source })?;
        *committed = true;

        // The write lock is held, so the replaced set is exactly what is stored.
        let stored = outcome.inserted;
        let match_status = if stored == live {
            MatchStatus::Match
        } else {
            MatchStatus::Mismatch
        };
        let finished_at = Utc::now();
        self.ctx
            .store
            .upsert_verification(&VerificationResult {
                date,
                hailydb_count: stored,
                spc_live_count: Some(live),
                match_status,
                last_checked_at: finished_at,
                last_error: None,
            })
            .await?;

        let count_kind = |kind: ReportKind| staged.iter().filter(|r| r.kind() == kind).count() as u64;
        let entry = IngestionLogEntry {
            id: op_id,
            report_date: date,
            url_attempted: document.url,
            started_at,
            completed_at: finished_at,
            success: true,
            tornado_reports: count_kind(ReportKind::Tornado),
            wind_reports: count_kind(ReportKind::Wind),
            hail_reports: count_kind(ReportKind::Hail),
            inserted: outcome.inserted,
            skipped: 0,
            parse_errors: parsed.errors.len() as u64,
            error_message: None,
        };
        if let Err(err) = self.ctx.store.record_ingestion(&entry).await {
            warn!(%date, error = %err, "failed to record reimport in ingestion log");
        }

        Ok(ReimportReport {
            op_id,
            date,
            reports_replaced: outcome.deleted,
            reports_ingested: outcome.inserted,
            spc_live_count: live,
            match_status,
            parse_errors: parsed.errors,
            started_at,
            finished_at,
        })
    }
}
