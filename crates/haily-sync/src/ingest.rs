//! Append-only ingestion of one report date, and the tiered polling driver around it.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use haily_adapters::{parse_spc_csv, ParseError, SourceDocument};
use haily_core::{
    age_days, is_poll_due, tier_for, PollingTier, ReportKind, SourceToken, StormReport,
    StormReportDraft, PROTECTED_AGE_DAYS,
};
use serde::Serialize;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::ops::OperationScope;
use crate::store::{IngestionLogEntry, OperationKind, Trigger};
use crate::{SyncContext, SyncError};

#[derive(Debug, Clone, Serialize)]
pub struct IngestSummary {
    pub op_id: Uuid,
    pub date: NaiveDate,
    pub source_url: String,
    /// False when the source has no document for the date yet.
    pub published: bool,
    pub rows_parsed: u64,
    pub inserted_count: u64,
    pub skipped_count: u64,
    pub inserted_by_kind: BTreeMap<ReportKind, u64>,
    pub errors: Vec<ParseError>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PollOutcome {
    Skipped {
        date: NaiveDate,
        tier: PollingTier,
        next_due: Option<DateTime<Utc>>,
    },
    Ingested(IngestSummary),
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PollSweep {
    pub ingested: Vec<IngestSummary>,
    pub skipped: Vec<NaiveDate>,
    pub failures: Vec<PollFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PollFailure {
    pub date: NaiveDate,
    pub error: String,
}

/// Drops rows repeated within one document; the first occurrence wins.
pub(crate) fn stage_reports(
    drafts: Vec<StormReportDraft>,
    ingested_at: DateTime<Utc>,
) -> Vec<StormReport> {
    let mut seen = HashSet::new();
    drafts
        .into_iter()
        .filter(|d| seen.insert(d.content_fingerprint.clone()))
        .map(|d| StormReport::from_draft(d, ingested_at))
        .collect()
}

#[derive(Clone)]
pub struct IngestionPipeline {
    ctx: SyncContext,
}

impl IngestionPipeline {
    pub fn new(ctx: SyncContext) -> Self {
        Self { ctx }
    }

    /// Manual ingest of any supported date, protected ones included.
    pub async fn ingest(&self, date: NaiveDate) -> Result<IngestSummary, SyncError> {
        self.ctx.check_supported(date, Utc::now())?;
        self.run(date, Trigger::Manual).await
    }

    /// Scheduled poll: honors the tier cadence and refuses protected dates.
    pub async fn poll(&self, date: NaiveDate, now: DateTime<Utc>) -> Result<PollOutcome, SyncError> {
        let Some(age) = age_days(date, now) else {
            return Err(SyncError::DateOutOfRange {
                date,
                reason: "date is in the future".to_string(),
            });
        };
        let tier = tier_for(age);
        if tier.is_protected() {
            return Err(SyncError::DateOutOfRange {
                date,
                reason: format!(
                    "age {age} days is protected from scheduled polling; use reimport to refresh it"
                ),
            });
        }
        if date < self.ctx.earliest_date {
            return Err(SyncError::DateOutOfRange {
                date,
                reason: format!("before earliest supported date {}", self.ctx.earliest_date),
            });
        }

        let last_polled = self.ctx.store.last_successful_ingestion(date).await?;
        if !is_poll_due(date, last_polled, now) {
            let next_due = last_polled.and_then(|last| tier.cadence().next_due(last));
            debug!(%date, ?tier, ?next_due, "poll not due");
            return Ok(PollOutcome::Skipped { date, tier, next_due });
        }
        self.run(date, Trigger::Scheduled)
            .await
            .map(PollOutcome::Ingested)
    }

    /// Polls every non-protected date whose cadence has elapsed, newest first.
    pub async fn poll_due(&self, now: DateTime<Utc>) -> PollSweep {
        let today = now.date_naive();
        let mut sweep = PollSweep::default();
        for age in 0..i64::from(PROTECTED_AGE_DAYS) {
            let date = today - Duration::days(age);
            if date < self.ctx.earliest_date {
                break;
            }
            match self.poll(date, now).await {
                Ok(PollOutcome::Ingested(summary)) => sweep.ingested.push(summary),
                Ok(PollOutcome::Skipped { date, .. }) => sweep.skipped.push(date),
                Err(err) => {
                    warn!(%date, error = %err, "scheduled poll failed");
                    sweep.failures.push(PollFailure {
                        date,
                        error: err.to_string(),
                    });
                }
            }
        }
        info!(
            ingested = sweep.ingested.len(),
            skipped = sweep.skipped.len(),
            failed = sweep.failures.len(),
            "poll sweep complete"
        );
        sweep
    }

    async fn run(&self, date: NaiveDate, trigger: Trigger) -> Result<IngestSummary, SyncError> {
        let kind = match trigger {
            Trigger::Scheduled => OperationKind::Poll,
            Trigger::Manual => OperationKind::Ingest,
        };
        let scope = OperationScope::start(kind, trigger, Some(date));
        let span = info_span!("ingest", op_id = %scope.id, %date, trigger = trigger.as_str());
        async move {
            let _guard = self.ctx.locks.write(date).await;
            let result = self.ingest_locked(scope.id, date, scope.started_at()).await;
            self.log_attempt(date, scope.started_at(), &result).await;
            let (processed, new, error) = match &result {
                Ok(summary) => (summary.rows_parsed, summary.inserted_count, None),
                Err(err) => (0, 0, Some(err.to_string())),
            };
            scope.finish(self.ctx.store.as_ref(), processed, new, error).await;
            result
        }
        .instrument(span)
        .await
    }

    async fn ingest_locked(
        &self,
        op_id: Uuid,
        date: NaiveDate,
        started_at: DateTime<Utc>,
    ) -> Result<IngestSummary, SyncError> {
        let token = SourceToken::for_report_date(date);
        let document = self
            .ctx
            .source
            .fetch_day(op_id, token)
            .await
            .map_err(|source| SyncError::SourceFetch { date, source })?;

        let document = match document {
            SourceDocument::Published(doc) => doc,
            SourceDocument::NotPublished { url } => {
                info!(%url, "source document not published yet");
                return Ok(IngestSummary {
                    op_id,
                    date,
                    source_url: url,
                    published: false,
                    rows_parsed: 0,
                    inserted_count: 0,
                    skipped_count: 0,
                    inserted_by_kind: BTreeMap::new(),
                    errors: Vec::new(),
                    started_at,
                    finished_at: Utc::now(),
                });
            }
        };
        self.ctx.archive_document(&document).await;

        let parsed = parse_spc_csv(token, &document.body);
        for error in &parsed.errors {
            warn!(line = error.line, error = %error.kind, "skipped unparseable row");
        }
        let rows_parsed = parsed.drafts.len() as u64;

        let existing = self.ctx.store.fingerprints_for_date(date).await?;
        let fresh: Vec<StormReport> = stage_reports(parsed.drafts, Utc::now())
            .into_iter()
            .filter(|r| !existing.contains(&r.content_fingerprint))
            .collect();
        let inserted_count = self.ctx.store.insert_new(date, &fresh).await?;

        let mut inserted_by_kind: BTreeMap<ReportKind, u64> =
            ReportKind::ALL.into_iter().map(|k| (k, 0)).collect();
        for report in &fresh {
            *inserted_by_kind.entry(report.kind()).or_default() += 1;
        }

        let summary = IngestSummary {
            op_id,
            date,
            source_url: document.url,
            published: true,
            rows_parsed,
            inserted_count,
            skipped_count: rows_parsed.saturating_sub(inserted_count),
            inserted_by_kind,
            errors: parsed.errors,
            started_at,
            finished_at: Utc::now(),
        };
        info!(
            inserted = summary.inserted_count,
            skipped = summary.skipped_count,
            parse_errors = summary.errors.len(),
            "ingest complete"
        );
        Ok(summary)
    }

    async fn log_attempt(
        &self,
        date: NaiveDate,
        started_at: DateTime<Utc>,
        result: &Result<IngestSummary, SyncError>,
    ) {
        let by_kind = |summary: &IngestSummary, kind: ReportKind| {
            summary.inserted_by_kind.get(&kind).copied().unwrap_or(0)
        };
        let entry = match result {
            Ok(summary) => IngestionLogEntry {
                id: summary.op_id,
                report_date: date,
                url_attempted: summary.source_url.clone(),
                started_at,
                completed_at: summary.finished_at,
                success: true,
                tornado_reports: by_kind(summary, ReportKind::Tornado),
                wind_reports: by_kind(summary, ReportKind::Wind),
                hail_reports: by_kind(summary, ReportKind::Hail),
                inserted: summary.inserted_count,
                skipped: summary.skipped_count,
                parse_errors: summary.errors.len() as u64,
                error_message: None,
            },
            Err(err) => IngestionLogEntry {
                id: Uuid::new_v4(),
                report_date: date,
                url_attempted: self.ctx.source.location_for(SourceToken::for_report_date(date)),
                started_at,
                completed_at: Utc::now(),
                success: false,
                tornado_reports: 0,
                wind_reports: 0,
                hail_reports: 0,
                inserted: 0,
                skipped: 0,
                parse_errors: 0,
                error_message: Some(err.to_string()),
            },
        };
        if let Err(err) = self.ctx.store.record_ingestion(&entry).await {
            warn!(%date, error = %err, "failed to record ingestion attempt");
        }
    }
}
