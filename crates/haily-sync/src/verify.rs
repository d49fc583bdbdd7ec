//! Reconciles stored per-date counts against the live source.

use std::sync::Arc;

use chrono::{DateTime, Days, NaiveDate, Utc};
use haily_adapters::{count_reports_in_csv, SourceDocument};
use haily_core::{MatchStatus, SourceToken, VerificationResult};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::ops::OperationScope;
use crate::store::{OperationKind, Trigger};
use crate::{SyncContext, SyncError};

/// Days per verification page.
pub const DEFAULT_WINDOW_DAYS: u32 = 60;

/// What the live source said about a date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveCount {
    Published(u64),
    NotPublished,
    Failed(String),
}

impl LiveCount {
    /// Count recorded on the verification row. An unpublished document counts as zero.
    pub fn recorded(&self) -> Option<u64> {
        match self {
            LiveCount::Published(n) => Some(*n),
            LiveCount::NotPublished => Some(0),
            LiveCount::Failed(_) => None,
        }
    }
}

/// Classification of one date given its stored and live counts.
/// `window_closed` is true once the date's reporting window has ended.
pub fn classify(stored: u64, live: &LiveCount, window_closed: bool) -> MatchStatus {
    match live {
        LiveCount::Failed(_) => MatchStatus::Pending,
        LiveCount::NotPublished if stored == 0 => {
            if window_closed {
                MatchStatus::Unavailable
            } else {
                MatchStatus::Pending
            }
        }
        LiveCount::NotPublished => MatchStatus::Mismatch,
        LiveCount::Published(n) if *n == stored => MatchStatus::Match,
        LiveCount::Published(_) if window_closed => MatchStatus::Mismatch,
        LiveCount::Published(_) => MatchStatus::Pending,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    /// Page `offset` of `days`-long blocks walking back from `today`,
    /// clamped to `earliest`. Page 0 ends today. Pages past the calendar
    /// or before `earliest` are empty.
    pub fn window(today: NaiveDate, offset: u32, days: u32, earliest: NaiveDate) -> Self {
        let days = u64::from(days.max(1));
        let end = u64::from(offset)
            .checked_mul(days)
            .and_then(|back| today.checked_sub_days(Days::new(back)));
        let Some(end) = end else {
            return Self {
                start: earliest,
                end: earliest.pred_opt().unwrap_or(NaiveDate::MIN),
            };
        };
        let start = end
            .checked_sub_days(Days::new(days - 1))
            .map_or(earliest, |start| start.max(earliest));
        Self { start, end }
    }

    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }

    pub fn dates(&self) -> impl Iterator<Item = NaiveDate> {
        let end = self.end;
        self.start.iter_days().take_while(move |d| *d <= end)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct VerificationSummary {
    pub total_dates: u64,
    pub matches: u64,
    pub mismatches: u64,
    pub pending: u64,
    pub processing: u64,
    pub unavailable: u64,
    pub match_percentage: f64,
}

impl VerificationSummary {
    pub fn from_results(results: &[VerificationResult]) -> Self {
        let mut summary = Self {
            total_dates: results.len() as u64,
            ..Self::default()
        };
        for result in results {
            match result.match_status {
                MatchStatus::Match => summary.matches += 1,
                MatchStatus::Mismatch => summary.mismatches += 1,
                MatchStatus::Pending => summary.pending += 1,
                MatchStatus::Processing => summary.processing += 1,
                MatchStatus::Unavailable => summary.unavailable += 1,
            }
        }
        if summary.total_dates > 0 {
            summary.match_percentage = summary.matches as f64 * 100.0 / summary.total_dates as f64;
        }
        summary
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VerificationRun {
    pub date_range: DateRange,
    /// Instant every classification in this run was evaluated against.
    pub checked_at: DateTime<Utc>,
    pub results: Vec<VerificationResult>,
    pub summary: VerificationSummary,
}

#[derive(Clone)]
pub struct IntegrityVerifier {
    ctx: SyncContext,
    concurrency: usize,
}

impl IntegrityVerifier {
    pub fn new(ctx: SyncContext, concurrency: usize) -> Self {
        Self {
            ctx,
            concurrency: concurrency.max(1),
        }
    }

    pub async fn verify_date(&self, date: NaiveDate) -> Result<VerificationResult, SyncError> {
        let scope = OperationScope::start(OperationKind::Verify, Trigger::Manual, Some(date));
        let result = self.verify_at(date, Utc::now()).await;
        let error = result.as_ref().err().map(ToString::to_string);
        scope.finish(self.ctx.store.as_ref(), 1, 0, error).await;
        result
    }

    /// Verifies every date in `range`. All dates are classified against the
    /// instant the run started, so a date crossing a boundary mid-run is
    /// judged consistently.
    pub async fn verify_range(
        &self,
        range: DateRange,
        trigger: Trigger,
    ) -> Result<VerificationRun, SyncError> {
        let scope = OperationScope::start(OperationKind::Verify, trigger, None);
        let now = scope.started_at();
        let span = info_span!("verify", op_id = %scope.id, start = %range.start, end = %range.end);
        let outcome = self.fan_out(range, now).instrument(span).await;

        let (processed, error) = match &outcome {
            Ok(results) => (results.len() as u64, None),
            Err(err) => (0, Some(err.to_string())),
        };
        scope.finish(self.ctx.store.as_ref(), processed, 0, error).await;

        let results = outcome?;
        let summary = VerificationSummary::from_results(&results);
        info!(
            dates = summary.total_dates,
            matches = summary.matches,
            mismatches = summary.mismatches,
            pending = summary.pending,
            "verification run complete"
        );
        Ok(VerificationRun {
            date_range: range,
            checked_at: now,
            results,
            summary,
        })
    }

    /// Stored verification rows for a window, without touching the source.
    pub async fn stored_window(&self, range: DateRange) -> Result<Vec<VerificationResult>, SyncError> {
        Ok(self.ctx.store.verifications_between(range.start, range.end).await?)
    }

    async fn fan_out(
        &self,
        range: DateRange,
        now: DateTime<Utc>,
    ) -> Result<Vec<VerificationResult>, SyncError> {
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        for date in range.dates() {
            let verifier = self.clone();
            let permits = Arc::clone(&permits);
            tasks.spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|e| SyncError::Task(e.to_string()))?;
                verifier.verify_at(date, now).await
            });
        }

        let mut results = Vec::new();
        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(result)) => results.push(result),
                Ok(Err(err)) => {
                    warn!(error = %err, "date verification failed");
                    first_error.get_or_insert(err);
                }
                Err(join_err) => {
                    first_error.get_or_insert(SyncError::Task(join_err.to_string()));
                }
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }
        results.sort_by_key(|r| r.date);
        Ok(results)
    }

    pub(crate) async fn verify_at(
        &self,
        date: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<VerificationResult, SyncError> {
        if date < self.ctx.earliest_date || date > now.date_naive() {
            let _guard = self.ctx.locks.write(date).await;
            let result = VerificationResult {
                date,
                hailydb_count: self.ctx.store.count_reports(date).await?,
                spc_live_count: None,
                match_status: MatchStatus::Unavailable,
                last_checked_at: now,
                last_error: Some("date outside the supported range".to_string()),
            };
            self.ctx.store.upsert_verification(&result).await?;
            return Ok(result);
        }
        if self.ctx.locks.is_reimporting(date) {
            return self.processing(date, now).await;
        }

        let token = SourceToken::for_report_date(date);
        let live = self.live_count(token).await;

        let _guard = self.ctx.locks.write(date).await;
        // A reimport that queued behind us owns the next write.
        if self.ctx.locks.is_reimporting(date) {
            return self.processing(date, now).await;
        }
        let stored = self.ctx.store.count_reports(date).await?;
        let status = classify(stored, &live, now > token.window_close());
        let result = VerificationResult {
            date,
            hailydb_count: stored,
            spc_live_count: live.recorded(),
            match_status: status,
            last_checked_at: now,
            last_error: match &live {
                LiveCount::Failed(reason) => Some(reason.clone()),
                _ => None,
            },
        };
        self.ctx.store.upsert_verification(&result).await?;
        debug!(%date, stored, live = ?result.spc_live_count, %status, "verified date");
        Ok(result)
    }

    /// Reported while a reimport holds the date; nothing is written.
    async fn processing(
        &self,
        date: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<VerificationResult, SyncError> {
        let previous = self.ctx.store.load_verification(date).await?;
        Ok(VerificationResult {
            date,
            hailydb_count: self.ctx.store.count_reports(date).await?,
            spc_live_count: previous.and_then(|p| p.spc_live_count),
            match_status: MatchStatus::Processing,
            last_checked_at: now,
            last_error: None,
        })
    }

    async fn live_count(&self, token: SourceToken) -> LiveCount {
        match self.ctx.source.fetch_day(Uuid::new_v4(), token).await {
            Ok(SourceDocument::Published(doc)) => LiveCount::Published(count_reports_in_csv(&doc.body)),
            Ok(SourceDocument::NotPublished { .. }) => LiveCount::NotPublished,
            Err(err) => {
                warn!(%token, error = %err, "live count unavailable");
                LiveCount::Failed(err.to_string())
            }
        }
    }
}
