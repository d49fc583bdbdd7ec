use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use haily_core::{ReportKind, StormReport, VerificationResult};
use tokio::sync::RwLock;

use super::{
    IngestionLogEntry, OperationKind, OperationRecord, ReplaceOutcome, ReportStore, StoreError,
};

#[derive(Debug, Default)]
struct MemoryState {
    reports: BTreeMap<NaiveDate, Vec<StormReport>>,
    verifications: BTreeMap<NaiveDate, VerificationResult>,
    ingestion_log: Vec<IngestionLogEntry>,
    operations: Vec<OperationRecord>,
}

/// Attempts kept per date. The newest success always survives.
const INGESTION_LOG_PER_DATE: usize = 96;

fn trim_ingestion_log(log: &mut Vec<IngestionLogEntry>, date: NaiveDate) {
    let attempts = log.iter().filter(|e| e.report_date == date).count();
    if attempts <= INGESTION_LOG_PER_DATE {
        return;
    }
    let newest_success = log
        .iter()
        .filter(|e| e.report_date == date && e.success)
        .max_by_key(|e| e.completed_at)
        .map(|e| e.id);
    let mut excess = attempts - INGESTION_LOG_PER_DATE;
    log.retain(|e| {
        if excess == 0 || e.report_date != date || Some(e.id) == newest_success {
            return true;
        }
        excess -= 1;
        false
    });
}

/// Process-local store used when no `DATABASE_URL` is configured and in tests.
/// Holds one lock over all tables so every write is observed whole.
#[derive(Debug, Default)]
pub struct MemoryReportStore {
    state: RwLock<MemoryState>,
}

impl MemoryReportStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn ingestion_log(&self) -> Vec<IngestionLogEntry> {
        self.state.read().await.ingestion_log.clone()
    }
}

#[async_trait]
impl ReportStore for MemoryReportStore {
    async fn count_reports(&self, date: NaiveDate) -> Result<u64, StoreError> {
        let state = self.state.read().await;
        Ok(state.reports.get(&date).map_or(0, |rows| rows.len() as u64))
    }

    async fn reports_for_date(&self, date: NaiveDate) -> Result<Vec<StormReport>, StoreError> {
        let state = self.state.read().await;
        let mut rows = state.reports.get(&date).cloned().unwrap_or_default();
        rows.sort_by_key(|r| r.event_at());
        Ok(rows)
    }

    async fn fingerprints_for_date(&self, date: NaiveDate) -> Result<HashSet<String>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .reports
            .get(&date)
            .map(|rows| rows.iter().map(|r| r.content_fingerprint.clone()).collect())
            .unwrap_or_default())
    }

    async fn insert_new(&self, date: NaiveDate, reports: &[StormReport]) -> Result<u64, StoreError> {
        if let Some(stray) = reports.iter().find(|r| r.report_date != date) {
            return Err(StoreError::Corrupt(format!(
                "report dated {} staged for {date}",
                stray.report_date
            )));
        }
        let mut state = self.state.write().await;
        let rows = state.reports.entry(date).or_default();
        let mut seen: HashSet<String> = rows.iter().map(|r| r.content_fingerprint.clone()).collect();
        let mut inserted = 0u64;
        for report in reports {
            if seen.insert(report.content_fingerprint.clone()) {
                rows.push(report.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn replace_reports(
        &self,
        date: NaiveDate,
        reports: &[StormReport],
    ) -> Result<ReplaceOutcome, StoreError> {
        if let Some(stray) = reports.iter().find(|r| r.report_date != date) {
            return Err(StoreError::Corrupt(format!(
                "report dated {} staged for {date}",
                stray.report_date
            )));
        }
        let mut seen = HashSet::new();
        let staged: Vec<StormReport> = reports
            .iter()
            .filter(|r| seen.insert(r.content_fingerprint.clone()))
            .cloned()
            .collect();
        let inserted = staged.len() as u64;

        let mut state = self.state.write().await;
        let deleted = state
            .reports
            .insert(date, staged)
            .map_or(0, |old| old.len() as u64);
        Ok(ReplaceOutcome { deleted, inserted })
    }

    async fn report_counts_by_kind(&self) -> Result<BTreeMap<ReportKind, u64>, StoreError> {
        let state = self.state.read().await;
        let mut counts: BTreeMap<ReportKind, u64> =
            ReportKind::ALL.into_iter().map(|k| (k, 0)).collect();
        for report in state.reports.values().flatten() {
            *counts.entry(report.kind()).or_default() += 1;
        }
        Ok(counts)
    }

    async fn load_verification(&self, date: NaiveDate) -> Result<Option<VerificationResult>, StoreError> {
        Ok(self.state.read().await.verifications.get(&date).cloned())
    }

    async fn upsert_verification(&self, result: &VerificationResult) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state.verifications.insert(result.date, result.clone());
        Ok(())
    }

    async fn verifications_between(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<VerificationResult>, StoreError> {
        if start > end {
            return Ok(Vec::new());
        }
        let state = self.state.read().await;
        Ok(state.verifications.range(start..=end).map(|(_, v)| v.clone()).collect())
    }

    async fn record_ingestion(&self, entry: &IngestionLogEntry) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state.ingestion_log.push(entry.clone());
        trim_ingestion_log(&mut state.ingestion_log, entry.report_date);
        Ok(())
    }

    async fn last_successful_ingestion(
        &self,
        date: NaiveDate,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .ingestion_log
            .iter()
            .filter(|e| e.report_date == date && e.success)
            .map(|e| e.completed_at)
            .max())
    }

    async fn record_operation(&self, record: &OperationRecord) -> Result<(), StoreError> {
        self.state.write().await.operations.push(record.clone());
        Ok(())
    }

    async fn operations_since(&self, since: DateTime<Utc>) -> Result<Vec<OperationRecord>, StoreError> {
        let state = self.state.read().await;
        let mut ops: Vec<OperationRecord> = state
            .operations
            .iter()
            .filter(|op| op.started_at >= since)
            .cloned()
            .collect();
        ops.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(ops)
    }

    async fn last_success_by_kind(&self) -> Result<BTreeMap<OperationKind, DateTime<Utc>>, StoreError> {
        let state = self.state.read().await;
        let mut latest: BTreeMap<OperationKind, DateTime<Utc>> = BTreeMap::new();
        for op in state.operations.iter().filter(|op| op.success) {
            latest
                .entry(op.kind)
                .and_modify(|t| *t = (*t).max(op.completed_at))
                .or_insert(op.completed_at);
        }
        Ok(latest)
    }

    async fn prune_operations(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut state = self.state.write().await;
        let len_before = state.operations.len();
        state.operations.retain(|op| op.started_at >= before);
        Ok((len_before - state.operations.len()) as u64)
    }
}
