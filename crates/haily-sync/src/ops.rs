//! Operation audit log and the status rollup built from it.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use haily_core::ReportKind;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::store::{OperationKind, OperationRecord, ReportStore, StoreError, Trigger};

pub const STATUS_WINDOW_HOURS: i64 = 24;

/// An operation in progress; written to the log when finished.
#[derive(Debug, Clone)]
pub(crate) struct OperationScope {
    pub id: Uuid,
    kind: OperationKind,
    trigger: Trigger,
    report_date: Option<NaiveDate>,
    started_at: DateTime<Utc>,
}

impl OperationScope {
    pub fn start(kind: OperationKind, trigger: Trigger, report_date: Option<NaiveDate>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            trigger,
            report_date,
            started_at: Utc::now(),
        }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Audit logging never fails the operation it describes.
    pub async fn finish(
        self,
        store: &dyn ReportStore,
        records_processed: u64,
        records_new: u64,
        error: Option<String>,
    ) {
        let record = OperationRecord {
            id: self.id,
            kind: self.kind,
            trigger: self.trigger,
            report_date: self.report_date,
            started_at: self.started_at,
            completed_at: Utc::now(),
            success: error.is_none(),
            records_processed,
            records_new,
            error_message: error,
        };
        if let Err(err) = store.record_operation(&record).await {
            warn!(op_id = %record.id, kind = %record.kind, error = %err, "failed to record operation");
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OperationStats {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
}

impl OperationStats {
    fn add(&mut self, success: bool) {
        self.total += 1;
        if success {
            self.successful += 1;
        } else {
            self.failed += 1;
        }
    }

    /// Percentage of successful operations, `None` when nothing ran.
    pub fn success_rate(&self) -> Option<f64> {
        (self.total > 0).then(|| self.successful as f64 * 100.0 / self.total as f64)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub generated_at: DateTime<Utc>,
    pub window_hours: i64,
    pub overall: OperationStats,
    pub success_rate: Option<f64>,
    pub by_kind: BTreeMap<OperationKind, OperationStats>,
    pub last_successful: BTreeMap<OperationKind, DateTime<Utc>>,
    pub reports_by_kind: BTreeMap<ReportKind, u64>,
    pub total_reports: u64,
    pub reimports_in_flight: Vec<NaiveDate>,
}

pub async fn status_report(
    store: &dyn ReportStore,
    now: DateTime<Utc>,
    reimports_in_flight: Vec<NaiveDate>,
) -> Result<StatusReport, StoreError> {
    let recent = store
        .operations_since(now - Duration::hours(STATUS_WINDOW_HOURS))
        .await?;
    let mut overall = OperationStats::default();
    let mut by_kind: BTreeMap<OperationKind, OperationStats> = OperationKind::ALL
        .into_iter()
        .map(|k| (k, OperationStats::default()))
        .collect();
    for op in &recent {
        overall.add(op.success);
        by_kind.entry(op.kind).or_default().add(op.success);
    }
    let reports_by_kind = store.report_counts_by_kind().await?;
    Ok(StatusReport {
        generated_at: now,
        window_hours: STATUS_WINDOW_HOURS,
        success_rate: overall.success_rate(),
        overall,
        by_kind,
        last_successful: store.last_success_by_kind().await?,
        total_reports: reports_by_kind.values().sum(),
        reports_by_kind,
        reimports_in_flight,
    })
}

/// Deletes operation log rows that started more than `retention_days` ago.
pub async fn prune_operation_log(
    store: &dyn ReportStore,
    now: DateTime<Utc>,
    retention_days: u32,
) -> Result<u64, StoreError> {
    let cutoff = now - Duration::days(i64::from(retention_days));
    let deleted = store.prune_operations(cutoff).await?;
    info!(%cutoff, deleted, "pruned operation log");
    Ok(deleted)
}
