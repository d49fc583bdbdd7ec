use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use haily_core::PROTECTED_AGE_DAYS;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::ops::prune_operation_log;
use crate::store::Trigger;
use crate::verify::DateRange;
use crate::{HailyService, SyncConfig};

/// Daily audit of the polling horizon plus log retention.
pub const MAINTENANCE_CRON: &str = "0 30 3 * * *";

/// Builds the background scheduler when `HAILY_SCHEDULER_ENABLED` is set.
/// The caller starts it and keeps it alive.
pub async fn maybe_build_scheduler(
    service: HailyService,
    config: &SyncConfig,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;

    let poller = service.clone();
    let poll_job = Job::new_async(config.poll_cron.as_str(), move |_uuid, _l| {
        let service = poller.clone();
        Box::pin(async move {
            let sweep = service.ingest.poll_due(Utc::now()).await;
            if !sweep.failures.is_empty() {
                warn!(failed = sweep.failures.len(), "scheduled poll had failures");
            }
        })
    })
    .with_context(|| format!("creating poll job for cron {}", config.poll_cron))?;
    sched.add(poll_job).await.context("adding poll job")?;

    let retention_days = config.log_retention_days;
    let earliest = config.earliest_date;
    let maintainer = service;
    let maintenance_job = Job::new_async(MAINTENANCE_CRON, move |_uuid, _l| {
        let service = maintainer.clone();
        Box::pin(async move {
            let now = Utc::now();
            let today = now.date_naive();
            let horizon = DateRange::new(
                (today - Duration::days(i64::from(PROTECTED_AGE_DAYS) - 1)).max(earliest),
                today,
            );
            match service.reconcile(horizon, Trigger::Scheduled).await {
                Ok(report) => info!(
                    mismatches = report.verification.summary.mismatches,
                    reimported = report.reimported.len(),
                    "scheduled reconcile finished"
                ),
                Err(err) => warn!(error = %err, "scheduled reconcile failed"),
            }
            if let Err(err) = prune_operation_log(service.ctx.store.as_ref(), now, retention_days).await {
                warn!(error = %err, "operation log pruning failed");
            }
        })
    })
    .context("creating maintenance job")?;
    sched.add(maintenance_job).await.context("adding maintenance job")?;

    Ok(Some(sched))
}
