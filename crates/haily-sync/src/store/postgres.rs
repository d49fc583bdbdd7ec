use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use haily_core::{Magnitude, MatchStatus, ReportKind, ReportTime, SourceToken, StormReport, VerificationResult};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, info};

use super::{
    IngestionLogEntry, OperationKind, OperationRecord, ReplaceOutcome, ReportStore, StoreError,
};

const INSERT_REPORT_SQL: &str = r#"
    INSERT INTO storm_reports (
        report_date, report_type, time_utc, magnitude, location, county, state,
        latitude, longitude, narrative, source_row, content_fingerprint,
        source_token, ingested_at
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
    ON CONFLICT (report_date, content_fingerprint) DO NOTHING
"#;

/// Postgres-backed store. Schema lives in `migrations/`.
#[derive(Debug, Clone)]
pub struct PgReportStore {
    pool: PgPool,
}

impl PgReportStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

async fn insert_rows(
    tx: &mut Transaction<'_, Postgres>,
    reports: &[StormReport],
) -> Result<u64, StoreError> {
    let mut inserted = 0u64;
    for report in reports {
        let result = sqlx::query(INSERT_REPORT_SQL)
            .bind(report.report_date)
            .bind(report.kind().as_str())
            .bind(report.time_utc.to_string())
            .bind(Json(&report.magnitude))
            .bind(&report.location)
            .bind(&report.county)
            .bind(&report.state)
            .bind(report.latitude)
            .bind(report.longitude)
            .bind(&report.narrative)
            .bind(&report.source_row)
            .bind(&report.content_fingerprint)
            .bind(report.source_token.to_string())
            .bind(report.ingested_at)
            .execute(&mut **tx)
            .await?;
        inserted += result.rows_affected();
    }
    Ok(inserted)
}

fn check_dates(date: NaiveDate, reports: &[StormReport]) -> Result<(), StoreError> {
    match reports.iter().find(|r| r.report_date != date) {
        Some(stray) => Err(StoreError::Corrupt(format!(
            "report dated {} staged for {date}",
            stray.report_date
        ))),
        None => Ok(()),
    }
}

fn report_from_row(row: &PgRow) -> Result<StormReport, StoreError> {
    let time_utc: String = row.try_get("time_utc")?;
    let token: String = row.try_get("source_token")?;
    let Json(magnitude): Json<Magnitude> = row.try_get("magnitude")?;
    Ok(StormReport {
        report_date: row.try_get("report_date")?,
        time_utc: ReportTime::parse(&time_utc)
            .map_err(|e| StoreError::Corrupt(format!("time_utc {time_utc:?}: {e}")))?,
        magnitude,
        location: row.try_get("location")?,
        county: row.try_get("county")?,
        state: row.try_get("state")?,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
        narrative: row.try_get("narrative")?,
        source_row: row.try_get("source_row")?,
        content_fingerprint: row.try_get("content_fingerprint")?,
        source_token: SourceToken::parse(&token)
            .map_err(|e| StoreError::Corrupt(format!("source_token {token:?}: {e}")))?,
        ingested_at: row.try_get("ingested_at")?,
    })
}

fn verification_from_row(row: &PgRow) -> Result<VerificationResult, StoreError> {
    let status: String = row.try_get("match_status")?;
    let live: Option<i64> = row.try_get("spc_live_count")?;
    Ok(VerificationResult {
        date: row.try_get("report_date")?,
        hailydb_count: to_u64(row.try_get("hailydb_count")?),
        spc_live_count: live.map(to_u64),
        match_status: status.parse::<MatchStatus>().map_err(StoreError::Corrupt)?,
        last_checked_at: row.try_get("last_checked_at")?,
        last_error: row.try_get("last_error")?,
    })
}

fn operation_from_row(row: &PgRow) -> Result<OperationRecord, StoreError> {
    let kind: String = row.try_get("operation_type")?;
    let trigger: String = row.try_get("trigger_method")?;
    Ok(OperationRecord {
        id: row.try_get("id")?,
        kind: kind.parse().map_err(StoreError::Corrupt)?,
        trigger: trigger.parse().map_err(StoreError::Corrupt)?,
        report_date: row.try_get("report_date")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        success: row.try_get("success")?,
        records_processed: to_u64(row.try_get("records_processed")?),
        records_new: to_u64(row.try_get("records_new")?),
        error_message: row.try_get("error_message")?,
    })
}

#[async_trait]
impl ReportStore for PgReportStore {
    async fn count_reports(&self, date: NaiveDate) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM storm_reports WHERE report_date = $1")
            .bind(date)
            .fetch_one(&self.pool)
            .await?;
        Ok(to_u64(count))
    }

    async fn reports_for_date(&self, date: NaiveDate) -> Result<Vec<StormReport>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT report_date, time_utc, magnitude, location, county, state, latitude,
                   longitude, narrative, source_row, content_fingerprint, source_token, ingested_at
            FROM storm_reports
            WHERE report_date = $1
            ORDER BY id
            "#,
        )
        .bind(date)
        .fetch_all(&self.pool)
        .await?;
        let mut reports = rows.iter().map(report_from_row).collect::<Result<Vec<_>, _>>()?;
        reports.sort_by_key(|r| r.event_at());
        Ok(reports)
    }

    async fn fingerprints_for_date(&self, date: NaiveDate) -> Result<HashSet<String>, StoreError> {
        let rows: Vec<String> = sqlx::query_scalar(
            "SELECT content_fingerprint FROM storm_reports WHERE report_date = $1",
        )
        .bind(date)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }

    async fn insert_new(&self, date: NaiveDate, reports: &[StormReport]) -> Result<u64, StoreError> {
        check_dates(date, reports)?;
        let mut tx = self.pool.begin().await?;
        let inserted = insert_rows(&mut tx, reports).await?;
        tx.commit().await?;
        debug!(%date, inserted, "inserted new storm reports");
        Ok(inserted)
    }

    async fn replace_reports(
        &self,
        date: NaiveDate,
        reports: &[StormReport],
    ) -> Result<ReplaceOutcome, StoreError> {
        check_dates(date, reports)?;
        // Dropping `tx` on an early return rolls the delete back.
        let mut tx = self.pool.begin().await?;
        let deleted = sqlx::query("DELETE FROM storm_reports WHERE report_date = $1")
            .bind(date)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let inserted = insert_rows(&mut tx, reports).await?;
        tx.commit().await?;
        Ok(ReplaceOutcome { deleted, inserted })
    }

    async fn report_counts_by_kind(&self) -> Result<BTreeMap<ReportKind, u64>, StoreError> {
        let rows = sqlx::query(
            "SELECT report_type, COUNT(*) AS total FROM storm_reports GROUP BY report_type",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut counts: BTreeMap<ReportKind, u64> =
            ReportKind::ALL.into_iter().map(|k| (k, 0)).collect();
        for row in rows {
            let kind: String = row.try_get("report_type")?;
            let total: i64 = row.try_get("total")?;
            let kind = kind.parse::<ReportKind>().map_err(StoreError::Corrupt)?;
            counts.insert(kind, to_u64(total));
        }
        Ok(counts)
    }

    async fn load_verification(&self, date: NaiveDate) -> Result<Option<VerificationResult>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT report_date, hailydb_count, spc_live_count, match_status, last_checked_at, last_error
            FROM verification_results
            WHERE report_date = $1
            "#,
        )
        .bind(date)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(verification_from_row).transpose()
    }

    async fn upsert_verification(&self, result: &VerificationResult) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO verification_results (
                report_date, hailydb_count, spc_live_count, match_status, last_checked_at, last_error
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (report_date) DO UPDATE SET
                hailydb_count = EXCLUDED.hailydb_count,
                spc_live_count = EXCLUDED.spc_live_count,
                match_status = EXCLUDED.match_status,
                last_checked_at = EXCLUDED.last_checked_at,
                last_error = EXCLUDED.last_error
            "#,
        )
        .bind(result.date)
        .bind(to_i64(result.hailydb_count))
        .bind(result.spc_live_count.map(to_i64))
        .bind(result.match_status.as_str())
        .bind(result.last_checked_at)
        .bind(&result.last_error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn verifications_between(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<VerificationResult>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT report_date, hailydb_count, spc_live_count, match_status, last_checked_at, last_error
            FROM verification_results
            WHERE report_date BETWEEN $1 AND $2
            ORDER BY report_date
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(verification_from_row).collect()
    }

    async fn record_ingestion(&self, entry: &IngestionLogEntry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO ingestion_log (
                id, report_date, url_attempted, started_at, completed_at, success,
                tornado_reports, wind_reports, hail_reports, inserted, skipped,
                parse_errors, error_message
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(entry.id)
        .bind(entry.report_date)
        .bind(&entry.url_attempted)
        .bind(entry.started_at)
        .bind(entry.completed_at)
        .bind(entry.success)
        .bind(to_i64(entry.tornado_reports))
        .bind(to_i64(entry.wind_reports))
        .bind(to_i64(entry.hail_reports))
        .bind(to_i64(entry.inserted))
        .bind(to_i64(entry.skipped))
        .bind(to_i64(entry.parse_errors))
        .bind(&entry.error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn last_successful_ingestion(
        &self,
        date: NaiveDate,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let latest: Option<DateTime<Utc>> = sqlx::query_scalar(
            "SELECT MAX(completed_at) FROM ingestion_log WHERE report_date = $1 AND success",
        )
        .bind(date)
        .fetch_one(&self.pool)
        .await?;
        Ok(latest)
    }

    async fn record_operation(&self, record: &OperationRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO operation_log (
                id, operation_type, trigger_method, report_date, started_at, completed_at,
                success, records_processed, records_new, error_message
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(record.id)
        .bind(record.kind.as_str())
        .bind(record.trigger.as_str())
        .bind(record.report_date)
        .bind(record.started_at)
        .bind(record.completed_at)
        .bind(record.success)
        .bind(to_i64(record.records_processed))
        .bind(to_i64(record.records_new))
        .bind(&record.error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn operations_since(&self, since: DateTime<Utc>) -> Result<Vec<OperationRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, operation_type, trigger_method, report_date, started_at, completed_at,
                   success, records_processed, records_new, error_message
            FROM operation_log
            WHERE started_at >= $1
            ORDER BY started_at DESC
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(operation_from_row).collect()
    }

    async fn last_success_by_kind(&self) -> Result<BTreeMap<OperationKind, DateTime<Utc>>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT operation_type, MAX(completed_at) AS latest
            FROM operation_log
            WHERE success
            GROUP BY operation_type
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        let mut latest = BTreeMap::new();
        for row in rows {
            let kind: String = row.try_get("operation_type")?;
            let at: DateTime<Utc> = row.try_get("latest")?;
            latest.insert(kind.parse::<OperationKind>().map_err(StoreError::Corrupt)?, at);
        }
        Ok(latest)
    }

    async fn prune_operations(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let deleted = sqlx::query("DELETE FROM operation_log WHERE started_at < $1")
            .bind(before)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(deleted)
    }
}
