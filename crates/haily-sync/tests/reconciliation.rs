use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use haily_adapters::{FetchedDocument, FixtureReportSource, ReportSource, SourceDocument, SourceError};
use haily_core::{MatchStatus, ReportKind, SourceToken, StormReport, VerificationResult};
use haily_sync::{
    DateRange, HailyService, IngestionLogEntry, MemoryReportStore, OperationKind, OperationRecord,
    PollOutcome, ReplaceOutcome, ReportStore, StoreError, SyncContext, SyncError, Trigger,
};
use tokio::sync::Semaphore;
use uuid::Uuid;

fn fixtures_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/spc")
}

fn fixture_body(token: &str) -> String {
    std::fs::read_to_string(fixtures_dir().join(format!("{token}_rpts_filtered.csv"))).unwrap()
}

fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn fixture_service() -> (HailyService, Arc<MemoryReportStore>) {
    let store = Arc::new(MemoryReportStore::new());
    let ctx = SyncContext::new(store.clone(), Arc::new(FixtureReportSource::new(fixtures_dir())));
    (HailyService::new(ctx, 4), store)
}

/// In-memory source whose documents can change between fetches.
#[derive(Default)]
struct ScriptedSource {
    documents: Mutex<HashMap<NaiveDate, String>>,
    failing: AtomicBool,
    gate: Option<Arc<Semaphore>>,
}

impl ScriptedSource {
    fn gated(gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }

    fn publish(&self, date: NaiveDate, body: impl Into<String>) {
        self.documents.lock().unwrap().insert(date, body.into());
    }

    fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl ReportSource for ScriptedSource {
    fn location_for(&self, token: SourceToken) -> String {
        format!("scripted://{token}")
    }

    async fn fetch_day(&self, _op_id: Uuid, token: SourceToken) -> Result<SourceDocument, SourceError> {
        if let Some(gate) = &self.gate {
            let _permit = gate.acquire().await.unwrap();
        }
        let url = self.location_for(token);
        if self.failing.load(Ordering::SeqCst) {
            return Err(SourceError::Empty { url });
        }
        let body = self.documents.lock().unwrap().get(&token.report_date()).cloned();
        Ok(match body {
            Some(body) => SourceDocument::Published(FetchedDocument {
                token,
                url,
                fetched_at: Utc::now(),
                body,
            }),
            None => SourceDocument::NotPublished { url },
        })
    }
}

fn scripted_service(source: Arc<ScriptedSource>) -> (HailyService, Arc<MemoryReportStore>) {
    let store = Arc::new(MemoryReportStore::new());
    let ctx = SyncContext::new(store.clone(), source);
    (HailyService::new(ctx, 4), store)
}

/// Memory store that can fail the replace or the final verification write.
#[derive(Default)]
struct FaultyStore {
    inner: MemoryReportStore,
    fail_replace: bool,
    fail_final_verification: bool,
}

#[async_trait]
impl ReportStore for FaultyStore {
    async fn count_reports(&self, date: NaiveDate) -> Result<u64, StoreError> {
        self.inner.count_reports(date).await
    }
    async fn reports_for_date(&self, date: NaiveDate) -> Result<Vec<StormReport>, StoreError> {
        self.inner.reports_for_date(date).await
    }
    async fn fingerprints_for_date(&self, date: NaiveDate) -> Result<HashSet<String>, StoreError> {
        self.inner.fingerprints_for_date(date).await
    }
    async fn insert_new(&self, date: NaiveDate, reports: &[StormReport]) -> Result<u64, StoreError> {
        self.inner.insert_new(date, reports).await
    }
    async fn replace_reports(
        &self,
        date: NaiveDate,
        reports: &[StormReport],
    ) -> Result<ReplaceOutcome, StoreError> {
        if self.fail_replace {
            return Err(StoreError::Unavailable("connection reset during replace".into()));
        }
        self.inner.replace_reports(date, reports).await
    }
    async fn report_counts_by_kind(&self) -> Result<BTreeMap<ReportKind, u64>, StoreError> {
        self.inner.report_counts_by_kind().await
    }
    async fn load_verification(&self, date: NaiveDate) -> Result<Option<VerificationResult>, StoreError> {
        self.inner.load_verification(date).await
    }
    async fn upsert_verification(&self, result: &VerificationResult) -> Result<(), StoreError> {
        let is_final = result.match_status != MatchStatus::Processing && result.last_error.is_none();
        if self.fail_final_verification && is_final {
            return Err(StoreError::Unavailable("connection reset during upsert".into()));
        }
        self.inner.upsert_verification(result).await
    }
    async fn verifications_between(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<VerificationResult>, StoreError> {
        self.inner.verifications_between(start, end).await
    }
    async fn record_ingestion(&self, entry: &IngestionLogEntry) -> Result<(), StoreError> {
        self.inner.record_ingestion(entry).await
    }
    async fn last_successful_ingestion(
        &self,
        date: NaiveDate,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.inner.last_successful_ingestion(date).await
    }
    async fn record_operation(&self, record: &OperationRecord) -> Result<(), StoreError> {
        self.inner.record_operation(record).await
    }
    async fn operations_since(&self, since: DateTime<Utc>) -> Result<Vec<OperationRecord>, StoreError> {
        self.inner.operations_since(since).await
    }
    async fn last_success_by_kind(&self) -> Result<BTreeMap<OperationKind, DateTime<Utc>>, StoreError> {
        self.inner.last_success_by_kind().await
    }
    async fn prune_operations(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        self.inner.prune_operations(before).await
    }
}

#[tokio::test]
async fn repeated_ingest_is_idempotent() {
    let (service, store) = fixture_service();
    let date = ymd(2024, 6, 3);

    let first = service.ingest.ingest(date).await.unwrap();
    assert!(first.published);
    assert_eq!(first.inserted_count, 8);
    assert_eq!(first.inserted_by_kind[&ReportKind::Tornado], 2);
    assert_eq!(first.inserted_by_kind[&ReportKind::Wind], 3);
    assert_eq!(first.inserted_by_kind[&ReportKind::Hail], 3);

    let second = service.ingest.ingest(date).await.unwrap();
    assert_eq!(second.inserted_count, 0);
    assert_eq!(second.skipped_count, 8);
    assert_eq!(store.count_reports(date).await.unwrap(), 8);

    let log = store.ingestion_log().await;
    assert_eq!(log.len(), 2);
    assert!(log.iter().all(|e| e.success && e.report_date == date));
}

#[tokio::test]
async fn after_midnight_rows_stay_on_the_token_date() {
    let (service, store) = fixture_service();
    let date = ymd(2024, 6, 3);
    service.ingest.ingest(date).await.unwrap();

    let reports = store.reports_for_date(date).await.unwrap();
    assert!(reports.iter().all(|r| r.report_date == date));
    let late = reports
        .iter()
        .find(|r| r.time_utc.to_string() == "0010")
        .unwrap();
    assert_eq!(late.event_at().to_rfc3339(), "2024-06-04T00:10:00+00:00");
    assert_eq!(store.count_reports(ymd(2024, 6, 4)).await.unwrap(), 0);
    // Ordered by event instant, so the 0105 hail report comes last.
    assert_eq!(reports.last().unwrap().time_utc.to_string(), "0105");
}

#[tokio::test]
async fn verification_classifies_each_date() {
    let (service, _store) = fixture_service();
    service.ingest.ingest(ymd(2024, 6, 3)).await.unwrap();
    let partial = service.ingest.ingest(ymd(2024, 6, 4)).await.unwrap();
    assert_eq!(partial.inserted_count, 2);
    assert_eq!(partial.errors.len(), 1);

    let run = service
        .verifier
        .verify_range(DateRange::new(ymd(2024, 6, 3), ymd(2024, 6, 5)), Trigger::Manual)
        .await
        .unwrap();
    let by_date: HashMap<NaiveDate, &VerificationResult> =
        run.results.iter().map(|r| (r.date, r)).collect();

    let matched = by_date[&ymd(2024, 6, 3)];
    assert_eq!(matched.match_status, MatchStatus::Match);
    assert_eq!((matched.hailydb_count, matched.spc_live_count), (8, Some(8)));

    let short = by_date[&ymd(2024, 6, 4)];
    assert_eq!(short.match_status, MatchStatus::Mismatch);
    assert_eq!(short.difference(), Some(1));

    let missing = by_date[&ymd(2024, 6, 5)];
    assert_eq!(missing.match_status, MatchStatus::Unavailable);

    assert_eq!(run.summary.total_dates, 3);
    assert_eq!(run.summary.matches, 1);
    assert_eq!(run.summary.mismatches, 1);
    assert_eq!(run.summary.unavailable, 1);

    let stored = service
        .verifier
        .stored_window(DateRange::new(ymd(2024, 6, 1), ymd(2024, 6, 30)))
        .await
        .unwrap();
    assert_eq!(stored.len(), 3);
}

#[tokio::test]
async fn unpublished_today_is_pending_and_ingest_succeeds_empty() {
    let source = Arc::new(ScriptedSource::default());
    let (service, store) = scripted_service(source);
    let today = Utc::now().date_naive();

    let summary = service.ingest.ingest(today).await.unwrap();
    assert!(!summary.published);
    assert_eq!(summary.inserted_count, 0);
    assert_eq!(store.count_reports(today).await.unwrap(), 0);

    let result = service.verifier.verify_date(today).await.unwrap();
    assert_eq!(result.match_status, MatchStatus::Pending);
    assert_eq!(result.spc_live_count, Some(0));
}

#[tokio::test]
async fn unreachable_source_is_pending_not_mismatch() {
    let source = Arc::new(ScriptedSource::default());
    let date = ymd(2024, 6, 3);
    source.publish(date, fixture_body("240603"));
    let (service, _store) = scripted_service(source.clone());
    service.ingest.ingest(date).await.unwrap();

    source.set_failing(true);
    let result = service.verifier.verify_date(date).await.unwrap();
    assert_eq!(result.match_status, MatchStatus::Pending);
    assert_eq!(result.spc_live_count, None);
    assert!(result.last_error.is_some());

    let err = service.ingest.ingest(date).await.unwrap_err();
    assert!(matches!(err, SyncError::SourceFetch { .. }));
}

#[tokio::test]
async fn reimport_replaces_a_drifted_date() {
    let source = Arc::new(ScriptedSource::default());
    let date = ymd(2024, 6, 3);
    source.publish(date, fixture_body("240603"));
    let (service, store) = scripted_service(source.clone());
    service.ingest.ingest(date).await.unwrap();

    // The source later revises the day: one hail row is corrected.
    let revised = fixture_body("240603").replace(
        "1955,100,Ellinwood,Barton,KS,38.36,-98.58,(DDC)",
        "1955,125,Ellinwood,Barton,KS,38.36,-98.58,Half dollar size. (DDC)",
    );
    let appended = format!("{revised}1700,150,2 N Sterling,Rice,KS,38.24,-98.21,(ICT)\n");
    source.publish(date, appended);

    let before = service.verifier.verify_date(date).await.unwrap();
    assert_eq!(before.match_status, MatchStatus::Mismatch);

    let report = service.reimport.reimport(date).await.unwrap();
    assert_eq!(report.reports_replaced, 8);
    assert_eq!(report.reports_ingested, 9);
    assert_eq!(report.match_status, MatchStatus::Match);
    assert!(report.message().contains("2024-06-03"));

    assert_eq!(store.count_reports(date).await.unwrap(), 9);
    let narratives: Vec<String> = store
        .reports_for_date(date)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.narrative)
        .collect();
    assert!(narratives.iter().any(|n| n.contains("Half dollar")));
    assert!(!narratives.iter().any(|n| n == "(DDC)"));

    let saved = store.load_verification(date).await.unwrap().unwrap();
    assert_eq!(saved.match_status, MatchStatus::Match);
    assert_eq!(saved.hailydb_count, 9);
}

#[tokio::test]
async fn concurrent_reimports_are_single_flight() {
    let gate = Arc::new(Semaphore::new(0));
    let source = Arc::new(ScriptedSource::gated(gate.clone()));
    let date = ymd(2024, 6, 3);
    source.publish(date, fixture_body("240603"));
    let (service, store) = scripted_service(source);

    let first = {
        let service = service.clone();
        tokio::spawn(async move { service.reimport.reimport(date).await })
    };
    while !service.ctx.locks.is_reimporting(date) {
        tokio::time::sleep(StdDuration::from_millis(5)).await;
    }

    let second = service.reimport.reimport(date).await.unwrap_err();
    assert!(matches!(second, SyncError::ReimportInProgress(d) if d == date));

    // Reads during the reimport report PROCESSING instead of a transient count.
    let during = service.verifier.verify_date(date).await.unwrap();
    assert_eq!(during.match_status, MatchStatus::Processing);

    gate.add_permits(1);
    let report = tokio::time::timeout(StdDuration::from_secs(5), first)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(report.reports_ingested, 8);
    assert_eq!(store.count_reports(date).await.unwrap(), 8);
    assert!(!service.ctx.locks.is_reimporting(date));

    // The slot is free again once the first run finishes.
    assert!(service.reimport.reimport(date).await.is_ok());
}

#[tokio::test]
async fn failed_replace_leaves_stored_reports_untouched() {
    let date = ymd(2024, 6, 3);
    let store = Arc::new(FaultyStore {
        fail_replace: true,
        ..FaultyStore::default()
    });
    let ctx = SyncContext::new(store.clone(), Arc::new(FixtureReportSource::new(fixtures_dir())));
    let service = HailyService::new(ctx, 2);
    service.ingest.ingest(date).await.unwrap();
    let before: Vec<String> = store
        .reports_for_date(date)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.content_fingerprint)
        .collect();

    let err = service.reimport.reimport(date).await.unwrap_err();
    assert!(matches!(err, SyncError::Transaction { .. }));

    let after: Vec<String> = store
        .reports_for_date(date)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.content_fingerprint)
        .collect();
    assert_eq!(before, after);

    let verification = store.load_verification(date).await.unwrap().unwrap();
    assert_eq!(verification.match_status, MatchStatus::Mismatch);
    assert_eq!(verification.hailydb_count, 8);
    assert!(verification.last_error.unwrap().contains("rolled back"));
}

#[tokio::test]
async fn failure_after_commit_records_the_replaced_count() {
    let date = ymd(2024, 6, 3);
    let source = Arc::new(ScriptedSource::default());
    source.publish(date, fixture_body("240604"));
    let store = Arc::new(FaultyStore {
        fail_final_verification: true,
        ..FaultyStore::default()
    });
    let service = HailyService::new(SyncContext::new(store.clone(), source.clone()), 2);
    service.ingest.ingest(date).await.unwrap();
    assert_eq!(store.count_reports(date).await.unwrap(), 2);

    source.publish(date, fixture_body("240603"));
    let err = service.reimport.reimport(date).await.unwrap_err();
    assert!(matches!(err, SyncError::Store(_)));

    assert_eq!(store.count_reports(date).await.unwrap(), 8);
    let verification = store.load_verification(date).await.unwrap().unwrap();
    assert_eq!(verification.match_status, MatchStatus::Mismatch);
    assert_eq!(verification.hailydb_count, 8);
    assert!(verification.last_error.is_some());
}

#[tokio::test]
async fn reimport_of_unpublished_date_keeps_existing_rows() {
    let source = Arc::new(ScriptedSource::default());
    let date = ymd(2024, 6, 3);
    source.publish(date, fixture_body("240603"));
    let (service, store) = scripted_service(source.clone());
    service.ingest.ingest(date).await.unwrap();

    source.documents.lock().unwrap().clear();
    let err = service.reimport.reimport(date).await.unwrap_err();
    assert!(matches!(err, SyncError::NotPublished { .. }));
    assert_eq!(store.count_reports(date).await.unwrap(), 8);
}

#[tokio::test]
async fn protected_dates_refuse_polling_but_accept_reimport() {
    let source = Arc::new(ScriptedSource::default());
    let now = Utc::now();
    let old = now.date_naive() - Duration::days(20);
    source.publish(old, fixture_body("240603"));
    let (service, store) = scripted_service(source);

    let err = service.ingest.poll(old, now).await.unwrap_err();
    assert!(matches!(err, SyncError::DateOutOfRange { .. }));
    assert_eq!(store.count_reports(old).await.unwrap(), 0);

    let report = service.reimport.reimport(old).await.unwrap();
    assert_eq!(report.reports_ingested, 8);
    assert_eq!(store.count_reports(old).await.unwrap(), 8);
}

#[tokio::test]
async fn future_dates_are_out_of_range() {
    let (service, _store) = fixture_service();
    let now = Utc::now();
    let tomorrow = now.date_naive() + Duration::days(1);
    assert!(matches!(
        service.ingest.poll(tomorrow, now).await,
        Err(SyncError::DateOutOfRange { .. })
    ));
    assert!(matches!(
        service.reimport.reimport(tomorrow).await,
        Err(SyncError::DateOutOfRange { .. })
    ));
}

#[tokio::test]
async fn polling_respects_tier_cadence() {
    let source = Arc::new(ScriptedSource::default());
    let now = Utc::now();
    let yesterday = now.date_naive() - Duration::days(1);
    source.publish(yesterday, fixture_body("240603"));
    let (service, store) = scripted_service(source);

    let first = service.ingest.poll(yesterday, now).await.unwrap();
    assert!(matches!(first, PollOutcome::Ingested(ref s) if s.inserted_count == 8));

    let again = service.ingest.poll(yesterday, Utc::now()).await.unwrap();
    let PollOutcome::Skipped { next_due, .. } = again else {
        panic!("second poll inside the cadence should be skipped");
    };
    let next_due = next_due.unwrap();
    assert!(next_due > Utc::now());
    assert_eq!(next_due.timestamp() % 3600, 0, "hourly polls align to the top of the hour");

    let later = service
        .ingest
        .poll(yesterday, Utc::now() + Duration::minutes(61))
        .await
        .unwrap();
    assert!(matches!(later, PollOutcome::Ingested(ref s) if s.inserted_count == 0));
    assert_eq!(store.count_reports(yesterday).await.unwrap(), 8);
}

#[tokio::test]
async fn poll_sweep_covers_the_polling_horizon() {
    let source = Arc::new(ScriptedSource::default());
    let now = Utc::now();
    let yesterday = now.date_naive() - Duration::days(1);
    source.publish(yesterday, fixture_body("240603"));
    let (service, store) = scripted_service(source);

    let sweep = service.ingest.poll_due(now).await;
    assert_eq!(sweep.ingested.len(), 16);
    assert!(sweep.failures.is_empty());
    assert_eq!(store.count_reports(yesterday).await.unwrap(), 8);

    let repeat = service.ingest.poll_due(now).await;
    assert!(repeat.ingested.is_empty());
    assert_eq!(repeat.skipped.len(), 16);
}

#[tokio::test]
async fn reconcile_reimports_recent_mismatches_and_defers_protected_ones() {
    let source = Arc::new(ScriptedSource::default());
    let now = Utc::now();
    let recent = now.date_naive() - Duration::days(3);
    let old = now.date_naive() - Duration::days(30);
    let partial = fixture_body("240604");
    let (service, store) = scripted_service(source.clone());

    // Store an older, shorter copy of both days.
    source.publish(recent, partial.clone());
    source.publish(old, partial);
    service.ingest.ingest(recent).await.unwrap();
    service.reimport.reimport(old).await.unwrap();
    source.publish(recent, fixture_body("240603"));
    source.publish(old, fixture_body("240603"));

    let report = service
        .reconcile(DateRange::new(old, recent), Trigger::Manual)
        .await
        .unwrap();
    assert_eq!(report.verification.summary.mismatches, 2);
    assert_eq!(report.reimported.len(), 1);
    assert_eq!(report.reimported[0].date, recent);
    assert_eq!(report.deferred.len(), 1);
    assert_eq!(report.deferred[0].date, old);
    assert_eq!(report.deferred[0].age_days, 30);
    assert_eq!(store.count_reports(recent).await.unwrap(), 8);
    assert_eq!(store.count_reports(old).await.unwrap(), 2);
}
