use std::path::PathBuf;
use std::time::Duration;

use chrono::NaiveDate;
use haily_adapters::DEFAULT_SPC_BASE_URL;
use haily_storage::{BackoffPolicy, HttpClientConfig};

pub const DEFAULT_EARLIEST_DATE: &str = "2004-01-01";
pub const DEFAULT_POLL_CRON: &str = "0 */5 * * * *";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Unset means the in-memory store.
    pub database_url: Option<String>,
    pub spc_base_url: String,
    /// When set, source documents are read from this directory instead of the network.
    pub fixtures_dir: Option<PathBuf>,
    pub archive_dir: Option<PathBuf>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub http_max_retries: usize,
    pub verify_concurrency: usize,
    pub earliest_date: NaiveDate,
    pub scheduler_enabled: bool,
    pub poll_cron: String,
    pub log_retention_days: u32,
}

fn flag(value: &str) -> bool {
    matches!(value, "1" | "true" | "TRUE" | "True" | "yes")
}

fn default_earliest_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2004, 1, 1).unwrap_or(NaiveDate::MIN)
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.trim().is_empty()),
            spc_base_url: std::env::var("HAILY_SPC_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_SPC_BASE_URL.to_string()),
            fixtures_dir: std::env::var("HAILY_FIXTURES_DIR").ok().map(PathBuf::from),
            archive_dir: std::env::var("HAILY_ARCHIVE_DIR").ok().map(PathBuf::from),
            user_agent: std::env::var("HAILY_USER_AGENT")
                .unwrap_or_else(|_| "hailydb-ingest/0.1".to_string()),
            http_timeout_secs: std::env::var("HAILY_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            http_max_retries: std::env::var("HAILY_HTTP_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3),
            verify_concurrency: std::env::var("HAILY_VERIFY_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(4),
            earliest_date: std::env::var("HAILY_EARLIEST_DATE")
                .ok()
                .and_then(|v| NaiveDate::parse_from_str(&v, "%Y-%m-%d").ok())
                .unwrap_or_else(default_earliest_date),
            scheduler_enabled: std::env::var("HAILY_SCHEDULER_ENABLED")
                .map(|v| flag(&v))
                .unwrap_or(false),
            poll_cron: std::env::var("HAILY_POLL_CRON")
                .unwrap_or_else(|_| DEFAULT_POLL_CRON.to_string()),
            log_retention_days: std::env::var("HAILY_LOG_RETENTION_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
        }
    }

    /// Offline configuration over a fixture directory and the in-memory store.
    pub fn for_fixtures(dir: impl Into<PathBuf>) -> Self {
        Self {
            database_url: None,
            spc_base_url: DEFAULT_SPC_BASE_URL.to_string(),
            fixtures_dir: Some(dir.into()),
            archive_dir: None,
            user_agent: "hailydb-ingest/0.1".to_string(),
            http_timeout_secs: 30,
            http_max_retries: 3,
            verify_concurrency: 4,
            earliest_date: default_earliest_date(),
            scheduler_enabled: false,
            poll_cron: DEFAULT_POLL_CRON.to_string(),
            log_retention_days: 30,
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            backoff: BackoffPolicy {
                max_retries: self.http_max_retries,
                ..BackoffPolicy::default()
            },
            ..HttpClientConfig::default()
        }
    }
}
