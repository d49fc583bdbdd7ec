//! Source feed contracts: the live SPC report feed and a fixture-directory twin.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use haily_core::SourceToken;
use haily_storage::{FetchError, HttpFetcher};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

pub mod csv_format;

pub use csv_format::{count_reports_in_csv, parse_spc_csv, sanitize, ParseError, ParseErrorKind, ParsedDay};

pub const CRATE_NAME: &str = "haily-adapters";

pub const DEFAULT_SPC_BASE_URL: &str = "https://www.spc.noaa.gov/climo/reports/";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedDocument {
    pub token: SourceToken,
    pub url: String,
    pub fetched_at: DateTime<Utc>,
    /// NUL-stripped document text.
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceDocument {
    Published(FetchedDocument),
    /// The source has no document for this token (HTTP 404 / missing fixture).
    NotPublished { url: String },
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("fetching {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: FetchError,
    },
    #[error("reading fixture {path}: {source}")]
    Fixture {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("empty document received from {url}")]
    Empty { url: String },
}

#[async_trait]
pub trait ReportSource: Send + Sync {
    fn location_for(&self, token: SourceToken) -> String;

    async fn fetch_day(&self, op_id: Uuid, token: SourceToken) -> Result<SourceDocument, SourceError>;
}

pub fn spc_csv_url(base_url: &str, token: SourceToken) -> String {
    let base = base_url.trim_end_matches('/');
    format!("{base}/{token}_rpts_filtered.csv")
}

fn published(token: SourceToken, url: String, raw: &str) -> Result<SourceDocument, SourceError> {
    if raw.trim().is_empty() {
        return Err(SourceError::Empty { url });
    }
    let (body, removed) = sanitize(raw);
    if removed > 0 {
        warn!(%token, removed, "stripped NUL characters from source document");
    }
    Ok(SourceDocument::Published(FetchedDocument {
        token,
        url,
        fetched_at: Utc::now(),
        body,
    }))
}

/// Live Storm Prediction Center daily report feed.
#[derive(Debug, Clone)]
pub struct SpcHttpSource {
    http: Arc<HttpFetcher>,
    base_url: String,
}

impl SpcHttpSource {
    pub fn new(http: Arc<HttpFetcher>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl ReportSource for SpcHttpSource {
    fn location_for(&self, token: SourceToken) -> String {
        spc_csv_url(&self.base_url, token)
    }

    async fn fetch_day(&self, op_id: Uuid, token: SourceToken) -> Result<SourceDocument, SourceError> {
        let url = self.location_for(token);
        match self.http.fetch_bytes(op_id, &token.to_string(), &url).await {
            Ok(resp) => published(token, url, &String::from_utf8_lossy(&resp.body)),
            Err(err) if err.is_not_found() => Ok(SourceDocument::NotPublished { url }),
            Err(source) => Err(SourceError::Fetch { url, source }),
        }
    }
}

/// Reads `<dir>/<token>_rpts_filtered.csv`; a missing file is an unpublished day.
#[derive(Debug, Clone)]
pub struct FixtureReportSource {
    dir: PathBuf,
}

impl FixtureReportSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, token: SourceToken) -> PathBuf {
        self.dir.join(format!("{token}_rpts_filtered.csv"))
    }
}

#[async_trait]
impl ReportSource for FixtureReportSource {
    fn location_for(&self, token: SourceToken) -> String {
        self.path_for(token).display().to_string()
    }

    async fn fetch_day(&self, _op_id: Uuid, token: SourceToken) -> Result<SourceDocument, SourceError> {
        let path = self.path_for(token);
        let location = path.display().to_string();
        match tokio::fs::read(&path).await {
            Ok(bytes) => published(token, location, &String::from_utf8_lossy(&bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Ok(SourceDocument::NotPublished { url: location })
            }
            Err(source) => Err(SourceError::Fixture {
                path: location,
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn fixtures_dir() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/spc")
    }

    #[test]
    fn url_uses_yymmdd_token() {
        let token = SourceToken::parse("240603").unwrap();
        assert_eq!(
            spc_csv_url(DEFAULT_SPC_BASE_URL, token),
            "https://www.spc.noaa.gov/climo/reports/240603_rpts_filtered.csv"
        );
        assert_eq!(
            spc_csv_url("http://localhost:9000/reports", token),
            "http://localhost:9000/reports/240603_rpts_filtered.csv"
        );
    }

    #[tokio::test]
    async fn fixture_source_reads_published_days() {
        let source = FixtureReportSource::new(fixtures_dir());
        let token = SourceToken::parse("240603").unwrap();
        let doc = source.fetch_day(Uuid::new_v4(), token).await.unwrap();
        let SourceDocument::Published(doc) = doc else {
            panic!("expected a published document");
        };
        assert_eq!(doc.token, token);
        assert_eq!(count_reports_in_csv(&doc.body), 8);
        let parsed = parse_spc_csv(token, &doc.body);
        assert_eq!(parsed.drafts.len(), 8);
    }

    #[tokio::test]
    async fn missing_fixture_is_not_published() {
        let dir = tempfile::tempdir().unwrap();
        let source = FixtureReportSource::new(dir.path());
        let token = SourceToken::parse("240101").unwrap();
        let doc = source.fetch_day(Uuid::new_v4(), token).await.unwrap();
        assert!(matches!(doc, SourceDocument::NotPublished { .. }));
    }

    #[tokio::test]
    async fn empty_fixture_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("240101_rpts_filtered.csv"), "  \n").unwrap();
        let source = FixtureReportSource::new(dir.path());
        let token = SourceToken::parse("240101").unwrap();
        let err = source.fetch_day(Uuid::new_v4(), token).await.unwrap_err();
        assert!(matches!(err, SourceError::Empty { .. }));
    }

    async fn serve_spc_feed() -> String {
        use axum::http::StatusCode;
        use axum::routing::get;

        let body = std::fs::read_to_string(fixtures_dir().join("240603_rpts_filtered.csv")).unwrap();
        let app = axum::Router::new()
            .route(
                "/240603_rpts_filtered.csv",
                get(move || {
                    let body = body.clone();
                    async move { body }
                }),
            )
            .route(
                "/240605_rpts_filtered.csv",
                get(|| async { StatusCode::SERVICE_UNAVAILABLE }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn http_source(base_url: String) -> SpcHttpSource {
        let fetcher = HttpFetcher::new(haily_storage::HttpClientConfig {
            backoff: haily_storage::BackoffPolicy {
                max_retries: 1,
                base_delay: std::time::Duration::from_millis(1),
                max_delay: std::time::Duration::from_millis(2),
            },
            ..Default::default()
        })
        .unwrap();
        SpcHttpSource::new(Arc::new(fetcher), base_url)
    }

    #[tokio::test]
    async fn http_source_maps_feed_responses() {
        let source = http_source(serve_spc_feed().await);

        let published = source
            .fetch_day(Uuid::new_v4(), SourceToken::parse("240603").unwrap())
            .await
            .unwrap();
        let SourceDocument::Published(doc) = published else {
            panic!("expected a published document");
        };
        assert_eq!(count_reports_in_csv(&doc.body), 8);
        assert!(doc.url.ends_with("/240603_rpts_filtered.csv"));

        let missing = source
            .fetch_day(Uuid::new_v4(), SourceToken::parse("240604").unwrap())
            .await
            .unwrap();
        assert!(matches!(missing, SourceDocument::NotPublished { .. }));

        let err = source
            .fetch_day(Uuid::new_v4(), SourceToken::parse("240605").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SourceError::Fetch {
                source: FetchError::HttpStatus { status: 503, .. },
                ..
            }
        ));
    }
}
