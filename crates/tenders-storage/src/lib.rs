//! Persistence + HTTP fetch utilities for the tender index.
//!
//! The store and run-tracker contracts live here together with a Postgres
//! implementation ([`pg`]) and an in-process one ([`memory`]) used by tests and
//! local development.

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::header::ACCEPT;
use reqwest::{StatusCode, Url};
use serde_json::Value as JsonValue;
use tenders_core::{SyncRun, TenderPage, TenderQuery, TenderRecord, TenderStats};
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

pub mod memory;
pub mod pg;

pub use memory::{MemorySyncRunTracker, MemoryTenderStore};
pub use pg::{PgSyncRunTracker, PgTenderStore};

pub const CRATE_NAME: &str = "tenders-storage";

/// Records per upsert statement.
pub const UPSERT_CHUNK_SIZE: usize = 50;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("invalid stored value: {0}")]
    Invalid(String),
    #[error("store backend error: {0}")]
    Backend(String),
}

/// A failed batch upsert. Chunks before the failing one are committed; the
/// failing chunk is not.
#[derive(Debug, Error)]
#[error("upsert failed after {written} records were written: {source}")]
pub struct UpsertError {
    pub written: usize,
    #[source]
    pub source: StoreError,
}

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("a sync run is already in progress")]
    AlreadyRunning,
    #[error("sync run {run_id} is not running")]
    NotRunning { run_id: i64 },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<sqlx::Error> for TrackerError {
    fn from(err: sqlx::Error) -> Self {
        TrackerError::Store(StoreError::Database(err))
    }
}

/// Write + read access to normalized tenders keyed by `ocid`.
#[async_trait]
pub trait TenderStore: Send + Sync {
    /// Insert-or-overwrite every record by `ocid`, bumping `synced_at`.
    /// Returns the number of distinct records written.
    async fn upsert_batch(&self, records: &[TenderRecord]) -> Result<usize, UpsertError>;

    async fn count(&self) -> Result<i64, StoreError>;

    async fn get(&self, ocid: &str) -> Result<Option<TenderRecord>, StoreError>;

    async fn raw_release(&self, ocid: &str) -> Result<Option<JsonValue>, StoreError>;

    async fn list(&self, query: &TenderQuery) -> Result<TenderPage, StoreError>;

    async fn stats(&self) -> Result<TenderStats, StoreError>;
}

/// Lifecycle bookkeeping for sync runs: `running -> success | error | cancelled`.
#[async_trait]
pub trait SyncRunTracker: Send + Sync {
    async fn is_running(&self) -> Result<bool, TrackerError>;

    /// Open a new run. Fails with [`TrackerError::AlreadyRunning`] when another
    /// run is still open, even if `is_running` reported otherwise a moment ago.
    async fn start(&self, date_from: NaiveDate, date_to: NaiveDate) -> Result<i64, TrackerError>;

    async fn record_progress(&self, run_id: i64, fetched: u64, upserted: u64) -> Result<(), TrackerError>;

    async fn record_success(
        &self,
        run_id: i64,
        fetched: u64,
        upserted: u64,
        duration_ms: u64,
    ) -> Result<(), TrackerError>;

    async fn record_failure(&self, run_id: i64, error_message: &str, duration_ms: u64) -> Result<(), TrackerError>;

    async fn record_cancelled(&self, run_id: i64, duration_ms: u64) -> Result<(), TrackerError>;

    /// Most recent run by start time.
    async fn latest(&self) -> Result<Option<SyncRun>, TrackerError>;

    /// Newest first.
    async fn history(&self, limit: u32) -> Result<Vec<SyncRun>, TrackerError>;

    /// Close out `running` rows older than `older_than` as errors. Returns how many were closed.
    async fn fail_stale(&self, older_than: chrono::Duration) -> Result<u64, TrackerError>;
}

pub(crate) const ABANDONED_RUN_MESSAGE: &str = "abandoned: run exceeded the stale-run threshold without finishing";

/// Collapse duplicate `ocid`s, keeping the last occurrence of each.
pub fn dedupe_by_ocid(records: &[TenderRecord]) -> Vec<&TenderRecord> {
    let mut seen = HashSet::with_capacity(records.len());
    let mut out = records
        .iter()
        .rev()
        .filter(|r| seen.insert(r.ocid.as_str()))
        .collect::<Vec<_>>();
    out.reverse();
    out
}

/// Writes `records` in order, `chunk_size` at a time. Each chunk is
/// all-or-nothing; on failure `written` counts the chunks already committed.
pub async fn upsert_in_chunks<'a, F, Fut>(
    records: &[&'a TenderRecord],
    chunk_size: usize,
    mut write_chunk: F,
) -> Result<usize, UpsertError>
where
    F: FnMut(Vec<&'a TenderRecord>) -> Fut,
    Fut: Future<Output = Result<(), StoreError>>,
{
    let mut written = 0usize;
    for chunk in records.chunks(chunk_size.max(1)) {
        write_chunk(chunk.to_vec())
            .await
            .map_err(|source| UpsertError { written, source })?;
        written += chunk.len();
        debug!(written, chunk = chunk.len(), "upserted tender chunk");
    }
    Ok(written)
}

pub(crate) fn non_empty(value: &str) -> Option<&str> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

pub(crate) fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Exponential backoff. `max_retries` of zero means every request is tried once.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone, Default)]
pub struct HttpClientConfig {
    /// Per-request timeout. `None` leaves requests unbounded.
    pub timeout: Option<Duration>,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("upstream request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("upstream returned {status}: {body}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error("undecodable upstream response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

const MAX_ERROR_BODY_CHARS: usize = 2048;

fn truncate_body(body: &str) -> String {
    match body.char_indices().nth(MAX_ERROR_BODY_CHARS) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().gzip(true).brotli(true);

        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    /// GET `url`, retrying retryable failures per the backoff policy. Any
    /// non-success status that is not retried becomes [`FetchError::HttpStatus`]
    /// carrying the response body.
    pub async fn fetch_bytes(&self, url: &Url, accept: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url = %url);
        self.fetch_with_retries(url, accept).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &Url, accept: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            let can_retry = attempt < self.backoff.max_retries;
            match self.client.get(url.clone()).header(ACCEPT, accept).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable && can_retry {
                        debug!(%status, attempt, "retrying upstream request");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    let body = resp.text().await.unwrap_or_default();
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                        body: truncate_body(&body),
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable && can_retry {
                        debug!(error = %err, attempt, "retrying upstream request");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}
