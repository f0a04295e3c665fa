//! Persistent listing store, duplicate collapsing, and HTTP fetch utilities for jobfeed.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use chrono::{SecondsFormat, Utc};
use jobfeed_core::{normalize_link, Job, JobField, JobFilter, JobId, NOT_AVAILABLE, NO_LINK_PREFIX};
use reqwest::StatusCode;
use serde::Serialize;
use sqlx::migrate::{MigrateError, Migrator};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{FromRow, Row};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use url::Url;

static MIGRATOR: Migrator = sqlx::migrate!();

const JOB_COLUMNS: &str = "j.id AS id, j.title AS title, j.description AS description, \
     j.link AS link, j.company AS company, j.source AS source, \
     j.timestamp AS timestamp, j.location AS location";

/// Every row that is not the first-inserted row of its link group.
const DUPLICATE_ROWIDS: &str = "SELECT rowid FROM jobs WHERE rowid NOT IN \
     (SELECT MIN(rowid) FROM jobs GROUP BY link)";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid database url {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("schema migration failed: {0}")]
    Migrate(#[from] MigrateError),
}

/// Outcome of one pass of [`ListingStore::deduplicate`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DedupReport {
    pub duplicate_groups: u64,
    pub removed: u64,
    pub removed_by_source: BTreeMap<String, u64>,
}

#[derive(Debug, FromRow)]
struct JobRow {
    id: String,
    title: String,
    description: String,
    link: String,
    company: String,
    source: String,
    timestamp: String,
    location: String,
}

impl From<JobRow> for Job {
    fn from(row: JobRow) -> Self {
        Job {
            id: JobId::from(row.id),
            title: row.title,
            description: row.description,
            link: row.link,
            company: row.company,
            source: row.source,
            timestamp: row.timestamp,
            location: row.location,
        }
    }
}

/// Handle to the SQLite listing table.
///
/// Each handle owns a single-connection pool. Concurrent writers should each
/// hold their own handle from [`ListingStore::reconnect`]; SQLite serializes
/// their writes and assigns the rowid used as the insertion order.
#[derive(Debug, Clone)]
pub struct ListingStore {
    pool: SqlitePool,
    options: SqliteConnectOptions,
}

impl ListingStore {
    /// Opens (creating if needed) the database at `database_url` and applies migrations.
    pub async fn open(database_url: &str) -> Result<Self, StoreError> {
        let options =
            SqliteConnectOptions::from_str(database_url).map_err(|source| StoreError::InvalidUrl {
                url: database_url.to_string(),
                source,
            })?;
        Self::open_with(options).await
    }

    pub async fn open_path(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with(SqliteConnectOptions::new().filename(path.as_ref())).await
    }

    async fn open_with(options: SqliteConnectOptions) -> Result<Self, StoreError> {
        let options = options
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30));
        let store = Self::connect(options).await?;
        MIGRATOR.run(&store.pool).await?;
        Ok(store)
    }

    async fn connect(options: SqliteConnectOptions) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options.clone())
            .await?;
        Ok(Self { pool, options })
    }

    /// Independent connection to the same database file. Schema is not re-applied.
    pub async fn reconnect(&self) -> Result<Self, StoreError> {
        Self::connect(self.options.clone()).await
    }

    pub async fn close(self) {
        self.pool.close().await;
    }

    /// Persists `job` unless a row with the same id exists. Returns whether a row was written.
    /// Rows sharing a link with an existing row are still written.
    pub async fn insert_if_absent(&self, job: &Job) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO jobs \
             (id, title, description, link, company, source, timestamp, location) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(job.id.as_str())
        .bind(&job.title)
        .bind(&job.description)
        .bind(&job.link)
        .bind(&job.company)
        .bind(&job.source)
        .bind(&job.timestamp)
        .bind(&job.location)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Snapshot of every row in insertion order.
    pub async fn all(&self) -> Result<Vec<Job>, StoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs AS j ORDER BY j.rowid");
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Job::from).collect())
    }

    pub async fn get(&self, id: &JobId) -> Result<Option<Job>, StoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs AS j WHERE j.id = ?");
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Job::from))
    }

    pub async fn search(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let mut jobs = self.all().await?;
        jobs.retain(|job| filter.matches(job));
        Ok(jobs)
    }

    pub async fn count(&self) -> Result<u64, StoreError> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs")
            .fetch_one(&self.pool)
            .await?;
        Ok(n as u64)
    }

    /// Row count per distinct value of `field`.
    pub async fn count_by(&self, field: JobField) -> Result<BTreeMap<String, u64>, StoreError> {
        let column = field.column();
        let sql = format!("SELECT {column} AS value, COUNT(*) AS n FROM jobs GROUP BY {column}");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        let mut counts = BTreeMap::new();
        for row in rows {
            let value: String = row.try_get("value")?;
            let n: i64 = row.try_get("n")?;
            counts.insert(value, n as u64);
        }
        Ok(counts)
    }

    /// Rows whose `field` holds the placeholder written for missing source data.
    pub async fn count_placeholder(&self, field: JobField) -> Result<u64, StoreError> {
        let column = field.column();
        let (sql, pattern) = match field {
            JobField::Link => (
                format!("SELECT COUNT(*) FROM jobs WHERE {column} LIKE ?"),
                format!("{NO_LINK_PREFIX}%"),
            ),
            _ => (
                format!("SELECT COUNT(*) FROM jobs WHERE {column} = ?"),
                NOT_AVAILABLE.to_string(),
            ),
        };
        let n: i64 = sqlx::query_scalar(&sql)
            .bind(pattern)
            .fetch_one(&self.pool)
            .await?;
        Ok(n as u64)
    }

    /// Links currently held by more than one row, most duplicated first.
    pub async fn duplicate_links(&self) -> Result<Vec<(String, u64)>, StoreError> {
        let rows = sqlx::query(
            "SELECT link, COUNT(*) AS n FROM jobs GROUP BY link HAVING COUNT(*) > 1 \
             ORDER BY n DESC, link",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                let link: String = row.try_get("link")?;
                let n: i64 = row.try_get("n")?;
                Ok((link, n as u64))
            })
            .collect()
    }

    /// Collapses every group of rows sharing a link down to its first-inserted row.
    ///
    /// Insertion order (rowid) decides the survivor; the listing's own timestamp
    /// is never consulted. Saved-job marks on removed rows move to the survivor.
    /// Must not run while other handles are inserting.
    pub async fn deduplicate(&self) -> Result<DedupReport, StoreError> {
        let mut tx = self.pool.begin().await?;

        let groups: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM (SELECT link FROM jobs GROUP BY link HAVING COUNT(*) > 1)",
        )
        .fetch_one(&mut *tx)
        .await?;
        if groups == 0 {
            tx.commit().await?;
            debug!("no duplicate listings found");
            return Ok(DedupReport::default());
        }

        let rows = sqlx::query(&format!(
            "SELECT source, COUNT(*) AS n FROM jobs WHERE rowid IN ({DUPLICATE_ROWIDS}) GROUP BY source"
        ))
        .fetch_all(&mut *tx)
        .await?;
        let mut removed_by_source = BTreeMap::new();
        for row in rows {
            let source: String = row.try_get("source")?;
            let n: i64 = row.try_get("n")?;
            removed_by_source.insert(source, n as u64);
        }

        sqlx::query(&format!(
            "UPDATE OR IGNORE saved_jobs SET job_id = ( \
                 SELECT keep.id FROM jobs AS keep \
                 WHERE keep.link = (SELECT dup.link FROM jobs AS dup WHERE dup.id = saved_jobs.job_id) \
                 ORDER BY keep.rowid LIMIT 1) \
             WHERE job_id IN (SELECT id FROM jobs WHERE rowid IN ({DUPLICATE_ROWIDS}))"
        ))
        .execute(&mut *tx)
        .await?;

        let removed = sqlx::query(&format!("DELETE FROM jobs WHERE rowid IN ({DUPLICATE_ROWIDS})"))
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;

        info!(duplicate_groups = groups, removed, "collapsed duplicate listings");
        Ok(DedupReport {
            duplicate_groups: groups as u64,
            removed,
            removed_by_source,
        })
    }

    /// Marks a listing as saved for `user`. False when already saved or the listing is unknown.
    pub async fn save_job(&self, user: &str, job_id: &JobId) -> Result<bool, StoreError> {
        let saved_at = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let result = sqlx::query(
            "INSERT OR IGNORE INTO saved_jobs (user, job_id, saved_at) \
             SELECT ?, id, ? FROM jobs WHERE id = ?",
        )
        .bind(user)
        .bind(saved_at)
        .bind(job_id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn unsave_job(&self, user: &str, job_id: &JobId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM saved_jobs WHERE user = ? AND job_id = ?")
            .bind(user)
            .bind(job_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn saved_jobs(&self, user: &str) -> Result<Vec<Job>, StoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs AS j \
             JOIN saved_jobs AS s ON j.id = s.job_id \
             WHERE s.user = ? ORDER BY s.saved_at, j.rowid"
        );
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(user)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Job::from).collect())
    }
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

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Pause before every request, retries included.
    pub request_delay: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            request_delay: Duration::ZERO,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPage {
    /// URL that finally served the body, after redirects and fallbacks.
    pub url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("no urls to fetch")]
    NoUrls,
}

pub fn is_valid_url(url: &str) -> bool {
    Url::parse(url)
        .map(|u| matches!(u.scheme(), "http" | "https") && u.host_str().is_some())
        .unwrap_or(false)
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    request_delay: Duration,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            request_delay: config.request_delay,
            backoff: config.backoff,
        })
    }

    /// Fetches one page, retrying transient failures with exponential backoff.
    pub async fn fetch_text(&self, source_id: &str, url: &str) -> Result<FetchedPage, FetchError> {
        let url = normalize_link(url);
        if !is_valid_url(&url) {
            return Err(FetchError::InvalidUrl(url));
        }
        let span = info_span!("http_fetch", source_id, url = %url);
        self.fetch_with_retries(&url).instrument(span).await
    }

    /// Tries each url in order and returns the first page that loads.
    pub async fn fetch_with_fallbacks(
        &self,
        source_id: &str,
        urls: &[String],
    ) -> Result<FetchedPage, FetchError> {
        let mut last_error = None;
        for url in urls {
            match self.fetch_text(source_id, url).await {
                Ok(page) => return Ok(page),
                Err(err) => {
                    warn!(source_id, url = %url, error = %err, "fetch failed");
                    last_error = Some(err);
                }
            }
        }
        Err(last_error.unwrap_or(FetchError::NoUrls))
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let mut attempt = 0;
        loop {
            if !self.request_delay.is_zero() {
                tokio::time::sleep(self.request_delay).await;
            }

            let (disposition, err) = match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        let body = resp.text().await?;
                        return Ok(FetchedPage {
                            url: final_url,
                            body,
                        });
                    }
                    (
                        classify_status(status),
                        FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        },
                    )
                }
                Err(err) => (classify_reqwest_error(&err), FetchError::Request(err)),
            };

            if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries {
                let delay = self.backoff.delay_for_attempt(attempt);
                warn!(attempt, ?delay, error = %err, "retrying request");
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }
            return Err(err);
        }
    }
}
