//! Sqlite-backed store + HTTP fetch utilities for Opportunity Watch.

use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use oppwatch_core::{
    AlertQueueEntry, AlertStatus, PersistedOpportunity, RawOpportunity, Source, SourceFormat,
    UserPreferences,
};
use reqwest::StatusCode;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use thiserror::Error;
use tracing::info_span;
use uuid::Uuid;

pub const CRATE_NAME: &str = "oppwatch-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Timestamps are stored as fixed-width RFC 3339 UTC text so that lexical
/// ordering matches chronological ordering.
fn encode_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_ts(raw: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| StorageError::Corrupt(format!("bad timestamp {raw:?}: {err}")))
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS sources (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        endpoint TEXT NOT NULL UNIQUE,
        format TEXT NOT NULL,
        enabled INTEGER NOT NULL DEFAULT 1,
        last_fetched TEXT,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS opportunities (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        source_id INTEGER NOT NULL,
        title TEXT NOT NULL,
        company TEXT NOT NULL DEFAULT '',
        kind TEXT NOT NULL DEFAULT 'Opportunity',
        region TEXT NOT NULL DEFAULT 'Unknown',
        deadline TEXT NOT NULL DEFAULT '',
        url TEXT NOT NULL DEFAULT '',
        description TEXT NOT NULL DEFAULT '',
        salary TEXT NOT NULL DEFAULT '',
        duration TEXT NOT NULL DEFAULT '',
        online INTEGER NOT NULL DEFAULT 1,
        source_name TEXT NOT NULL DEFAULT '',
        approved INTEGER NOT NULL DEFAULT 0,
        fetched_at TEXT NOT NULL,
        UNIQUE(source_id, title, url),
        FOREIGN KEY (source_id) REFERENCES sources (id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_opportunities_source ON opportunities (source_id)",
    "CREATE INDEX IF NOT EXISTS idx_opportunities_fetched ON opportunities (fetched_at)",
    "CREATE INDEX IF NOT EXISTS idx_opportunities_approved ON opportunities (approved)",
    "CREATE TABLE IF NOT EXISTS user_preferences (
        user_id INTEGER PRIMARY KEY,
        regions TEXT NOT NULL DEFAULT '',
        types TEXT NOT NULL DEFAULT '',
        keywords TEXT NOT NULL DEFAULT '',
        alert_channels TEXT NOT NULL DEFAULT '',
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS alert_queue (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL,
        channel TEXT NOT NULL,
        source_name TEXT NOT NULL,
        source_opportunity_id INTEGER NOT NULL DEFAULT 0,
        title TEXT NOT NULL,
        url TEXT NOT NULL DEFAULT '',
        status TEXT NOT NULL DEFAULT 'pending',
        created_at TEXT NOT NULL,
        UNIQUE(user_id, channel, source_name, source_opportunity_id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_alert_queue_user ON alert_queue (user_id)",
    "CREATE INDEX IF NOT EXISTS idx_alert_queue_status ON alert_queue (status)",
];

/// Alert-queue insert payload; the row id and created_at are assigned by the
/// store.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAlert {
    pub user_id: i64,
    pub channel: String,
    pub source_name: String,
    pub source_opportunity_id: i64,
    pub title: String,
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) the database at `database_url` and apply
    /// the schema.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // A shared in-memory database only lives as long as one connection.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// An isolated in-memory store, used by tests.
    pub async fn memory() -> Result<Self, StorageError> {
        Self::connect("sqlite::memory:").await
    }

    async fn migrate(&self) -> Result<(), StorageError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Register a source if its endpoint is not yet known. Returns whether a
    /// row was inserted; existing sources are left untouched.
    pub async fn ensure_source(
        &self,
        name: &str,
        endpoint: &str,
        format: SourceFormat,
        enabled: bool,
    ) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "INSERT INTO sources (name, endpoint, format, enabled, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(endpoint) DO NOTHING",
        )
        .bind(name)
        .bind(endpoint)
        .bind(format.as_str())
        .bind(enabled)
        .bind(encode_ts(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn all_sources(&self) -> Result<Vec<Source>, StorageError> {
        let rows = sqlx::query("SELECT * FROM sources ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(source_from_row).collect()
    }

    pub async fn enabled_sources(&self) -> Result<Vec<Source>, StorageError> {
        let rows = sqlx::query("SELECT * FROM sources WHERE enabled = 1 ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(source_from_row).collect()
    }

    pub async fn has_enabled_sources(&self) -> Result<bool, StorageError> {
        let row = sqlx::query("SELECT 1 FROM sources WHERE enabled = 1 LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn touch_source_last_fetched(
        &self,
        source_id: i64,
        when: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        sqlx::query("UPDATE sources SET last_fetched = ?2 WHERE id = ?1")
            .bind(source_id)
            .bind(encode_ts(when))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Newest successful fetch across enabled sources; drives the staleness
    /// check.
    pub async fn latest_fetch_timestamp(&self) -> Result<Option<DateTime<Utc>>, StorageError> {
        let row = sqlx::query(
            "SELECT MAX(last_fetched) AS latest FROM sources WHERE enabled = 1",
        )
        .fetch_one(&self.pool)
        .await?;
        let latest: Option<String> = row.try_get("latest")?;
        latest.as_deref().map(decode_ts).transpose()
    }

    /// Insert-or-skip on the per-source dedup key (source_id, title, url).
    /// Returns whether a new row was created.
    pub async fn insert_opportunity(
        &self,
        source_id: i64,
        raw: &RawOpportunity,
        approved: bool,
        fetched_at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "INSERT INTO opportunities
             (source_id, title, company, kind, region, deadline, url, description,
              salary, duration, online, source_name, approved, fetched_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
             ON CONFLICT(source_id, title, url) DO NOTHING",
        )
        .bind(source_id)
        .bind(raw.title.trim())
        .bind(&raw.company)
        .bind(&raw.kind)
        .bind(&raw.region)
        .bind(&raw.deadline)
        .bind(raw.url.trim())
        .bind(&raw.description)
        .bind(&raw.salary)
        .bind(&raw.duration)
        .bind(raw.online)
        .bind(&raw.source_name)
        .bind(approved)
        .bind(encode_ts(fetched_at))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn count_opportunities(&self) -> Result<i64, StorageError> {
        let row = sqlx::query("SELECT COUNT(*) AS c FROM opportunities")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("c")?)
    }

    pub async fn count_for_source(&self, source_id: i64) -> Result<i64, StorageError> {
        let row = sqlx::query("SELECT COUNT(*) AS c FROM opportunities WHERE source_id = ?1")
            .bind(source_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("c")?)
    }

    /// Most recently fetched opportunities, newest first. `limit` of `None`
    /// returns everything.
    pub async fn recent_opportunities(
        &self,
        limit: Option<i64>,
        include_unapproved: bool,
    ) -> Result<Vec<PersistedOpportunity>, StorageError> {
        let sql = if include_unapproved {
            "SELECT * FROM opportunities ORDER BY fetched_at DESC, id DESC LIMIT ?1"
        } else {
            "SELECT * FROM opportunities WHERE approved = 1
             ORDER BY fetched_at DESC, id DESC LIMIT ?1"
        };
        // LIMIT -1 is sqlite's spelling of "no limit".
        let rows = sqlx::query(sql)
            .bind(limit.unwrap_or(-1))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(opportunity_from_row).collect()
    }

    pub async fn opportunities_for_source(
        &self,
        source_id: i64,
    ) -> Result<Vec<PersistedOpportunity>, StorageError> {
        let rows = sqlx::query(
            "SELECT * FROM opportunities WHERE source_id = ?1
             ORDER BY fetched_at DESC, id DESC",
        )
        .bind(source_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(opportunity_from_row).collect()
    }

    /// Retention: keep only the newest `cap` rows for a source, ordered by
    /// (fetched_at DESC, id DESC). One statement, so each source's trim is
    /// atomic and never touches another source's rows. Returns rows deleted.
    pub async fn trim_source(&self, source_id: i64, cap: u32) -> Result<u64, StorageError> {
        let result = sqlx::query(
            "DELETE FROM opportunities
             WHERE source_id = ?1
               AND id NOT IN (
                 SELECT id FROM opportunities
                 WHERE source_id = ?1
                 ORDER BY fetched_at DESC, id DESC
                 LIMIT ?2
               )",
        )
        .bind(source_id)
        .bind(i64::from(cap))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn preferences(
        &self,
        user_id: i64,
    ) -> Result<Option<UserPreferences>, StorageError> {
        let row = sqlx::query("SELECT * FROM user_preferences WHERE user_id = ?1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(preferences_from_row).transpose()
    }

    /// Owned by the preferences screen (an external collaborator); the core
    /// only reads these.
    pub async fn upsert_preferences(&self, prefs: &UserPreferences) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO user_preferences (user_id, regions, types, keywords, alert_channels, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(user_id) DO UPDATE SET
               regions = excluded.regions,
               types = excluded.types,
               keywords = excluded.keywords,
               alert_channels = excluded.alert_channels,
               updated_at = excluded.updated_at",
        )
        .bind(prefs.user_id)
        .bind(&prefs.regions)
        .bind(&prefs.types)
        .bind(&prefs.keywords)
        .bind(&prefs.alert_channels)
        .bind(encode_ts(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Idempotent enqueue keyed on (user_id, channel, source_name,
    /// source_opportunity_id). Returns whether a new entry was created.
    pub async fn enqueue_alert(&self, alert: &NewAlert) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "INSERT INTO alert_queue
             (user_id, channel, source_name, source_opportunity_id, title, url, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(user_id, channel, source_name, source_opportunity_id) DO NOTHING",
        )
        .bind(alert.user_id)
        .bind(&alert.channel)
        .bind(&alert.source_name)
        .bind(alert.source_opportunity_id)
        .bind(&alert.title)
        .bind(&alert.url)
        .bind(AlertStatus::Pending.as_str())
        .bind(encode_ts(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn alerts_for_user(&self, user_id: i64) -> Result<Vec<AlertQueueEntry>, StorageError> {
        let rows = sqlx::query("SELECT * FROM alert_queue WHERE user_id = ?1 ORDER BY id")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(alert_from_row).collect()
    }

    /// Oldest pending entries for one channel; drained by the delivery
    /// collaborator.
    pub async fn pending_alerts(
        &self,
        channel: &str,
        limit: i64,
    ) -> Result<Vec<AlertQueueEntry>, StorageError> {
        let rows = sqlx::query(
            "SELECT * FROM alert_queue
             WHERE status = 'pending' AND channel = ?1
             ORDER BY created_at ASC, id ASC
             LIMIT ?2",
        )
        .bind(channel)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(alert_from_row).collect()
    }

    pub async fn update_alert_status(
        &self,
        alert_id: i64,
        status: AlertStatus,
    ) -> Result<(), StorageError> {
        sqlx::query("UPDATE alert_queue SET status = ?2 WHERE id = ?1")
            .bind(alert_id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn source_from_row(row: &SqliteRow) -> Result<Source, StorageError> {
    let format_raw: String = row.try_get("format")?;
    let format = format_raw
        .parse::<SourceFormat>()
        .map_err(|err| StorageError::Corrupt(err.to_string()))?;
    let last_fetched: Option<String> = row.try_get("last_fetched")?;
    Ok(Source {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        endpoint: row.try_get("endpoint")?,
        format,
        enabled: row.try_get("enabled")?,
        last_fetched: last_fetched.as_deref().map(decode_ts).transpose()?,
    })
}

fn opportunity_from_row(row: &SqliteRow) -> Result<PersistedOpportunity, StorageError> {
    let fetched_at: String = row.try_get("fetched_at")?;
    Ok(PersistedOpportunity {
        id: row.try_get("id")?,
        source_id: row.try_get("source_id")?,
        title: row.try_get("title")?,
        company: row.try_get("company")?,
        kind: row.try_get("kind")?,
        region: row.try_get("region")?,
        deadline: row.try_get("deadline")?,
        url: row.try_get("url")?,
        description: row.try_get("description")?,
        salary: row.try_get("salary")?,
        duration: row.try_get("duration")?,
        online: row.try_get("online")?,
        source_name: row.try_get("source_name")?,
        approved: row.try_get("approved")?,
        fetched_at: decode_ts(&fetched_at)?,
    })
}

fn preferences_from_row(row: &SqliteRow) -> Result<UserPreferences, StorageError> {
    Ok(UserPreferences {
        user_id: row.try_get("user_id")?,
        regions: row.try_get("regions")?,
        types: row.try_get("types")?,
        keywords: row.try_get("keywords")?,
        alert_channels: row.try_get("alert_channels")?,
    })
}

fn alert_from_row(row: &SqliteRow) -> Result<AlertQueueEntry, StorageError> {
    let status_raw: String = row.try_get("status")?;
    let status = status_raw
        .parse::<AlertStatus>()
        .map_err(|err| StorageError::Corrupt(err.to_string()))?;
    let created_at: String = row.try_get("created_at")?;
    Ok(AlertQueueEntry {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        channel: row.try_get("channel")?,
        source_name: row.try_get("source_name")?,
        source_opportunity_id: row.try_get("source_opportunity_id")?,
        title: row.try_get("title")?,
        url: row.try_get("url")?,
        status,
        created_at: decode_ts(&created_at)?,
    })
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

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Typed fetch failure. The ingestion pipeline treats any of these as "this
/// source produced nothing this cycle", never as fatal to the refresh.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request timed out fetching {url}")]
    Timeout { url: String },
    #[error("request failed after retries: {0}")]
    Network(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

fn request_error(err: reqwest::Error, url: &str) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout {
            url: url.to_string(),
        }
    } else {
        FetchError::Network(err)
    }
}

/// Seam between the ingestion pipeline and the network; tests substitute a
/// canned implementation.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch(&self, run_id: Uuid, source_name: &str, url: &str)
        -> Result<Vec<u8>, FetchError>;
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
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
            backoff: config.backoff,
        })
    }
}

#[async_trait]
impl Fetch for HttpFetcher {
    async fn fetch(
        &self,
        run_id: Uuid,
        source_name: &str,
        url: &str,
    ) -> Result<Vec<u8>, FetchError> {
        let span = info_span!("http_fetch", %run_id, source_name, url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await.map_err(|err| request_error(err, url))?;
                        return Ok(body.to_vec());
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(request_error(err, url));
                }
            }
        }

        Err(request_error(
            last_request_error.expect("retry loop should capture a request error"),
            url,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn raw(title: &str, url: &str) -> RawOpportunity {
        let mut raw = RawOpportunity::titled(title, "Test Feed");
        raw.url = url.to_string();
        raw
    }

    fn ts(secs: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, secs).single().unwrap()
    }

    #[tokio::test]
    async fn source_seeding_is_idempotent_by_endpoint() {
        let store = Store::memory().await.unwrap();
        assert!(store
            .ensure_source("RemoteOK Jobs", "https://remoteok.com/api", SourceFormat::Json, true)
            .await
            .unwrap());
        assert!(!store
            .ensure_source("RemoteOK Jobs", "https://remoteok.com/api", SourceFormat::Json, true)
            .await
            .unwrap());
        let sources = store.enabled_sources().await.unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].format, SourceFormat::Json);
        assert!(sources[0].last_fetched.is_none());
    }

    #[tokio::test]
    async fn duplicate_opportunity_insert_is_skipped() {
        let store = Store::memory().await.unwrap();
        store
            .ensure_source("Feed", "https://feed.example", SourceFormat::Json, true)
            .await
            .unwrap();
        let source_id = store.enabled_sources().await.unwrap()[0].id;

        assert!(store
            .insert_opportunity(source_id, &raw("Backend Engineer", "https://x/1"), true, ts(0))
            .await
            .unwrap());
        assert!(!store
            .insert_opportunity(source_id, &raw("Backend Engineer", "https://x/1"), true, ts(1))
            .await
            .unwrap());
        // Same title under a different url is a distinct sighting.
        assert!(store
            .insert_opportunity(source_id, &raw("Backend Engineer", "https://x/2"), true, ts(2))
            .await
            .unwrap());
        assert_eq!(store.count_for_source(source_id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn trim_keeps_newest_rows_by_fetch_time_then_id() {
        let store = Store::memory().await.unwrap();
        store
            .ensure_source("Feed", "https://feed.example", SourceFormat::Json, true)
            .await
            .unwrap();
        let source_id = store.enabled_sources().await.unwrap()[0].id;

        for i in 0..5u32 {
            store
                .insert_opportunity(source_id, &raw(&format!("Role {i}"), ""), true, ts(i))
                .await
                .unwrap();
        }
        let deleted = store.trim_source(source_id, 3).await.unwrap();
        assert_eq!(deleted, 2);

        let survivors = store.opportunities_for_source(source_id).await.unwrap();
        let titles: Vec<_> = survivors.iter().map(|o| o.title.as_str()).collect();
        assert_eq!(titles, vec!["Role 4", "Role 3", "Role 2"]);
    }

    #[tokio::test]
    async fn trim_for_one_source_never_touches_another() {
        let store = Store::memory().await.unwrap();
        store
            .ensure_source("A", "https://a.example", SourceFormat::Json, true)
            .await
            .unwrap();
        store
            .ensure_source("B", "https://b.example", SourceFormat::Rss, true)
            .await
            .unwrap();
        let sources = store.enabled_sources().await.unwrap();
        let (a, b) = (sources[0].id, sources[1].id);

        for i in 0..4u32 {
            store
                .insert_opportunity(a, &raw(&format!("A{i}"), ""), true, ts(i))
                .await
                .unwrap();
            store
                .insert_opportunity(b, &raw(&format!("B{i}"), ""), true, ts(i))
                .await
                .unwrap();
        }
        store.trim_source(a, 1).await.unwrap();
        assert_eq!(store.count_for_source(a).await.unwrap(), 1);
        assert_eq!(store.count_for_source(b).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn unapproved_rows_are_hidden_from_the_default_listing() {
        let store = Store::memory().await.unwrap();
        store
            .ensure_source("Feed", "https://feed.example", SourceFormat::Json, true)
            .await
            .unwrap();
        let source_id = store.enabled_sources().await.unwrap()[0].id;

        store
            .insert_opportunity(source_id, &raw("Visible", ""), true, ts(0))
            .await
            .unwrap();
        store
            .insert_opportunity(source_id, &raw("Hidden", ""), false, ts(1))
            .await
            .unwrap();

        let approved = store.recent_opportunities(None, false).await.unwrap();
        assert_eq!(approved.len(), 1);
        assert_eq!(approved[0].title, "Visible");
        assert_eq!(store.recent_opportunities(None, true).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn last_fetched_round_trips_and_drives_latest() {
        let store = Store::memory().await.unwrap();
        store
            .ensure_source("A", "https://a.example", SourceFormat::Json, true)
            .await
            .unwrap();
        store
            .ensure_source("B", "https://b.example", SourceFormat::Rss, true)
            .await
            .unwrap();
        let sources = store.enabled_sources().await.unwrap();

        assert!(store.latest_fetch_timestamp().await.unwrap().is_none());
        store.touch_source_last_fetched(sources[0].id, ts(5)).await.unwrap();
        store.touch_source_last_fetched(sources[1].id, ts(9)).await.unwrap();
        assert_eq!(store.latest_fetch_timestamp().await.unwrap(), Some(ts(9)));
    }

    #[tokio::test]
    async fn preferences_upsert_and_fetch() {
        let store = Store::memory().await.unwrap();
        assert!(store.preferences(7).await.unwrap().is_none());

        let prefs = UserPreferences {
            user_id: 7,
            regions: "USA".into(),
            types: "Internship".into(),
            keywords: "rust".into(),
            alert_channels: "email".into(),
        };
        store.upsert_preferences(&prefs).await.unwrap();
        assert_eq!(store.preferences(7).await.unwrap(), Some(prefs.clone()));

        let updated = UserPreferences {
            keywords: "rust,google".into(),
            ..prefs
        };
        store.upsert_preferences(&updated).await.unwrap();
        assert_eq!(store.preferences(7).await.unwrap(), Some(updated));
    }

    #[tokio::test]
    async fn alert_enqueue_is_idempotent_per_key() {
        let store = Store::memory().await.unwrap();
        let alert = NewAlert {
            user_id: 7,
            channel: "email".into(),
            source_name: "Feed".into(),
            source_opportunity_id: 3,
            title: "Backend Engineer".into(),
            url: "https://x/1".into(),
        };
        assert!(store.enqueue_alert(&alert).await.unwrap());
        assert!(!store.enqueue_alert(&alert).await.unwrap());

        let entries = store.alerts_for_user(7).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, AlertStatus::Pending);

        store
            .update_alert_status(entries[0].id, AlertStatus::Sent)
            .await
            .unwrap();
        assert!(store.pending_alerts("email", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn file_backed_store_persists_across_connections() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}", dir.path().join("oppwatch.db").display());

        {
            let store = Store::connect(&url).await.unwrap();
            store
                .ensure_source("Feed", "https://feed.example", SourceFormat::Html, true)
                .await
                .unwrap();
        }
        let store = Store::connect(&url).await.unwrap();
        assert_eq!(store.all_sources().await.unwrap().len(), 1);
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn retry_classification_matches_status_families() {
        assert_eq!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }
}
