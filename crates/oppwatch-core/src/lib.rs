//! Core domain model for Opportunity Watch.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "oppwatch-core";

/// Payload format of an external feed, used to dispatch parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    /// A JSON document carrying a list of records.
    Json,
    /// An RSS or Atom syndication feed.
    Rss,
    /// Unstructured markup scanned for anchor tags.
    Html,
}

impl SourceFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceFormat::Json => "json",
            SourceFormat::Rss => "rss",
            SourceFormat::Html => "html",
        }
    }
}

impl fmt::Display for SourceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for SourceFormat {
    type Err = UnknownSourceFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(SourceFormat::Json),
            "rss" => Ok(SourceFormat::Rss),
            "html" => Ok(SourceFormat::Html),
            other => Err(UnknownSourceFormat(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownSourceFormat(pub String);

impl fmt::Display for UnknownSourceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown source format {:?}", self.0)
    }
}

impl std::error::Error for UnknownSourceFormat {}

/// A configured external feed. Created by registry seeding; only the
/// ingestion pipeline mutates `last_fetched`; never deleted by the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: i64,
    pub name: String,
    pub endpoint: String,
    pub format: SourceFormat,
    pub enabled: bool,
    pub last_fetched: Option<DateTime<Utc>>,
}

/// Parser output, not persisted as-is. Title is the only required field;
/// parsers drop records without one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawOpportunity {
    pub title: String,
    pub company: String,
    pub kind: String,
    pub region: String,
    pub deadline: String,
    pub url: String,
    pub description: String,
    pub salary: String,
    pub duration: String,
    pub online: bool,
    pub source_name: String,
}

impl RawOpportunity {
    /// A record carrying only a title, every other field at its feed-level
    /// default. The syndication and markup parsers start from this.
    pub fn titled(title: impl Into<String>, source_name: impl Into<String>) -> Self {
        let source_name = source_name.into();
        Self {
            title: title.into(),
            company: source_name.clone(),
            kind: "Opportunity".to_string(),
            region: "Unknown".to_string(),
            deadline: String::new(),
            url: String::new(),
            description: String::new(),
            salary: String::new(),
            duration: String::new(),
            online: true,
            source_name,
        }
    }
}

/// A stored opportunity row. Unique per source on (title, url) with a missing
/// url normalized to the empty string; resightings are skipped, rows are only
/// removed by the per-source retention trim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedOpportunity {
    pub id: i64,
    pub source_id: i64,
    pub title: String,
    pub company: String,
    pub kind: String,
    pub region: String,
    pub deadline: String,
    pub url: String,
    pub description: String,
    pub salary: String,
    pub duration: String,
    pub online: bool,
    pub source_name: String,
    pub approved: bool,
    pub fetched_at: DateTime<Utc>,
}

/// Per-request enrichment over a persisted (or seed) opportunity. Never
/// persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedOpportunity {
    pub opportunity: PersistedOpportunity,
    pub category: String,
    pub summary: String,
    pub relevance: u32,
}

/// Stored per-user interest profile. Comma-separated token lists, read-only
/// to the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPreferences {
    pub user_id: i64,
    pub regions: String,
    pub types: String,
    pub keywords: String,
    pub alert_channels: String,
}

fn split_tokens(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

impl UserPreferences {
    pub fn keyword_tokens(&self) -> Vec<String> {
        split_tokens(&self.keywords)
    }

    pub fn region_tokens(&self) -> Vec<String> {
        split_tokens(&self.regions)
    }

    pub fn type_tokens(&self) -> Vec<String> {
        split_tokens(&self.types)
    }

    /// Configured alert channels, defaulting to email when unset.
    pub fn channels(&self) -> Vec<String> {
        let channels = split_tokens(&self.alert_channels);
        if channels.is_empty() {
            vec!["email".to_string()]
        } else {
            channels
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Pending,
    Sent,
    Failed,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Pending => "pending",
            AlertStatus::Sent => "sent",
            AlertStatus::Failed => "failed",
        }
    }
}

impl FromStr for AlertStatus {
    type Err = UnknownAlertStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(AlertStatus::Pending),
            "sent" => Ok(AlertStatus::Sent),
            "failed" => Ok(AlertStatus::Failed),
            other => Err(UnknownAlertStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownAlertStatus(pub String);

impl fmt::Display for UnknownAlertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown alert status {:?}", self.0)
    }
}

impl std::error::Error for UnknownAlertStatus {}

/// A queued alert work item. Unique on (user_id, channel, source_name,
/// source_opportunity_id) so generation is idempotent; the delivery
/// collaborator owns status transitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertQueueEntry {
    pub id: i64,
    pub user_id: i64,
    pub channel: String,
    pub source_name: String,
    /// 0 for fallback seed data that has no stored row behind it.
    pub source_opportunity_id: i64,
    pub title: String,
    pub url: String,
    pub status: AlertStatus,
    pub created_at: DateTime<Utc>,
}
