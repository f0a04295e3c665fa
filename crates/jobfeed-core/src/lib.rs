//! Core listing model and the record normalizer for jobfeed.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Placeholder stored in place of any free-text field a source did not provide.
pub const NOT_AVAILABLE: &str = "Not available";

/// Prefix of the per-record link given to listings that arrived without one.
pub const NO_LINK_PREFIX: &str = "urn:jobfeed:no-link:";

/// Opaque listing identity. Random, never derived from listing content.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonical persisted listing. Every field is populated; missing source data
/// carries [`NOT_AVAILABLE`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub title: String,
    pub description: String,
    pub link: String,
    pub company: String,
    pub source: String,
    pub timestamp: String,
    pub location: String,
}

impl Job {
    pub fn has_link(&self) -> bool {
        !self.link.starts_with(NO_LINK_PREFIX)
    }
}

/// Partially-populated extraction result handed over by a source adapter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawJob {
    pub title: Option<String>,
    pub description: Option<String>,
    pub link: Option<String>,
    pub company: Option<String>,
    pub source: Option<String>,
    pub location: Option<String>,
    pub timestamp: Option<String>,
}

impl RawJob {
    /// Builds a record from loosely keyed pairs; unrecognized keys are dropped.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut raw = Self::default();
        for (key, value) in pairs {
            let slot = match key.as_ref() {
                "title" => &mut raw.title,
                "description" => &mut raw.description,
                "link" => &mut raw.link,
                "company" => &mut raw.company,
                "source" => &mut raw.source,
                "location" => &mut raw.location,
                "timestamp" => &mut raw.timestamp,
                _ => continue,
            };
            *slot = Some(value.into());
        }
        raw
    }

    pub fn with_default_source(mut self, source: &str) -> Self {
        if text_or_none(self.source.as_deref()).is_none() {
            self.source = Some(source.to_string());
        }
        self
    }
}

/// Normalizes with the current wall clock as the default timestamp.
pub fn normalize(raw: RawJob) -> Job {
    normalize_at(raw, Utc::now())
}

/// Total over any input: every missing field is replaced, a fresh id is assigned.
pub fn normalize_at(raw: RawJob, now: DateTime<Utc>) -> Job {
    let id = JobId::generate();
    let link = match text_or_none(raw.link.as_deref()) {
        Some(link) => normalize_link(link),
        None => format!("{NO_LINK_PREFIX}{id}"),
    };
    let timestamp = text_or_none(raw.timestamp.as_deref())
        .and_then(|text| parse_posted_at(text, now))
        .unwrap_or(now);

    Job {
        id,
        title: text_or_sentinel(raw.title.as_deref()),
        description: text_or_sentinel(raw.description.as_deref()),
        link,
        company: text_or_sentinel(raw.company.as_deref()),
        source: text_or_sentinel(raw.source.as_deref()),
        timestamp: timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
        location: text_or_sentinel(raw.location.as_deref()),
    }
}

fn text_or_none(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}

fn text_or_sentinel(value: Option<&str>) -> String {
    text_or_none(value).unwrap_or(NOT_AVAILABLE).to_string()
}

/// Canonical form of a listing URL: scheme added when absent, one trailing slash removed.
pub fn normalize_link(link: &str) -> String {
    let link = link.trim();
    let mut out = if link.starts_with("http://") || link.starts_with("https://") {
        link.to_string()
    } else {
        format!("https://{link}")
    };
    if out.ends_with('/') {
        out.pop();
    }
    out
}

/// Parses absolute timestamps and the relative phrases job boards print
/// ("3 hours ago", "yesterday", ...).
pub fn parse_posted_at(text: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
    }

    let lower = text.to_ascii_lowercase();
    if matches!(lower.as_str(), "now" | "just now" | "today") {
        return Some(now);
    }
    if lower.contains("yesterday") {
        return Some(now - Duration::days(1));
    }
    if lower.contains("last week") {
        return Some(now - Duration::weeks(1));
    }

    let digits_at = lower.find(|c: char| c.is_ascii_digit())?;
    let rest = &lower[digits_at..];
    let digits_len = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
    let amount: i64 = rest[..digits_len].parse().ok()?;
    // first word after the number: "3 hours ago", "5 mins", "30+ days", "2d", "1mo"
    let unit = rest[digits_len..]
        .trim_start_matches(|c: char| !c.is_ascii_alphabetic())
        .split(|c: char| !c.is_ascii_alphabetic())
        .next()
        .unwrap_or_default();
    let delta = if unit.starts_with("mo") {
        Duration::try_days(amount.saturating_mul(30))
    } else if unit == "m" || unit.starts_with("mi") {
        Duration::try_minutes(amount)
    } else if unit.starts_with('h') {
        Duration::try_hours(amount)
    } else if unit.starts_with('d') {
        Duration::try_days(amount)
    } else if unit.starts_with('w') {
        Duration::try_weeks(amount)
    } else {
        None
    }?;
    now.checked_sub_signed(delta)
}

/// Persisted columns that can be grouped or filtered on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobField {
    Title,
    Description,
    Link,
    Company,
    Source,
    Timestamp,
    Location,
}

impl JobField {
    pub const ALL: [JobField; 7] = [
        JobField::Title,
        JobField::Description,
        JobField::Link,
        JobField::Company,
        JobField::Source,
        JobField::Timestamp,
        JobField::Location,
    ];

    pub fn column(self) -> &'static str {
        match self {
            JobField::Title => "title",
            JobField::Description => "description",
            JobField::Link => "link",
            JobField::Company => "company",
            JobField::Source => "source",
            JobField::Timestamp => "timestamp",
            JobField::Location => "location",
        }
    }

    pub fn value(self, job: &Job) -> &str {
        match self {
            JobField::Title => &job.title,
            JobField::Description => &job.description,
            JobField::Link => &job.link,
            JobField::Company => &job.company,
            JobField::Source => &job.source,
            JobField::Timestamp => &job.timestamp,
            JobField::Location => &job.location,
        }
    }
}

impl fmt::Display for JobField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column())
    }
}

#[derive(Debug, Error)]
#[error("unknown job field `{0}`")]
pub struct UnknownField(pub String);

impl FromStr for JobField {
    type Err = UnknownField;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobField::ALL
            .into_iter()
            .find(|field| field.column().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownField(s.to_string()))
    }
}

/// Case-insensitive substring filters over listings, plus a posting-time window.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub title: Option<String>,
    pub company: Option<String>,
    pub location: Option<String>,
    pub description: Option<String>,
    pub link: Option<String>,
    /// Empty means every source.
    pub sources: Vec<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl JobFilter {
    pub fn matches(&self, job: &Job) -> bool {
        let text_checks = [
            (&self.title, &job.title),
            (&self.company, &job.company),
            (&self.location, &job.location),
            (&self.description, &job.description),
            (&self.link, &job.link),
        ];
        for (needle, haystack) in text_checks {
            if let Some(needle) = needle.as_deref() {
                if !contains_ignore_case(haystack, needle) {
                    return false;
                }
            }
        }

        if !self.sources.is_empty() && !self.sources.iter().any(|s| s == &job.source) {
            return false;
        }

        if self.since.is_some() || self.until.is_some() {
            let Ok(ts) = DateTime::parse_from_rfc3339(&job.timestamp) else {
                return false;
            };
            let ts = ts.with_timezone(&Utc);
            if self.since.is_some_and(|since| ts < since) {
                return false;
            }
            if self.until.is_some_and(|until| ts > until) {
                return false;
            }
        }
        true
    }
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}
