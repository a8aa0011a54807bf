use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::util::sha256_hex;

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors with user-friendly messages
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another process holds the database lock
    #[error("The database is locked by another newsintel process. Please wait and try again.")]
    InstanceLocked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// A row referenced by id does not exist
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Map lock-related sqlx errors to [`DatabaseError::InstanceLocked`].
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let error_string = err.to_string().to_lowercase();

        // SQLITE_BUSY (5), SQLITE_LOCKED (6), SQLITE_CANTOPEN (14)
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
            || error_string.contains("sqlite_busy")
            || error_string.contains("sqlite_locked")
            || error_string.contains("unable to open database file")
        {
            return DatabaseError::InstanceLocked;
        }

        DatabaseError::Other(err)
    }
}

/// Error for enum columns and CLI arguments that fail to parse.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseKindError {
    #[error("unsupported source type: {0}")]
    SourceKind(String),
    #[error("unsupported schedule: {0} (expected hourly, daily, weekly or manual)")]
    Schedule(String),
    #[error("unsupported policy scope: {0} (expected global, category or source)")]
    PolicyScope(String),
}

// ============================================================================
// Sources
// ============================================================================

/// How a source's handle is fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    Rss,
    GithubRepo,
    Html,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::Rss => "rss",
            SourceKind::GithubRepo => "github_repo",
            SourceKind::Html => "html",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = ParseKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rss" | "atom" => Ok(SourceKind::Rss),
            "github_repo" | "github" => Ok(SourceKind::GithubRepo),
            "html" | "readme" => Ok(SourceKind::Html),
            _ => Err(ParseKindError::SourceKind(s.to_string())),
        }
    }
}

/// Refresh cadence used by `fetch --all --due`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Schedule {
    Hourly,
    #[default]
    Daily,
    Weekly,
    /// Fetched only on explicit request.
    Manual,
}

impl Schedule {
    pub fn as_str(self) -> &'static str {
        match self {
            Schedule::Hourly => "hourly",
            Schedule::Daily => "daily",
            Schedule::Weekly => "weekly",
            Schedule::Manual => "manual",
        }
    }

    /// Seconds between scheduled fetches. `None` for manual sources.
    pub fn interval_secs(self) -> Option<i64> {
        match self {
            Schedule::Hourly => Some(3_600),
            Schedule::Daily => Some(86_400),
            Schedule::Weekly => Some(604_800),
            Schedule::Manual => None,
        }
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Schedule {
    type Err = ParseKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hourly" => Ok(Schedule::Hourly),
            "daily" => Ok(Schedule::Daily),
            "weekly" => Ok(Schedule::Weekly),
            "manual" => Ok(Schedule::Manual),
            _ => Err(ParseKindError::Schedule(s.to_string())),
        }
    }
}

/// Source data from database
#[derive(Debug, Clone)]
pub struct Source {
    pub id: i64,
    pub name: String,
    pub kind: SourceKind,
    pub handle: String,
    pub schedule: Schedule,
    pub ai_focus: Option<String>,
    pub policy_id: Option<i64>,
    pub is_active: bool,
    pub last_fetched: Option<i64>,
    pub error: Option<String>,
    /// Number of consecutive fetch failures (circuit breaker)
    pub consecutive_failures: i64,
    pub created_at: i64,
}

impl Source {
    /// Whether the schedule interval has elapsed since the last fetch.
    ///
    /// Never-fetched scheduled sources are always due; manual ones never are.
    pub fn is_due(&self, now: i64) -> bool {
        match (self.schedule.interval_secs(), self.last_fetched) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(interval), Some(last)) => now - last >= interval,
        }
    }
}

/// Fields for registering a source.
#[derive(Debug, Clone)]
pub struct NewSource {
    pub name: String,
    pub kind: SourceKind,
    pub handle: String,
    pub schedule: Schedule,
    pub ai_focus: Option<String>,
    pub policy_id: Option<i64>,
}

/// Partial update for a source. `None` leaves the column untouched.
#[derive(Debug, Clone, Default)]
pub struct SourceUpdate {
    pub name: Option<String>,
    pub handle: Option<String>,
    pub schedule: Option<Schedule>,
    /// `Some(None)` clears the focus.
    pub ai_focus: Option<Option<String>>,
    pub is_active: Option<bool>,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct SourceDbRow {
    pub id: i64,
    pub name: String,
    pub kind: String,
    pub handle: String,
    pub schedule: String,
    pub ai_focus: Option<String>,
    pub policy_id: Option<i64>,
    pub is_active: bool,
    pub last_fetched: Option<i64>,
    pub error: Option<String>,
    pub consecutive_failures: i64,
    pub created_at: i64,
}

impl SourceDbRow {
    pub(crate) fn into_source(self) -> Result<Source, ParseKindError> {
        Ok(Source {
            id: self.id,
            name: self.name,
            kind: self.kind.parse()?,
            handle: self.handle,
            schedule: self.schedule.parse().unwrap_or_default(),
            ai_focus: self.ai_focus,
            policy_id: self.policy_id,
            is_active: self.is_active,
            last_fetched: self.last_fetched,
            error: self.error,
            consecutive_failures: self.consecutive_failures,
            created_at: self.created_at,
        })
    }
}

// ============================================================================
// Categories
// ============================================================================

/// A category for organizing sources into a hierarchy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Category {
    pub id: i64,
    pub name: String,
    pub parent_id: Option<i64>,
    pub sort_order: i64,
}

// ============================================================================
// Policies
// ============================================================================

/// Where a policy is meant to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PolicyScope {
    #[default]
    Global,
    Category,
    Source,
}

impl PolicyScope {
    pub fn as_str(self) -> &'static str {
        match self {
            PolicyScope::Global => "global",
            PolicyScope::Category => "category",
            PolicyScope::Source => "source",
        }
    }
}

impl fmt::Display for PolicyScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PolicyScope {
    type Err = ParseKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "global" => Ok(PolicyScope::Global),
            "category" => Ok(PolicyScope::Category),
            "source" => Ok(PolicyScope::Source),
            _ => Err(ParseKindError::PolicyScope(s.to_string())),
        }
    }
}

/// Summarization parameters stored as JSON in `policies.params`.
///
/// Every section and field defaults, so `{}` is a valid document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PolicyParams {
    pub summary: SummaryParams,
    pub insights: InsightParams,
    pub extraction: ExtractionParams,
    pub recommendations: RecommendationParams,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SummaryParams {
    pub target_length: u32,
    pub language: String,
    pub style: String,
    pub uncertainty_handling: String,
}

impl Default for SummaryParams {
    fn default() -> Self {
        Self {
            target_length: 150,
            language: "chinese".to_string(),
            style: "professional".to_string(),
            uncertainty_handling: "explicit".to_string(),
        }
    }
}

/// Focus areas a policy may request.
pub const KNOWN_FOCUS_AREAS: &[&str] = &[
    "trends",
    "impact",
    "risks",
    "opportunities",
    "competition",
    "regulation",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InsightParams {
    pub count: u32,
    pub focus_areas: Vec<String>,
}

impl Default for InsightParams {
    fn default() -> Self {
        Self {
            count: 4,
            focus_areas: ["trends", "impact", "risks", "opportunities"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionParams {
    pub schema: String,
    pub confidence_threshold: f64,
    /// Domain name → field names to extract.
    pub fields: std::collections::BTreeMap<String, Vec<String>>,
}

impl Default for ExtractionParams {
    fn default() -> Self {
        Self {
            schema: "default".to_string(),
            confidence_threshold: 0.8,
            fields: Default::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecommendationParams {
    pub count: u32,
    pub target_audience: String,
}

impl Default for RecommendationParams {
    fn default() -> Self {
        Self {
            count: 3,
            target_audience: "researchers".to_string(),
        }
    }
}

impl PolicyParams {
    /// Reject values the prompt builder cannot honor.
    pub fn validate(&self) -> Result<(), String> {
        let threshold = self.extraction.confidence_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(format!(
                "confidence_threshold must be between 0.0 and 1.0, got {threshold}"
            ));
        }
        if let Some(unknown) = self
            .insights
            .focus_areas
            .iter()
            .find(|area| !KNOWN_FOCUS_AREAS.contains(&area.as_str()))
        {
            return Err(format!("unknown focus area: {unknown}"));
        }
        match self.summary.language.as_str() {
            "chinese" | "english" => Ok(()),
            other => Err(format!("unsupported summary language: {other}")),
        }
    }
}

/// Policy data from database
#[derive(Debug, Clone)]
pub struct Policy {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub scope: PolicyScope,
    pub params: PolicyParams,
    pub created_at: i64,
}

// ============================================================================
// Items
// ============================================================================

/// A fetched unit of content, before it has a row id.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedItem {
    pub url: String,
    pub title: String,
    pub author: String,
    /// UNIX seconds
    pub published_at: i64,
    pub content: String,
    pub tags: Vec<String>,
    pub metadata: serde_json::Value,
}

impl NormalizedItem {
    /// Lowercase hex SHA-256 of `url ‖ title ‖ content`.
    pub fn content_sha(&self) -> String {
        let mut input = String::with_capacity(self.url.len() + self.title.len() + self.content.len());
        input.push_str(&self.url);
        input.push_str(&self.title);
        input.push_str(&self.content);
        sha256_hex(&input)
    }
}

/// Stored item.
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub id: i64,
    pub source_id: i64,
    pub url: String,
    pub title: String,
    pub author: String,
    pub published_at: i64,
    pub content: String,
    pub content_sha: String,
    pub tags: Vec<String>,
    pub metadata: serde_json::Value,
    pub fetched_at: i64,
}

impl From<Item> for NormalizedItem {
    fn from(item: Item) -> Self {
        Self {
            url: item.url,
            title: item.title,
            author: item.author,
            published_at: item.published_at,
            content: item.content,
            tags: item.tags,
            metadata: item.metadata,
        }
    }
}

/// Internal row type; `tags` and `metadata` are JSON text columns.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ItemDbRow {
    pub id: i64,
    pub source_id: i64,
    pub url: String,
    pub title: String,
    pub author: String,
    pub published_at: i64,
    pub content: String,
    pub content_sha: String,
    pub tags: String,
    pub metadata: String,
    pub fetched_at: i64,
}

impl ItemDbRow {
    pub(crate) fn into_item(self) -> Item {
        Item {
            id: self.id,
            source_id: self.source_id,
            url: self.url,
            title: self.title,
            author: self.author,
            published_at: self.published_at,
            content: self.content,
            content_sha: self.content_sha,
            tags: serde_json::from_str(&self.tags).unwrap_or_default(),
            metadata: serde_json::from_str(&self.metadata)
                .unwrap_or_else(|_| serde_json::Value::Object(Default::default())),
            fetched_at: self.fetched_at,
        }
    }
}

/// Author or tag with the number of items carrying it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityCount {
    pub name: String,
    pub kind: EntityKind,
    pub count: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Author,
    Tag,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EntityKind::Author => "author",
            EntityKind::Tag => "tag",
        })
    }
}

// ============================================================================
// Fetch runs and digests
// ============================================================================

/// One attempt to refresh a source.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct FetchRun {
    pub id: i64,
    pub source_id: i64,
    pub started_at: i64,
    pub ended_at: Option<i64>,
    pub ok: bool,
    pub new_items: i64,
    pub error: Option<String>,
}

/// Reference to an item included in a digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestItemRef {
    pub id: i64,
    pub title: String,
    pub url: String,
}

/// Per-source, per-day summary.
#[derive(Debug, Clone, PartialEq)]
pub struct DailyDigest {
    /// `None` until stored.
    pub id: Option<i64>,
    pub source_id: i64,
    pub date: NaiveDate,
    pub summary_md: String,
    pub insights_md: String,
    pub items: Vec<DigestItemRef>,
    pub created_at: i64,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct DigestDbRow {
    pub id: i64,
    pub source_id: i64,
    pub date: String,
    pub summary_md: String,
    pub insights_md: String,
    pub items: String,
    pub created_at: i64,
}

impl DigestDbRow {
    pub(crate) fn into_digest(self) -> Result<DailyDigest, chrono::ParseError> {
        Ok(DailyDigest {
            id: Some(self.id),
            source_id: self.source_id,
            date: NaiveDate::parse_from_str(&self.date, "%Y-%m-%d")?,
            summary_md: self.summary_md,
            insights_md: self.insights_md,
            items: serde_json::from_str(&self.items).unwrap_or_default(),
            created_at: self.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_source_kind_parse() {
        assert_eq!("rss".parse::<SourceKind>(), Ok(SourceKind::Rss));
        assert_eq!("GitHub_Repo".parse::<SourceKind>(), Ok(SourceKind::GithubRepo));
        assert_eq!("html".parse::<SourceKind>(), Ok(SourceKind::Html));
        let err = "twitter".parse::<SourceKind>().unwrap_err();
        assert_eq!(err.to_string(), "unsupported source type: twitter");
    }

    #[test]
    fn test_schedule_due() {
        let mut source = Source {
            id: 1,
            name: "s".into(),
            kind: SourceKind::Rss,
            handle: "https://example.com/feed".into(),
            schedule: Schedule::Hourly,
            ai_focus: None,
            policy_id: None,
            is_active: true,
            last_fetched: None,
            error: None,
            consecutive_failures: 0,
            created_at: 0,
        };
        assert!(source.is_due(1_000));

        source.last_fetched = Some(1_000);
        assert!(!source.is_due(1_000 + 3_599));
        assert!(source.is_due(1_000 + 3_600));

        source.schedule = Schedule::Manual;
        assert!(!source.is_due(i64::MAX));
    }

    #[test]
    fn test_policy_params_defaults_from_empty_json() {
        let params: PolicyParams = serde_json::from_str("{}").unwrap();
        assert_eq!(params, PolicyParams::default());
        assert_eq!(params.summary.target_length, 150);
        assert_eq!(params.summary.language, "chinese");
        assert_eq!(
            params.insights.focus_areas,
            vec!["trends", "impact", "risks", "opportunities"]
        );
        assert_eq!(params.recommendations.target_audience, "researchers");
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_policy_params_partial_override() {
        let params: PolicyParams =
            serde_json::from_str(r#"{"insights":{"count":2},"summary":{"language":"english"}}"#)
                .unwrap();
        assert_eq!(params.insights.count, 2);
        assert_eq!(params.insights.focus_areas.len(), 4);
        assert_eq!(params.summary.language, "english");
        assert_eq!(params.summary.target_length, 150);
    }

    #[test]
    fn test_policy_params_validation() {
        let mut params = PolicyParams::default();
        params.extraction.confidence_threshold = 1.5;
        assert!(params.validate().is_err());

        let mut params = PolicyParams::default();
        params.insights.focus_areas.push("astrology".into());
        assert!(params.validate().unwrap_err().contains("astrology"));

        let mut params = PolicyParams::default();
        params.summary.language = "klingon".into();
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_content_sha_concatenates_fields() {
        let item = NormalizedItem {
            url: "https://example.com/1".into(),
            title: "Title".into(),
            author: "a".into(),
            published_at: 0,
            content: " body".into(),
            tags: vec![],
            metadata: serde_json::json!({}),
        };
        assert_eq!(
            item.content_sha(),
            sha256_hex("https://example.com/1Title body")
        );
    }
}
