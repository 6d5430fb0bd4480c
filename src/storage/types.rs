use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::canonical::CanonicalUrl;

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors with user-friendly messages
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another process holds the database lock
    #[error("The library database is locked by another shelf process. Please wait for it to finish.")]
    InstanceLocked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Map lock-related sqlx errors to `InstanceLocked`.
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        if is_lock_message(&err.to_string()) {
            return DatabaseError::InstanceLocked;
        }
        DatabaseError::Other(err)
    }
}

/// SQLITE_BUSY (5), SQLITE_LOCKED (6) and SQLITE_CANTOPEN (14) messages.
pub(crate) fn is_lock_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("database is locked")
        || lower.contains("database table is locked")
        || lower.contains("sqlite_busy")
        || lower.contains("sqlite_locked")
        || lower.contains("unable to open database file")
}

// ============================================================================
// Articles
// ============================================================================

/// An article row as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct Article {
    pub id: i64,
    pub url: String,
    pub title: String,
    pub selection: Option<String>,
    pub folder_id: Option<i64>,
    /// When the article entered the originating service
    pub provenance_at: DateTime<Utc>,
    pub synced_at: Option<DateTime<Utc>>,
    pub sync_failed_at: Option<DateTime<Utc>>,
    pub failed_count: i64,
    pub status_code: Option<i64>,
    pub status_text: Option<String>,
    pub final_url: Option<String>,
    /// Extracted body in Markdown
    pub content: Option<String>,
    #[serde(skip_serializing)]
    pub raw_html: Option<String>,
    pub obsolete: bool,
}

pub(crate) const ARTICLE_COLUMNS: &str = "a.id, a.url, a.title, a.selection, a.folder_id, \
     a.provenance_at, a.synced_at, a.sync_failed_at, a.failed_count, a.status_code, \
     a.status_text, a.final_url, a.content, a.raw_html, a.obsolete";

/// Metadata for inserting or refreshing an article.
#[derive(Debug, Clone)]
pub struct ArticleDraft {
    pub url: CanonicalUrl,
    pub title: String,
    pub selection: Option<String>,
    pub folder_id: Option<i64>,
    pub provenance_at: DateTime<Utc>,
}

/// One imported row: article metadata plus folder title and tag set, applied
/// as a single unit.
#[derive(Debug, Clone)]
pub struct ImportRecord {
    pub url: CanonicalUrl,
    pub title: String,
    pub selection: Option<String>,
    pub folder: Option<String>,
    pub provenance_at: DateTime<Utc>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub id: i64,
    /// False when an existing row with the same URL was updated
    pub inserted: bool,
}

/// Result of a successful content fetch, ready to be committed.
#[derive(Debug, Clone)]
pub struct FetchSuccess {
    pub content: String,
    pub final_url: String,
    pub status_code: i64,
    /// Replaces the stored title when set
    pub title: Option<String>,
    /// Stored only when set
    pub raw_html: Option<String>,
}

/// Fetch candidate ordering by provenance time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CandidateOrder {
    #[default]
    OldestFirst,
    NewestFirst,
}

impl std::str::FromStr for CandidateOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "oldest" => Ok(Self::OldestFirst),
            "newest" => Ok(Self::NewestFirst),
            other => Err(format!("invalid order '{}': expected 'oldest' or 'newest'", other)),
        }
    }
}

/// Article plus its resolved folder path and tag titles, as read by export.
#[derive(Debug, Clone, Serialize)]
pub struct ArticleSnapshot {
    #[serde(flatten)]
    pub article: Article,
    pub folder_path: Option<String>,
    pub tags: Vec<String>,
}

/// Separator used when tag titles are aggregated with GROUP_CONCAT.
pub(crate) const TAG_SEPARATOR: char = '\u{1f}';

pub(crate) fn split_tags(joined: Option<String>) -> Vec<String> {
    joined
        .map(|s| {
            s.split(TAG_SEPARATOR)
                .filter(|t| !t.is_empty())
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct SnapshotDbRow {
    #[sqlx(flatten)]
    pub article: Article,
    pub folder_path: Option<String>,
    pub tags: Option<String>,
}

impl SnapshotDbRow {
    pub(crate) fn into_snapshot(self) -> ArticleSnapshot {
        ArticleSnapshot {
            article: self.article,
            folder_path: self.folder_path,
            tags: split_tags(self.tags),
        }
    }
}

// ============================================================================
// Folders & Tags
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct Folder {
    pub id: i64,
    pub title: String,
    pub parent_id: Option<i64>,
    /// Materialized `Parent/Child` path
    pub path: String,
    /// Non-obsolete articles filed directly in this folder
    pub article_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct Tag {
    pub id: i64,
    pub title: String,
    /// Non-obsolete articles carrying this tag
    pub article_count: i64,
}

// ============================================================================
// Index Projection
// ============================================================================

/// One row of the full-text projection, as stored.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ProjectionEntry {
    pub url: String,
    pub title: String,
    pub content: String,
    pub folder: String,
    pub tags: String,
}

/// Consistency of the full-text projection against non-obsolete articles.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProjectionReport {
    /// Non-obsolete articles
    pub articles_count: i64,
    /// Rows in the projection
    pub projection_count: i64,
    /// Projection rows with no non-obsolete article behind them
    pub orphaned_entries: i64,
    /// Non-obsolete articles with no projection row
    pub missing_entries: i64,
    /// Rows whose url/title/content no longer match the article
    pub stale_entries: i64,
    pub is_consistent: bool,
}

// ============================================================================
// Obsolescence
// ============================================================================

/// Bulk selection criteria for marking articles obsolete.
///
/// Criteria that are set are AND-combined; at least one must be set.
#[derive(Debug, Clone, Default)]
pub struct ObsoleteSelector {
    pub ids: Vec<i64>,
    pub status_codes: Vec<i64>,
    pub min_failures: Option<i64>,
}

impl ObsoleteSelector {
    pub fn by_ids(ids: impl Into<Vec<i64>>) -> Self {
        Self {
            ids: ids.into(),
            ..Self::default()
        }
    }

    pub fn by_status_codes(codes: impl Into<Vec<i64>>) -> Self {
        Self {
            status_codes: codes.into(),
            ..Self::default()
        }
    }

    pub fn by_min_failures(min: i64) -> Self {
        Self {
            min_failures: Some(min),
            ..Self::default()
        }
    }

    pub(crate) fn min_failures(&self) -> Option<i64> {
        self.min_failures.filter(|n| *n > 0)
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty() && self.status_codes.is_empty() && self.min_failures().is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct ObsoleteCandidate {
    pub id: i64,
    pub url: String,
    pub title: String,
    pub status_code: Option<i64>,
    pub failed_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ObsoleteSweep {
    pub dry_run: bool,
    pub candidates: Vec<ObsoleteCandidate>,
    /// Rows flipped; always 0 on a dry run
    pub marked: u64,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ObsoleteArticle {
    pub id: i64,
    pub url: String,
    pub title: String,
    pub folder_id: Option<i64>,
    pub provenance_at: DateTime<Utc>,
    pub status_code: Option<i64>,
    pub failed_count: i64,
}

// ============================================================================
// Query results
// ============================================================================

/// A search or listing hit.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub id: i64,
    pub url: String,
    pub title: String,
    pub folder_path: Option<String>,
    pub tags: Vec<String>,
    pub provenance_at: DateTime<Utc>,
    pub synced_at: Option<DateTime<Utc>>,
    pub failed_count: i64,
    pub status_code: Option<i64>,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct SearchHitDbRow {
    pub id: i64,
    pub url: String,
    pub title: String,
    pub folder_path: Option<String>,
    pub tags: Option<String>,
    pub provenance_at: DateTime<Utc>,
    pub synced_at: Option<DateTime<Utc>>,
    pub failed_count: i64,
    pub status_code: Option<i64>,
}

impl SearchHitDbRow {
    pub(crate) fn into_hit(self) -> SearchHit {
        SearchHit {
            id: self.id,
            url: self.url,
            title: self.title,
            folder_path: self.folder_path,
            tags: split_tags(self.tags),
            provenance_at: self.provenance_at,
            synced_at: self.synced_at,
            failed_count: self.failed_count,
            status_code: self.status_code,
        }
    }
}

// ============================================================================
// Feeds
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct Feed {
    pub id: i64,
    pub url: String,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub active: bool,
    /// Tags applied to every article ingested from this feed
    pub tags: Vec<String>,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct FeedDbRow {
    pub id: i64,
    pub url: String,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub active: bool,
    pub tags: Option<String>,
}

impl FeedDbRow {
    pub(crate) fn into_feed(self) -> Feed {
        Feed {
            id: self.id,
            url: self.url,
            name: self.name,
            created_at: self.created_at,
            last_synced_at: self.last_synced_at,
            active: self.active,
            tags: split_tags(self.tags),
        }
    }
}

// ============================================================================
// Statistics & Repair
// ============================================================================

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct FailureBucket {
    pub failed_count: i64,
    pub articles: i64,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct StatusBucket {
    pub status_code: i64,
    pub articles: i64,
}

/// Library overview. Every count except `obsolete_articles` covers
/// non-obsolete articles only.
#[derive(Debug, Clone, Serialize)]
pub struct LibraryStats {
    pub total_articles: i64,
    pub obsolete_articles: i64,
    pub synced_articles: i64,
    pub unsynced_articles: i64,
    /// Unsynced articles that hit the failure ceiling
    pub exhausted_articles: i64,
    pub folders: i64,
    pub tags: i64,
    pub feeds: i64,
    pub failures_by_count: Vec<FailureBucket>,
    pub failing_status_codes: Vec<StatusBucket>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DuplicateUrl {
    pub url: String,
    pub copies: i64,
}

/// Outcome of `Database::repair`.
#[derive(Debug, Clone, Serialize)]
pub struct RepairReport {
    /// Lines returned by `PRAGMA integrity_check` (`["ok"]` when healthy)
    pub integrity: Vec<String>,
    pub foreign_key_violations: i64,
    pub folders_recomputed: u64,
    pub projection_before: ProjectionReport,
    pub entries_indexed: u64,
    pub projection_after: ProjectionReport,
    pub duplicate_urls: Vec<DuplicateUrl>,
}

impl RepairReport {
    pub fn is_healthy(&self) -> bool {
        self.integrity.len() == 1
            && self.integrity[0] == "ok"
            && self.foreign_key_violations == 0
            && self.duplicate_urls.is_empty()
            && self.projection_after.is_consistent
    }
}
