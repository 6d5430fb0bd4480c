use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{QueryBuilder, Sqlite};

use super::schema::Database;
use super::types::{
    ArticleSnapshot, SearchHit, SearchHitDbRow, SnapshotDbRow, ARTICLE_COLUMNS,
};
use crate::util::{format_timestamp, MAX_SEARCH_QUERY_LENGTH};

// ============================================================================
// FTS5 Query Validation
// ============================================================================

const MAX_WILDCARDS: usize = 3;
const MAX_OR_OPERATORS: usize = 5;
const MAX_PARENTHESES: usize = 5;
const MAX_AND_OPERATORS: usize = 10;

/// Maximum number of rows any single read returns
const MAX_RESULTS: i64 = 2000;

pub const DEFAULT_SEARCH_LIMIT: i64 = 50;
pub const DEFAULT_LATEST_LIMIT: i64 = 20;

/// Reject FTS5 queries whose expansion or parse cost could be excessive.
///
/// Limits: 256 characters, 3 wildcards, 5 `OR`, 10 `AND`, 5 balanced
/// parenthesis pairs.
pub(crate) fn validate_fts_query(query: &str) -> Result<()> {
    if query.len() > MAX_SEARCH_QUERY_LENGTH {
        anyhow::bail!(
            "Search query exceeds maximum length of {} characters",
            MAX_SEARCH_QUERY_LENGTH
        );
    }

    if query.matches('*').count() > MAX_WILDCARDS {
        anyhow::bail!(
            "Search query contains too many wildcards (max {})",
            MAX_WILDCARDS
        );
    }

    let upper = query.to_uppercase();
    if upper.matches(" OR ").count() > MAX_OR_OPERATORS {
        anyhow::bail!(
            "Search query contains too many OR operators (max {})",
            MAX_OR_OPERATORS
        );
    }

    let open = query.chars().filter(|&c| c == '(').count();
    let close = query.chars().filter(|&c| c == ')').count();
    if open > MAX_PARENTHESES {
        anyhow::bail!(
            "Search query contains too many parentheses (max {})",
            MAX_PARENTHESES
        );
    }
    if open != close {
        anyhow::bail!("Search query has unbalanced parentheses");
    }

    if upper.matches(" AND ").count() > MAX_AND_OPERATORS {
        anyhow::bail!(
            "Search query contains too many AND operators (max {})",
            MAX_AND_OPERATORS
        );
    }

    Ok(())
}

/// Whether SQLite rejected the MATCH expression itself, as opposed to the
/// database being busy, locked or damaged.
fn is_fts_query_error(message: &str) -> bool {
    const QUERY_ERRORS: &[&str] = &[
        "fts5:",
        "no such column",
        "unterminated string",
        "unknown special query",
    ];
    let message = message.to_lowercase();
    QUERY_ERRORS.iter().any(|marker| message.contains(marker))
}

/// `%term%` with LIKE metacharacters escaped for `ESCAPE '\'`.
pub(crate) fn like_pattern(term: &str) -> String {
    let mut pattern = String::with_capacity(term.len() + 2);
    pattern.push('%');
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

// ============================================================================
// Filters
// ============================================================================

/// Filters shared by search, latest and export. Obsolete articles are
/// always excluded regardless of what is set here.
#[derive(Debug, Clone, Default)]
pub struct ArticleFilter {
    /// Match any of these folders, by title or full path
    pub folders: Vec<String>,
    /// Article must carry every one of these tags
    pub all_tags: Vec<String>,
    /// Article must carry at least one of these tags
    pub any_tags: Vec<String>,
    /// Inclusive lower bound on provenance time
    pub since: Option<DateTime<Utc>>,
    /// Inclusive upper bound on provenance time
    pub until: Option<DateTime<Utc>>,
    pub synced_only: bool,
}

impl ArticleFilter {
    fn push_clauses(&self, builder: &mut QueryBuilder<'_, Sqlite>) {
        if !self.folders.is_empty() {
            builder.push(" AND a.folder_id IN (SELECT id FROM folders WHERE title IN (");
            push_text_list(builder, &self.folders);
            builder.push(") OR path IN (");
            push_text_list(builder, &self.folders);
            builder.push("))");
        }

        for tag in &self.all_tags {
            builder.push(
                " AND EXISTS (SELECT 1 FROM article_tags at JOIN tags t ON t.id = at.tag_id \
                 WHERE at.article_id = a.id AND t.title = ",
            );
            builder.push_bind(tag.clone());
            builder.push(")");
        }

        if !self.any_tags.is_empty() {
            builder.push(
                " AND EXISTS (SELECT 1 FROM article_tags at JOIN tags t ON t.id = at.tag_id \
                 WHERE at.article_id = a.id AND t.title IN (",
            );
            push_text_list(builder, &self.any_tags);
            builder.push("))");
        }

        if let Some(since) = self.since {
            builder.push(" AND a.provenance_at >= ");
            builder.push_bind(format_timestamp(since));
        }
        if let Some(until) = self.until {
            builder.push(" AND a.provenance_at <= ");
            builder.push_bind(format_timestamp(until));
        }
        if self.synced_only {
            builder.push(" AND a.synced_at IS NOT NULL");
        }
    }
}

fn push_text_list(builder: &mut QueryBuilder<'_, Sqlite>, values: &[String]) {
    let mut separated = builder.separated(", ");
    for value in values {
        separated.push_bind(value.trim().to_string());
    }
}

// ============================================================================
// Search
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchField {
    Url,
    Title,
    Content,
    Tags,
    Folder,
}

impl SearchField {
    fn fts_column(self) -> &'static str {
        match self {
            SearchField::Url => "url",
            SearchField::Title => "title",
            SearchField::Content => "content",
            SearchField::Tags => "tags",
            SearchField::Folder => "folder",
        }
    }
}

impl std::str::FromStr for SearchField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "url" => Ok(Self::Url),
            "title" => Ok(Self::Title),
            "content" => Ok(Self::Content),
            "tags" | "tag" => Ok(Self::Tags),
            "folder" => Ok(Self::Folder),
            other => Err(format!(
                "invalid field '{}': expected url, title, content, tags or folder",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchMode {
    /// Case-insensitive substring scan
    #[default]
    Keyword,
    /// FTS5 MATCH ordered by rank
    FullText,
}

#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub text: String,
    /// Restrict matching to one field; `None` searches all of them
    pub field: Option<SearchField>,
    pub mode: SearchMode,
    pub filter: ArticleFilter,
    pub limit: i64,
}

impl SearchQuery {
    pub fn keyword(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            field: None,
            mode: SearchMode::Keyword,
            filter: ArticleFilter::default(),
            limit: DEFAULT_SEARCH_LIMIT,
        }
    }

    pub fn full_text(text: impl Into<String>) -> Self {
        Self {
            mode: SearchMode::FullText,
            ..Self::keyword(text)
        }
    }
}

const HIT_SELECT: &str = r#"
    SELECT a.id, a.url, a.title, f.path AS folder_path,
           (SELECT GROUP_CONCAT(title, char(31)) FROM (
                SELECT t.title AS title FROM article_tags at
                JOIN tags t ON t.id = at.tag_id
                WHERE at.article_id = a.id
                ORDER BY t.title)) AS tags,
           a.provenance_at, a.synced_at, a.failed_count, a.status_code
"#;

const SNAPSHOT_SELECT_TAIL: &str = r#",
           f.path AS folder_path,
           (SELECT GROUP_CONCAT(title, char(31)) FROM (
                SELECT t.title AS title FROM article_tags at
                JOIN tags t ON t.id = at.tag_id
                WHERE at.article_id = a.id
                ORDER BY t.title)) AS tags
    FROM articles a
    LEFT JOIN folders f ON f.id = a.folder_id
    WHERE a.obsolete = 0"#;

fn clamp_limit(limit: i64) -> i64 {
    limit.clamp(0, MAX_RESULTS)
}

fn push_keyword_clause(builder: &mut QueryBuilder<'_, Sqlite>, field: Option<SearchField>, text: &str) {
    let pattern = like_pattern(text);
    let tag_clause = "EXISTS (SELECT 1 FROM article_tags at JOIN tags t ON t.id = at.tag_id \
                      WHERE at.article_id = a.id AND t.title LIKE ";

    let fields: &[SearchField] = match field {
        Some(ref f) => std::slice::from_ref(f),
        None => &[
            SearchField::Url,
            SearchField::Title,
            SearchField::Content,
            SearchField::Tags,
            SearchField::Folder,
        ],
    };

    builder.push(" AND (");
    for (i, f) in fields.iter().enumerate() {
        if i > 0 {
            builder.push(" OR ");
        }
        match f {
            SearchField::Url => builder.push("a.url LIKE "),
            SearchField::Title => builder.push("a.title LIKE "),
            SearchField::Content => builder.push("a.content LIKE "),
            SearchField::Folder => builder.push("f.path LIKE "),
            SearchField::Tags => builder.push(tag_clause),
        };
        builder.push_bind(pattern.clone());
        builder.push(r" ESCAPE '\'");
        if *f == SearchField::Tags {
            builder.push(")");
        }
    }
    builder.push(")");
}

impl Database {
    /// Search non-obsolete articles.
    ///
    /// Keyword mode scans url/title/content/tags/folder (or one field) for a
    /// case-insensitive substring, newest first. Full-text mode runs an FTS5
    /// MATCH ordered by rank; if FTS5 rejects the query syntax the search
    /// falls back to a keyword scan.
    pub async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchHit>> {
        let text = query.text.trim();
        if text.is_empty() {
            return Ok(Vec::new());
        }

        match query.mode {
            SearchMode::Keyword => {
                if text.len() > MAX_SEARCH_QUERY_LENGTH {
                    anyhow::bail!(
                        "Search query exceeds maximum length of {} characters",
                        MAX_SEARCH_QUERY_LENGTH
                    );
                }
                self.keyword_search(query, text).await
            }
            SearchMode::FullText => {
                validate_fts_query(text)?;
                match self.fts_search(query, text).await {
                    Ok(hits) => Ok(hits),
                    Err(sqlx::Error::Database(e)) if is_fts_query_error(e.message()) => {
                        tracing::warn!(error = %e, query = %text, "FTS5 search failed, falling back to keyword scan");
                        self.keyword_search(query, text).await
                    }
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    async fn keyword_search(&self, query: &SearchQuery, text: &str) -> Result<Vec<SearchHit>> {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(HIT_SELECT);
        builder.push(" FROM articles a LEFT JOIN folders f ON f.id = a.folder_id WHERE a.obsolete = 0");
        push_keyword_clause(&mut builder, query.field, text);
        query.filter.push_clauses(&mut builder);
        builder.push(" ORDER BY a.provenance_at DESC, a.id DESC LIMIT ");
        builder.push_bind(clamp_limit(query.limit));

        let rows: Vec<SearchHitDbRow> = builder.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(SearchHitDbRow::into_hit).collect())
    }

    async fn fts_search(&self, query: &SearchQuery, text: &str) -> Result<Vec<SearchHit>, sqlx::Error> {
        let expression = match query.field {
            Some(field) => format!("{} : ({})", field.fts_column(), text),
            None => text.to_string(),
        };

        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(HIT_SELECT);
        builder.push(
            " FROM (SELECT rowid AS id, rank AS score FROM articles_fts WHERE articles_fts MATCH ",
        );
        builder.push_bind(expression);
        builder.push(
            ") m JOIN articles a ON a.id = m.id LEFT JOIN folders f ON f.id = a.folder_id \
             WHERE a.obsolete = 0",
        );
        query.filter.push_clauses(&mut builder);
        builder.push(" ORDER BY m.score, a.id LIMIT ");
        builder.push_bind(clamp_limit(query.limit));

        let rows: Vec<SearchHitDbRow> = builder.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(SearchHitDbRow::into_hit).collect())
    }

    /// Newest non-obsolete articles by provenance time.
    pub async fn latest(&self, filter: &ArticleFilter, limit: i64) -> Result<Vec<SearchHit>> {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(HIT_SELECT);
        builder.push(" FROM articles a LEFT JOIN folders f ON f.id = a.folder_id WHERE a.obsolete = 0");
        filter.push_clauses(&mut builder);
        builder.push(" ORDER BY a.provenance_at DESC, a.id DESC LIMIT ");
        builder.push_bind(clamp_limit(limit));

        let rows: Vec<SearchHitDbRow> = builder.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(SearchHitDbRow::into_hit).collect())
    }

    /// Full snapshot of one non-obsolete article for export.
    pub async fn get_snapshot(&self, article_id: i64) -> Result<Option<ArticleSnapshot>> {
        let sql = format!("SELECT {}{} AND a.id = ?", ARTICLE_COLUMNS, SNAPSHOT_SELECT_TAIL);
        let row = sqlx::query_as::<_, SnapshotDbRow>(&sql)
            .bind(article_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(SnapshotDbRow::into_snapshot))
    }

    /// Snapshots of every non-obsolete article matching `filter`, oldest
    /// provenance first.
    pub async fn export_candidates(&self, filter: &ArticleFilter) -> Result<Vec<ArticleSnapshot>> {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT ");
        builder.push(ARTICLE_COLUMNS);
        builder.push(SNAPSHOT_SELECT_TAIL);
        filter.push_clauses(&mut builder);
        builder.push(" ORDER BY a.provenance_at ASC, a.id ASC");

        let rows: Vec<SnapshotDbRow> = builder.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(SnapshotDbRow::into_snapshot).collect())
    }
}
