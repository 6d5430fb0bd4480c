use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;

use super::folders::find_or_create_folder;
use super::index;
use super::query::like_pattern;
use super::schema::Database;
use super::tags::find_or_create_tag;
use super::types::{
    Article, ArticleDraft, CandidateOrder, FetchSuccess, ImportRecord, UpsertOutcome,
    ARTICLE_COLUMNS,
};
use crate::retry::RetryPolicy;
use crate::util::{format_timestamp, normalize_titles};

/// Hard cap on one fetch batch
const MAX_CANDIDATES: i64 = 1000;

/// Selection of fetch candidates.
#[derive(Debug, Clone)]
pub struct CandidateQuery {
    pub limit: i64,
    pub order: CandidateOrder,
    /// Case-insensitive substring over url or title
    pub search: Option<String>,
}

impl Default for CandidateQuery {
    fn default() -> Self {
        Self {
            limit: 10,
            order: CandidateOrder::OldestFirst,
            search: None,
        }
    }
}

// ============================================================================
// Connection-level helpers
//
// These run on a caller-owned transaction so compound operations (import,
// feed ingestion) can commit metadata, tags and projection together.
// ============================================================================

pub(crate) async fn upsert_in(conn: &mut SqliteConnection, draft: &ArticleDraft) -> Result<UpsertOutcome> {
    let provenance = format_timestamp(draft.provenance_at);

    let existing: Option<(i64,)> = sqlx::query_as("SELECT id FROM articles WHERE url = ?")
        .bind(draft.url.as_str())
        .fetch_optional(&mut *conn)
        .await?;

    if let Some((id,)) = existing {
        // Metadata refresh only; sync outcome and obsolete flag stay as they are
        sqlx::query(
            r#"
            UPDATE articles
            SET title = ?, selection = ?, folder_id = ?, provenance_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&draft.title)
        .bind(&draft.selection)
        .bind(draft.folder_id)
        .bind(&provenance)
        .bind(id)
        .execute(&mut *conn)
        .await?;
        return Ok(UpsertOutcome { id, inserted: false });
    }

    let (id,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO articles (url, title, selection, folder_id, provenance_at)
        VALUES (?, ?, ?, ?, ?)
        RETURNING id
        "#,
    )
    .bind(draft.url.as_str())
    .bind(&draft.title)
    .bind(&draft.selection)
    .bind(draft.folder_id)
    .bind(&provenance)
    .fetch_one(&mut *conn)
    .await?;

    Ok(UpsertOutcome { id, inserted: true })
}

pub(crate) async fn replace_tags_in(
    conn: &mut SqliteConnection,
    article_id: i64,
    titles: &[String],
) -> Result<()> {
    sqlx::query("DELETE FROM article_tags WHERE article_id = ?")
        .bind(article_id)
        .execute(&mut *conn)
        .await?;

    for title in normalize_titles(titles) {
        let tag_id = find_or_create_tag(conn, &title).await?;
        sqlx::query("INSERT OR IGNORE INTO article_tags (article_id, tag_id) VALUES (?, ?)")
            .bind(article_id)
            .bind(tag_id)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

async fn ensure_exists(conn: &mut SqliteConnection, article_id: i64) -> Result<()> {
    let found: Option<(i64,)> = sqlx::query_as("SELECT id FROM articles WHERE id = ?")
        .bind(article_id)
        .fetch_optional(&mut *conn)
        .await?;
    if found.is_none() {
        anyhow::bail!("article {} not found", article_id);
    }
    Ok(())
}

impl Database {
    // ========================================================================
    // Article Mutations
    // ========================================================================

    /// Insert a new article, or refresh title/selection/folder/provenance on
    /// the row that already has this canonical URL. Sync outcome fields are
    /// never touched here.
    pub async fn upsert_article(&self, draft: &ArticleDraft) -> Result<UpsertOutcome> {
        let mut tx = self.pool.begin().await?;
        let outcome = upsert_in(&mut tx, draft).await?;
        index::refresh_entry(&mut tx, outcome.id).await?;
        tx.commit().await?;

        tracing::debug!(
            article_id = outcome.id,
            inserted = outcome.inserted,
            url = %draft.url,
            "Upserted article"
        );
        Ok(outcome)
    }

    /// Replace an article's tag set. Titles are trimmed and deduplicated,
    /// empty entries dropped; an empty set clears every tag.
    pub async fn replace_tags(&self, article_id: i64, titles: &[String]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        ensure_exists(&mut tx, article_id).await?;
        replace_tags_in(&mut tx, article_id, titles).await?;
        index::refresh_entry(&mut tx, article_id).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Apply one imported record: resolve the folder, upsert, replace tags
    /// and refresh the projection as one unit.
    pub async fn import_article(&self, record: &ImportRecord) -> Result<UpsertOutcome> {
        let mut tx = self.pool.begin().await?;

        let folder_id = match record.folder.as_deref().map(str::trim) {
            Some(title) if !title.is_empty() => {
                Some(find_or_create_folder(&mut tx, title).await?)
            }
            _ => None,
        };

        let draft = ArticleDraft {
            url: record.url.clone(),
            title: record.title.clone(),
            selection: record.selection.clone(),
            folder_id,
            provenance_at: record.provenance_at,
        };
        let outcome = upsert_in(&mut tx, &draft).await?;
        replace_tags_in(&mut tx, outcome.id, &record.tags).await?;
        index::refresh_entry(&mut tx, outcome.id).await?;
        tx.commit().await?;

        Ok(outcome)
    }

    /// Insert an article only if its canonical URL is unseen, then attach
    /// `tags`. Returns the new id, or `None` when the URL already exists
    /// (that row is left untouched, obsolete or not).
    pub async fn insert_if_unseen(&self, draft: &ArticleDraft, tags: &[String]) -> Result<Option<i64>> {
        let mut tx = self.pool.begin().await?;

        let inserted: Option<(i64,)> = sqlx::query_as(
            r#"
            INSERT INTO articles (url, title, selection, folder_id, provenance_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(url) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(draft.url.as_str())
        .bind(&draft.title)
        .bind(&draft.selection)
        .bind(draft.folder_id)
        .bind(format_timestamp(draft.provenance_at))
        .fetch_optional(&mut *tx)
        .await?;

        let Some((id,)) = inserted else {
            tx.rollback().await?;
            return Ok(None);
        };

        replace_tags_in(&mut tx, id, tags).await?;
        index::refresh_entry(&mut tx, id).await?;
        tx.commit().await?;
        Ok(Some(id))
    }

    /// Commit a successful fetch: the article becomes Synced and its failure
    /// history is cleared.
    pub async fn record_fetch_success(
        &self,
        article_id: i64,
        success: &FetchSuccess,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE articles
            SET synced_at = ?,
                content = ?,
                final_url = ?,
                status_code = ?,
                status_text = 'OK',
                failed_count = 0,
                sync_failed_at = NULL,
                title = COALESCE(?, title),
                raw_html = COALESCE(?, raw_html)
            WHERE id = ?
            "#,
        )
        .bind(format_timestamp(at))
        .bind(&success.content)
        .bind(&success.final_url)
        .bind(success.status_code)
        .bind(&success.title)
        .bind(&success.raw_html)
        .bind(article_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            anyhow::bail!("article {} not found", article_id);
        }

        index::refresh_entry(&mut tx, article_id).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Record a failed fetch. Content, `synced_at` and the projection are
    /// left alone, so an article that once synced keeps its text.
    pub async fn record_fetch_failure(
        &self,
        article_id: i64,
        status_code: i64,
        status_text: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE articles
            SET sync_failed_at = ?,
                failed_count = failed_count + 1,
                status_code = ?,
                status_text = ?
            WHERE id = ?
            "#,
        )
        .bind(format_timestamp(at))
        .bind(status_code)
        .bind(status_text)
        .bind(article_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            anyhow::bail!("article {} not found", article_id);
        }
        Ok(())
    }

    // ========================================================================
    // Article Queries
    // ========================================================================

    /// Load an article by id regardless of its obsolete flag.
    pub async fn get_article(&self, article_id: i64) -> Result<Option<Article>> {
        let query = format!("SELECT {} FROM articles a WHERE a.id = ?", ARTICLE_COLUMNS);
        let article = sqlx::query_as::<_, Article>(&query)
            .bind(article_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(article)
    }

    /// Load an article by canonical URL regardless of its obsolete flag.
    pub async fn get_article_by_url(&self, url: &crate::canonical::CanonicalUrl) -> Result<Option<Article>> {
        let query = format!("SELECT {} FROM articles a WHERE a.url = ?", ARTICLE_COLUMNS);
        let article = sqlx::query_as::<_, Article>(&query)
            .bind(url.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(article)
    }

    /// Articles eligible for fetching at `now` under `policy`, ordered by
    /// provenance time.
    ///
    /// The SQL mirrors [`RetryPolicy::is_eligible`]; the predicate is applied
    /// again to the rows so both stay the single definition of eligibility.
    pub async fn fetch_candidates(
        &self,
        query: &CandidateQuery,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<Vec<Article>> {
        let limit = query.limit.clamp(0, MAX_CANDIDATES);
        if limit == 0 {
            return Ok(Vec::new());
        }

        let direction = match query.order {
            CandidateOrder::OldestFirst => "ASC",
            CandidateOrder::NewestFirst => "DESC",
        };
        let search = query
            .search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty());
        let search_clause = if search.is_some() {
            r"AND (a.url LIKE ? ESCAPE '\' OR a.title LIKE ? ESCAPE '\')"
        } else {
            ""
        };

        let sql = format!(
            r#"
            SELECT {}
            FROM articles a
            WHERE a.obsolete = 0
              AND a.synced_at IS NULL
              AND a.failed_count < ?
              AND (a.sync_failed_at IS NULL OR a.sync_failed_at <= ?)
              {}
            ORDER BY a.provenance_at {}, a.id {}
            LIMIT ?
            "#,
            ARTICLE_COLUMNS, search_clause, direction, direction
        );

        let mut q = sqlx::query_as::<_, Article>(&sql)
            .bind(policy.max_failures)
            .bind(format_timestamp(policy.cooldown_cutoff(now)));
        if let Some(term) = search {
            let pattern = like_pattern(term);
            q = q.bind(pattern.clone()).bind(pattern);
        }
        let rows = q.bind(limit).fetch_all(&self.pool).await?;

        Ok(rows
            .into_iter()
            .filter(|article| policy.is_eligible(article, now))
            .collect())
    }
}
