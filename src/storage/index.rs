//! Full-text projection maintenance.
//!
//! `articles_fts` holds one row per non-obsolete article (rowid = article id)
//! with the url, title, content, folder path and comma-joined tag titles.
//! Every content-affecting write calls [`refresh_entry`] (or
//! [`refresh_entries`]) on the same connection before committing, so the
//! projection never lags the articles it mirrors.

use anyhow::Result;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

use super::schema::Database;
use super::types::{DatabaseError, ProjectionEntry, ProjectionReport};

/// The projection row for every non-obsolete article, computed from the store.
const PROJECTION_SELECT: &str = r#"
    SELECT a.id,
           a.url,
           a.title,
           COALESCE(a.content, ''),
           COALESCE(f.path, ''),
           COALESCE((
               SELECT GROUP_CONCAT(title, ', ')
               FROM (
                   SELECT t.title AS title
                   FROM article_tags at
                   JOIN tags t ON t.id = at.tag_id
                   WHERE at.article_id = a.id
                   ORDER BY t.title
               )
           ), '')
    FROM articles a
    LEFT JOIN folders f ON f.id = a.folder_id
    WHERE a.obsolete = 0
"#;

/// Rewrite the projection row for one article. An obsolete or missing
/// article ends up with no row.
pub(crate) async fn refresh_entry(conn: &mut SqliteConnection, article_id: i64) -> Result<()> {
    sqlx::query("DELETE FROM articles_fts WHERE rowid = ?")
        .bind(article_id)
        .execute(&mut *conn)
        .await?;

    let insert = format!(
        "INSERT INTO articles_fts (rowid, url, title, content, folder, tags) {} AND a.id = ?",
        PROJECTION_SELECT
    );
    sqlx::query(&insert)
        .bind(article_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Rewrite the projection rows for a set of articles.
pub(crate) async fn refresh_entries(conn: &mut SqliteConnection, article_ids: &[i64]) -> Result<()> {
    if article_ids.is_empty() {
        return Ok(());
    }

    // Stay well under SQLite's bound-parameter limit
    for chunk in article_ids.chunks(500) {
        let mut delete: QueryBuilder<Sqlite> =
            QueryBuilder::new("DELETE FROM articles_fts WHERE rowid IN (");
        push_id_list(&mut delete, chunk);
        delete.push(")");
        delete.build().execute(&mut *conn).await?;

        let mut insert: QueryBuilder<Sqlite> = QueryBuilder::new(
            "INSERT INTO articles_fts (rowid, url, title, content, folder, tags) ",
        );
        insert.push(PROJECTION_SELECT);
        insert.push(" AND a.id IN (");
        push_id_list(&mut insert, chunk);
        insert.push(")");
        insert.build().execute(&mut *conn).await?;
    }
    Ok(())
}

/// Drop projection rows outright (used when articles become obsolete).
pub(crate) async fn remove_entries(conn: &mut SqliteConnection, article_ids: &[i64]) -> Result<()> {
    for chunk in article_ids.chunks(500) {
        let mut delete: QueryBuilder<Sqlite> =
            QueryBuilder::new("DELETE FROM articles_fts WHERE rowid IN (");
        push_id_list(&mut delete, chunk);
        delete.push(")");
        delete.build().execute(&mut *conn).await?;
    }
    Ok(())
}

/// Clear and repopulate the whole projection. Returns the number of rows
/// written.
pub(crate) async fn rebuild(conn: &mut SqliteConnection) -> Result<u64> {
    sqlx::query("DELETE FROM articles_fts")
        .execute(&mut *conn)
        .await?;
    let insert = format!(
        "INSERT INTO articles_fts (rowid, url, title, content, folder, tags) {}",
        PROJECTION_SELECT
    );
    let result = sqlx::query(&insert).execute(&mut *conn).await?;
    Ok(result.rows_affected())
}

fn push_id_list(builder: &mut QueryBuilder<'_, Sqlite>, ids: &[i64]) {
    let mut separated = builder.separated(", ");
    for id in ids {
        separated.push_bind(*id);
    }
}

impl Database {
    /// The stored projection row for an article, if any.
    pub async fn projection_entry(&self, article_id: i64) -> Result<Option<ProjectionEntry>> {
        let entry = sqlx::query_as::<_, ProjectionEntry>(
            "SELECT url, title, content, folder, tags FROM articles_fts WHERE rowid = ?",
        )
        .bind(article_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(entry)
    }

    /// Compare the projection against the non-obsolete articles.
    ///
    /// Orphaned rows have no live article behind them, missing rows are live
    /// articles without a projection row, and stale rows disagree with the
    /// article's current url, title or content.
    pub async fn check_projection(&self) -> Result<ProjectionReport, DatabaseError> {
        let (articles_count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM articles WHERE obsolete = 0")
                .fetch_one(&self.pool)
                .await?;

        let (projection_count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM articles_fts")
            .fetch_one(&self.pool)
            .await?;

        let (orphaned,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM articles_fts
            LEFT JOIN articles a ON a.id = articles_fts.rowid AND a.obsolete = 0
            WHERE a.id IS NULL
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let (missing,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM articles a
            LEFT JOIN articles_fts ON articles_fts.rowid = a.id
            WHERE a.obsolete = 0 AND articles_fts.rowid IS NULL
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let (stale,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM articles_fts
            JOIN articles a ON a.id = articles_fts.rowid AND a.obsolete = 0
            WHERE articles_fts.url IS NOT a.url
               OR articles_fts.title IS NOT a.title
               OR articles_fts.content IS NOT COALESCE(a.content, '')
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let is_consistent =
            orphaned == 0 && missing == 0 && stale == 0 && articles_count == projection_count;

        tracing::debug!(
            articles = articles_count,
            projection = projection_count,
            orphaned,
            missing,
            stale,
            is_consistent,
            "Projection consistency check"
        );

        Ok(ProjectionReport {
            articles_count,
            projection_count,
            orphaned_entries: orphaned,
            missing_entries: missing,
            stale_entries: stale,
            is_consistent,
        })
    }

    /// Rebuild the projection from the store in one transaction.
    pub async fn rebuild_projection(&self) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let written = rebuild(&mut tx).await?;
        tx.commit().await?;
        tracing::info!(entries = written, "Rebuilt full-text projection");
        Ok(written)
    }
}
