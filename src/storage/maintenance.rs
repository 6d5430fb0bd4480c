use anyhow::Result;

use super::folders::recompute_paths;
use super::index;
use super::schema::Database;
use super::types::{DuplicateUrl, FailureBucket, LibraryStats, RepairReport, StatusBucket};
use crate::retry::MAX_FAILURES;

impl Database {
    /// Counts describing the library and its sync health.
    pub async fn library_stats(&self) -> Result<LibraryStats> {
        let (total, obsolete, synced, exhausted): (i64, i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COALESCE(SUM(obsolete = 0), 0),
                COALESCE(SUM(obsolete = 1), 0),
                COALESCE(SUM(obsolete = 0 AND synced_at IS NOT NULL), 0),
                COALESCE(SUM(obsolete = 0 AND synced_at IS NULL AND failed_count >= ?), 0)
            FROM articles
            "#,
        )
        .bind(MAX_FAILURES)
        .fetch_one(&self.pool)
        .await?;

        let (folders,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM folders")
            .fetch_one(&self.pool)
            .await?;
        let (tags,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM tags")
            .fetch_one(&self.pool)
            .await?;
        let (feeds,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM feeds")
            .fetch_one(&self.pool)
            .await?;

        let failures_by_count = sqlx::query_as::<_, FailureBucket>(
            r#"
            SELECT failed_count, COUNT(*) AS articles
            FROM articles
            WHERE obsolete = 0 AND synced_at IS NULL
            GROUP BY failed_count
            ORDER BY failed_count
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let failing_status_codes = sqlx::query_as::<_, StatusBucket>(
            r#"
            SELECT status_code, COUNT(*) AS articles
            FROM articles
            WHERE obsolete = 0 AND failed_count > 0
              AND status_code IS NOT NULL AND status_code NOT IN (0, 200)
            GROUP BY status_code
            ORDER BY articles DESC, status_code
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(LibraryStats {
            total_articles: total,
            obsolete_articles: obsolete,
            synced_articles: synced,
            unsynced_articles: total - synced,
            exhausted_articles: exhausted,
            folders,
            tags,
            feeds,
            failures_by_count,
            failing_status_codes,
        })
    }

    /// Check the database and rebuild everything derived from it.
    ///
    /// Folder paths are recomputed and the full-text projection is rebuilt
    /// from scratch in one transaction; integrity and foreign-key problems
    /// and duplicate URLs are reported, not fixed.
    pub async fn repair(&self) -> Result<RepairReport> {
        let integrity: Vec<(String,)> = sqlx::query_as("PRAGMA integrity_check")
            .fetch_all(&self.pool)
            .await?;
        let integrity: Vec<String> = integrity.into_iter().map(|(line,)| line).collect();

        let foreign_key_violations = sqlx::query("PRAGMA foreign_key_check")
            .fetch_all(&self.pool)
            .await?
            .len() as i64;

        let duplicate_urls: Vec<(String, i64)> = sqlx::query_as(
            "SELECT url, COUNT(*) FROM articles GROUP BY url HAVING COUNT(*) > 1 ORDER BY url",
        )
        .fetch_all(&self.pool)
        .await?;

        let projection_before = self.check_projection().await?;

        let mut tx = self.pool.begin().await?;
        let folders_recomputed = recompute_paths(&mut tx).await?;
        let entries_indexed = index::rebuild(&mut tx).await?;
        tx.commit().await?;

        let projection_after = self.check_projection().await?;

        let report = RepairReport {
            integrity,
            foreign_key_violations,
            folders_recomputed,
            projection_before,
            entries_indexed,
            projection_after,
            duplicate_urls: duplicate_urls
                .into_iter()
                .map(|(url, copies)| DuplicateUrl { url, copies })
                .collect(),
        };

        tracing::info!(
            healthy = report.is_healthy(),
            folders_recomputed,
            entries_indexed,
            "Repair finished"
        );
        Ok(report)
    }
}
