use anyhow::Result;
use sqlx::{QueryBuilder, Sqlite};

use super::index;
use super::schema::Database;
use super::types::{ObsoleteArticle, ObsoleteCandidate, ObsoleteSelector, ObsoleteSweep};

/// Default page size for `list_obsolete`
pub const DEFAULT_OBSOLETE_LIMIT: i64 = 100;

/// Build `SELECT ... FROM articles WHERE obsolete = 0 AND <selector>`.
fn candidate_query(selector: &ObsoleteSelector) -> QueryBuilder<'_, Sqlite> {
    let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
        "SELECT id, url, title, status_code, failed_count FROM articles WHERE obsolete = 0",
    );

    if !selector.ids.is_empty() {
        builder.push(" AND id IN (");
        let mut ids = builder.separated(", ");
        for id in &selector.ids {
            ids.push_bind(*id);
        }
        builder.push(")");
    }

    if !selector.status_codes.is_empty() {
        builder.push(" AND status_code IN (");
        let mut codes = builder.separated(", ");
        for code in &selector.status_codes {
            codes.push_bind(*code);
        }
        builder.push(")");
    }

    if let Some(min) = selector.min_failures() {
        builder.push(" AND failed_count >= ");
        builder.push_bind(min);
    }

    builder.push(" ORDER BY id");
    builder
}

impl Database {
    /// Mark every non-obsolete article matching `selector` as obsolete and
    /// drop it from the projection, in one transaction.
    ///
    /// With `dry_run` the matching set is returned and nothing changes.
    /// Re-marking is a no-op because already-obsolete rows never match.
    pub async fn mark_obsolete(&self, selector: &ObsoleteSelector, dry_run: bool) -> Result<ObsoleteSweep> {
        if selector.is_empty() {
            anyhow::bail!("obsolete selection needs at least one of: ids, status codes, min failures");
        }

        let mut tx = self.pool.begin().await?;
        let candidates: Vec<ObsoleteCandidate> = candidate_query(selector)
            .build_query_as()
            .fetch_all(&mut *tx)
            .await?;

        if dry_run || candidates.is_empty() {
            tx.rollback().await?;
            tracing::info!(matched = candidates.len(), dry_run, "Obsolete sweep evaluated");
            return Ok(ObsoleteSweep {
                dry_run,
                candidates,
                marked: 0,
            });
        }

        let ids: Vec<i64> = candidates.iter().map(|c| c.id).collect();
        let mut marked = 0;
        for chunk in ids.chunks(500) {
            let mut update: QueryBuilder<Sqlite> =
                QueryBuilder::new("UPDATE articles SET obsolete = 1 WHERE obsolete = 0 AND id IN (");
            let mut separated = update.separated(", ");
            for id in chunk {
                separated.push_bind(*id);
            }
            update.push(")");
            marked += update.build().execute(&mut *tx).await?.rows_affected();
        }
        index::remove_entries(&mut tx, &ids).await?;
        tx.commit().await?;

        tracing::info!(marked, "Marked articles obsolete");
        Ok(ObsoleteSweep {
            dry_run,
            candidates,
            marked,
        })
    }

    /// Obsolete articles, newest provenance first.
    pub async fn list_obsolete(&self, limit: i64) -> Result<Vec<ObsoleteArticle>> {
        let rows = sqlx::query_as::<_, ObsoleteArticle>(
            r#"
            SELECT id, url, title, folder_id, provenance_at, status_code, failed_count
            FROM articles
            WHERE obsolete = 1
            ORDER BY provenance_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::CanonicalUrl;
    use crate::storage::ArticleDraft;
    use chrono::{TimeZone, Utc};

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    async fn article(db: &Database, url: &str) -> i64 {
        db.upsert_article(&ArticleDraft {
            url: CanonicalUrl::parse(url).unwrap(),
            title: url.to_string(),
            selection: None,
            folder_id: None,
            provenance_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        })
        .await
        .unwrap()
        .id
    }

    async fn fail(db: &Database, id: i64, code: i64, times: usize) {
        let at = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        for _ in 0..times {
            db.record_fetch_failure(id, code, "err", at).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_empty_selector_rejected() {
        let db = test_db().await;
        assert!(db.mark_obsolete(&ObsoleteSelector::default(), true).await.is_err());
        assert!(db
            .mark_obsolete(&ObsoleteSelector::by_min_failures(0), true)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_criteria_are_and_combined() {
        let db = test_db().await;
        let a = article(&db, "https://example.com/a").await;
        let b = article(&db, "https://example.com/b").await;
        let c = article(&db, "https://example.com/c").await;
        fail(&db, a, 404, 3).await;
        fail(&db, b, 404, 1).await;
        fail(&db, c, 500, 3).await;

        let selector = ObsoleteSelector {
            ids: Vec::new(),
            status_codes: vec![404],
            min_failures: Some(2),
        };
        let sweep = db.mark_obsolete(&selector, true).await.unwrap();
        let ids: Vec<i64> = sweep.candidates.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![a]);
    }

    #[tokio::test]
    async fn test_dry_run_changes_nothing() {
        let db = test_db().await;
        let a = article(&db, "https://example.com/a").await;

        let sweep = db.mark_obsolete(&ObsoleteSelector::by_ids([a]), true).await.unwrap();
        assert!(sweep.dry_run);
        assert_eq!(sweep.candidates.len(), 1);
        assert_eq!(sweep.marked, 0);
        assert!(!db.get_article(a).await.unwrap().unwrap().obsolete);
        assert!(db.projection_entry(a).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_marking_removes_projection_and_is_idempotent() {
        let db = test_db().await;
        let a = article(&db, "https://example.com/a").await;
        let b = article(&db, "https://example.com/b").await;

        let sweep = db.mark_obsolete(&ObsoleteSelector::by_ids([a]), false).await.unwrap();
        assert_eq!(sweep.marked, 1);
        assert!(db.get_article(a).await.unwrap().unwrap().obsolete);
        assert!(db.projection_entry(a).await.unwrap().is_none());
        assert!(db.projection_entry(b).await.unwrap().is_some());

        let again = db.mark_obsolete(&ObsoleteSelector::by_ids([a]), false).await.unwrap();
        assert_eq!(again.marked, 0);
        assert!(again.candidates.is_empty());

        let listed = db.list_obsolete(DEFAULT_OBSOLETE_LIMIT).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, a);
        assert!(db.check_projection().await.unwrap().is_consistent);
    }

    #[tokio::test]
    async fn test_obsolete_article_not_resurrected_by_upsert() {
        let db = test_db().await;
        let a = article(&db, "https://example.com/a").await;
        db.mark_obsolete(&ObsoleteSelector::by_ids([a]), false).await.unwrap();

        let again = article(&db, "https://example.com/a").await;
        assert_eq!(again, a);
        assert!(db.get_article(a).await.unwrap().unwrap().obsolete);
        assert!(db.projection_entry(a).await.unwrap().is_none());
    }
}
