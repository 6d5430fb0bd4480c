use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;

use super::schema::Database;
use super::tags::find_or_create_tag;
use super::types::{Feed, FeedDbRow};
use crate::canonical::{CanonicalUrl, FeedUrl};
use crate::util::{format_timestamp, normalize_titles};

const FEED_SELECT: &str = r#"
    SELECT fd.id, fd.url, fd.name, fd.created_at, fd.last_synced_at, fd.active,
           (SELECT GROUP_CONCAT(title, char(31)) FROM (
                SELECT t.title AS title FROM feed_tags ft
                JOIN tags t ON t.id = ft.tag_id
                WHERE ft.feed_id = fd.id
                ORDER BY t.title)) AS tags
    FROM feeds fd
"#;

async fn replace_feed_tags_in(conn: &mut SqliteConnection, feed_id: i64, titles: &[String]) -> Result<()> {
    sqlx::query("DELETE FROM feed_tags WHERE feed_id = ?")
        .bind(feed_id)
        .execute(&mut *conn)
        .await?;
    for title in normalize_titles(titles) {
        let tag_id = find_or_create_tag(conn, &title).await?;
        sqlx::query("INSERT OR IGNORE INTO feed_tags (feed_id, tag_id) VALUES (?, ?)")
            .bind(feed_id)
            .bind(tag_id)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

async fn feed_id_for(conn: &mut SqliteConnection, url: &CanonicalUrl) -> Result<i64> {
    let found: Option<(i64,)> = sqlx::query_as("SELECT id FROM feeds WHERE url_key = ?")
        .bind(url.as_str())
        .fetch_optional(&mut *conn)
        .await?;
    found
        .map(|(id,)| id)
        .with_context(|| format!("no subscription for {}", url))
}

impl Database {
    // ========================================================================
    // Subscriptions
    // ========================================================================

    /// Subscribe to a feed. Fails if a subscription with the same canonical
    /// address exists, whatever its scheme or trailing slash.
    pub async fn add_feed(&self, url: &FeedUrl, name: Option<&str>, tags: &[String]) -> Result<i64> {
        let mut tx = self.pool.begin().await?;

        let inserted: Option<(i64,)> = sqlx::query_as(
            r#"
            INSERT INTO feeds (url, url_key, name, created_at, active) VALUES (?, ?, ?, ?, 1)
            ON CONFLICT DO NOTHING
            RETURNING id
            "#,
        )
        .bind(url.as_str())
        .bind(url.key().as_str())
        .bind(name.map(str::trim).filter(|n| !n.is_empty()))
        .bind(format_timestamp(Utc::now()))
        .fetch_optional(&mut *tx)
        .await?;

        let Some((id,)) = inserted else {
            anyhow::bail!("already subscribed to {}", url);
        };
        replace_feed_tags_in(&mut tx, id, tags).await?;
        tx.commit().await?;

        tracing::info!(feed_id = id, url = %url, "Added feed subscription");
        Ok(id)
    }

    pub async fn list_feeds(&self) -> Result<Vec<Feed>> {
        let sql = format!("{} ORDER BY fd.id", FEED_SELECT);
        let rows = sqlx::query_as::<_, FeedDbRow>(&sql)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(FeedDbRow::into_feed).collect())
    }

    pub async fn active_feeds(&self) -> Result<Vec<Feed>> {
        let sql = format!("{} WHERE fd.active = 1 ORDER BY fd.id", FEED_SELECT);
        let rows = sqlx::query_as::<_, FeedDbRow>(&sql)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(FeedDbRow::into_feed).collect())
    }

    /// Look up a subscription by any address with the same canonical form.
    pub async fn get_feed(&self, url: &CanonicalUrl) -> Result<Option<Feed>> {
        let sql = format!("{} WHERE fd.url_key = ?", FEED_SELECT);
        let row = sqlx::query_as::<_, FeedDbRow>(&sql)
            .bind(url.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(FeedDbRow::into_feed))
    }

    /// Unsubscribe. Articles already ingested from the feed are kept.
    pub async fn remove_feed(&self, url: &CanonicalUrl) -> Result<()> {
        let result = sqlx::query("DELETE FROM feeds WHERE url_key = ?")
            .bind(url.as_str())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            anyhow::bail!("no subscription for {}", url);
        }
        tracing::info!(url = %url, "Removed feed subscription");
        Ok(())
    }

    /// Replace the tags applied to articles ingested from a feed from now on.
    pub async fn set_feed_tags(&self, url: &CanonicalUrl, tags: &[String]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let feed_id = feed_id_for(&mut tx, url).await?;
        replace_feed_tags_in(&mut tx, feed_id, tags).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn set_feed_active(&self, url: &CanonicalUrl, active: bool) -> Result<()> {
        let result = sqlx::query("UPDATE feeds SET active = ? WHERE url_key = ?")
            .bind(active)
            .bind(url.as_str())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            anyhow::bail!("no subscription for {}", url);
        }
        Ok(())
    }

    pub async fn mark_feed_synced(&self, feed_id: i64, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE feeds SET last_synced_at = ? WHERE id = ?")
            .bind(format_timestamp(at))
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
