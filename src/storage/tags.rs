use anyhow::Result;
use sqlx::SqliteConnection;

use super::index;
use super::schema::Database;
use super::types::Tag;

pub(crate) async fn find_or_create_tag(conn: &mut SqliteConnection, title: &str) -> Result<i64> {
    let (id,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO tags (title) VALUES (?)
        ON CONFLICT(title) DO UPDATE SET title = excluded.title
        RETURNING id
        "#,
    )
    .bind(title)
    .fetch_one(&mut *conn)
    .await?;
    Ok(id)
}

impl Database {
    /// All tags by title, with their non-obsolete article counts.
    pub async fn list_tags(&self) -> Result<Vec<Tag>> {
        let tags = sqlx::query_as::<_, Tag>(
            r#"
            SELECT t.id, t.title,
                   (SELECT COUNT(*) FROM article_tags at
                    JOIN articles a ON a.id = at.article_id
                    WHERE at.tag_id = t.id AND a.obsolete = 0) AS article_count
            FROM tags t
            ORDER BY t.title
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(tags)
    }

    /// Rename a tag. Renaming onto a title that already exists is refused
    /// rather than silently merging the two tags.
    pub async fn rename_tag(&self, old_title: &str, new_title: &str) -> Result<()> {
        let new_title = new_title.trim();
        if new_title.is_empty() {
            anyhow::bail!("tag title cannot be empty");
        }

        let mut tx = self.pool.begin().await?;

        let existing: Option<(i64,)> = sqlx::query_as("SELECT id FROM tags WHERE title = ?")
            .bind(old_title.trim())
            .fetch_optional(&mut *tx)
            .await?;
        let Some((tag_id,)) = existing else {
            anyhow::bail!("tag '{}' not found", old_title);
        };

        let clash: Option<(i64,)> = sqlx::query_as("SELECT id FROM tags WHERE title = ? AND id != ?")
            .bind(new_title)
            .bind(tag_id)
            .fetch_optional(&mut *tx)
            .await?;
        if clash.is_some() {
            anyhow::bail!("tag '{}' already exists", new_title);
        }

        sqlx::query("UPDATE tags SET title = ? WHERE id = ?")
            .bind(new_title)
            .bind(tag_id)
            .execute(&mut *tx)
            .await?;

        let tagged: Vec<(i64,)> = sqlx::query_as(
            r#"
            SELECT at.article_id FROM article_tags at
            JOIN articles a ON a.id = at.article_id
            WHERE at.tag_id = ? AND a.obsolete = 0
            "#,
        )
        .bind(tag_id)
        .fetch_all(&mut *tx)
        .await?;
        let ids: Vec<i64> = tagged.into_iter().map(|(id,)| id).collect();
        index::refresh_entries(&mut tx, &ids).await?;
        tx.commit().await?;

        tracing::info!(tag_id, title = %new_title, articles = ids.len(), "Renamed tag");
        Ok(())
    }
}
