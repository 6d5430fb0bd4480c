use anyhow::{Context, Result};
use sqlx::SqliteConnection;

use super::index;
use super::schema::Database;
use super::types::Folder;

/// Deepest folder nesting followed by the recursive queries.
const MAX_FOLDER_DEPTH: i64 = 64;

/// Find a folder by title or path, creating whatever is missing. A name such
/// as `Work/Reading` is walked segment by segment, each missing segment
/// created beneath the previous one.
pub(crate) async fn find_or_create_folder(conn: &mut SqliteConnection, name: &str) -> Result<i64> {
    if let Some(id) = resolve_folder(conn, name).await? {
        return Ok(id);
    }

    let mut parent_id: Option<i64> = None;
    for segment in name.split('/').map(str::trim).filter(|s| !s.is_empty()) {
        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO folders (title, parent_id, path) VALUES (?, ?, ?)
            ON CONFLICT(title) DO UPDATE SET title = excluded.title
            RETURNING id
            "#,
        )
        .bind(segment)
        .bind(parent_id)
        .bind(segment)
        .fetch_one(&mut *conn)
        .await?;
        parent_id = Some(id);
    }
    recompute_paths(conn).await?;

    parent_id.with_context(|| format!("invalid folder name '{}'", name))
}

/// Trimmed folder title. Titles are path segments, so '/' is rejected.
fn folder_title(title: &str) -> Result<&str> {
    let title = title.trim();
    if title.is_empty() {
        anyhow::bail!("folder title cannot be empty");
    }
    if title.contains('/') {
        anyhow::bail!("folder title '{}' cannot contain '/'", title);
    }
    Ok(title)
}

/// Resolve a folder reference given either as a title or a full path.
pub(crate) async fn resolve_folder(conn: &mut SqliteConnection, name: &str) -> Result<Option<i64>> {
    let found: Option<(i64,)> = sqlx::query_as(
        "SELECT id FROM folders WHERE title = ?1 OR path = ?1 ORDER BY (title = ?1) DESC, id LIMIT 1",
    )
    .bind(name.trim())
    .fetch_optional(&mut *conn)
    .await?;
    Ok(found.map(|(id,)| id))
}

async fn require_folder(conn: &mut SqliteConnection, name: &str) -> Result<i64> {
    resolve_folder(conn, name)
        .await?
        .with_context(|| format!("folder '{}' not found", name))
}

/// Ids of `root` and every folder beneath it.
async fn subtree_ids(conn: &mut SqliteConnection, root: i64) -> Result<Vec<i64>> {
    let rows: Vec<(i64,)> = sqlx::query_as(
        r#"
        WITH RECURSIVE sub(id, depth) AS (
            SELECT ?1, 0
            UNION
            SELECT f.id, sub.depth + 1
            FROM folders f JOIN sub ON f.parent_id = sub.id
            WHERE sub.depth < ?2
        )
        SELECT DISTINCT id FROM sub
        "#,
    )
    .bind(root)
    .bind(MAX_FOLDER_DEPTH)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Recompute every materialized path from the parent links. Returns the
/// number of folders whose path changed.
pub(crate) async fn recompute_paths(conn: &mut SqliteConnection) -> Result<u64> {
    let result = sqlx::query(
        r#"
        WITH RECURSIVE tree(id, path, depth) AS (
            SELECT id, title, 0 FROM folders WHERE parent_id IS NULL
            UNION ALL
            SELECT f.id, tree.path || '/' || f.title, tree.depth + 1
            FROM folders f JOIN tree ON f.parent_id = tree.id
            WHERE tree.depth < ?
        )
        UPDATE folders
        SET path = (SELECT path FROM tree WHERE tree.id = folders.id)
        WHERE id IN (SELECT id FROM tree)
          AND path IS NOT (SELECT path FROM tree WHERE tree.id = folders.id)
        "#,
    )
    .bind(MAX_FOLDER_DEPTH)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

/// Refresh the projection of every article filed under the given folders.
async fn refresh_folder_articles(conn: &mut SqliteConnection, folder_ids: &[i64]) -> Result<()> {
    let mut article_ids = Vec::new();
    for folder_id in folder_ids {
        let rows: Vec<(i64,)> =
            sqlx::query_as("SELECT id FROM articles WHERE folder_id = ? AND obsolete = 0")
                .bind(folder_id)
                .fetch_all(&mut *conn)
                .await?;
        article_ids.extend(rows.into_iter().map(|(id,)| id));
    }
    index::refresh_entries(conn, &article_ids).await
}

impl Database {
    // ========================================================================
    // Folder Operations
    // ========================================================================

    /// All folders ordered by path, with their non-obsolete article counts.
    pub async fn list_folders(&self) -> Result<Vec<Folder>> {
        let folders = sqlx::query_as::<_, Folder>(
            r#"
            SELECT f.id, f.title, f.parent_id, f.path,
                   (SELECT COUNT(*) FROM articles a
                    WHERE a.folder_id = f.id AND a.obsolete = 0) AS article_count
            FROM folders f
            ORDER BY f.path
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(folders)
    }

    /// Create a folder, optionally beneath an existing parent (title or path).
    pub async fn create_folder(&self, title: &str, parent: Option<&str>) -> Result<i64> {
        let title = folder_title(title)?;

        let mut tx = self.pool.begin().await?;
        if resolve_folder(&mut tx, title).await?.is_some() {
            anyhow::bail!("folder '{}' already exists", title);
        }
        let parent_id = match parent {
            Some(name) => Some(require_folder(&mut tx, name).await?),
            None => None,
        };

        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO folders (title, parent_id, path) VALUES (?, ?, ?) RETURNING id",
        )
        .bind(title)
        .bind(parent_id)
        .bind(title)
        .fetch_one(&mut *tx)
        .await?;
        recompute_paths(&mut tx).await?;
        tx.commit().await?;

        tracing::info!(folder_id = id, title = %title, "Created folder");
        Ok(id)
    }

    /// Re-parent a folder (`None` moves it to the root). Moving a folder
    /// beneath itself or one of its descendants is rejected.
    pub async fn move_folder(&self, name: &str, new_parent: Option<&str>) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let folder_id = require_folder(&mut tx, name).await?;
        let subtree = subtree_ids(&mut tx, folder_id).await?;

        let parent_id = match new_parent {
            Some(parent) => {
                let parent_id = require_folder(&mut tx, parent).await?;
                if subtree.contains(&parent_id) {
                    anyhow::bail!(
                        "cannot move folder '{}' beneath '{}': that would create a cycle",
                        name,
                        parent
                    );
                }
                Some(parent_id)
            }
            None => None,
        };

        sqlx::query("UPDATE folders SET parent_id = ? WHERE id = ?")
            .bind(parent_id)
            .bind(folder_id)
            .execute(&mut *tx)
            .await?;
        recompute_paths(&mut tx).await?;
        refresh_folder_articles(&mut tx, &subtree).await?;
        tx.commit().await?;

        tracing::info!(folder_id, parent_id, "Moved folder");
        Ok(())
    }

    /// Rename a folder. Paths of the folder and its descendants follow, and
    /// so does the projection of every article filed under them.
    pub async fn rename_folder(&self, name: &str, new_title: &str) -> Result<()> {
        let new_title = folder_title(new_title)?;

        let mut tx = self.pool.begin().await?;
        let folder_id = require_folder(&mut tx, name).await?;

        let clash: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM folders WHERE title = ? AND id != ?")
                .bind(new_title)
                .bind(folder_id)
                .fetch_optional(&mut *tx)
                .await?;
        if clash.is_some() {
            anyhow::bail!("folder '{}' already exists", new_title);
        }

        sqlx::query("UPDATE folders SET title = ? WHERE id = ?")
            .bind(new_title)
            .bind(folder_id)
            .execute(&mut *tx)
            .await?;
        recompute_paths(&mut tx).await?;
        let subtree = subtree_ids(&mut tx, folder_id).await?;
        refresh_folder_articles(&mut tx, &subtree).await?;
        tx.commit().await?;

        tracing::info!(folder_id, title = %new_title, "Renamed folder");
        Ok(())
    }

    /// File an article in a folder (or none).
    pub async fn set_article_folder(&self, article_id: i64, folder: Option<&str>) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let folder_id = match folder {
            Some(name) => Some(require_folder(&mut tx, name).await?),
            None => None,
        };
        let result = sqlx::query("UPDATE articles SET folder_id = ? WHERE id = ?")
            .bind(folder_id)
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
}
