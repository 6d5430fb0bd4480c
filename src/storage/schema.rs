use anyhow::Result;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqliteConnection, SqlitePool,
};
use std::str::FromStr;
use std::time::Duration;

use super::types::{is_lock_message, DatabaseError};
use crate::util::format_timestamp;

// ============================================================================
// Migrations
// ============================================================================

/// One ordered schema step. Applied exactly once and recorded in
/// `schema_migrations`.
struct Migration {
    version: i64,
    name: &'static str,
    statements: &'static [&'static str],
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "core library tables",
        statements: &[
            r#"
            CREATE TABLE folders (
                id INTEGER PRIMARY KEY,
                title TEXT NOT NULL UNIQUE,
                parent_id INTEGER REFERENCES folders(id) ON DELETE SET NULL,
                path TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE tags (
                id INTEGER PRIMARY KEY,
                title TEXT NOT NULL UNIQUE
            )
            "#,
            r#"
            CREATE TABLE articles (
                id INTEGER PRIMARY KEY,
                url TEXT NOT NULL UNIQUE,
                title TEXT NOT NULL,
                selection TEXT,
                folder_id INTEGER REFERENCES folders(id) ON DELETE SET NULL,
                provenance_at TEXT NOT NULL,
                synced_at TEXT,
                sync_failed_at TEXT,
                failed_count INTEGER NOT NULL DEFAULT 0,
                status_code INTEGER,
                status_text TEXT,
                final_url TEXT,
                content TEXT,
                raw_html TEXT
            )
            "#,
            r#"
            CREATE TABLE article_tags (
                article_id INTEGER NOT NULL REFERENCES articles(id) ON DELETE CASCADE,
                tag_id INTEGER NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
                PRIMARY KEY (article_id, tag_id)
            )
            "#,
            "CREATE INDEX idx_articles_folder ON articles(folder_id)",
            "CREATE INDEX idx_articles_provenance ON articles(provenance_at)",
            "CREATE INDEX idx_articles_pending ON articles(failed_count, sync_failed_at) WHERE synced_at IS NULL",
            "CREATE INDEX idx_article_tags_tag ON article_tags(tag_id)",
            "CREATE INDEX idx_folders_parent ON folders(parent_id)",
        ],
    },
    Migration {
        version: 2,
        name: "full-text projection",
        // Stores its own copies of the strings: the projection is derived,
        // rowid = articles.id, and rewritten explicitly by storage::index.
        statements: &[r#"
            CREATE VIRTUAL TABLE articles_fts
            USING fts5(url, title, content, folder, tags)
            "#],
    },
    Migration {
        version: 3,
        name: "obsolete flag",
        statements: &[
            "ALTER TABLE articles ADD COLUMN obsolete INTEGER NOT NULL DEFAULT 0",
            "CREATE INDEX idx_articles_obsolete ON articles(obsolete)",
        ],
    },
    Migration {
        version: 4,
        name: "feed subscriptions",
        statements: &[
            r#"
            CREATE TABLE feeds (
                id INTEGER PRIMARY KEY,
                url TEXT NOT NULL UNIQUE,
                name TEXT,
                created_at TEXT NOT NULL,
                last_synced_at TEXT,
                active INTEGER NOT NULL DEFAULT 1
            )
            "#,
            r#"
            CREATE TABLE feed_tags (
                feed_id INTEGER NOT NULL REFERENCES feeds(id) ON DELETE CASCADE,
                tag_id INTEGER NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
                PRIMARY KEY (feed_id, tag_id)
            )
            "#,
        ],
    },
    Migration {
        version: 5,
        name: "feed address key",
        // `url` is the address fetched as given; `url_key` is its canonical
        // form and decides whether two subscriptions are the same feed.
        statements: &[
            "ALTER TABLE feeds ADD COLUMN url_key TEXT",
            "UPDATE feeds SET url_key = url",
            "CREATE UNIQUE INDEX idx_feeds_url_key ON feeds(url_key)",
        ],
    },
];

/// Highest schema version this build knows how to read.
pub const SCHEMA_VERSION: i64 = 5;

// ============================================================================
// Database
// ============================================================================

/// Handle to the library store. Cheap to clone; every clone shares one pool.
#[derive(Clone)]
pub struct Database {
    pub(crate) pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the library at `path` and apply pending
    /// migrations. `":memory:"` opens a private in-memory library.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError::InstanceLocked` if another shelf process holds
    /// the database lock, `DatabaseError::Migration` if the schema cannot be
    /// brought up to date (including a file written by a newer build), and
    /// `DatabaseError::Other` for anything else.
    pub async fn open(path: &str) -> Result<Self, DatabaseError> {
        let url = format!("sqlite:{}?mode=rwc", path);

        // Create the file owner-only before SQLite touches it
        #[cfg(unix)]
        if path != ":memory:" {
            use std::os::unix::fs::PermissionsExt;
            let db_path = std::path::Path::new(path);
            if db_path.exists() {
                let perms = std::fs::Permissions::from_mode(0o600);
                if let Err(e) = std::fs::set_permissions(path, perms) {
                    tracing::warn!(path = %path, error = %e, "Failed to restrict database file permissions");
                }
            } else if let Some(parent) = db_path.parent() {
                if parent.exists() {
                    use std::os::unix::fs::OpenOptionsExt;
                    let _file = std::fs::OpenOptions::new()
                        .write(true)
                        .create_new(true)
                        .mode(0o600)
                        .open(db_path)
                        .ok(); // If creation fails, SQLite will report the error at connect_with.
                }
            }
        }

        // busy_timeout and foreign_keys are per-connection; setting them on the
        // options makes every pooled connection inherit them.
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(DatabaseError::from_sqlx)?
            .pragma("busy_timeout", "5000")
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        let db = Self { pool };
        db.migrate().await.map_err(|e| {
            if is_lock_message(&e.to_string()) {
                DatabaseError::InstanceLocked
            } else {
                DatabaseError::Migration(format!("{:#}", e))
            }
        })?;
        Ok(db)
    }

    /// Apply every migration newer than the recorded schema version.
    ///
    /// Each migration runs in its own transaction together with its ledger
    /// row, so a crash mid-upgrade leaves the database at the last completed
    /// version.
    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        let current = self.schema_version().await?;
        if current > SCHEMA_VERSION {
            anyhow::bail!(
                "database schema version {} is newer than this build supports ({})",
                current,
                SCHEMA_VERSION
            );
        }

        for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
            let mut tx = self.pool.begin().await?;
            apply(&mut tx, migration).await?;
            tx.commit().await?;
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applied schema migration"
            );
        }

        Ok(())
    }

    /// Highest applied migration version, 0 for a fresh database.
    pub async fn schema_version(&self) -> Result<i64> {
        let (version,): (Option<i64>,) =
            sqlx::query_as("SELECT MAX(version) FROM schema_migrations")
                .fetch_one(&self.pool)
                .await?;
        Ok(version.unwrap_or(0))
    }

    /// Close the pool, waiting for in-flight work to finish.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

async fn apply(conn: &mut SqliteConnection, migration: &Migration) -> Result<()> {
    for statement in migration.statements {
        sqlx::query(statement).execute(&mut *conn).await.map_err(|e| {
            anyhow::anyhow!("migration {} ({}) failed: {}", migration.version, migration.name, e)
        })?;
    }
    sqlx::query("INSERT INTO schema_migrations (version, name, applied_at) VALUES (?, ?, ?)")
        .bind(migration.version)
        .bind(migration.name)
        .bind(format_timestamp(chrono::Utc::now()))
        .execute(&mut *conn)
        .await?;
    Ok(())
}
