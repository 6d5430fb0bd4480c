//! Markdown export with YAML front matter.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::storage::{ArticleFilter, ArticleSnapshot, Database, SearchField, SearchMode, SearchQuery};
use crate::util::{format_timestamp, safe_filename};

/// Tag added to every exported document.
pub const EXPORT_TAG: &str = "shelf";

/// Upper bound on the title slug in exported filenames.
pub const MAX_SLUG_BYTES: usize = 100;

const MAX_COLLISION_SUFFIX: u32 = 100;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("article {0} not found")]
    NotFound(i64),
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to render front matter: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("no free filename for {0} after 100 attempts")]
    Collision(PathBuf),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl ExportError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Front matter block at the top of every exported document.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct FrontMatter {
    pub title: String,
    pub saved_at: String,
    pub exported_at: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder: Option<String>,
    pub tags: Vec<String>,
}

/// Render one article as a Markdown document.
///
/// Articles without content get a placeholder line pointing at the source.
pub fn render_markdown(snapshot: &ArticleSnapshot, exported_at: DateTime<Utc>) -> Result<String, ExportError> {
    let article = &snapshot.article;
    let front_matter = FrontMatter {
        title: article.title.clone(),
        saved_at: format_timestamp(article.provenance_at),
        exported_at: format_timestamp(exported_at),
        source: article.url.clone(),
        folder: snapshot.folder_path.clone(),
        tags: std::iter::once(EXPORT_TAG.to_string())
            .chain(snapshot.tags.iter().cloned())
            .collect(),
    };
    let yaml = serde_yaml::to_string(&front_matter)?;

    let mut doc = String::with_capacity(yaml.len() + article.content.as_ref().map_or(64, String::len) + 16);
    doc.push_str("---\n");
    doc.push_str(&yaml);
    doc.push_str("---\n\n");
    match article.content.as_deref().filter(|c| !c.is_empty()) {
        Some(content) => {
            doc.push_str(content);
            if !content.ends_with('\n') {
                doc.push('\n');
            }
        }
        None => {
            doc.push_str(&format!("*Article content not yet fetched. Source: {}*\n", article.url));
        }
    }
    Ok(doc)
}

/// Render a single article by id.
pub async fn render_article(db: &Database, article_id: i64, exported_at: DateTime<Utc>) -> Result<String, ExportError> {
    let snapshot = db
        .get_snapshot(article_id)
        .await?
        .ok_or(ExportError::NotFound(article_id))?;
    render_markdown(&snapshot, exported_at)
}

/// Export a single article to `path`, or to `out` when no path is given.
pub async fn export_article<W: Write>(
    db: &Database,
    article_id: i64,
    path: Option<&Path>,
    out: &mut W,
) -> Result<(), ExportError> {
    let doc = render_article(db, article_id, Utc::now()).await?;
    match path {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(|e| ExportError::io(parent, e))?;
            }
            std::fs::write(path, doc).map_err(|e| ExportError::io(path, e))?;
            tracing::info!(article_id, path = %path.display(), "Exported article");
        }
        None => {
            out.write_all(doc.as_bytes())
                .map_err(|e| ExportError::io(Path::new("<stdout>"), e))?;
        }
    }
    Ok(())
}

/// Export exactly the hits of a search instead of every filtered article.
#[derive(Debug, Clone)]
pub struct ExportSearch {
    pub text: String,
    pub field: Option<SearchField>,
    pub mode: SearchMode,
    pub limit: i64,
}

#[derive(Debug, Clone, Default)]
pub struct ExportOptions {
    pub directory: PathBuf,
    pub filter: ArticleFilter,
    /// Also write articles that were never fetched, with a placeholder body
    pub include_unsynced: bool,
    /// When set, the filter narrows this search rather than the whole library
    pub search: Option<ExportSearch>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExportReport {
    pub selected: usize,
    pub written: Vec<PathBuf>,
    pub skipped_unsynced: usize,
    pub failed: usize,
}

/// Export every article matching the filter, or the hits of
/// `options.search`, into a folder tree.
///
/// Files land at `<directory>/<folder path>/<slug>-<id>.md`. An existing
/// file is never overwritten; the name gets `-2`, `-3`, ... instead. A
/// failure to write one article is logged and counted, and the run goes on.
pub async fn export_all(db: &Database, options: &ExportOptions) -> Result<ExportReport, ExportError> {
    let snapshots = match &options.search {
        Some(search) => search_snapshots(db, search, &options.filter).await?,
        None => db.export_candidates(&options.filter).await?,
    };
    let exported_at = Utc::now();
    let mut report = ExportReport {
        selected: snapshots.len(),
        ..ExportReport::default()
    };

    std::fs::create_dir_all(&options.directory).map_err(|e| ExportError::io(&options.directory, e))?;
    tracing::info!(selected = report.selected, dir = %options.directory.display(), "Exporting articles");

    for snapshot in &snapshots {
        if snapshot.article.content.is_none() && !options.include_unsynced {
            report.skipped_unsynced += 1;
            continue;
        }

        match write_snapshot(&options.directory, snapshot, exported_at) {
            Ok(path) => {
                report.written.push(path);
                if report.written.len() % 100 == 0 {
                    tracing::info!(written = report.written.len(), "Export progress");
                }
            }
            Err(e) => {
                tracing::warn!(article_id = snapshot.article.id, error = %e, "Failed to export article");
                report.failed += 1;
            }
        }
    }

    tracing::info!(
        written = report.written.len(),
        skipped_unsynced = report.skipped_unsynced,
        failed = report.failed,
        "Export finished"
    );
    Ok(report)
}

/// Snapshots of the search hits, in hit order.
async fn search_snapshots(
    db: &Database,
    search: &ExportSearch,
    filter: &ArticleFilter,
) -> Result<Vec<ArticleSnapshot>, ExportError> {
    let query = SearchQuery {
        text: search.text.clone(),
        field: search.field,
        mode: search.mode,
        filter: filter.clone(),
        limit: search.limit,
    };
    let hits = db.search(&query).await?;
    tracing::debug!(query = %search.text, hits = hits.len(), "Exporting search results");

    let mut snapshots = Vec::with_capacity(hits.len());
    for hit in hits {
        if let Some(snapshot) = db.get_snapshot(hit.id).await? {
            snapshots.push(snapshot);
        }
    }
    Ok(snapshots)
}

fn write_snapshot(base: &Path, snapshot: &ArticleSnapshot, exported_at: DateTime<Utc>) -> Result<PathBuf, ExportError> {
    let doc = render_markdown(snapshot, exported_at)?;

    let mut dir = base.to_path_buf();
    if let Some(folder_path) = &snapshot.folder_path {
        dir.extend(folder_components(folder_path));
        std::fs::create_dir_all(&dir).map_err(|e| ExportError::io(&dir, e))?;
    }

    let id = snapshot.article.id;
    let stem = safe_filename(&snapshot.article.title, id, MAX_SLUG_BYTES + format!("-{}", id).len());
    let path = free_path(&dir, &stem)?;
    std::fs::write(&path, doc).map_err(|e| ExportError::io(&path, e))?;
    Ok(path)
}

/// Split a folder path into directory names safe on common filesystems.
fn folder_components(folder_path: &str) -> Vec<String> {
    folder_path
        .split('/')
        .map(|part| {
            part.chars()
                .map(|c| match c {
                    '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
                    c if c.is_control() => '_',
                    c => c,
                })
                .collect::<String>()
                .trim_matches(|c: char| c == '.' || c.is_whitespace())
                .to_string()
        })
        .filter(|part| !part.is_empty())
        .collect()
}

fn free_path(dir: &Path, stem: &str) -> Result<PathBuf, ExportError> {
    let first = dir.join(format!("{}.md", stem));
    if !first.exists() {
        return Ok(first);
    }
    for n in 2..=MAX_COLLISION_SUFFIX {
        let candidate = dir.join(format!("{}-{}.md", stem, n));
        if !candidate.exists() {
            return Ok(candidate);
        }
    }
    Err(ExportError::Collision(first))
}
