use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

mod render;

use shelf::canonical::{CanonicalUrl, FeedUrl};
use shelf::config::{Config, ContentBackend};
use shelf::content::{ContentSource, DirectSource, JinaSource};
use shelf::export::{export_all, export_article, ExportOptions, ExportSearch};
use shelf::feed::{sync_feeds, FeedClient};
use shelf::fetcher::{CancelFlag, FetchOptions, FetchPipeline};
use shelf::import::import_csv_file;
use shelf::retry::SystemClock;
use shelf::storage::{
    ArticleFilter, CandidateOrder, CandidateQuery, Database, DatabaseError, ObsoleteSelector,
    SearchField, SearchMode, SearchQuery, DEFAULT_LATEST_LIMIT, DEFAULT_OBSOLETE_LIMIT,
    DEFAULT_SEARCH_LIMIT,
};
use shelf::util::{parse_relative_date, parse_tag_list, parse_until, MAX_SEARCH_QUERY_LENGTH};

#[derive(Parser, Debug)]
#[command(
    name = "shelf",
    version,
    about = "Personal article library: import, fetch readable content, search and export"
)]
struct Cli {
    /// Library database (overrides the config file)
    #[arg(long, global = true, value_name = "PATH")]
    db: Option<PathBuf>,

    /// Config file (default: ~/.config/shelf/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true, value_name = "PATH")]
    log: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Import articles from a CSV export
    Import {
        #[arg(long, value_name = "FILE")]
        csv: PathBuf,
    },
    /// Fetch readable content for articles that need it
    Fetch {
        /// Articles to process in this run
        #[arg(long)]
        limit: Option<i64>,
        /// `oldest` or `newest` first
        #[arg(long, default_value = "oldest")]
        order: CandidateOrder,
        /// Only articles whose URL or title contains this text
        #[arg(long)]
        search: Option<String>,
        /// Replace stored titles with the page title
        #[arg(long)]
        prefer_extracted_title: bool,
        /// Keep the raw HTML next to the Markdown
        #[arg(long)]
        store_raw: bool,
        #[arg(long)]
        json: bool,
    },
    /// Search the library
    Search {
        query: String,
        /// Restrict to one field: url, title, content, tags, folder
        #[arg(long)]
        field: Option<SearchField>,
        /// Use the full-text index (FTS5 syntax)
        #[arg(long)]
        fts: bool,
        #[arg(long, default_value_t = DEFAULT_SEARCH_LIMIT)]
        limit: i64,
        #[command(flatten)]
        filter: FilterArgs,
        #[arg(long)]
        json: bool,
    },
    /// Most recently saved articles
    Latest {
        #[arg(long, default_value_t = DEFAULT_LATEST_LIMIT)]
        limit: i64,
        #[command(flatten)]
        filter: FilterArgs,
        #[arg(long)]
        json: bool,
    },
    /// Export one article as Markdown
    Export {
        #[arg(long)]
        id: i64,
        /// Output file
        #[arg(long, conflicts_with = "stdout")]
        out: Option<PathBuf>,
        #[arg(long)]
        stdout: bool,
    },
    /// Export matching articles into a folder tree of Markdown files
    ExportAll {
        /// Target directory (default: [export].directory from the config)
        #[arg(long)]
        dir: Option<PathBuf>,
        /// Also export articles that were never fetched
        #[arg(long)]
        include_unsynced: bool,
        /// Export the results of this search instead of the whole library
        #[arg(long)]
        from_search: Option<String>,
        /// Search field for --from-search: url, title, content, tags, folder
        #[arg(long, requires = "from_search")]
        field: Option<SearchField>,
        /// Run --from-search against the full-text index
        #[arg(long, requires = "from_search")]
        fts: bool,
        /// Maximum search results to export
        #[arg(long, requires = "from_search", default_value_t = DEFAULT_SEARCH_LIMIT)]
        limit: i64,
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Manage folders
    #[command(subcommand)]
    Folders(FolderCommand),
    /// Manage tags
    #[command(subcommand)]
    Tags(TagCommand),
    /// Manage RSS/Atom subscriptions
    #[command(subcommand)]
    Feeds(FeedCommand),
    /// Mark articles obsolete (hidden everywhere, never fetched again)
    Obsolete {
        /// Comma-separated article ids
        #[arg(long, value_delimiter = ',')]
        ids: Vec<i64>,
        /// Comma-separated recorded status codes
        #[arg(long, value_delimiter = ',')]
        status_codes: Vec<i64>,
        /// Minimum failed fetch attempts
        #[arg(long)]
        min_failures: Option<i64>,
        /// Only list what would be marked
        #[arg(long, conflicts_with = "confirm")]
        dry_run: bool,
        /// Apply the change
        #[arg(long)]
        confirm: bool,
        #[arg(long)]
        json: bool,
    },
    /// List obsolete articles, newest first
    ListObsolete {
        #[arg(long, default_value_t = DEFAULT_OBSOLETE_LIMIT)]
        limit: i64,
        #[arg(long)]
        json: bool,
    },
    /// Library statistics
    Stats {
        #[arg(long)]
        json: bool,
    },
    /// Check integrity, recompute folder paths and rebuild the search index
    Doctor {
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand, Debug)]
enum FolderCommand {
    List {
        #[arg(long)]
        json: bool,
    },
    /// Create a folder
    Mkdir {
        title: String,
        /// Parent folder title or path
        #[arg(long)]
        parent: Option<String>,
    },
    /// Move a folder under another one, or to the top level
    Mv {
        folder: String,
        #[arg(long)]
        parent: Option<String>,
    },
    Rename { folder: String, new_title: String },
    /// File an article into a folder; no folder clears it
    Assign { id: i64, folder: Option<String> },
}

#[derive(Subcommand, Debug)]
enum TagCommand {
    List {
        #[arg(long)]
        json: bool,
    },
    Rename { old: String, new: String },
}

#[derive(Subcommand, Debug)]
enum FeedCommand {
    /// Subscribe to a feed
    Add {
        url: String,
        #[arg(long)]
        name: Option<String>,
        /// Tags for every ingested article, comma-separated
        #[arg(long)]
        tags: Option<String>,
    },
    List {
        #[arg(long)]
        json: bool,
    },
    Remove { url: String },
    /// Replace the tags applied to a feed's new articles
    Tag { url: String, tags: String },
    /// Pause or resume a subscription
    Active {
        url: String,
        #[arg(action = clap::ArgAction::Set)]
        active: bool,
    },
    /// Fetch active feeds and ingest unseen entries
    Sync {
        /// Only this feed (even when paused)
        #[arg(long)]
        url: Option<String>,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Debug, Default)]
struct FilterArgs {
    /// Folder title or path (repeatable, any-of)
    #[arg(long = "folder")]
    folders: Vec<String>,
    /// Required tag (repeatable, all-of)
    #[arg(long = "tag")]
    tags: Vec<String>,
    /// Tag of which at least one must match (repeatable)
    #[arg(long = "any-tag")]
    any_tags: Vec<String>,
    /// Saved at or after: today, yesterday, 3d, 2w, 1m, 1y, 2024-01-31, RFC 3339
    #[arg(long)]
    since: Option<String>,
    /// Saved at or before (same forms; whole days include the full day)
    #[arg(long)]
    until: Option<String>,
    /// Only articles with fetched content
    #[arg(long)]
    synced: bool,
}

impl FilterArgs {
    fn to_filter(&self, now: DateTime<Utc>) -> Result<ArticleFilter> {
        let since = self
            .since
            .as_deref()
            .map(|expr| parse_relative_date(expr, now))
            .transpose()
            .context("invalid --since")?;
        let until = self
            .until
            .as_deref()
            .map(|expr| parse_until(expr, now))
            .transpose()
            .context("invalid --until")?;

        Ok(ArticleFilter {
            folders: self.folders.clone(),
            all_tags: self.tags.clone(),
            any_tags: self.any_tags.clone(),
            since,
            until,
            synced_only: self.synced,
        })
    }
}

fn init_logging(log_file: Option<&Path>) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("shelf=info"));

    match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file '{}'", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

async fn open_database(path: &Path) -> Result<Database> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if !parent.exists() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory '{}'", parent.display()))?;

            // User-only access on Unix
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Err(e) = std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700)) {
                    tracing::warn!(path = %parent.display(), error = %e, "Failed to set directory permissions to 0700");
                }
            }
        }
    }

    let path_str = path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    match Database::open(path_str).await {
        Ok(db) => Ok(db),
        Err(DatabaseError::InstanceLocked) => {
            eprintln!("Error: the library database is locked by another shelf process. Try again when it finishes.");
            std::process::exit(1);
        }
        Err(e) => Err(anyhow::anyhow!("Failed to open database: {}", e)),
    }
}

fn content_source(config: &Config) -> Result<Arc<dyn ContentSource>> {
    let fetch = &config.fetch;
    let source: Arc<dyn ContentSource> = match fetch.backend {
        ContentBackend::Direct => Arc::new(
            DirectSource::new(
                &fetch.user_agent,
                fetch.timeout(),
                fetch.max_body_bytes,
                fetch.allow_private_hosts,
                fetch.wrap_width,
            )
            .context("Failed to build HTTP client")?,
        ),
        ContentBackend::Jina => Arc::new(JinaSource::new(
            fetch.jina_base_url.as_deref(),
            fetch.api_key(),
            fetch.timeout(),
            fetch.max_body_bytes,
            fetch.allow_private_hosts,
        )?),
    };
    Ok(source)
}

fn validate_search_text(query: &str) -> Result<()> {
    if query.trim().is_empty() {
        anyhow::bail!("search query is empty");
    }
    if query.len() > MAX_SEARCH_QUERY_LENGTH {
        anyhow::bail!("search query too long (max {} bytes)", MAX_SEARCH_QUERY_LENGTH);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log.as_deref())?;

    let config = match cli.config.clone().or_else(Config::default_path) {
        Some(path) => Config::load(&path)
            .with_context(|| format!("Failed to load config '{}'", path.display()))?,
        None => Config::default(),
    };
    let db_path = cli.db.clone().unwrap_or_else(|| config.resolved_database_path());
    let db = open_database(&db_path).await?;

    let result = run(cli.command, &db, &config).await;
    db.close().await;
    result
}

async fn run(command: Command, db: &Database, config: &Config) -> Result<()> {
    let now = Utc::now();

    match command {
        Command::Import { csv } => {
            let report = import_csv_file(db, &csv).await?;
            println!(
                "Imported {} of {} rows ({} new, {} updated, {} skipped)",
                report.imported, report.rows, report.inserted, report.updated, report.skipped
            );
        }

        Command::Fetch {
            limit,
            order,
            search,
            prefer_extracted_title,
            store_raw,
            json,
        } => {
            let pipeline = FetchPipeline::new(db.clone(), content_source(config)?)
                .with_pacing(config.fetch.pacing());
            let options = FetchOptions {
                candidates: CandidateQuery {
                    limit: limit.unwrap_or(config.fetch.default_limit),
                    order,
                    search,
                },
                prefer_extracted_title,
                store_raw,
            };

            let cancel = CancelFlag::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("Interrupt received, stopping after the current article");
                    on_signal.cancel();
                }
            });

            let report = pipeline.run(&options, &cancel).await?;
            if json {
                render::print_json(&report)?;
            } else {
                println!(
                    "Fetched {} of {} selected: {} synced, {} failed{}",
                    report.outcomes.len(),
                    report.selected,
                    report.synced(),
                    report.failed(),
                    if report.cancelled { " (interrupted)" } else { "" }
                );
            }
        }

        Command::Search {
            query,
            field,
            fts,
            limit,
            filter,
            json,
        } => {
            validate_search_text(&query)?;
            let search = SearchQuery {
                text: query,
                field,
                mode: if fts { SearchMode::FullText } else { SearchMode::Keyword },
                filter: filter.to_filter(now)?,
                limit,
            };
            let hits = db.search(&search).await?;
            if json {
                render::print_json(&hits)?;
            } else {
                render::hits(&hits);
            }
        }

        Command::Latest { limit, filter, json } => {
            let hits = db.latest(&filter.to_filter(now)?, limit).await?;
            if json {
                render::print_json(&hits)?;
            } else {
                render::hits(&hits);
            }
        }

        Command::Export { id, out, stdout } => {
            if out.is_none() && !stdout {
                anyhow::bail!("choose an output: --out <FILE> or --stdout");
            }
            let mut console = std::io::stdout().lock();
            export_article(db, id, out.as_deref(), &mut console).await?;
            if let Some(path) = out {
                println!("Exported article {} to {}", id, path.display());
            }
        }

        Command::ExportAll {
            dir,
            include_unsynced,
            from_search,
            field,
            fts,
            limit,
            filter,
        } => {
            let directory = dir
                .or_else(|| config.export.directory.clone())
                .context("no export directory: pass --dir or set [export].directory")?;
            let search = match from_search {
                Some(text) => {
                    validate_search_text(&text)?;
                    Some(ExportSearch {
                        text,
                        field,
                        mode: if fts { SearchMode::FullText } else { SearchMode::Keyword },
                        limit,
                    })
                }
                None => None,
            };
            let options = ExportOptions {
                directory,
                filter: filter.to_filter(now)?,
                include_unsynced,
                search,
            };
            let report = export_all(db, &options).await?;
            println!(
                "Exported {} of {} articles to {} ({} unsynced skipped, {} failed)",
                report.written.len(),
                report.selected,
                options.directory.display(),
                report.skipped_unsynced,
                report.failed
            );
        }

        Command::Folders(cmd) => match cmd {
            FolderCommand::List { json } => {
                let folders = db.list_folders().await?;
                if json {
                    render::print_json(&folders)?;
                } else {
                    render::folders(&folders);
                }
            }
            FolderCommand::Mkdir { title, parent } => {
                let id = db.create_folder(&title, parent.as_deref()).await?;
                println!("Created folder {} ({})", title, id);
            }
            FolderCommand::Mv { folder, parent } => {
                db.move_folder(&folder, parent.as_deref()).await?;
                println!("Moved folder {}", folder);
            }
            FolderCommand::Rename { folder, new_title } => {
                db.rename_folder(&folder, &new_title).await?;
                println!("Renamed folder {} to {}", folder, new_title);
            }
            FolderCommand::Assign { id, folder } => {
                db.set_article_folder(id, folder.as_deref()).await?;
                match folder {
                    Some(folder) => println!("Filed article {} under {}", id, folder),
                    None => println!("Removed article {} from its folder", id),
                }
            }
        },

        Command::Tags(cmd) => match cmd {
            TagCommand::List { json } => {
                let tags = db.list_tags().await?;
                if json {
                    render::print_json(&tags)?;
                } else {
                    render::tags(&tags);
                }
            }
            TagCommand::Rename { old, new } => {
                db.rename_tag(&old, &new).await?;
                println!("Renamed tag {} to {}", old, new);
            }
        },

        Command::Feeds(cmd) => run_feeds(cmd, db, config).await?,

        Command::Obsolete {
            ids,
            status_codes,
            min_failures,
            dry_run,
            confirm,
            json,
        } => {
            let selector = ObsoleteSelector {
                ids,
                status_codes,
                min_failures,
            };
            if selector.is_empty() {
                anyhow::bail!("give at least one of --ids, --status-codes, --min-failures");
            }
            if !dry_run && !confirm {
                anyhow::bail!("marking articles obsolete cannot be undone: pass --dry-run to preview or --confirm to apply");
            }
            let sweep = db.mark_obsolete(&selector, dry_run).await?;
            if json {
                render::print_json(&sweep)?;
            } else {
                render::sweep(&sweep);
            }
        }

        Command::ListObsolete { limit, json } => {
            let articles = db.list_obsolete(limit).await?;
            if json {
                render::print_json(&articles)?;
            } else {
                render::obsolete(&articles);
            }
        }

        Command::Stats { json } => {
            let stats = db.library_stats().await?;
            if json {
                render::print_json(&stats)?;
            } else {
                render::stats(&stats);
            }
        }

        Command::Doctor { json } => {
            let report = db.repair().await?;
            if json {
                render::print_json(&report)?;
            } else {
                render::repair(&report);
            }
        }
    }

    Ok(())
}

async fn run_feeds(cmd: FeedCommand, db: &Database, config: &Config) -> Result<()> {
    match cmd {
        FeedCommand::Add { url, name, tags } => {
            let url = FeedUrl::parse(&url)?;
            let tags = tags.as_deref().map(parse_tag_list).unwrap_or_default();
            let id = db.add_feed(&url, name.as_deref(), &tags).await?;
            println!("Subscribed to {} ({})", url, id);
        }
        FeedCommand::List { json } => {
            let feeds = db.list_feeds().await?;
            if json {
                render::print_json(&feeds)?;
            } else {
                render::feeds(&feeds);
            }
        }
        FeedCommand::Remove { url } => {
            let url = CanonicalUrl::parse(&url)?;
            db.remove_feed(&url).await?;
            println!("Unsubscribed from {}", url);
        }
        FeedCommand::Tag { url, tags } => {
            let url = CanonicalUrl::parse(&url)?;
            db.set_feed_tags(&url, &parse_tag_list(&tags)).await?;
            println!("Updated tags for {}", url);
        }
        FeedCommand::Active { url, active } => {
            let url = CanonicalUrl::parse(&url)?;
            db.set_feed_active(&url, active).await?;
            println!("{} {}", if active { "Resumed" } else { "Paused" }, url);
        }
        FeedCommand::Sync { url, json } => {
            let feeds = match url {
                Some(url) => {
                    let url = CanonicalUrl::parse(&url)?;
                    let feed = db
                        .get_feed(&url)
                        .await?
                        .with_context(|| format!("no subscription for {}", url))?;
                    vec![feed]
                }
                None => db.active_feeds().await?,
            };

            let client = FeedClient::new(
                Some(&config.fetch.user_agent),
                config.feeds.timeout(),
                config.feeds.max_body_bytes,
                config.fetch.allow_private_hosts,
            )
            .context("Failed to build HTTP client")?;
            let outcomes = sync_feeds(db, &client, feeds, config.feeds.concurrency, &SystemClock).await?;

            if json {
                render::print_json(&outcomes)?;
            } else if outcomes.is_empty() {
                println!("No active feeds.");
            } else {
                for outcome in &outcomes {
                    match &outcome.error {
                        Some(err) => println!("{}: failed: {}", outcome.url, err),
                        None => println!(
                            "{}: {} new, {} already saved",
                            outcome.url, outcome.ingest.new_articles, outcome.ingest.already_known
                        ),
                    }
                }
            }
        }
    }
    Ok(())
}
