//! Terminal output for the CLI: fixed-width tables or JSON.

use anyhow::Result;
use serde::Serialize;

use shelf::storage::{
    Feed, Folder, LibraryStats, ObsoleteArticle, ObsoleteSweep, RepairReport, SearchHit, Tag,
};
use shelf::util::{fit_to_width, strip_control_chars};

const TITLE_WIDTH: usize = 50;
const URL_WIDTH: usize = 50;
const DATE_FORMAT: &str = "%Y-%m-%d";

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Text from the library can come from arbitrary pages; never let it drive
/// the terminal.
fn cell(text: &str, width: usize) -> String {
    fit_to_width(&strip_control_chars(text), width)
}

pub fn hits(hits: &[SearchHit]) {
    if hits.is_empty() {
        println!("No articles found.");
        return;
    }
    println!(
        "{:>6}  {}  {}  {}  {}",
        "ID",
        cell("Title", TITLE_WIDTH),
        cell("Folder", 20),
        "Saved     ",
        "Synced"
    );
    for hit in hits {
        let synced = match (hit.synced_at, hit.failed_count) {
            (Some(_), _) => "yes".to_string(),
            (None, 0) => "-".to_string(),
            (None, n) => format!("failed x{}", n),
        };
        println!(
            "{:>6}  {}  {}  {}  {}",
            hit.id,
            cell(&hit.title, TITLE_WIDTH),
            cell(hit.folder_path.as_deref().unwrap_or("-"), 20),
            hit.provenance_at.format(DATE_FORMAT),
            synced
        );
        if !hit.tags.is_empty() {
            println!("{:6}  tags: {}", "", strip_control_chars(&hit.tags.join(", ")));
        }
    }
    println!("\n{} article(s)", hits.len());
}

pub fn folders(folders: &[Folder]) {
    if folders.is_empty() {
        println!("No folders.");
        return;
    }
    for folder in folders {
        println!(
            "{:>6}  {}  {:>6}",
            folder.id,
            cell(&folder.path, 60),
            folder.article_count
        );
    }
}

pub fn tags(tags: &[Tag]) {
    if tags.is_empty() {
        println!("No tags.");
        return;
    }
    for tag in tags {
        println!("{}  {:>6}", cell(&tag.title, 40), tag.article_count);
    }
}

pub fn feeds(feeds: &[Feed]) {
    if feeds.is_empty() {
        println!("No feed subscriptions.");
        return;
    }
    for feed in feeds {
        let last = feed
            .last_synced_at
            .map(|at| at.format(DATE_FORMAT).to_string())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "{:>6}  {}  {}  {:<10}  {}{}",
            feed.id,
            cell(feed.name.as_deref().unwrap_or("-"), 24),
            cell(&feed.url, URL_WIDTH),
            last,
            if feed.active { "" } else { "[inactive] " },
            feed.tags.join(", ")
        );
    }
}

pub fn sweep(sweep: &ObsoleteSweep) {
    for candidate in &sweep.candidates {
        println!(
            "{:>6}  {}  {}  status={} failures={}",
            candidate.id,
            cell(&candidate.title, TITLE_WIDTH),
            cell(&candidate.url, URL_WIDTH),
            candidate.status_code.map_or_else(|| "-".to_string(), |c| c.to_string()),
            candidate.failed_count
        );
    }
    if sweep.dry_run {
        println!(
            "\nDry run: {} article(s) would be marked obsolete. Re-run with --confirm to apply.",
            sweep.candidates.len()
        );
    } else {
        println!("\nMarked {} article(s) obsolete.", sweep.marked);
    }
}

pub fn obsolete(articles: &[ObsoleteArticle]) {
    if articles.is_empty() {
        println!("No obsolete articles.");
        return;
    }
    for article in articles {
        println!(
            "{:>6}  {}  {}  status={}",
            article.id,
            cell(&article.title, TITLE_WIDTH),
            cell(&article.url, URL_WIDTH),
            article.status_code.map_or_else(|| "-".to_string(), |c| c.to_string())
        );
    }
}

pub fn stats(stats: &LibraryStats) {
    println!("Articles:        {}", stats.total_articles);
    println!("  synced:        {}", stats.synced_articles);
    println!("  unsynced:      {}", stats.unsynced_articles);
    println!("  exhausted:     {}", stats.exhausted_articles);
    println!("Obsolete:        {}", stats.obsolete_articles);
    println!("Folders:         {}", stats.folders);
    println!("Tags:            {}", stats.tags);
    println!("Feeds:           {}", stats.feeds);

    if !stats.failures_by_count.is_empty() {
        println!("\nUnsynced articles by failure count:");
        for bucket in &stats.failures_by_count {
            println!("  {:>3} failures: {}", bucket.failed_count, bucket.articles);
        }
    }
    if !stats.failing_status_codes.is_empty() {
        println!("\nFailing articles by status code:");
        for bucket in &stats.failing_status_codes {
            println!("  {:>3}: {}", bucket.status_code, bucket.articles);
        }
    }
}

pub fn repair(report: &RepairReport) {
    println!("Integrity check:        {}", report.integrity.join("; "));
    println!("Foreign key violations: {}", report.foreign_key_violations);
    println!("Folder paths updated:   {}", report.folders_recomputed);
    println!(
        "Search index before:    {} rows for {} articles ({} missing, {} orphaned, {} stale)",
        report.projection_before.projection_count,
        report.projection_before.articles_count,
        report.projection_before.missing_entries,
        report.projection_before.orphaned_entries,
        report.projection_before.stale_entries
    );
    println!("Search index rebuilt:   {} entries", report.entries_indexed);
    if !report.duplicate_urls.is_empty() {
        println!("Duplicate URLs:");
        for dup in &report.duplicate_urls {
            println!("  {} ({} copies)", dup.url, dup.copies);
        }
    }
    println!(
        "\n{}",
        if report.is_healthy() {
            "Library is healthy."
        } else {
            "Problems remain; see above."
        }
    );
}
