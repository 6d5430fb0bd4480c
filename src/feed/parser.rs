use chrono::{DateTime, Utc};
use feed_rs::parser;

use super::FeedError;
use crate::canonical::CanonicalUrl;

#[derive(Debug, Clone)]
pub struct FeedEntry {
    pub title: String,
    pub link: CanonicalUrl,
    pub published: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedFeed {
    pub title: Option<String>,
    pub entries: Vec<FeedEntry>,
    /// Entries dropped for a missing or unparseable link
    pub skipped: usize,
}

/// Parse an RSS or Atom document.
///
/// Each entry is keyed by its first link in canonical form. The title falls
/// back to the link and the date to `updated` when `published` is absent.
pub fn parse_feed(bytes: &[u8]) -> Result<ParsedFeed, FeedError> {
    let feed = parser::parse(bytes).map_err(|e| FeedError::Parse(e.to_string()))?;

    let mut parsed = ParsedFeed {
        title: feed.title.map(|t| t.content.trim().to_string()).filter(|t| !t.is_empty()),
        ..ParsedFeed::default()
    };

    for entry in feed.entries {
        let link = entry
            .links
            .first()
            .and_then(|l| CanonicalUrl::parse(&l.href).ok());
        let Some(link) = link else {
            parsed.skipped += 1;
            continue;
        };

        let title = entry
            .title
            .map(|t| t.content.trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| link.as_str().to_string());

        parsed.entries.push(FeedEntry {
            title,
            link,
            published: entry.published.or(entry.updated),
        });
    }

    Ok(parsed)
}
