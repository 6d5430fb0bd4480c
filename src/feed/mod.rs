//! Feed ingestion: RSS/Atom subscriptions as a source of new articles.
//!
//! - [`parser`] turns a feed document into canonical entries via `feed-rs`
//! - [`sync`] fetches subscriptions concurrently and inserts unseen entries
//!
//! Ingestion never touches an article that already exists, so re-syncing a
//! feed is harmless and obsolete articles stay obsolete.

mod parser;
mod sync;

use thiserror::Error;

pub use parser::{parse_feed, FeedEntry, ParsedFeed};
pub use sync::{
    ingest_feed, sync_feeds, FeedClient, FeedIngest, FeedSyncOutcome, DEFAULT_FEED_CONCURRENCY,
    DEFAULT_FEED_TIMEOUT, DEFAULT_MAX_FEED_BYTES,
};

/// Errors from fetching or parsing a single feed.
#[derive(Debug, Error)]
pub enum FeedError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    #[error("Request timed out")]
    Timeout,
    #[error("Response larger than {0} bytes")]
    TooLarge(usize),
    /// Feed XML could not be parsed as RSS or Atom
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Refusing feed URL: {0}")]
    Rejected(String),
}
