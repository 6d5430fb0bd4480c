use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::time::Duration;

use super::parser::{parse_feed, ParsedFeed};
use super::FeedError;
use crate::content::DEFAULT_USER_AGENT;
use crate::retry::Clock;
use crate::storage::{ArticleDraft, Database, Feed};
use crate::util::validate_url;

pub const DEFAULT_FEED_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_FEED_BYTES: usize = 5 * 1024 * 1024;
pub const DEFAULT_FEED_CONCURRENCY: usize = 4;

/// HTTP side of feed syncing.
#[derive(Clone)]
pub struct FeedClient {
    client: reqwest::Client,
    timeout: Duration,
    max_body_bytes: usize,
    allow_private_hosts: bool,
}

impl FeedClient {
    pub fn new(
        user_agent: Option<&str>,
        timeout: Duration,
        max_body_bytes: usize,
        allow_private_hosts: bool,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent.unwrap_or(DEFAULT_USER_AGENT))
            .connect_timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            timeout,
            max_body_bytes,
            allow_private_hosts,
        })
    }

    /// Download and parse one feed document.
    pub async fn fetch(&self, url: &str) -> Result<ParsedFeed, FeedError> {
        let parsed_url = validate_url(url, self.allow_private_hosts)
            .map_err(|e| FeedError::Rejected(e.to_string()))?;

        let bytes = tokio::time::timeout(self.timeout, self.retrieve(parsed_url.as_str()))
            .await
            .map_err(|_| FeedError::Timeout)??;

        parse_feed(&bytes)
    }

    async fn retrieve(&self, url: &str) -> Result<Vec<u8>, FeedError> {
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(FeedError::HttpStatus(response.status().as_u16()));
        }
        read_limited_bytes(response, self.max_body_bytes).await
    }
}

async fn read_limited_bytes(response: reqwest::Response, limit: usize) -> Result<Vec<u8>, FeedError> {
    // Fast path: check Content-Length header
    if let Some(len) = response.content_length() {
        if len > limit as u64 {
            return Err(FeedError::TooLarge(limit));
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FeedError::TooLarge(limit));
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(bytes)
}

/// Counts from ingesting one parsed feed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FeedIngest {
    pub new_articles: usize,
    /// Entries whose URL was already in the library
    pub already_known: usize,
    /// Entries without a usable link
    pub skipped: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedSyncOutcome {
    pub feed_id: i64,
    pub url: String,
    #[serde(flatten)]
    pub ingest: FeedIngest,
    /// Set when the feed could not be fetched or parsed
    pub error: Option<String>,
}

/// Insert every unseen entry of `parsed` with the feed's tags attached.
///
/// Entries without a date take `now` as their provenance. Existing articles
/// are left untouched.
pub async fn ingest_feed(
    db: &Database,
    feed: &Feed,
    parsed: &ParsedFeed,
    now: DateTime<Utc>,
) -> Result<FeedIngest> {
    let mut ingest = FeedIngest {
        skipped: parsed.skipped,
        ..FeedIngest::default()
    };

    for entry in &parsed.entries {
        let draft = ArticleDraft {
            url: entry.link.clone(),
            title: entry.title.clone(),
            selection: None,
            folder_id: None,
            provenance_at: entry.published.unwrap_or(now),
        };
        match db.insert_if_unseen(&draft, &feed.tags).await? {
            Some(article_id) => {
                tracing::debug!(feed_id = feed.id, article_id, url = %entry.link, "Ingested feed entry");
                ingest.new_articles += 1;
            }
            None => ingest.already_known += 1,
        }
    }

    db.mark_feed_synced(feed.id, now).await?;
    Ok(ingest)
}

/// Sync a set of subscriptions.
///
/// Feeds are downloaded concurrently (at most `concurrency` at a time) and
/// ingested one after another so writes never contend. A feed that fails to
/// download or parse is reported and the rest carry on; store errors abort.
/// Outcomes are ordered by feed id.
pub async fn sync_feeds(
    db: &Database,
    client: &FeedClient,
    feeds: Vec<Feed>,
    concurrency: usize,
    clock: &dyn Clock,
) -> Result<Vec<FeedSyncOutcome>> {
    if feeds.is_empty() {
        return Ok(Vec::new());
    }

    let mut fetched: Vec<(Feed, Result<ParsedFeed, FeedError>)> = stream::iter(feeds)
        .map(|feed| {
            let client = client.clone();
            async move {
                let result = client.fetch(&feed.url).await;
                (feed, result)
            }
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;
    fetched.sort_by_key(|(feed, _)| feed.id);

    let mut outcomes = Vec::with_capacity(fetched.len());
    for (feed, result) in fetched {
        let outcome = match result {
            Ok(parsed) => {
                let ingest = ingest_feed(db, &feed, &parsed, clock.now()).await?;
                tracing::info!(
                    feed_id = feed.id,
                    url = %feed.url,
                    new_articles = ingest.new_articles,
                    already_known = ingest.already_known,
                    skipped = ingest.skipped,
                    "Synced feed"
                );
                FeedSyncOutcome {
                    feed_id: feed.id,
                    url: feed.url,
                    ingest,
                    error: None,
                }
            }
            Err(e) => {
                tracing::warn!(feed_id = feed.id, url = %feed.url, error = %e, "Feed sync failed");
                FeedSyncOutcome {
                    feed_id: feed.id,
                    url: feed.url,
                    ingest: FeedIngest::default(),
                    error: Some(e.to_string()),
                }
            }
        };
        outcomes.push(outcome);
    }

    Ok(outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const VALID_RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
    <item><title>Test</title><link>https://example.com/post</link></item>
</channel></rss>"#;

    fn client(limit: usize) -> FeedClient {
        FeedClient::new(None, Duration::from_secs(5), limit, true).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(VALID_RSS)
                    .insert_header("Content-Type", "application/xml"),
            )
            .mount(&server)
            .await;

        let parsed = client(1024 * 1024)
            .fetch(&format!("{}/feed", server.uri()))
            .await
            .unwrap();
        assert_eq!(parsed.entries.len(), 1);
        assert_eq!(parsed.entries[0].link.as_str(), "https://example.com/post");
    }

    #[tokio::test]
    async fn test_fetch_404_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = client(1024).fetch(&format!("{}/feed", server.uri())).await.unwrap_err();
        assert!(matches!(err, FeedError::HttpStatus(404)));
    }

    #[tokio::test]
    async fn test_oversized_feed_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(VALID_RSS))
            .mount(&server)
            .await;

        let err = client(16).fetch(&format!("{}/feed", server.uri())).await.unwrap_err();
        assert!(matches!(err, FeedError::TooLarge(16)));
    }

    #[tokio::test]
    async fn test_private_feed_host_refused() {
        let strict = FeedClient::new(None, Duration::from_secs(5), 1024, false).unwrap();
        let err = strict.fetch("http://127.0.0.1:9/feed").await.unwrap_err();
        assert!(matches!(err, FeedError::Rejected(_)));
    }
}
