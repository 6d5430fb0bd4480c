//! Integration tests for the fetch pipeline: candidate selection, outcome
//! persistence, cooldown and the failure ceiling.
//!
//! Retrieval is scripted through a fake `ContentSource` and time through a
//! fake `Clock`, so every scenario is deterministic.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use pretty_assertions::assert_eq;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use shelf::canonical::CanonicalUrl;
use shelf::content::{ContentSource, FailureKind, FetchedDocument, SourceError};
use shelf::fetcher::{CancelFlag, FetchOptions, FetchPipeline, FetchStatus};
use shelf::retry::{Clock, RetryPolicy, SyncState, MAX_FAILURES};
use shelf::storage::{
    ArticleDraft, CandidateOrder, CandidateQuery, Database, ObsoleteSelector, SearchQuery,
};

// ============================================================================
// Fakes
// ============================================================================

struct FakeClock(Mutex<DateTime<Utc>>);

impl FakeClock {
    fn at(start: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self(Mutex::new(start)))
    }

    fn advance(&self, by: TimeDelta) {
        let mut now = self.0.lock().unwrap();
        *now += by;
    }
}

impl Clock for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap()
    }
}

#[derive(Clone)]
enum Reply {
    Page { title: Option<&'static str>, markdown: &'static str },
    Status(u16, &'static str),
    Timeout,
}

#[derive(Default)]
struct ScriptedSource {
    replies: Mutex<HashMap<String, Reply>>,
    calls: Mutex<Vec<String>>,
    /// Cancelled after the first fetch when set
    cancel_after_first: Option<CancelFlag>,
}

impl ScriptedSource {
    fn reply(&self, url: &str, reply: Reply) {
        self.replies.lock().unwrap().insert(url.to_string(), reply);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContentSource for ScriptedSource {
    async fn fetch(&self, url: &str) -> Result<FetchedDocument, SourceError> {
        self.calls.lock().unwrap().push(url.to_string());
        if let Some(cancel) = &self.cancel_after_first {
            cancel.cancel();
        }

        let reply = self
            .replies
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .unwrap_or(Reply::Page {
                title: Some("Fetched Title"),
                markdown: "# Heading\n\nReadable body text.",
            });

        match reply {
            Reply::Page { title, markdown } => Ok(FetchedDocument {
                final_url: format!("{}?final", url),
                status_code: 200,
                title: title.map(str::to_string),
                markdown: markdown.to_string(),
                raw_html: Some("<html><body>raw</body></html>".to_string()),
            }),
            Reply::Status(status, reason) => Err(SourceError::Remote {
                status,
                reason: reason.to_string(),
            }),
            Reply::Timeout => Err(SourceError::Timeout(Duration::from_secs(20))),
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

async fn test_db() -> Database {
    Database::open(":memory:").await.unwrap()
}

async fn add_article(db: &Database, url: &str, saved_secs: i64) -> i64 {
    let draft = ArticleDraft {
        url: CanonicalUrl::parse(url).unwrap(),
        title: format!("Saved {}", url),
        selection: None,
        folder_id: None,
        provenance_at: Utc.timestamp_opt(1_700_000_000 + saved_secs, 0).unwrap(),
    };
    db.upsert_article(&draft).await.unwrap().id
}

fn pipeline(db: &Database, source: Arc<ScriptedSource>, clock: Arc<FakeClock>) -> FetchPipeline {
    FetchPipeline::new(db.clone(), source)
        .with_clock(clock)
        .with_pacing(Duration::ZERO)
}

fn options(limit: i64) -> FetchOptions {
    FetchOptions {
        candidates: CandidateQuery {
            limit,
            ..CandidateQuery::default()
        },
        ..FetchOptions::default()
    }
}

// ============================================================================
// Outcome persistence
// ============================================================================

#[tokio::test]
async fn test_not_found_is_persisted_as_failure() {
    let db = test_db().await;
    let id = add_article(&db, "https://example.com/gone", 0).await;
    let source = Arc::new(ScriptedSource::default());
    source.reply("https://example.com/gone", Reply::Status(404, "Not Found"));
    let clock = FakeClock::at(t0());

    let report = pipeline(&db, source, clock)
        .run(&options(10), &CancelFlag::new())
        .await
        .unwrap();

    assert_eq!(report.selected, 1);
    assert_eq!(report.failed(), 1);
    assert_eq!(
        report.outcomes[0].status,
        FetchStatus::Failed {
            status_code: 404,
            reason: "Not Found".to_string(),
            kind: FailureKind::Remote,
        }
    );

    let article = db.get_article(id).await.unwrap().unwrap();
    assert_eq!(article.failed_count, 1);
    assert_eq!(article.status_code, Some(404));
    assert_eq!(article.status_text.as_deref(), Some("Not Found"));
    assert_eq!(article.sync_failed_at, Some(t0()));
    assert!(article.synced_at.is_none());
    assert!(article.content.is_none());
    assert_eq!(RetryPolicy::default().state_of(&article), SyncState::FailedRetryPending);
}

#[tokio::test]
async fn test_success_stores_content_and_indexes_it() {
    let db = test_db().await;
    let id = add_article(&db, "https://example.com/post", 0).await;
    let source = Arc::new(ScriptedSource::default());
    source.reply(
        "https://example.com/post",
        Reply::Page {
            title: Some("Page Title"),
            markdown: "[Skip to content](#main)\n# Zebra facts   \n\n\n\nStripes everywhere.\n",
        },
    );

    let report = pipeline(&db, source, FakeClock::at(t0()))
        .run(&options(10), &CancelFlag::new())
        .await
        .unwrap();
    assert_eq!(report.synced(), 1);

    let article = db.get_article(id).await.unwrap().unwrap();
    assert_eq!(article.synced_at, Some(t0()));
    assert_eq!(article.status_code, Some(200));
    assert_eq!(article.final_url.as_deref(), Some("https://example.com/post?final"));
    assert_eq!(article.content.as_deref(), Some("# Zebra facts\n\nStripes everywhere."));
    // Stored title kept and raw HTML dropped unless asked for
    assert_eq!(article.title, "Saved https://example.com/post");
    assert!(article.raw_html.is_none());

    let hits = db.search(&SearchQuery::full_text("zebra")).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, id);
}

#[tokio::test]
async fn test_prefer_extracted_title_and_store_raw() {
    let db = test_db().await;
    let id = add_article(&db, "https://example.com/post", 0).await;
    let source = Arc::new(ScriptedSource::default());

    let opts = FetchOptions {
        prefer_extracted_title: true,
        store_raw: true,
        ..options(10)
    };
    pipeline(&db, source, FakeClock::at(t0()))
        .run(&opts, &CancelFlag::new())
        .await
        .unwrap();

    let article = db.get_article(id).await.unwrap().unwrap();
    assert_eq!(article.title, "Fetched Title");
    assert_eq!(article.raw_html.as_deref(), Some("<html><body>raw</body></html>"));
}

#[tokio::test]
async fn test_content_empty_after_cleanup_is_extraction_failure() {
    let db = test_db().await;
    let id = add_article(&db, "https://example.com/menu", 0).await;
    let source = Arc::new(ScriptedSource::default());
    source.reply(
        "https://example.com/menu",
        Reply::Page {
            title: None,
            markdown: "Menu\n\n[Skip to content](#x)\n",
        },
    );

    let report = pipeline(&db, source, FakeClock::at(t0()))
        .run(&options(10), &CancelFlag::new())
        .await
        .unwrap();
    assert_eq!(report.failed(), 1);

    let article = db.get_article(id).await.unwrap().unwrap();
    assert_eq!(article.status_code, Some(200));
    assert!(article
        .status_text
        .as_deref()
        .unwrap()
        .starts_with("ExtractionError: "));
    assert!(article.content.is_none());
}

#[tokio::test]
async fn test_timeout_recorded_with_zero_status() {
    let db = test_db().await;
    let id = add_article(&db, "https://example.com/slow", 0).await;
    let source = Arc::new(ScriptedSource::default());
    source.reply("https://example.com/slow", Reply::Timeout);

    pipeline(&db, source, FakeClock::at(t0()))
        .run(&options(10), &CancelFlag::new())
        .await
        .unwrap();

    let article = db.get_article(id).await.unwrap().unwrap();
    assert_eq!(article.status_code, Some(0));
    assert_eq!(article.status_text.as_deref(), Some("Timeout"));
}

#[tokio::test]
async fn test_failure_never_clears_synced_content() {
    let db = test_db().await;
    let id = add_article(&db, "https://example.com/post", 0).await;
    pipeline(&db, Arc::new(ScriptedSource::default()), FakeClock::at(t0()))
        .run(&options(10), &CancelFlag::new())
        .await
        .unwrap();

    db.record_fetch_failure(id, 503, "Service Unavailable", t0() + TimeDelta::hours(1))
        .await
        .unwrap();

    let article = db.get_article(id).await.unwrap().unwrap();
    assert_eq!(article.content.as_deref(), Some("# Heading\n\nReadable body text."));
    assert!(article.synced_at.is_some());
    assert_eq!(article.failed_count, 1);
}

// ============================================================================
// Eligibility: cooldown, ceiling, obsolescence
// ============================================================================

#[tokio::test]
async fn test_cooldown_blocks_retry_until_an_hour_has_passed() {
    let db = test_db().await;
    let id = add_article(&db, "https://example.com/flaky", 0).await;
    let source = Arc::new(ScriptedSource::default());
    source.reply("https://example.com/flaky", Reply::Status(503, "Service Unavailable"));
    let clock = FakeClock::at(t0());
    let pipeline = pipeline(&db, source.clone(), clock.clone());

    pipeline.run(&options(10), &CancelFlag::new()).await.unwrap();

    clock.advance(TimeDelta::minutes(10));
    let report = pipeline.run(&options(10), &CancelFlag::new()).await.unwrap();
    assert_eq!(report.selected, 0);

    clock.advance(TimeDelta::minutes(51));
    source.reply("https://example.com/flaky", Reply::Page { title: None, markdown: "Back online." });
    let report = pipeline.run(&options(10), &CancelFlag::new()).await.unwrap();
    assert_eq!(report.selected, 1);
    assert_eq!(report.synced(), 1);
    assert_eq!(source.calls().len(), 2);

    // Success wipes the failure history
    let article = db.get_article(id).await.unwrap().unwrap();
    assert_eq!(article.failed_count, 0);
    assert!(article.sync_failed_at.is_none());
    assert_eq!(RetryPolicy::default().state_of(&article), SyncState::Synced);
}

#[tokio::test]
async fn test_exhausted_articles_never_selected() {
    let db = test_db().await;
    let id = add_article(&db, "https://example.com/dead", 0).await;
    for n in 0..MAX_FAILURES {
        db.record_fetch_failure(id, 500, "Internal Server Error", t0() - TimeDelta::days(30 - n))
            .await
            .unwrap();
    }

    let source = Arc::new(ScriptedSource::default());
    let clock = FakeClock::at(t0() + TimeDelta::days(365));
    let report = pipeline(&db, source.clone(), clock)
        .run(&options(10), &CancelFlag::new())
        .await
        .unwrap();

    assert_eq!(report.selected, 0);
    assert!(source.calls().is_empty());
    let article = db.get_article(id).await.unwrap().unwrap();
    assert_eq!(RetryPolicy::default().state_of(&article), SyncState::FailedExhausted);
}

#[tokio::test]
async fn test_fifth_failure_exhausts_the_article() {
    let db = test_db().await;
    let id = add_article(&db, "https://example.com/broken", 0).await;
    let source = Arc::new(ScriptedSource::default());
    source.reply("https://example.com/broken", Reply::Status(500, "Internal Server Error"));
    let clock = FakeClock::at(t0());
    let pipeline = pipeline(&db, source.clone(), clock.clone());

    for _ in 0..(MAX_FAILURES + 2) {
        pipeline.run(&options(10), &CancelFlag::new()).await.unwrap();
        clock.advance(TimeDelta::hours(2));
    }

    assert_eq!(source.calls().len() as i64, MAX_FAILURES);
    let article = db.get_article(id).await.unwrap().unwrap();
    assert_eq!(article.failed_count, MAX_FAILURES);
}

#[tokio::test]
async fn test_obsolete_articles_never_selected() {
    let db = test_db().await;
    let keep = add_article(&db, "https://example.com/keep", 0).await;
    let gone = add_article(&db, "https://example.com/drop", 1).await;
    db.mark_obsolete(&ObsoleteSelector::by_ids(vec![gone]), false)
        .await
        .unwrap();

    let source = Arc::new(ScriptedSource::default());
    let report = pipeline(&db, source.clone(), FakeClock::at(t0()))
        .run(&options(10), &CancelFlag::new())
        .await
        .unwrap();

    assert_eq!(report.selected, 1);
    assert_eq!(report.outcomes[0].article_id, keep);
    assert_eq!(source.calls(), vec!["https://example.com/keep".to_string()]);
}

#[tokio::test]
async fn test_failure_fields_stay_paired() {
    let db = test_db().await;
    let source = Arc::new(ScriptedSource::default());
    let mut ids = Vec::new();
    for i in 0..6 {
        let url = format!("https://example.com/{}", i);
        ids.push(add_article(&db, &url, i).await);
        if i % 2 == 0 {
            source.reply(&url, Reply::Status(404, "Not Found"));
        }
    }
    let clock = FakeClock::at(t0());
    let pipeline = pipeline(&db, source.clone(), clock.clone());

    for _ in 0..3 {
        pipeline.run(&options(10), &CancelFlag::new()).await.unwrap();
        clock.advance(TimeDelta::minutes(90));
        source.reply("https://example.com/2", Reply::Page { title: None, markdown: "Recovered." });

        for id in &ids {
            let article = db.get_article(*id).await.unwrap().unwrap();
            assert_eq!(
                article.failed_count == 0,
                article.sync_failed_at.is_none(),
                "article {} broke the pairing",
                id
            );
        }
    }
}

// ============================================================================
// Selection order, limits and batch control
// ============================================================================

#[tokio::test]
async fn test_order_limit_and_search() {
    let db = test_db().await;
    add_article(&db, "https://example.com/old", 0).await;
    add_article(&db, "https://example.com/mid", 100).await;
    add_article(&db, "https://news.example.org/new", 200).await;
    let clock = FakeClock::at(t0());

    let source = Arc::new(ScriptedSource::default());
    let newest = FetchOptions {
        candidates: CandidateQuery {
            limit: 2,
            order: CandidateOrder::NewestFirst,
            search: None,
        },
        ..FetchOptions::default()
    };
    pipeline(&db, source.clone(), clock.clone())
        .run(&newest, &CancelFlag::new())
        .await
        .unwrap();
    assert_eq!(
        source.calls(),
        vec![
            "https://news.example.org/new".to_string(),
            "https://example.com/mid".to_string()
        ]
    );

    let source = Arc::new(ScriptedSource::default());
    let searched = FetchOptions {
        candidates: CandidateQuery {
            limit: 10,
            order: CandidateOrder::OldestFirst,
            search: Some("OLD".to_string()),
        },
        ..FetchOptions::default()
    };
    let report = pipeline(&db, source.clone(), clock)
        .run(&searched, &CancelFlag::new())
        .await
        .unwrap();
    assert_eq!(report.selected, 1);
    assert_eq!(source.calls(), vec!["https://example.com/old".to_string()]);
}

#[tokio::test]
async fn test_cancellation_stops_between_articles() {
    let db = test_db().await;
    for i in 0..3 {
        add_article(&db, &format!("https://example.com/{}", i), i).await;
    }
    let cancel = CancelFlag::new();
    let source = Arc::new(ScriptedSource {
        cancel_after_first: Some(cancel.clone()),
        ..ScriptedSource::default()
    });

    let report = pipeline(&db, source.clone(), FakeClock::at(t0()))
        .run(&options(10), &cancel)
        .await
        .unwrap();

    assert!(report.cancelled);
    assert_eq!(report.selected, 3);
    assert_eq!(report.outcomes.len(), 1);
    assert_eq!(source.calls().len(), 1);
    // The in-flight article was still committed
    let article = db.get_article(report.outcomes[0].article_id).await.unwrap().unwrap();
    assert!(article.synced_at.is_some());
}

#[tokio::test]
async fn test_pacing_between_articles() {
    let db = test_db().await;
    for i in 0..3 {
        add_article(&db, &format!("https://example.com/{}", i), i).await;
    }
    let pipeline = FetchPipeline::new(db.clone(), Arc::new(ScriptedSource::default()))
        .with_clock(FakeClock::at(t0()))
        .with_pacing(Duration::from_millis(60));

    let started = Instant::now();
    let report = pipeline.run(&options(10), &CancelFlag::new()).await.unwrap();

    assert_eq!(report.synced(), 3);
    // Two gaps for three articles
    assert!(started.elapsed() >= Duration::from_millis(120));
}
