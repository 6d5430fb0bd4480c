//! Integration tests for bulk obsolescence: selection, dry run, and removal
//! from every read surface.

use chrono::{TimeZone, Utc};
use pretty_assertions::assert_eq;

use shelf::canonical::CanonicalUrl;
use shelf::retry::RetryPolicy;
use shelf::storage::{
    ArticleDraft, ArticleFilter, CandidateQuery, Database, ObsoleteSelector, SearchQuery,
    DEFAULT_OBSOLETE_LIMIT,
};

async fn test_db() -> Database {
    Database::open(":memory:").await.unwrap()
}

async fn article_with_failures(db: &Database, slug: &str, failures: i64, status: i64) -> i64 {
    let draft = ArticleDraft {
        url: CanonicalUrl::parse(&format!("https://example.com/{}", slug)).unwrap(),
        title: format!("Article about {}", slug),
        selection: None,
        folder_id: None,
        provenance_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
    };
    let id = db.upsert_article(&draft).await.unwrap().id;
    for n in 0..failures {
        let at = Utc.timestamp_opt(1_700_100_000 + n * 7200, 0).unwrap();
        db.record_fetch_failure(id, status, "Not Found", at).await.unwrap();
    }
    id
}

#[tokio::test]
async fn test_min_failures_sweep() {
    let db = test_db().await;
    let dead_a = article_with_failures(&db, "alpha", 5, 404).await;
    let dead_b = article_with_failures(&db, "bravo", 5, 410).await;
    let alive = article_with_failures(&db, "charlie", 2, 404).await;
    let selector = ObsoleteSelector::by_min_failures(5);

    let preview = db.mark_obsolete(&selector, true).await.unwrap();
    assert!(preview.dry_run);
    assert_eq!(preview.marked, 0);
    let previewed: Vec<i64> = preview.candidates.iter().map(|c| c.id).collect();
    assert_eq!(previewed, vec![dead_a, dead_b]);
    assert!(db.list_obsolete(DEFAULT_OBSOLETE_LIMIT).await.unwrap().is_empty());

    let sweep = db.mark_obsolete(&selector, false).await.unwrap();
    assert_eq!(sweep.marked, 2);

    // Hidden from search, latest and export; the survivor is still there
    let hits = db.search(&SearchQuery::keyword("article about")).await.unwrap();
    assert_eq!(hits.iter().map(|h| h.id).collect::<Vec<_>>(), vec![alive]);
    let latest = db.latest(&ArticleFilter::default(), 10).await.unwrap();
    assert_eq!(latest.len(), 1);
    let exportable = db.export_candidates(&ArticleFilter::default()).await.unwrap();
    assert_eq!(exportable.len(), 1);
    assert!(db.get_snapshot(dead_a).await.unwrap().is_none());
    assert!(db.search(&SearchQuery::full_text("alpha")).await.unwrap().is_empty());

    // Still loadable directly, with the terminal state
    let article = db.get_article(dead_a).await.unwrap().unwrap();
    assert!(article.obsolete);
    assert_eq!(
        RetryPolicy::default().state_of(&article),
        shelf::retry::SyncState::Obsolete
    );

    let listed = db.list_obsolete(DEFAULT_OBSOLETE_LIMIT).await.unwrap();
    assert_eq!(listed.len(), 2);

    let report = db.check_projection().await.unwrap();
    assert!(report.is_consistent);
    assert_eq!(report.projection_count, 1);

    let stats = db.library_stats().await.unwrap();
    assert_eq!(stats.total_articles, 1);
    assert_eq!(stats.obsolete_articles, 2);

    // Re-marking matches nothing
    let again = db.mark_obsolete(&selector, false).await.unwrap();
    assert_eq!(again.marked, 0);
    assert!(again.candidates.is_empty());
}

#[tokio::test]
async fn test_status_code_sweep_combined_with_ids() {
    let db = test_db().await;
    let a = article_with_failures(&db, "a", 1, 404).await;
    let b = article_with_failures(&db, "b", 1, 404).await;
    let c = article_with_failures(&db, "c", 1, 500).await;

    let selector = ObsoleteSelector {
        ids: vec![a, c],
        status_codes: vec![404],
        min_failures: None,
    };
    let sweep = db.mark_obsolete(&selector, false).await.unwrap();
    assert_eq!(sweep.marked, 1);
    assert_eq!(sweep.candidates[0].id, a);

    assert!(!db.get_article(b).await.unwrap().unwrap().obsolete);
    assert!(!db.get_article(c).await.unwrap().unwrap().obsolete);
}

#[tokio::test]
async fn test_obsolete_never_fetched_again() {
    let db = test_db().await;
    let id = article_with_failures(&db, "never", 0, 0).await;
    db.mark_obsolete(&ObsoleteSelector::by_ids(vec![id]), false)
        .await
        .unwrap();

    let far_future = Utc.timestamp_opt(1_900_000_000, 0).unwrap();
    let candidates = db
        .fetch_candidates(&CandidateQuery::default(), &RetryPolicy::default(), far_future)
        .await
        .unwrap();
    assert!(candidates.is_empty());
}

#[tokio::test]
async fn test_obsolete_rows_excluded_from_listing_counts() {
    let db = test_db().await;
    let draft = |slug: &str| ArticleDraft {
        url: CanonicalUrl::parse(&format!("https://example.com/{}", slug)).unwrap(),
        title: slug.to_string(),
        selection: None,
        folder_id: None,
        provenance_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
    };
    let kept = db.insert_if_unseen(&draft("kept"), &["rust".to_string()]).await.unwrap().unwrap();
    let gone = db.insert_if_unseen(&draft("gone"), &["rust".to_string()]).await.unwrap().unwrap();
    db.mark_obsolete(&ObsoleteSelector::by_ids(vec![gone]), false)
        .await
        .unwrap();

    let tags = db.list_tags().await.unwrap();
    assert_eq!(tags.len(), 1);
    assert_eq!(tags[0].article_count, 1);

    let filter = ArticleFilter {
        all_tags: vec!["rust".to_string()],
        ..ArticleFilter::default()
    };
    let hits = db.latest(&filter, 10).await.unwrap();
    assert_eq!(hits.iter().map(|h| h.id).collect::<Vec<_>>(), vec![kept]);
}
