//! Library organisation: upserts, folders, tags, search and maintenance.

use chrono::{TimeDelta, TimeZone, Utc};
use pretty_assertions::assert_eq;

use shelf::canonical::CanonicalUrl;
use shelf::util::{parse_relative_date, parse_until};
use shelf::storage::{
    ArticleDraft, ArticleFilter, Database, FetchSuccess, SearchField, SearchQuery,
};

async fn test_db() -> Database {
    Database::open(":memory:").await.unwrap()
}

fn draft(url: &str, title: &str, day: i64) -> ArticleDraft {
    ArticleDraft {
        url: CanonicalUrl::parse(url).unwrap(),
        title: title.to_string(),
        selection: None,
        folder_id: None,
        provenance_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap() + TimeDelta::days(day),
    }
}

fn tags(titles: &[&str]) -> Vec<String> {
    titles.iter().map(|t| t.to_string()).collect()
}

#[tokio::test]
async fn test_upsert_keyed_by_canonical_url() {
    let db = test_db().await;
    let first = db
        .upsert_article(&draft("http://example.com/a/", "A", 0))
        .await
        .unwrap();
    let second = db
        .upsert_article(&draft("https://example.com/a#comments", "A again", 1))
        .await
        .unwrap();

    assert!(first.inserted);
    assert!(!second.inserted);
    assert_eq!(first.id, second.id);

    let article = db.get_article(first.id).await.unwrap().unwrap();
    assert_eq!(article.title, "A again");
    assert_eq!(db.latest(&ArticleFilter::default(), 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_upsert_keeps_sync_outcome() {
    let db = test_db().await;
    let id = db
        .upsert_article(&draft("https://example.com/a", "A", 0))
        .await
        .unwrap()
        .id;
    db.record_fetch_success(
        id,
        &FetchSuccess {
            content: "Stored text".to_string(),
            final_url: "https://example.com/a".to_string(),
            status_code: 200,
            title: None,
            raw_html: None,
        },
        Utc::now(),
    )
    .await
    .unwrap();

    db.upsert_article(&draft("https://example.com/a", "Renamed", 0))
        .await
        .unwrap();
    let article = db.get_article(id).await.unwrap().unwrap();
    assert_eq!(article.title, "Renamed");
    assert_eq!(article.content.as_deref(), Some("Stored text"));
    assert!(article.synced_at.is_some());

    let entry = db.projection_entry(id).await.unwrap().unwrap();
    assert_eq!(entry.title, "Renamed");
    assert_eq!(entry.content, "Stored text");
}

#[tokio::test]
async fn test_replace_tags_is_a_full_replacement() {
    let db = test_db().await;
    let id = db
        .upsert_article(&draft("https://example.com/a", "A", 0))
        .await
        .unwrap()
        .id;

    db.replace_tags(id, &tags(&["rust", "async", "rust"])).await.unwrap();
    assert_eq!(db.get_snapshot(id).await.unwrap().unwrap().tags, tags(&["async", "rust"]));

    db.replace_tags(id, &tags(&["databases"])).await.unwrap();
    assert_eq!(db.get_snapshot(id).await.unwrap().unwrap().tags, tags(&["databases"]));
    assert_eq!(db.projection_entry(id).await.unwrap().unwrap().tags, "databases");
}

#[tokio::test]
async fn test_folder_tree_paths_follow_moves_and_renames() {
    let db = test_db().await;
    db.create_folder("Tech", None).await.unwrap();
    db.create_folder("Rust", Some("Tech")).await.unwrap();
    db.create_folder("Async", Some("Rust")).await.unwrap();

    let id = db
        .upsert_article(&draft("https://example.com/a", "A", 0))
        .await
        .unwrap()
        .id;
    db.set_article_folder(id, Some("Tech/Rust/Async")).await.unwrap();
    assert_eq!(db.projection_entry(id).await.unwrap().unwrap().folder, "Tech/Rust/Async");

    db.rename_folder("Tech", "Engineering").await.unwrap();
    let snapshot = db.get_snapshot(id).await.unwrap().unwrap();
    assert_eq!(snapshot.folder_path.as_deref(), Some("Engineering/Rust/Async"));
    assert_eq!(
        db.projection_entry(id).await.unwrap().unwrap().folder,
        "Engineering/Rust/Async"
    );

    db.move_folder("Async", None).await.unwrap();
    let paths: Vec<String> = db
        .list_folders()
        .await
        .unwrap()
        .into_iter()
        .map(|f| f.path)
        .collect();
    assert_eq!(paths, vec!["Async", "Engineering", "Engineering/Rust"]);
    assert_eq!(db.projection_entry(id).await.unwrap().unwrap().folder, "Async");
}

#[tokio::test]
async fn test_folder_cycles_rejected() {
    let db = test_db().await;
    db.create_folder("Tech", None).await.unwrap();
    db.create_folder("Rust", Some("Tech")).await.unwrap();

    assert!(db.move_folder("Tech", Some("Rust")).await.is_err());
    assert!(db.move_folder("Tech", Some("Tech")).await.is_err());

    let rust = db
        .list_folders()
        .await
        .unwrap()
        .into_iter()
        .find(|f| f.title == "Rust")
        .unwrap();
    assert_eq!(rust.path, "Tech/Rust");
}

#[tokio::test]
async fn test_folder_name_clashes_rejected() {
    let db = test_db().await;
    db.create_folder("Tech", None).await.unwrap();
    db.create_folder("News", None).await.unwrap();

    assert!(db.create_folder("Tech", None).await.is_err());
    assert!(db.create_folder("  ", None).await.is_err());
    assert!(db.rename_folder("News", "Tech").await.is_err());
    assert!(db.create_folder("Child", Some("Missing")).await.is_err());
    assert!(db.set_article_folder(999, Some("Tech")).await.is_err());
}

#[tokio::test]
async fn test_rename_tag_updates_projection() {
    let db = test_db().await;
    let id = db
        .upsert_article(&draft("https://example.com/a", "A", 0))
        .await
        .unwrap()
        .id;
    db.replace_tags(id, &tags(&["rust", "go"])).await.unwrap();

    db.rename_tag("rust", "rustlang").await.unwrap();
    assert_eq!(db.get_snapshot(id).await.unwrap().unwrap().tags, tags(&["go", "rustlang"]));
    assert_eq!(db.projection_entry(id).await.unwrap().unwrap().tags, "go, rustlang");

    assert!(db.rename_tag("rustlang", "go").await.is_err());
    assert!(db.rename_tag("missing", "other").await.is_err());
    assert!(db.rename_tag("go", "").await.is_err());

    let listed: Vec<(String, i64)> = db
        .list_tags()
        .await
        .unwrap()
        .into_iter()
        .map(|t| (t.title, t.article_count))
        .collect();
    assert_eq!(listed, vec![("go".to_string(), 1), ("rustlang".to_string(), 1)]);
}

#[tokio::test]
async fn test_search_filters_combine() {
    let db = test_db().await;
    db.create_folder("Tech", None).await.unwrap();

    let a = db
        .upsert_article(&draft("https://example.com/rust-tips", "Rust tips", 0))
        .await
        .unwrap()
        .id;
    let b = db
        .upsert_article(&draft("https://example.com/rust-news", "Rust news", 5))
        .await
        .unwrap()
        .id;
    let c = db
        .upsert_article(&draft("https://example.com/cooking", "Cooking", 10))
        .await
        .unwrap()
        .id;
    db.set_article_folder(a, Some("Tech")).await.unwrap();
    db.replace_tags(a, &tags(&["rust", "howto"])).await.unwrap();
    db.replace_tags(b, &tags(&["rust"])).await.unwrap();
    db.replace_tags(c, &tags(&["food"])).await.unwrap();

    let ids = |hits: Vec<shelf::storage::SearchHit>| hits.into_iter().map(|h| h.id).collect::<Vec<_>>();

    // Newest provenance first
    assert_eq!(ids(db.search(&SearchQuery::keyword("RUST")).await.unwrap()), vec![b, a]);

    let mut in_title = SearchQuery::keyword("cooking");
    in_title.field = Some(SearchField::Title);
    assert_eq!(ids(db.search(&in_title).await.unwrap()), vec![c]);

    let mut by_folder = SearchQuery::keyword("rust");
    by_folder.filter.folders = vec!["Tech".to_string()];
    assert_eq!(ids(db.search(&by_folder).await.unwrap()), vec![a]);

    let mut all_tags = SearchQuery::keyword("rust");
    all_tags.filter.all_tags = tags(&["rust", "howto"]);
    assert_eq!(ids(db.search(&all_tags).await.unwrap()), vec![a]);

    let any = ArticleFilter {
        any_tags: tags(&["howto", "food"]),
        ..ArticleFilter::default()
    };
    assert_eq!(ids(db.latest(&any, 10).await.unwrap()), vec![c, a]);

    let window = ArticleFilter {
        since: Some(Utc.timestamp_opt(1_700_000_000, 0).unwrap() + TimeDelta::days(1)),
        until: Some(Utc.timestamp_opt(1_700_000_000, 0).unwrap() + TimeDelta::days(5)),
        ..ArticleFilter::default()
    };
    assert_eq!(ids(db.latest(&window, 10).await.unwrap()), vec![b]);

    let synced = ArticleFilter {
        synced_only: true,
        ..ArticleFilter::default()
    };
    assert!(db.latest(&synced, 10).await.unwrap().is_empty());
    assert_eq!(ids(db.latest(&ArticleFilter::default(), 2).await.unwrap()), vec![c, b]);
}

#[tokio::test]
async fn test_stats_and_repair_on_healthy_library() {
    let db = test_db().await;
    db.create_folder("Tech", None).await.unwrap();
    let a = db
        .upsert_article(&draft("https://example.com/a", "A", 0))
        .await
        .unwrap()
        .id;
    let b = db
        .upsert_article(&draft("https://example.com/b", "B", 1))
        .await
        .unwrap()
        .id;
    db.replace_tags(a, &tags(&["x"])).await.unwrap();
    db.record_fetch_failure(b, 503, "Service Unavailable", Utc::now())
        .await
        .unwrap();

    let stats = db.library_stats().await.unwrap();
    assert_eq!(stats.total_articles, 2);
    assert_eq!(stats.synced_articles, 0);
    assert_eq!(stats.unsynced_articles, 2);
    assert_eq!(stats.obsolete_articles, 0);
    assert_eq!((stats.folders, stats.tags, stats.feeds), (1, 1, 0));
    assert_eq!(stats.failing_status_codes.len(), 1);
    assert_eq!(stats.failing_status_codes[0].status_code, 503);

    let report = db.repair().await.unwrap();
    assert!(report.is_healthy());
    assert!(report.projection_after.is_consistent);
    assert_eq!(report.projection_after.articles_count, 2);
    assert!(db.check_projection().await.unwrap().is_consistent);
}

#[tokio::test]
async fn test_until_today_keeps_articles_saved_today() {
    let db = test_db().await;
    let now = Utc.with_ymd_and_hms(2024, 5, 10, 12, 0, 0).unwrap();
    let saved = |url: &str, at| ArticleDraft {
        url: CanonicalUrl::parse(url).unwrap(),
        title: url.to_string(),
        selection: None,
        folder_id: None,
        provenance_at: at,
    };
    let yesterday = db
        .upsert_article(&saved("https://example.com/y", Utc.with_ymd_and_hms(2024, 5, 9, 18, 0, 0).unwrap()))
        .await
        .unwrap()
        .id;
    let this_morning = db
        .upsert_article(&saved("https://example.com/m", Utc.with_ymd_and_hms(2024, 5, 10, 8, 0, 0).unwrap()))
        .await
        .unwrap()
        .id;
    let tonight = db
        .upsert_article(&saved("https://example.com/n", Utc.with_ymd_and_hms(2024, 5, 10, 22, 0, 0).unwrap()))
        .await
        .unwrap()
        .id;

    let ids = |hits: Vec<shelf::storage::SearchHit>| hits.into_iter().map(|h| h.id).collect::<Vec<_>>();
    let until = |expr: &str| ArticleFilter {
        until: Some(parse_until(expr, now).unwrap()),
        ..ArticleFilter::default()
    };

    assert_eq!(ids(db.latest(&until("today"), 10).await.unwrap()), vec![tonight, this_morning, yesterday]);
    assert_eq!(ids(db.latest(&until("yesterday"), 10).await.unwrap()), vec![yesterday]);
    assert_eq!(ids(db.latest(&until("2h"), 10).await.unwrap()), vec![this_morning, yesterday]);

    let today_only = ArticleFilter {
        since: Some(parse_relative_date("today", now).unwrap()),
        until: Some(parse_until("today", now).unwrap()),
        ..ArticleFilter::default()
    };
    assert_eq!(ids(db.latest(&today_only, 10).await.unwrap()), vec![tonight, this_morning]);
}
