//! SQLite-backed article store.
//!
//! Every mutating operation is one transaction that also rewrites the
//! affected rows of the full-text projection (see [`index`]), and every read
//! path excludes obsolete articles.

mod articles;
mod feeds;
mod folders;
mod index;
mod maintenance;
mod obsolete;
mod query;
mod schema;
mod tags;
mod types;

pub use articles::CandidateQuery;
pub use obsolete::DEFAULT_OBSOLETE_LIMIT;
pub use query::{
    ArticleFilter, SearchField, SearchMode, SearchQuery, DEFAULT_LATEST_LIMIT, DEFAULT_SEARCH_LIMIT,
};
pub use schema::{Database, SCHEMA_VERSION};
pub use types::{
    Article, ArticleDraft, ArticleSnapshot, CandidateOrder, DatabaseError, DuplicateUrl,
    FailureBucket, Feed, FetchSuccess, Folder, ImportRecord, LibraryStats, ObsoleteArticle,
    ObsoleteCandidate, ObsoleteSelector, ObsoleteSweep, ProjectionEntry, ProjectionReport,
    RepairReport, SearchHit, StatusBucket, Tag, UpsertOutcome,
};
