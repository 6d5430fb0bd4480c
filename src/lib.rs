//! A personal article library.
//!
//! Articles enter the library from a CSV export ([`import`]) or from RSS/Atom
//! subscriptions ([`feed`]), are keyed by their [`canonical`] URL, and have
//! their readable content retrieved by the [`fetcher`] under the [`retry`]
//! policy. Everything lives in one SQLite database behind
//! [`storage::Database`], with a full-text projection kept in step with every
//! write. Articles can be searched, listed, and written out as Markdown
//! documents ([`export`]).

pub mod canonical;
pub mod config;
pub mod content;
pub mod export;
pub mod feed;
pub mod fetcher;
pub mod import;
pub mod retry;
pub mod storage;
pub mod util;
