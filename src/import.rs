//! Bulk import of the `URL,Title,Selection,Folder,Timestamp,Tags` CSV export.

use anyhow::{Context, Result};
use serde::Serialize;
use std::io::Read;
use std::path::Path;
use thiserror::Error;

use crate::canonical::CanonicalUrl;
use crate::storage::{Database, ImportRecord};
use crate::util::{from_unix_seconds, parse_tag_list};

pub const EXPECTED_HEADERS: [&str; 6] = ["URL", "Title", "Selection", "Folder", "Timestamp", "Tags"];

/// Why a single row was skipped.
#[derive(Debug, Error)]
pub enum RowError {
    #[error("expected 6 fields, got {0}")]
    FieldCount(usize),
    #[error(transparent)]
    InvalidUrl(#[from] crate::canonical::CanonicalUrlError),
    #[error("invalid timestamp '{0}'")]
    InvalidTimestamp(String),
    #[error("unreadable row: {0}")]
    Csv(#[from] csv::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    /// Data rows read, excluding the header
    pub rows: usize,
    pub imported: usize,
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
}

/// Turn one CSV record into an import record.
fn parse_row(record: &csv::StringRecord) -> Result<ImportRecord, RowError> {
    if record.len() != EXPECTED_HEADERS.len() {
        return Err(RowError::FieldCount(record.len()));
    }

    let url = CanonicalUrl::parse(&record[0])?;
    let raw_timestamp = record[4].trim();
    let provenance_at = raw_timestamp
        .parse::<i64>()
        .ok()
        .and_then(from_unix_seconds)
        .ok_or_else(|| RowError::InvalidTimestamp(raw_timestamp.to_string()))?;

    let title = match record[1].trim() {
        "" => url.as_str().to_string(),
        title => title.to_string(),
    };
    let selection = Some(record[2].to_string()).filter(|s| !s.trim().is_empty());
    let folder = Some(record[3].trim().to_string()).filter(|f| !f.is_empty());

    Ok(ImportRecord {
        url,
        title,
        selection,
        folder,
        provenance_at,
        tags: parse_tag_list(&record[5]),
    })
}

/// Import every row from a CSV reader.
///
/// The header must have exactly six columns; differently named headers are
/// accepted with a warning. Rows with a bad URL, timestamp or field count
/// are skipped and logged. Each accepted row is committed on its own, so a
/// failure mid-file keeps everything imported before it.
pub async fn import_csv<R: Read>(db: &Database, reader: R) -> Result<ImportReport> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(reader);

    let headers = csv_reader.headers().context("failed to read CSV header")?.clone();
    if headers.len() != EXPECTED_HEADERS.len() {
        anyhow::bail!(
            "unexpected number of CSV columns: got {}, expected {}",
            headers.len(),
            EXPECTED_HEADERS.len()
        );
    }
    for (idx, (found, expected)) in headers.iter().zip(EXPECTED_HEADERS).enumerate() {
        if found.trim() != expected {
            tracing::warn!(column = idx, found = %found, expected, "Unexpected CSV header");
        }
    }

    let mut report = ImportReport::default();
    for (idx, result) in csv_reader.records().enumerate() {
        let line = idx + 2;
        report.rows += 1;

        let record = match result.map_err(RowError::from).and_then(|r| parse_row(&r)) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(line, error = %e, "Skipping CSV row");
                report.skipped += 1;
                continue;
            }
        };

        let outcome = db
            .import_article(&record)
            .await
            .with_context(|| format!("failed to import row {} ({})", line, record.url))?;
        report.imported += 1;
        if outcome.inserted {
            report.inserted += 1;
        } else {
            report.updated += 1;
        }

        if report.imported % 100 == 0 {
            tracing::info!(imported = report.imported, "Import progress");
        }
    }

    tracing::info!(
        rows = report.rows,
        inserted = report.inserted,
        updated = report.updated,
        skipped = report.skipped,
        "Import finished"
    );
    Ok(report)
}

pub async fn import_csv_file(db: &Database, path: &Path) -> Result<ImportReport> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open CSV file {}", path.display()))?;
    import_csv(db, std::io::BufReader::new(file)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    const HEADER: &str = "URL,Title,Selection,Folder,Timestamp,Tags\n";

    #[tokio::test]
    async fn test_rows_skipped_not_fatal() {
        let db = test_db().await;
        let csv = format!(
            "{HEADER}\
             https://example.com/ok,Fine,,,1700000000,\n\
             not a url,Bad,,,1700000000,\n\
             https://example.com/ts,Bad ts,,,yesterday,\n\
             https://example.com/short,Too few\n\
             https://example.com/ok2,Also fine,quote,Later,1700000100,\"[\"\"a\"\"]\"\n"
        );

        let report = import_csv(&db, csv.as_bytes()).await.unwrap();
        assert_eq!(
            report,
            ImportReport {
                rows: 5,
                imported: 2,
                inserted: 2,
                updated: 0,
                skipped: 3,
            }
        );
    }

    #[tokio::test]
    async fn test_reimport_counts_updates() {
        let db = test_db().await;
        let csv = format!("{HEADER}https://example.com/a,A,,,1700000000,\n");
        import_csv(&db, csv.as_bytes()).await.unwrap();
        let again = import_csv(&db, csv.as_bytes()).await.unwrap();
        assert_eq!(again.inserted, 0);
        assert_eq!(again.updated, 1);
    }

    #[tokio::test]
    async fn test_wrong_column_count_rejected() {
        let db = test_db().await;
        let csv = "URL,Title\nhttps://example.com/a,A\n";
        assert!(import_csv(&db, csv.as_bytes()).await.is_err());
    }

    #[tokio::test]
    async fn test_renamed_headers_still_import() {
        let db = test_db().await;
        let csv = "url,title,selection,folder,timestamp,tags\nhttps://example.com/a,A,,,1700000000,\n";
        let report = import_csv(&db, csv.as_bytes()).await.unwrap();
        assert_eq!(report.imported, 1);
    }

    #[test]
    fn test_parse_row_blank_title_falls_back_to_url() {
        let record = csv::StringRecord::from(vec!["http://example.com/x/", "", " ", "", "0", ""]);
        let parsed = parse_row(&record).unwrap();
        assert_eq!(parsed.title, "https://example.com/x");
        assert_eq!(parsed.selection, None);
        assert_eq!(parsed.folder, None);
        assert!(parsed.tags.is_empty());
    }
}
