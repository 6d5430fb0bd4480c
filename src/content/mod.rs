//! Retrieving and extracting readable article content.
//!
//! A [`ContentSource`] turns an article URL into a [`FetchedDocument`]
//! holding Markdown, or a [`SourceError`] that maps onto the status code and
//! reason text persisted for the article. Two sources ship: [`DirectSource`]
//! fetches the page itself and extracts it locally, [`JinaSource`] delegates
//! to the Jina Reader service.

mod direct;
mod extract;
mod jina;
mod tidy;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

pub use direct::{DirectSource, DEFAULT_USER_AGENT};
pub use extract::{extract_readable, ExtractError, Extracted};
pub use jina::{JinaConfigError, JinaSource, DEFAULT_JINA_BASE_URL};
pub use tidy::tidy_markdown;

/// A retrieved and extracted article body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedDocument {
    /// URL after redirects
    pub final_url: String,
    pub status_code: u16,
    /// Title found in the document, if any
    pub title: Option<String>,
    pub markdown: String,
    /// Original HTML, when the source saw it
    pub raw_html: Option<String>,
}

/// How a fetch failed, as far as the lifecycle is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// No HTTP response (timeout, DNS, refused URL)
    Transport,
    /// The server answered with a non-success status
    Remote,
    /// A response arrived but no readable content came out of it
    Extraction,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("request timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("refused to fetch URL: {0}")]
    Rejected(String),
    #[error("HTTP {status} {reason}")]
    Remote { status: u16, reason: String },
    #[error("response too large (exceeds {0} bytes)")]
    TooLarge(usize),
    #[error("extraction failed: {reason}")]
    Extraction { status: u16, reason: String },
}

impl SourceError {
    pub fn kind(&self) -> FailureKind {
        match self {
            SourceError::Timeout(_) | SourceError::Network(_) | SourceError::Rejected(_) => {
                FailureKind::Transport
            }
            SourceError::Remote { .. } => FailureKind::Remote,
            SourceError::TooLarge(_) | SourceError::Extraction { .. } => FailureKind::Extraction,
        }
    }

    /// Status code persisted for the failure; 0 when nothing answered.
    pub fn status_code(&self) -> u16 {
        match self {
            SourceError::Timeout(_) | SourceError::Network(_) | SourceError::Rejected(_) => 0,
            SourceError::Remote { status, .. } => *status,
            SourceError::TooLarge(_) => 200,
            SourceError::Extraction { status, .. } => *status,
        }
    }

    /// Reason text persisted for the failure.
    pub fn status_text(&self) -> String {
        match self {
            SourceError::Timeout(_) => "Timeout".to_string(),
            SourceError::Network(detail) => format!("NetworkError: {}", detail),
            SourceError::Rejected(detail) => format!("NetworkError: {}", detail),
            SourceError::Remote { reason, .. } => reason.clone(),
            SourceError::TooLarge(limit) => {
                format!("ExtractionError: response exceeds {} bytes", limit)
            }
            SourceError::Extraction { reason, .. } => format!("ExtractionError: {}", reason),
        }
    }

    pub(crate) fn remote(status: reqwest::StatusCode) -> Self {
        SourceError::Remote {
            status: status.as_u16(),
            reason: status
                .canonical_reason()
                .unwrap_or("Unknown Status")
                .to_string(),
        }
    }

    pub(crate) fn from_reqwest(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            return SourceError::Timeout(timeout);
        }
        // Keep the innermost cause; reqwest's own message is generic
        let mut detail = err.to_string();
        let mut source = std::error::Error::source(&err);
        while let Some(inner) = source {
            detail = inner.to_string();
            source = std::error::Error::source(inner);
        }
        SourceError::Network(detail)
    }
}

/// Retrieval of readable content for one URL.
#[async_trait]
pub trait ContentSource: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedDocument, SourceError>;
}

/// Read a response body up to `limit` bytes, decoding it lossily as UTF-8.
pub(crate) async fn read_limited_body(
    response: reqwest::Response,
    limit: usize,
    timeout: Duration,
) -> Result<String, SourceError> {
    // Fast path: check Content-Length header
    if let Some(len) = response.content_length() {
        if len as usize > limit {
            return Err(SourceError::TooLarge(limit));
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| SourceError::from_reqwest(e, timeout))?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(SourceError::TooLarge(limit));
        }
        bytes.extend_from_slice(&chunk);
    }

    Ok(String::from_utf8_lossy(&bytes).into_owned())
}
