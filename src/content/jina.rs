use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;

use super::{read_limited_body, ContentSource, FetchedDocument, SourceError};
use crate::util::validate_url;

pub const DEFAULT_JINA_BASE_URL: &str = "https://r.jina.ai";

/// CSS selectors targeting main article content across common blog platforms.
/// Order matters: more specific selectors first, generic fallbacks last.
const TARGET_SELECTORS: &str =
    "article, .entry-content, .post-content, .article-content, .post-body, main .content, main";

#[derive(Debug, thiserror::Error)]
pub enum JinaConfigError {
    #[error("Insecure base URL: HTTPS required (except localhost for testing)")]
    InsecureBaseUrl,
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Delegates retrieval and extraction to the Jina Reader service, which
/// returns Markdown directly.
pub struct JinaSource {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<SecretString>,
    timeout: Duration,
    max_body_bytes: usize,
    allow_private_hosts: bool,
}

impl JinaSource {
    /// `api_key` falls back to the `JINA_API_KEY` environment variable. The
    /// key is only ever sent to the official service host.
    pub fn new(
        base_url: Option<&str>,
        api_key: Option<SecretString>,
        timeout: Duration,
        max_body_bytes: usize,
        allow_private_hosts: bool,
    ) -> Result<Self, JinaConfigError> {
        let base = base_url
            .unwrap_or(DEFAULT_JINA_BASE_URL)
            .trim_end_matches('/')
            .to_string();

        // Plain HTTP would expose the API key; allow it for local test servers only
        if !base.starts_with("https://") {
            let is_localhost =
                base.starts_with("http://127.0.0.1") || base.starts_with("http://localhost");
            if !is_localhost {
                tracing::error!(base_url = %base, "Rejecting non-HTTPS base URL (HTTPS required except for localhost)");
                return Err(JinaConfigError::InsecureBaseUrl);
            }
            tracing::warn!(base_url = %base, "Using non-HTTPS Jina base URL (localhost only)");
        }

        let api_key = api_key.or_else(|| std::env::var("JINA_API_KEY").ok().map(SecretString::from));
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: base,
            api_key,
            timeout,
            max_body_bytes,
            allow_private_hosts,
        })
    }

    fn is_official_host(&self) -> bool {
        self.base_url == "https://r.jina.ai" || self.base_url == "https://api.jina.ai"
    }

    async fn retrieve(&self, reader_url: &str) -> Result<(u16, String), SourceError> {
        let mut request = self
            .client
            .get(reader_url)
            .header("X-Target-Selector", TARGET_SELECTORS);

        if let Some(key) = &self.api_key {
            if self.is_official_host() {
                request = request.header(
                    reqwest::header::AUTHORIZATION,
                    format!("Bearer {}", key.expose_secret()),
                );
            } else {
                tracing::debug!("Skipping API key for non-official Jina URL (custom base_url in use)");
            }
        }

        let response = request
            .send()
            .await
            .map_err(|e| SourceError::from_reqwest(e, self.timeout))?;
        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::remote(status));
        }
        let body = read_limited_body(response, self.max_body_bytes, self.timeout).await?;
        Ok((status.as_u16(), body))
    }
}

/// Split the reader's `Title:` / `URL Source:` / `Markdown Content:` header
/// from the body. Responses without the header are treated as pure Markdown.
fn parse_reader_response(body: &str) -> (Option<String>, Option<String>, String) {
    let Some(marker) = body.find("Markdown Content:") else {
        return (None, None, body.to_string());
    };

    let (header, rest) = body.split_at(marker);
    let markdown = rest["Markdown Content:".len()..].trim_start_matches(|c: char| c == '\r' || c == '\n');

    let mut title = None;
    let mut source = None;
    for line in header.lines() {
        if let Some(value) = line.strip_prefix("Title:") {
            title = Some(value.trim().to_string()).filter(|t| !t.is_empty());
        } else if let Some(value) = line.strip_prefix("URL Source:") {
            source = Some(value.trim().to_string()).filter(|s| !s.is_empty());
        }
    }
    (title, source, markdown.to_string())
}

#[async_trait]
impl ContentSource for JinaSource {
    async fn fetch(&self, url: &str) -> Result<FetchedDocument, SourceError> {
        let parsed = validate_url(url, self.allow_private_hosts)
            .map_err(|e| SourceError::Rejected(e.to_string()))?;
        let reader_url = format!("{}/{}", self.base_url, parsed.as_str());

        let (status_code, body) = tokio::time::timeout(self.timeout, self.retrieve(&reader_url))
            .await
            .map_err(|_| SourceError::Timeout(self.timeout))??;

        let (title, source, markdown) = parse_reader_response(&body);
        if !markdown.chars().any(char::is_alphanumeric) {
            return Err(SourceError::Extraction {
                status: status_code,
                reason: "reader returned no content".to_string(),
            });
        }

        Ok(FetchedDocument {
            final_url: source.unwrap_or_else(|| parsed.to_string()),
            status_code,
            title,
            markdown,
            raw_html: None,
        })
    }
}
