use async_trait::async_trait;
use std::time::Duration;

use super::extract::{extract_readable, ExtractError};
use super::{read_limited_body, ContentSource, FetchedDocument, SourceError};
use crate::util::validate_url;

pub const DEFAULT_USER_AGENT: &str = concat!("shelf/", env!("CARGO_PKG_VERSION"));

/// Fetches pages over HTTP and extracts them locally.
pub struct DirectSource {
    client: reqwest::Client,
    timeout: Duration,
    max_body_bytes: usize,
    allow_private_hosts: bool,
    wrap_width: usize,
}

impl DirectSource {
    pub fn new(
        user_agent: &str,
        timeout: Duration,
        max_body_bytes: usize,
        allow_private_hosts: bool,
        wrap_width: usize,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .connect_timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()?;
        Ok(Self {
            client,
            timeout,
            max_body_bytes,
            allow_private_hosts,
            wrap_width,
        })
    }

    async fn retrieve(&self, url: &str) -> Result<(String, u16, String), SourceError> {
        let response = self
            .client
            .get(url)
            .header(
                reqwest::header::ACCEPT,
                "text/html,application/xhtml+xml;q=0.9,*/*;q=0.8",
            )
            .header(reqwest::header::ACCEPT_LANGUAGE, "en;q=0.9,*;q=0.5")
            .send()
            .await
            .map_err(|e| SourceError::from_reqwest(e, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::remote(status));
        }

        let final_url = response.url().to_string();
        let body = read_limited_body(response, self.max_body_bytes, self.timeout).await?;
        Ok((final_url, status.as_u16(), body))
    }
}

#[async_trait]
impl ContentSource for DirectSource {
    async fn fetch(&self, url: &str) -> Result<FetchedDocument, SourceError> {
        let parsed = validate_url(url, self.allow_private_hosts)
            .map_err(|e| SourceError::Rejected(e.to_string()))?;

        // One budget covers connect, headers and body
        let (final_url, status_code, html) =
            tokio::time::timeout(self.timeout, self.retrieve(parsed.as_str()))
                .await
                .map_err(|_| SourceError::Timeout(self.timeout))??;

        let extracted = extract_readable(&html, self.wrap_width).map_err(|e| {
            let reason = match e {
                ExtractError::Empty => "no readable text".to_string(),
                ExtractError::Convert(detail) => detail,
            };
            SourceError::Extraction {
                status: status_code,
                reason,
            }
        })?;

        tracing::debug!(
            url = %url,
            final_url = %final_url,
            status = status_code,
            bytes = html.len(),
            "Fetched page"
        );

        Ok(FetchedDocument {
            final_url,
            status_code,
            title: extracted.title,
            markdown: extracted.markdown,
            raw_html: Some(html),
        })
    }
}
