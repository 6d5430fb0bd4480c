//! The fetch pipeline: select eligible articles, retrieve and extract their
//! content, and commit each outcome to the store.

use anyhow::Result;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::content::{tidy_markdown, ContentSource, FailureKind, SourceError};
use crate::retry::{Clock, RetryPolicy, SystemClock};
use crate::storage::{Article, CandidateQuery, Database, FetchSuccess};

pub const DEFAULT_PACING: Duration = Duration::from_millis(500);

/// Shared stop request, checked between articles.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub candidates: CandidateQuery,
    /// Replace the stored title with the one found in the page
    pub prefer_extracted_title: bool,
    /// Keep the raw HTML alongside the Markdown
    pub store_raw: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum FetchStatus {
    Synced {
        status_code: i64,
    },
    Failed {
        status_code: i64,
        reason: String,
        kind: FailureKind,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct ArticleOutcome {
    pub article_id: i64,
    pub url: String,
    #[serde(flatten)]
    pub status: FetchStatus,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FetchReport {
    /// Candidates selected for this run
    pub selected: usize,
    pub outcomes: Vec<ArticleOutcome>,
    /// True when the run stopped early on request
    pub cancelled: bool,
}

impl FetchReport {
    pub fn synced(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, FetchStatus::Synced { .. }))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.synced()
    }
}

pub struct FetchPipeline {
    db: Database,
    source: Arc<dyn ContentSource>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    pacing: Duration,
}

impl FetchPipeline {
    pub fn new(db: Database, source: Arc<dyn ContentSource>) -> Self {
        Self {
            db,
            source,
            clock: Arc::new(SystemClock),
            policy: RetryPolicy::default(),
            pacing: DEFAULT_PACING,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_pacing(mut self, pacing: Duration) -> Self {
        self.pacing = pacing;
        self
    }

    /// Run one batch.
    ///
    /// Articles are processed strictly one at a time with the pacing delay
    /// between retrievals. Each retrieval outcome is committed before the
    /// next one starts; retrieval problems become persisted failures and
    /// never abort the batch. Only store errors propagate.
    pub async fn run(&self, options: &FetchOptions, cancel: &CancelFlag) -> Result<FetchReport> {
        let now = self.clock.now();
        let candidates = self
            .db
            .fetch_candidates(&options.candidates, &self.policy, now)
            .await?;

        tracing::info!(selected = candidates.len(), "Starting fetch batch");
        let mut report = FetchReport {
            selected: candidates.len(),
            ..FetchReport::default()
        };

        for (i, article) in candidates.iter().enumerate() {
            if i > 0 && !self.pacing.is_zero() && !cancel.is_cancelled() {
                tokio::time::sleep(self.pacing).await;
            }
            if cancel.is_cancelled() {
                tracing::info!(processed = i, "Fetch batch cancelled");
                report.cancelled = true;
                break;
            }

            let outcome = self.process(article, options).await?;
            report.outcomes.push(outcome);
        }

        tracing::info!(
            synced = report.synced(),
            failed = report.failed(),
            cancelled = report.cancelled,
            "Fetch batch finished"
        );
        Ok(report)
    }

    async fn process(&self, article: &Article, options: &FetchOptions) -> Result<ArticleOutcome> {
        let status = match self.source.fetch(&article.url).await {
            Ok(doc) => {
                let content = tidy_markdown(&doc.markdown);
                if content.is_empty() {
                    let err = SourceError::Extraction {
                        status: doc.status_code,
                        reason: "no content left after cleanup".to_string(),
                    };
                    self.record_failure(article, &err).await?
                } else {
                    let success = FetchSuccess {
                        content,
                        final_url: doc.final_url,
                        status_code: i64::from(doc.status_code),
                        title: doc
                            .title
                            .filter(|t| options.prefer_extracted_title && !t.trim().is_empty()),
                        raw_html: doc.raw_html.filter(|_| options.store_raw),
                    };
                    self.db
                        .record_fetch_success(article.id, &success, self.clock.now())
                        .await?;
                    tracing::info!(
                        article_id = article.id,
                        status = success.status_code,
                        bytes = success.content.len(),
                        url = %article.url,
                        "Synced article"
                    );
                    FetchStatus::Synced {
                        status_code: success.status_code,
                    }
                }
            }
            Err(err) => self.record_failure(article, &err).await?,
        };

        Ok(ArticleOutcome {
            article_id: article.id,
            url: article.url.clone(),
            status,
        })
    }

    async fn record_failure(&self, article: &Article, err: &SourceError) -> Result<FetchStatus> {
        let status_code = i64::from(err.status_code());
        let reason = err.status_text();
        self.db
            .record_fetch_failure(article.id, status_code, &reason, self.clock.now())
            .await?;

        tracing::warn!(
            article_id = article.id,
            status = status_code,
            reason = %reason,
            failures = article.failed_count + 1,
            url = %article.url,
            "Fetch failed"
        );
        Ok(FetchStatus::Failed {
            status_code,
            reason,
            kind: err.kind(),
        })
    }
}
