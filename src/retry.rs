//! Fetch eligibility and the derived sync state of an article.

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

use crate::storage::Article;

/// Failures after which an article is never selected again.
pub const MAX_FAILURES: i64 = 5;

/// Minimum wait after a failed fetch before the next attempt, in seconds.
pub const COOLDOWN_SECS: i64 = 3600;

/// Source of "now" for eligibility decisions.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_failures: i64,
    pub cooldown: TimeDelta,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_failures: MAX_FAILURES,
            cooldown: TimeDelta::seconds(COOLDOWN_SECS),
        }
    }
}

impl RetryPolicy {
    /// Latest failure time that has cooled down by `now`.
    pub fn cooldown_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(self.cooldown).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Whether `article` may be fetched at `now`.
    ///
    /// Never-synced, non-obsolete articles with fewer than `max_failures`
    /// failures qualify once `cooldown` has elapsed since the last failure.
    pub fn is_eligible(&self, article: &Article, now: DateTime<Utc>) -> bool {
        !article.obsolete
            && article.synced_at.is_none()
            && article.failed_count < self.max_failures
            && article
                .sync_failed_at
                .map_or(true, |failed_at| failed_at <= self.cooldown_cutoff(now))
    }

    /// The lifecycle state implied by the persisted fields.
    pub fn state_of(&self, article: &Article) -> SyncState {
        if article.obsolete {
            SyncState::Obsolete
        } else if article.failed_count >= self.max_failures {
            SyncState::FailedExhausted
        } else if article.sync_failed_at.is_some() {
            SyncState::FailedRetryPending
        } else if article.synced_at.is_some() {
            SyncState::Synced
        } else {
            SyncState::NeverSynced
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    NeverSynced,
    Synced,
    FailedRetryPending,
    FailedExhausted,
    /// Terminal
    Obsolete,
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            SyncState::NeverSynced => "never synced",
            SyncState::Synced => "synced",
            SyncState::FailedRetryPending => "failed, retry pending",
            SyncState::FailedExhausted => "failed, exhausted",
            SyncState::Obsolete => "obsolete",
        };
        f.write_str(label)
    }
}
