//! Canonical article identity.
//!
//! Every article is keyed by the normalized form of its URL. Two raw URLs that
//! differ only by `http`/`https`, a fragment, or a single trailing slash refer
//! to the same article:
//!
//! ```
//! use shelf::canonical::CanonicalUrl;
//!
//! let a = CanonicalUrl::parse("http://example.com/a/#comments").unwrap();
//! let b = CanonicalUrl::parse("https://example.com/a").unwrap();
//! assert_eq!(a, b);
//! assert_eq!(a.as_str(), "https://example.com/a");
//! ```
//!
//! The store only accepts [`CanonicalUrl`] values, so every insert and lookup
//! goes through [`CanonicalUrl::parse`].

use serde::Serialize;
use std::fmt;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum CanonicalUrlError {
    #[error("Invalid URL '{input}': {source}")]
    InvalidUrl {
        input: String,
        #[source]
        source: url::ParseError,
    },
}

/// A URL in the normalized form used as the article dedup key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct CanonicalUrl(String);

impl CanonicalUrl {
    /// Normalize a raw URL.
    ///
    /// Rules, applied in order:
    /// 1. `http` is rewritten to `https`
    /// 2. the fragment is dropped
    /// 3. exactly one trailing `/` is removed from a non-root path
    ///
    /// The query string is left as-is. A root path (`https://host/`) keeps its
    /// slash because the URL model always serializes one.
    pub fn parse(raw: &str) -> Result<Self, CanonicalUrlError> {
        let input = raw.trim();
        let mut url = Url::parse(input).map_err(|source| CanonicalUrlError::InvalidUrl {
            input: input.to_owned(),
            source,
        })?;

        if url.scheme() == "http" {
            // http and https are both special schemes, so the swap cannot fail
            let _ = url.set_scheme("https");
        }

        url.set_fragment(None);

        if !url.cannot_be_a_base() {
            let path = url.path().to_owned();
            if path.len() > 1 {
                if let Some(trimmed) = path.strip_suffix('/') {
                    url.set_path(trimmed);
                }
            }
        }

        Ok(Self(url.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CanonicalUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CanonicalUrl {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::str::FromStr for CanonicalUrl {
    type Err = CanonicalUrlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// A feed subscription address.
///
/// Feeds are fetched from the address exactly as given (minus any fragment),
/// so an http-only feed stays reachable. The canonical form is kept alongside
/// as the uniqueness key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedUrl {
    location: String,
    key: CanonicalUrl,
}

impl FeedUrl {
    pub fn parse(raw: &str) -> Result<Self, CanonicalUrlError> {
        let input = raw.trim();
        let mut url = Url::parse(input).map_err(|source| CanonicalUrlError::InvalidUrl {
            input: input.to_owned(),
            source,
        })?;
        url.set_fragment(None);

        Ok(Self {
            key: CanonicalUrl::parse(input)?,
            location: url.into(),
        })
    }

    /// Address requested when syncing.
    pub fn as_str(&self) -> &str {
        &self.location
    }

    pub fn key(&self) -> &CanonicalUrl {
        &self.key
    }
}

impl fmt::Display for FeedUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.location)
    }
}
