//! Configuration file parser for ~/.config/shelf/config.toml.
//!
//! The config file is optional; a missing file yields `Config::default()`.
//! Unknown keys are accepted by serde but logged as likely typos.
use secrecy::SecretString;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::content::DEFAULT_USER_AGENT;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file too large: {0}")]
    TooLarge(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Which service turns a page into Markdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentBackend {
    /// Fetch the page and extract it locally
    #[default]
    Direct,
    /// Delegate to the Jina Reader service
    Jina,
}

/// Top-level application configuration.
///
/// Every section uses `#[serde(default)]` so any subset of keys can be given.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Library database location. `--db` overrides it.
    pub database_path: Option<PathBuf>,
    pub fetch: FetchSettings,
    pub feeds: FeedSettings,
    pub export: ExportSettings,
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct FetchSettings {
    pub timeout_secs: u64,
    /// Delay between consecutive article fetches
    pub pacing_ms: u64,
    /// Articles per fetch run when `--limit` is not given
    pub default_limit: i64,
    pub max_body_bytes: usize,
    pub user_agent: String,
    pub backend: ContentBackend,
    pub jina_base_url: Option<String>,
    /// Jina API key. The `JINA_API_KEY` environment variable is used when unset.
    pub jina_api_key: Option<String>,
    /// Permit fetching from loopback and private network addresses
    pub allow_private_hosts: bool,
    /// Line width used when converting HTML to Markdown
    pub wrap_width: usize,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 20,
            pacing_ms: 500,
            default_limit: 10,
            max_body_bytes: 10 * 1024 * 1024,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            backend: ContentBackend::Direct,
            jina_base_url: None,
            jina_api_key: None,
            allow_private_hosts: false,
            wrap_width: 100,
        }
    }
}

/// Mask jina_api_key in Debug output to prevent secret leakage.
impl std::fmt::Debug for FetchSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchSettings")
            .field("timeout_secs", &self.timeout_secs)
            .field("pacing_ms", &self.pacing_ms)
            .field("default_limit", &self.default_limit)
            .field("max_body_bytes", &self.max_body_bytes)
            .field("user_agent", &self.user_agent)
            .field("backend", &self.backend)
            .field("jina_base_url", &self.jina_base_url)
            .field(
                "jina_api_key",
                &self.jina_api_key.as_ref().map(|_| "[REDACTED]"),
            )
            .field("allow_private_hosts", &self.allow_private_hosts)
            .field("wrap_width", &self.wrap_width)
            .finish()
    }
}

impl FetchSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.pacing_ms)
    }

    pub fn api_key(&self) -> Option<SecretString> {
        self.jina_api_key
            .as_ref()
            .filter(|k| !k.trim().is_empty())
            .map(|k| SecretString::from(k.clone()))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedSettings {
    pub timeout_secs: u64,
    pub max_body_bytes: usize,
    /// Feeds downloaded at the same time
    pub concurrency: usize,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_body_bytes: 5 * 1024 * 1024,
            concurrency: 4,
        }
    }
}

impl FeedSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ExportSettings {
    /// Default target of `export-all` when `--dir` is not given
    pub directory: Option<PathBuf>,
}

const KNOWN_TOP_LEVEL: &[&str] = &["database_path", "fetch", "feeds", "export"];
const KNOWN_FETCH: &[&str] = &[
    "timeout_secs",
    "pacing_ms",
    "default_limit",
    "max_body_bytes",
    "user_agent",
    "backend",
    "jina_base_url",
    "jina_api_key",
    "allow_private_hosts",
    "wrap_width",
];
const KNOWN_FEEDS: &[&str] = &["timeout_secs", "max_body_bytes", "concurrency"];
const KNOWN_EXPORT: &[&str] = &["directory"];

fn warn_unknown_keys(raw: &toml::Table) {
    for (key, value) in raw {
        if !KNOWN_TOP_LEVEL.contains(&key.as_str()) {
            tracing::warn!(key = %key, "Unknown key in config file, ignoring");
            continue;
        }
        let known: &[&str] = match key.as_str() {
            "fetch" => KNOWN_FETCH,
            "feeds" => KNOWN_FEEDS,
            "export" => KNOWN_EXPORT,
            _ => continue,
        };
        if let Some(section) = value.as_table() {
            for nested in section.keys() {
                if !known.contains(&nested.as_str()) {
                    tracing::warn!(section = %key, key = %nested, "Unknown key in config file, ignoring");
                }
            }
        }
    }
}

/// `~/.config/shelf`, or `None` when the platform has no config directory.
pub fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("shelf"))
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    pub fn default_path() -> Option<PathBuf> {
        config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Database location: the configured path, else `shelf.db` in the
    /// config directory, else the working directory.
    pub fn resolved_database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .or_else(|| config_dir().map(|dir| dir.join("shelf.db")))
            .unwrap_or_else(|| PathBuf::from("shelf.db"))
    }

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        // Check size before reading so a huge file is never loaded
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File deleted between metadata and read
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            warn_unknown_keys(&raw);
        }

        let config: Config = toml::from_str(&content)?;
        tracing::info!(
            path = %path.display(),
            backend = ?config.fetch.backend,
            "Loaded configuration"
        );
        Ok(config)
    }
}

// ============================================================================
// Tests
// ============================================================================
