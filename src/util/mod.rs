//! Utility functions shared across the crate.
//!
//! - **Dates**: storage timestamp format and relative date expressions
//! - **Tags**: parsing tag cells and normalizing label titles
//! - **Text**: terminal-width truncation, control-character stripping, slugs
//! - **URL validation**: outbound request guard against local/private hosts

mod dates;
mod tags;
mod text;
mod url_validator;

pub use dates::{
    end_of_day, format_timestamp, from_unix_seconds, parse_relative_date, parse_until,
    DateParseError,
    TIMESTAMP_FORMAT,
};
pub use tags::{normalize_titles, parse_tag_list};
pub use text::{
    display_width, fit_to_width, safe_filename, slugify, strip_control_chars, truncate_to_width,
};
pub use url_validator::{validate_url, UrlValidationError};

/// Maximum accepted length of a search query, shared by the CLI and the
/// full-text query validator.
pub const MAX_SEARCH_QUERY_LENGTH: usize = 256;
