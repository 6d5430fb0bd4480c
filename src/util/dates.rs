use chrono::{DateTime, Months, NaiveDate, TimeDelta, Utc};
use thiserror::Error;

/// Storage and display format for every timestamp: RFC 3339, UTC, whole
/// seconds. Fixed width, so lexicographic order in SQL matches time order.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DateParseError {
    #[error("empty date expression")]
    Empty,
    #[error("unrecognized date expression '{0}' (try today, yesterday, 3d, 2w, 1m, 1y, 12h, 2024-01-31 or RFC 3339)")]
    Unrecognized(String),
    #[error("date expression '{0}' is out of range")]
    OutOfRange(String),
}

pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

/// Convert Unix epoch seconds to a UTC timestamp.
///
/// ```
/// use shelf::util::{format_timestamp, from_unix_seconds};
///
/// let at = from_unix_seconds(1_700_000_000).unwrap();
/// assert_eq!(format_timestamp(at), "2023-11-14T22:13:20Z");
/// ```
pub fn from_unix_seconds(secs: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
}

fn start_of_day(at: DateTime<Utc>) -> DateTime<Utc> {
    at.date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|naive| naive.and_utc())
        .unwrap_or(at)
}

/// Last representable second of the UTC day containing `at`.
pub fn end_of_day(at: DateTime<Utc>) -> DateTime<Utc> {
    at.date_naive()
        .and_hms_opt(23, 59, 59)
        .map(|naive| naive.and_utc())
        .unwrap_or(at)
}

/// Whether a parsed expression names a whole day or an exact instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Precision {
    Day,
    Instant,
}

/// Parse a date filter expression relative to `now`.
///
/// Accepts `today`, `yesterday`, `<n>h`, `<n>d`, `<n>w`, `<n>m`, `<n>y`,
/// `YYYY-MM-DD` and full RFC 3339 timestamps. Day-granular forms resolve to
/// the start of that UTC day; `<n>h` keeps the time of day.
pub fn parse_relative_date(input: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, DateParseError> {
    parse_with_precision(input, now).map(|(at, _)| at)
}

/// Parse an upper bound. Day-granular forms cover the whole day and resolve
/// to its last second; `<n>h` and RFC 3339 timestamps are used as given.
pub fn parse_until(input: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, DateParseError> {
    parse_with_precision(input, now).map(|(at, precision)| match precision {
        Precision::Day => end_of_day(at),
        Precision::Instant => at,
    })
}

fn parse_with_precision(
    input: &str,
    now: DateTime<Utc>,
) -> Result<(DateTime<Utc>, Precision), DateParseError> {
    let expr = input.trim().to_lowercase();
    if expr.is_empty() {
        return Err(DateParseError::Empty);
    }
    let out_of_range = || DateParseError::OutOfRange(input.to_owned());

    match expr.as_str() {
        "today" => return Ok((start_of_day(now), Precision::Day)),
        "yesterday" => {
            return now
                .checked_sub_signed(TimeDelta::days(1))
                .map(|at| (start_of_day(at), Precision::Day))
                .ok_or_else(out_of_range);
        }
        _ => {}
    }

    if let Some(target) = parse_offset(&expr, now) {
        return target.ok_or_else(out_of_range);
    }

    if let Ok(date) = NaiveDate::parse_from_str(&expr, "%Y-%m-%d") {
        return date
            .and_hms_opt(0, 0, 0)
            .map(|naive| (naive.and_utc(), Precision::Day))
            .ok_or_else(out_of_range);
    }

    DateTime::parse_from_rfc3339(input.trim())
        .map(|dt| (dt.with_timezone(&Utc), Precision::Instant))
        .map_err(|_| DateParseError::Unrecognized(input.to_owned()))
}

/// `Some(None)` means the expression had offset shape but overflowed.
fn parse_offset(expr: &str, now: DateTime<Utc>) -> Option<Option<(DateTime<Utc>, Precision)>> {
    let unit = expr.chars().last()?;
    let digits = &expr[..expr.len() - unit.len_utf8()];
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let amount: i64 = digits.parse().ok()?;

    let target = match unit {
        'h' => TimeDelta::try_hours(amount).and_then(|d| now.checked_sub_signed(d)),
        'd' => TimeDelta::try_days(amount).and_then(|d| now.checked_sub_signed(d)),
        'w' => TimeDelta::try_weeks(amount).and_then(|d| now.checked_sub_signed(d)),
        'm' => u32::try_from(amount)
            .ok()
            .and_then(|m| now.checked_sub_months(Months::new(m))),
        'y' => u32::try_from(amount)
            .ok()
            .and_then(|y| y.checked_mul(12))
            .and_then(|m| now.checked_sub_months(Months::new(m))),
        _ => return None,
    };

    Some(if unit == 'h' {
        target.map(|at| (at, Precision::Instant))
    } else {
        target.map(|at| (start_of_day(at), Precision::Day))
    })
}
