use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

fn quoted_item() -> &'static Regex {
    static QUOTED: OnceLock<Regex> = OnceLock::new();
    QUOTED.get_or_init(|| Regex::new(r#""([^"]*)""#).expect("quoted tag pattern is valid"))
}

/// Parse a tag cell from an export file.
///
/// Two shapes are accepted: a bracketed list of quoted strings
/// (`["a", "b"]`) and a plain comma-separated list (`a, b`). The result is
/// trimmed and deduplicated in first-seen order.
///
/// ```
/// use shelf::util::parse_tag_list;
///
/// assert_eq!(parse_tag_list(r#"["x","y"]"#), vec!["x", "y"]);
/// assert_eq!(parse_tag_list("reading, rust ,reading"), vec!["reading", "rust"]);
/// assert!(parse_tag_list("[]").is_empty());
/// ```
pub fn parse_tag_list(cell: &str) -> Vec<String> {
    let cell = cell.trim();
    if cell.is_empty() {
        return Vec::new();
    }

    if let Some(inner) = cell.strip_prefix('[').and_then(|c| c.strip_suffix(']')) {
        let items = quoted_item()
            .captures_iter(inner)
            .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_owned()));
        return normalize_titles(items);
    }

    normalize_titles(cell.split(',').map(str::to_owned))
}

/// Trim, drop empties and deduplicate label titles, keeping first-seen order.
pub fn normalize_titles<I, S>(titles: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for title in titles {
        let trimmed = title.as_ref().trim();
        if !trimmed.is_empty() && seen.insert(trimmed.to_owned()) {
            out.push(trimmed.to_owned());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bracketed_list() {
        assert_eq!(parse_tag_list(r#"["x","y"]"#), vec!["x", "y"]);
        assert_eq!(parse_tag_list(r#"[ "a b" , "c" ]"#), vec!["a b", "c"]);
    }

    #[test]
    fn test_bracketed_list_skips_empty_items() {
        assert_eq!(parse_tag_list(r#"["", "x", " "]"#), vec!["x"]);
    }

    #[test]
    fn test_comma_separated() {
        assert_eq!(parse_tag_list("a,b , c"), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_empty_forms() {
        assert!(parse_tag_list("").is_empty());
        assert!(parse_tag_list("   ").is_empty());
        assert!(parse_tag_list("[]").is_empty());
        assert!(parse_tag_list(",,").is_empty());
    }

    #[test]
    fn test_duplicates_removed() {
        assert_eq!(parse_tag_list(r#"["x","x","y"]"#), vec!["x", "y"]);
        assert_eq!(normalize_titles([" a", "a ", "b"]), vec!["a", "b"]);
    }
}
