use std::borrow::Cow;

use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

const ELLIPSIS: &str = "...";
const ELLIPSIS_WIDTH: usize = 3;

/// Display width of a string in terminal columns (CJK and emoji count as 2).
pub fn display_width(s: &str) -> usize {
    UnicodeWidthStr::width(s)
}

/// Truncate `s` to at most `max_width` terminal columns, appending "..." when
/// anything was cut. Widths of 3 or less get a hard cut with no ellipsis.
///
/// ```
/// use shelf::util::truncate_to_width;
///
/// assert_eq!(truncate_to_width("Short", 10), "Short");
/// assert_eq!(truncate_to_width("Hello World", 8), "Hello...");
/// assert_eq!(truncate_to_width("Test", 2), "Te");
/// ```
pub fn truncate_to_width(s: &str, max_width: usize) -> Cow<'_, str> {
    if display_width(s) <= max_width {
        return Cow::Borrowed(s);
    }

    let (budget, suffix) = if max_width <= ELLIPSIS_WIDTH {
        (max_width, "")
    } else {
        (max_width - ELLIPSIS_WIDTH, ELLIPSIS)
    };

    let mut used = 0;
    let mut end = 0;
    for (idx, c) in s.char_indices() {
        let w = UnicodeWidthChar::width(c).unwrap_or(0);
        if used + w > budget {
            break;
        }
        used += w;
        end = idx + c.len_utf8();
    }

    Cow::Owned(format!("{}{}", &s[..end], suffix))
}

/// Truncate then right-pad with spaces so the cell is exactly `width` columns.
pub fn fit_to_width(s: &str, width: usize) -> String {
    let cut = truncate_to_width(s, width);
    let pad = width.saturating_sub(display_width(&cut));
    format!("{}{}", cut, " ".repeat(pad))
}

fn is_stripped_control(c: char) -> bool {
    c == '\u{7f}' || (c < '\u{20}' && !matches!(c, '\t' | '\n' | '\r'))
}

/// Remove terminal control characters and ANSI escape sequences from text that
/// came from outside (CSV rows, feed titles, fetched pages).
///
/// Tab, newline and carriage return are preserved. CSI sequences (`ESC [` ...
/// final byte) and OSC sequences (`ESC ]` ... BEL or `ESC \`) are dropped
/// whole. Returns the input borrowed when nothing needed stripping.
pub fn strip_control_chars(s: &str) -> Cow<'_, str> {
    if !s.chars().any(is_stripped_control) {
        return Cow::Borrowed(s);
    }

    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '\u{1b}' {
            if !is_stripped_control(c) {
                out.push(c);
            }
            continue;
        }

        match chars.peek() {
            Some('[') => {
                chars.next();
                for next in chars.by_ref() {
                    if ('\u{40}'..='\u{7e}').contains(&next) {
                        break;
                    }
                }
            }
            Some(']') => {
                chars.next();
                while let Some(next) = chars.next() {
                    if next == '\u{07}' {
                        break;
                    }
                    if next == '\u{1b}' && chars.peek() == Some(&'\\') {
                        chars.next();
                        break;
                    }
                }
            }
            _ => {}
        }
    }

    Cow::Owned(out)
}

/// Lowercase, dash-separated slug of `title`, at most `max_len` bytes.
///
/// Alphanumeric characters (any script) are kept; every other run of
/// characters collapses to a single `-`.
pub fn slugify(title: &str, max_len: usize) -> String {
    let mut slug = String::with_capacity(title.len().min(max_len));
    let mut pending_dash = false;

    for c in title.chars() {
        if c.is_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            for lower in c.to_lowercase() {
                slug.push(lower);
            }
        } else {
            pending_dash = true;
        }
    }

    if slug.len() > max_len {
        let mut end = max_len;
        while !slug.is_char_boundary(end) {
            end -= 1;
        }
        slug.truncate(end);
    }

    slug.trim_end_matches('-').to_owned()
}

/// Filename stem for an exported article: `<slug>-<id>`, falling back to
/// `article-<id>` when the title has nothing sluggable. The slug part is capped
/// so the whole stem stays within `max_len` bytes.
pub fn safe_filename(title: &str, id: i64, max_len: usize) -> String {
    let suffix = format!("-{}", id);
    let budget = max_len.saturating_sub(suffix.len()).max(1);
    let slug = slugify(title, budget);
    let base = if slug.is_empty() { "article" } else { &slug };
    format!("{}{}", base, suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_fits() {
        assert_eq!(truncate_to_width("Short", 10), "Short");
        assert!(matches!(truncate_to_width("12345", 5), Cow::Borrowed(_)));
    }

    #[test]
    fn test_truncate_ascii() {
        assert_eq!(truncate_to_width("Hello World", 8), "Hello...");
        assert_eq!(truncate_to_width("Testing", 4), "T...");
    }

    #[test]
    fn test_truncate_wide_chars() {
        assert_eq!(truncate_to_width("你好世界", 7), "你好...");
        assert_eq!(truncate_to_width("你好世界", 5), "你...");
        assert_eq!(truncate_to_width("你好", 3), "你");
        assert_eq!(truncate_to_width("你好", 1), "");
    }

    #[test]
    fn test_truncate_narrow_widths() {
        assert_eq!(truncate_to_width("Test", 0), "");
        assert_eq!(truncate_to_width("Test", 1), "T");
        assert_eq!(truncate_to_width("Test", 3), "Tes");
    }

    #[test]
    fn test_fit_to_width_pads() {
        assert_eq!(fit_to_width("ab", 4), "ab  ");
        assert_eq!(fit_to_width("abcdefgh", 6), "abc...");
        assert_eq!(display_width(&fit_to_width("你好", 6)), 6);
    }

    #[test]
    fn test_strip_clean_text_borrowed() {
        let input = "line1\nline2\ttabbed\r\n";
        assert!(matches!(strip_control_chars(input), Cow::Borrowed(_)));
    }

    #[test]
    fn test_strip_controls_and_del() {
        assert_eq!(strip_control_chars("he\x00ll\x07o\x7f!"), "hello!");
    }

    #[test]
    fn test_strip_ansi_sequences() {
        assert_eq!(strip_control_chars("\x1b[31mRed\x1b[0m text"), "Red text");
        assert_eq!(strip_control_chars("\x1b]0;title\x07safe"), "safe");
        assert_eq!(strip_control_chars("\x1b]0;title\x1b\\safe"), "safe");
        assert_eq!(strip_control_chars("before\x1bafter"), "beforeafter");
    }

    #[test]
    fn test_strip_keeps_unicode() {
        assert_eq!(strip_control_chars("日本語 \x1b[1m太字\x1b[0m"), "日本語 太字");
    }

    #[test]
    fn test_slugify_basic() {
        assert_eq!(slugify("Hello, World!", 100), "hello-world");
        assert_eq!(slugify("  Rust & Async: A Guide  ", 100), "rust-async-a-guide");
        assert_eq!(slugify("Ünïcode Títle", 100), "ünïcode-títle");
        assert_eq!(slugify("!!!", 100), "");
    }

    #[test]
    fn test_slugify_respects_length() {
        assert_eq!(slugify("abcdef ghijkl", 8), "abcdef-g");
        assert_eq!(slugify("abcdef ghijkl", 7), "abcdef");
        assert!(slugify("ééééé", 3).len() <= 3);
    }

    #[test]
    fn test_safe_filename() {
        assert_eq!(safe_filename("My Article", 42, 120), "my-article-42");
        assert_eq!(safe_filename("", 7, 120), "article-7");
        let long = "word ".repeat(100);
        let name = safe_filename(&long, 12345, 120);
        assert!(name.len() <= 120);
        assert!(name.ends_with("-12345"));
    }
}
