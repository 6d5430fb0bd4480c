use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

/// Elements that never carry article text.
const NOISE_TAGS: &[&str] = &[
    "script", "style", "noscript", "template", "svg", "iframe", "form", "nav", "header", "footer",
    "aside", "button",
];

/// Fewer alphanumeric characters than this and the page counts as empty.
const MIN_TEXT_CHARS: usize = 25;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExtractError {
    #[error("HTML conversion failed: {0}")]
    Convert(String),
    #[error("no readable text found")]
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extracted {
    pub title: Option<String>,
    pub markdown: String,
}

fn noise_patterns() -> &'static [Regex] {
    static NOISE: OnceLock<Vec<Regex>> = OnceLock::new();
    NOISE.get_or_init(|| {
        let mut patterns: Vec<Regex> = NOISE_TAGS
            .iter()
            .map(|tag| {
                Regex::new(&format!(r"(?is)<{tag}\b[^>]*>.*?</{tag}\s*>"))
                    .expect("noise tag pattern is valid")
            })
            .collect();
        patterns.push(Regex::new(r"(?s)<!--.*?-->").expect("comment pattern is valid"));
        patterns
    })
}

fn container_patterns() -> &'static [Regex] {
    static CONTAINERS: OnceLock<Vec<Regex>> = OnceLock::new();
    CONTAINERS.get_or_init(|| {
        ["article", "main", "body"]
            .iter()
            .map(|tag| {
                Regex::new(&format!(r"(?is)<{tag}\b[^>]*>(.*)</{tag}\s*>"))
                    .expect("container pattern is valid")
            })
            .collect()
    })
}

fn title_patterns() -> &'static [Regex] {
    static TITLES: OnceLock<Vec<Regex>> = OnceLock::new();
    TITLES.get_or_init(|| {
        [
            r#"(?is)<meta\b[^>]*property\s*=\s*["']og:title["'][^>]*content\s*=\s*["']([^"']*)["']"#,
            r#"(?is)<meta\b[^>]*content\s*=\s*["']([^"']*)["'][^>]*property\s*=\s*["']og:title["']"#,
            r"(?is)<title\b[^>]*>(.*?)</title\s*>",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("title pattern is valid"))
        .collect()
    })
}

/// Decode entities and collapse whitespace in a short HTML text fragment.
fn decode_fragment(fragment: &str) -> String {
    let decoded = html2text::from_read(fragment.as_bytes(), 10_000)
        .unwrap_or_else(|_| fragment.to_string());
    decoded.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn extract_title(html: &str) -> Option<String> {
    title_patterns().iter().find_map(|pattern| {
        let raw = pattern.captures(html)?.get(1)?.as_str();
        let title = decode_fragment(raw);
        (!title.is_empty()).then_some(title)
    })
}

/// Strip noise elements and narrow to the most specific content container.
fn isolate_content(html: &str) -> String {
    let mut cleaned = html.to_string();
    for pattern in noise_patterns() {
        cleaned = pattern.replace_all(&cleaned, "").into_owned();
    }

    for pattern in container_patterns() {
        if let Some(inner) = pattern.captures(&cleaned).and_then(|c| c.get(1)) {
            return inner.as_str().to_string();
        }
    }
    cleaned
}

/// Convert an HTML page into readable Markdown-style text.
///
/// The page title comes from `og:title`, falling back to `<title>`. The body
/// is taken from `<article>`, `<main>` or `<body>` (first found) after
/// scripts, navigation and similar chrome are removed, then rendered at
/// `width` columns.
pub fn extract_readable(html: &str, width: usize) -> Result<Extracted, ExtractError> {
    let title = extract_title(html);
    let content = isolate_content(html);

    let markdown = html2text::from_read(content.as_bytes(), width.max(20))
        .map_err(|e| ExtractError::Convert(e.to_string()))?;

    let text_chars = markdown.chars().filter(|c| c.is_alphanumeric()).count();
    if text_chars < MIN_TEXT_CHARS {
        return Err(ExtractError::Empty);
    }

    Ok(Extracted { title, markdown })
}
