/// Substrings marking tracking pixels and analytics snippets.
const TRACKER_MARKERS: &[&str] = &[
    "facebook.com/tr",
    "google-analytics.com",
    "googletagmanager.com",
    "gtag(",
];

/// Static patterns for month detection in archive links
const MONTH_PATTERNS: &[&str] = &[
    "[January",
    "[February",
    "[March",
    "[April",
    "[May",
    "[June",
    "[July",
    "[August",
    "[September",
    "[October",
    "[November",
    "[December",
];

/// Normalize extracted Markdown before it is stored.
///
/// - trailing whitespace removed from every line
/// - tracker lines and common page boilerplate dropped ("Skip to content",
///   comment form scaffolding, WordPress footers, bare "Menu")
/// - runs of three or more `[Month Year](...)` archive links dropped
/// - blank-line runs collapsed to one, leading/trailing blanks trimmed
///
/// ```
/// use shelf::content::tidy_markdown;
///
/// let raw = "[Skip to content](#main)\n# Title   \n\n\n\nBody text\n";
/// assert_eq!(tidy_markdown(raw), "# Title\n\nBody text");
/// ```
pub fn tidy_markdown(content: &str) -> String {
    let kept: Vec<&str> = content
        .lines()
        .map(str::trim_end)
        .filter(|line| !is_noise_line(line))
        .collect();

    let without_archives = drop_archive_runs(&kept);
    collapse_blank_runs(&without_archives)
}

fn is_noise_line(line: &str) -> bool {
    let trimmed = line.trim();

    if TRACKER_MARKERS.iter().any(|marker| trimmed.contains(marker)) {
        return true;
    }

    trimmed.starts_with("[Skip to content]")
        || trimmed.eq_ignore_ascii_case("skip to content")
        || trimmed == "Loading Comments..."
        || trimmed == "Write a Comment..."
        || trimmed.starts_with("Email (Required)")
        || trimmed == "%d"
        || trimmed.contains("Proudly powered by WordPress")
        || trimmed == "Menu"
}

/// Remove consecutive archive link runs (3+ in a row).
fn drop_archive_runs<'a>(lines: &[&'a str]) -> Vec<&'a str> {
    let mut result = Vec::with_capacity(lines.len());
    let mut run_start: Option<usize> = None;
    let mut run_len = 0;

    for line in lines {
        if is_archive_link(line) {
            if run_start.is_none() {
                run_start = Some(result.len());
            }
            run_len += 1;
            result.push(*line);
            continue;
        }

        if run_len >= 3 {
            if let Some(start) = run_start {
                result.truncate(start);
            }
        }
        run_start = None;
        run_len = 0;
        result.push(*line);
    }

    // Handle trailing archive run
    if run_len >= 3 {
        if let Some(start) = run_start {
            result.truncate(start);
        }
    }

    result
}

/// Check if a line matches the archive link pattern: "*   [Month Year](url)"
fn is_archive_link(line: &str) -> bool {
    let trimmed = line.trim();
    if !trimmed.starts_with('*') {
        return false;
    }

    MONTH_PATTERNS.iter().any(|pattern| {
        trimmed.find(pattern).is_some_and(|idx| {
            trimmed[idx + pattern.len()..]
                .get(1..5)
                .is_some_and(|year| year.chars().all(|c| c.is_ascii_digit()))
        })
    })
}

fn collapse_blank_runs(lines: &[&str]) -> String {
    let mut out: Vec<&str> = Vec::with_capacity(lines.len());
    for &line in lines {
        if line.is_empty() && out.last().is_some_and(|prev| prev.is_empty()) {
            continue;
        }
        out.push(line);
    }

    while out.first().is_some_and(|l| l.is_empty()) {
        out.remove(0);
    }
    while out.last().is_some_and(|l| l.is_empty()) {
        out.pop();
    }
    out.join("\n")
}
