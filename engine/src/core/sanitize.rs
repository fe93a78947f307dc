//! Sanitizing of error text shown to listeners.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::failure_summary::truncate_chars;

static ABS_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:[A-Za-z]:\\|/)(?:[\w.\-]+[/\\])+[\w.\-]*").expect("valid path regex")
});

static SECRET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(api[_-]?key|token|secret|password|authorization)\b\s*[:=]\s*\S+")
        .expect("valid secret regex")
});

/// Reduce an internal error to one bounded line without paths or credentials.
pub fn sanitize_error(raw: &str, max_chars: usize) -> String {
    let first_line = raw
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("internal error");
    let no_paths = ABS_PATH.replace_all(first_line, "<path>");
    let no_secrets = SECRET.replace_all(&no_paths, "$1=<redacted>");
    truncate_chars(&no_secrets, max_chars)
}
