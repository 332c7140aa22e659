use std::time::Duration;

const MAX_ERROR_LINE_LEN: usize = 300;

static CLI_MISSING_PATTERNS: &[&str] = &[
    "not installed",
    "command not found",
    "no such file or directory",
    "is not recognized as an internal or external command",
];

static QUOTA_PATTERNS: &[&str] = &["insufficient_quota", "exceeded your current quota", "quota exceeded"];
static RATE_LIMIT_PATTERNS: &[&str] = &["rate limit", "rate_limit", "too many requests", "429"];
static AUTH_PATTERNS: &[&str] = &[
    "unauthorized",
    "invalid api key",
    "invalid_api_key",
    "not logged in",
    "please log in",
    "authentication failed",
    "401",
];

pub fn is_cli_missing_line(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    CLI_MISSING_PATTERNS
        .iter()
        .any(|pattern| lower.contains(pattern))
}

pub fn find_cli_missing_line(output: &str) -> Option<&str> {
    output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && is_cli_missing_line(line))
}

/// One-line summary of a failed CLI run, preferring known provider failures
/// over raw output.
pub fn concise_error(output: &str, fallback: &str) -> String {
    let lower = output.to_ascii_lowercase();
    if contains_any(&lower, QUOTA_PATTERNS) {
        return "quota exceeded (check plan or billing)".to_string();
    }
    if contains_any(&lower, RATE_LIMIT_PATTERNS) {
        return "rate limited (retry later)".to_string();
    }
    if contains_any(&lower, AUTH_PATTERNS) {
        return "authentication failed (log in or check credentials)".to_string();
    }
    if let Some(line) = find_cli_missing_line(output) {
        return line.to_string();
    }
    let error_line = output.lines().map(str::trim).find(|line| {
        !line.is_empty()
            && line.len() <= MAX_ERROR_LINE_LEN
            && line.to_ascii_lowercase().contains("error")
    });
    match error_line {
        Some(line) => line.to_string(),
        None => fallback.to_string(),
    }
}

fn contains_any(haystack: &str, patterns: &[&str]) -> bool {
    patterns.iter().any(|pattern| haystack.contains(pattern))
}

pub fn format_duration(duration: Duration) -> String {
    let millis = duration.as_millis();
    if millis < 1_000 {
        return format!("{}ms", millis);
    }
    if millis % 1_000 == 0 {
        return format!("{}s", millis / 1_000);
    }
    format!("{:.1}s", duration.as_secs_f64())
}
