//! Map raw provider failures onto a closed set of error kinds.
//!
//! The pattern table is versioned. `tests/fixtures/error_patterns_v<N>.json`
//! pins the expected classification for each table version, so changing a
//! pattern means bumping [`PATTERN_TABLE_VERSION`] and adding a fixture.

use std::sync::LazyLock;

use regex::{Regex, RegexSet};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Version of the built-in pattern table.
pub const PATTERN_TABLE_VERSION: u32 = 2;

/// How the agent loop should react to a failed model turn.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    /// Transient transport or rate-limit failure; retry with backoff.
    Retryable,
    /// The request exceeded the model's context window; compact and reissue.
    ContextOverflow,
    /// Anything else.
    Fatal,
}

const CONTEXT_OVERFLOW_PATTERNS: &[&str] = &[
    r"(?i)prompt is too long",
    r"(?i)context[_ ]length[_ ]exceeded",
    r"(?i)maximum context length",
    r"(?i)exceeds? (the )?(model'?s? )?context (window|length|limit)",
    r"(?i)input is too long",
    r"(?i)too many (input )?tokens",
    r"(?i)input token count .* exceeds",
    r"(?i)reduce the length of the (messages|prompt|input)",
];

const RETRYABLE_PATTERNS: &[&str] = &[
    r"(?i)rate[_ ]?limit",
    r"(?i)too many requests",
    r"(?i)overloaded",
    r"(?i)internal server error",
    r"(?i)server error",
    r"(?i)service unavailable",
    r"(?i)bad gateway",
    r"(?i)gateway time-?out",
    r"(?i)temporarily unavailable",
    r"(?i)timed? ?out",
    r"(?i)connection (reset|refused|closed|error|aborted)",
    r"(?i)econnreset|econnrefused|etimedout|epipe",
    r"(?i)socket hang up",
    r"(?i)fetch failed",
    r"(?i)network error",
    r"(?i)stream idle timeout",
    r"(?i)\b(?:status|http)(?: code)?[: ]+(?:408|429|5\d\d)\b",
];

static CONTEXT_OVERFLOW_SET: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new(CONTEXT_OVERFLOW_PATTERNS).expect("context overflow patterns are valid")
});

static RETRYABLE_SET: LazyLock<RegexSet> =
    LazyLock::new(|| RegexSet::new(RETRYABLE_PATTERNS).expect("retryable patterns are valid"));

static RETRY_AFTER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?:retry[- ]after|try again in|retry in|please wait)\s*:?\s*(\d+(?:\.\d+)?)\s*(ms|milliseconds?|s|secs?|seconds?|m|mins?|minutes?)?\b",
    )
    .expect("retry-after pattern is valid")
});

static RETRY_DELAY_FIELD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)"?retry_?delay"?\s*:\s*"(\d+(?:\.\d+)?)s""#)
        .expect("retry delay field pattern is valid")
});

/// Classify raw error text and an optional HTTP status.
///
/// Overflow signatures win over transient ones: a 400 carrying "prompt is too
/// long" must never be retried verbatim. Any other 4xx except 408 and 429 is
/// final regardless of what the text says.
pub fn classify_error_text(message: &str, status: Option<u16>) -> ErrorKind {
    if CONTEXT_OVERFLOW_SET.is_match(message) || status == Some(413) {
        return ErrorKind::ContextOverflow;
    }
    match status {
        Some(408 | 429) | Some(500..=599) => return ErrorKind::Retryable,
        Some(400..=499) => return ErrorKind::Fatal,
        _ => {}
    }
    if RETRYABLE_SET.is_match(message) {
        return ErrorKind::Retryable;
    }
    ErrorKind::Fatal
}

/// Extract a server-supplied retry delay from error text, in milliseconds.
pub fn extract_retry_delay_ms(message: &str) -> Option<u64> {
    if let Some(caps) = RETRY_AFTER.captures(message) {
        let value: f64 = caps.get(1)?.as_str().parse().ok()?;
        let unit = caps.get(2).map(|m| m.as_str().to_ascii_lowercase());
        let multiplier = match unit.as_deref() {
            Some(u) if u.starts_with("ms") || u.starts_with("milli") => 1.0,
            Some(u) if u.starts_with('m') => 60_000.0,
            _ => 1000.0,
        };
        return Some((value * multiplier).ceil() as u64);
    }
    let caps = RETRY_DELAY_FIELD.captures(message)?;
    let seconds: f64 = caps.get(1)?.as_str().parse().ok()?;
    Some((seconds * 1000.0).ceil() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_wins_over_retryable_status() {
        assert_eq!(
            classify_error_text("prompt is too long: 210000 tokens > 200000 maximum", Some(500)),
            ErrorKind::ContextOverflow
        );
    }

    #[test]
    fn payload_too_large_is_overflow() {
        assert_eq!(
            classify_error_text("request entity too large", Some(413)),
            ErrorKind::ContextOverflow
        );
    }

    #[test]
    fn unknown_text_without_status_is_fatal() {
        assert_eq!(
            classify_error_text("invalid api key", Some(401)),
            ErrorKind::Fatal
        );
    }

    #[test]
    fn client_error_status_beats_transient_looking_text() {
        assert_eq!(
            classify_error_text("max_tokens: 500 is above the allowed maximum", Some(400)),
            ErrorKind::Fatal
        );
        assert_eq!(
            classify_error_text("upstream request timed out", Some(400)),
            ErrorKind::Fatal
        );
        assert_eq!(
            classify_error_text("max_tokens: 500 is above the allowed maximum", None),
            ErrorKind::Fatal
        );
        assert_eq!(
            classify_error_text("upstream returned status: 502", None),
            ErrorKind::Retryable
        );
    }

    #[test]
    fn parses_retry_delay_units() {
        assert_eq!(extract_retry_delay_ms("Please retry after 2s"), Some(2000));
        assert_eq!(extract_retry_delay_ms("try again in 250ms"), Some(250));
        assert_eq!(extract_retry_delay_ms("try again in 1.5 seconds"), Some(1500));
        assert_eq!(
            extract_retry_delay_ms(r#"{"retryDelay": "7s"}"#),
            Some(7000)
        );
        assert_eq!(extract_retry_delay_ms("no hint here"), None);
    }

    #[test]
    fn error_kind_round_trips_through_strum() {
        use std::str::FromStr;
        assert_eq!(ErrorKind::ContextOverflow.to_string(), "context_overflow");
        assert_eq!(ErrorKind::from_str("retryable").ok(), Some(ErrorKind::Retryable));
    }
}
