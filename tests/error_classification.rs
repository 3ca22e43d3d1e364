use std::path::Path;

use pretty_assertions::assert_eq;
use serde::Deserialize;
use strand::error::classify::PATTERN_TABLE_VERSION;
use strand::error::{classify_error_text, extract_retry_delay_ms, ErrorKind, StrandError};

#[derive(Deserialize)]
struct Fixture {
    version: u32,
    cases: Vec<Case>,
    retry_hints: Vec<RetryHint>,
}

#[derive(Deserialize)]
struct Case {
    message: String,
    status: Option<u16>,
    kind: ErrorKind,
}

#[derive(Deserialize)]
struct RetryHint {
    message: String,
    delay_ms: Option<u64>,
}

fn load_fixture(version: u32) -> Fixture {
    let path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(format!("error_patterns_v{version}.json"));
    let raw = std::fs::read_to_string(&path).expect("read fixture");
    serde_json::from_str(&raw).expect("parse fixture")
}

fn mismatches(fixture: &Fixture) -> Vec<String> {
    fixture
        .cases
        .iter()
        .filter_map(|case| {
            let actual = classify_error_text(&case.message, case.status);
            (actual != case.kind).then(|| {
                format!(
                    "v{} {:?} (status {:?}): expected {}, got {actual}",
                    fixture.version, case.message, case.status, case.kind
                )
            })
        })
        .collect()
}

#[test]
fn pattern_table_matches_its_fixture() {
    let fixture = load_fixture(PATTERN_TABLE_VERSION);
    assert_eq!(fixture.version, PATTERN_TABLE_VERSION);

    let mismatches = mismatches(&fixture);
    assert!(mismatches.is_empty(), "{mismatches:#?}");
}

#[test]
fn earlier_fixtures_still_classify_the_same() {
    let mismatches: Vec<String> = (1..PATTERN_TABLE_VERSION)
        .map(load_fixture)
        .flat_map(|fixture| mismatches(&fixture))
        .collect();
    assert!(mismatches.is_empty(), "{mismatches:#?}");
}

#[test]
fn client_errors_are_not_retried_for_numbers_in_their_text() {
    let error = StrandError::provider("max_tokens: 500 is above the allowed maximum", Some(400));
    assert_eq!(error.kind(), ErrorKind::Fatal);
    assert!(!error.is_retryable());
}

#[test]
fn retry_hints_match_their_fixture() {
    let fixture = load_fixture(PATTERN_TABLE_VERSION);
    for hint in &fixture.retry_hints {
        assert_eq!(
            extract_retry_delay_ms(&hint.message),
            hint.delay_ms,
            "{:?}",
            hint.message
        );
    }
}

#[test]
fn error_variants_map_onto_kinds() {
    assert_eq!(
        StrandError::RateLimited {
            retry_after_ms: None
        }
        .kind(),
        ErrorKind::Retryable
    );
    assert_eq!(StrandError::Timeout(1_000).kind(), ErrorKind::Retryable);
    assert_eq!(
        StrandError::ContextOverflow("too big".into()).kind(),
        ErrorKind::ContextOverflow
    );
    assert_eq!(StrandError::Aborted.kind(), ErrorKind::Fatal);
    assert_eq!(
        StrandError::Stream("connection reset by peer".into()).kind(),
        ErrorKind::Retryable
    );

    let provider = StrandError::provider("Rate limited. Please try again in 3s", Some(429));
    assert!(provider.is_retryable());
    assert_eq!(provider.retry_after_ms(), Some(3_000));
}
